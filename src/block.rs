//! Block device front end.
//!
//! Requests come in as byte offsets with scatter-gather segments. Each one
//! is gathered into the bounce buffer, handed to the FTL and scattered back
//! while the disk lock is held, so the FTL only ever sees one request at a
//! time.

use log::{debug, trace};
use num_integer::Integer;
use spin::Mutex;
use thiserror::Error;

use crate::config::Lpn;
use crate::ftl::{FtlError, FtlLayer, TransferError};
use crate::nand::NandDevice;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum BlockError {
    #[error("request at {offset} of {len} bytes is not page aligned")]
    InvalidArgument { offset: u64, len: usize },
    #[error("I/O error after {completed} pages: {error}")]
    Io { completed: u32, error: FtlError },
}

impl From<TransferError> for BlockError {
    fn from(e: TransferError) -> Self {
        BlockError::Io {
            completed: e.completed,
            error: e.error,
        }
    }
}

impl From<FtlError> for BlockError {
    fn from(error: FtlError) -> Self {
        BlockError::Io {
            completed: 0,
            error,
        }
    }
}

/// Page-granular storage addressed by logical block number.
pub trait BlockDevice: Send + Sync {
    fn block_size(&self) -> usize;

    fn total_blocks(&self) -> u64;

    fn read_blocks(&self, lba: u64, buf: &mut [u8]) -> Result<(), BlockError>;

    fn write_blocks(&self, lba: u64, buf: &[u8]) -> Result<(), BlockError>;

    fn flush(&self) -> Result<(), BlockError>;
}

struct Inner<N: NandDevice> {
    ftl: FtlLayer<N>,
    bounce: Vec<u8>,
}

pub struct FlashDisk<N: NandDevice> {
    inner: Mutex<Inner<N>>,
    page_size: usize,
    pages: u32,
}

impl<N: NandDevice> FlashDisk<N> {
    pub fn new(ftl: FtlLayer<N>) -> Self {
        let page_size = ftl.page_size();
        let pages = ftl.logical_pages();
        FlashDisk {
            inner: Mutex::new(Inner {
                ftl,
                bounce: Vec::new(),
            }),
            page_size,
            pages,
        }
    }

    pub fn capacity_bytes(&self) -> u64 {
        u64::from(self.pages) * self.page_size as u64
    }

    fn check(&self, offset: u64, len: usize) -> Result<(Lpn, u32), BlockError> {
        let page = self.page_size as u64;
        if !Integer::is_multiple_of(&offset, &page) || !Integer::is_multiple_of(&(len as u64), &page) {
            return Err(BlockError::InvalidArgument { offset, len });
        }
        let lpn = Lpn::try_from(offset / page).map_err(|_| BlockError::InvalidArgument { offset, len })?;
        Ok((lpn, (len / self.page_size) as u32))
    }

    /// Gather `segments` and write them at byte `offset`.
    pub fn write_sg(&self, offset: u64, segments: &[&[u8]]) -> Result<usize, BlockError> {
        let len = segments.iter().map(|s| s.len()).sum();
        let (lpn, count) = self.check(offset, len)?;
        trace!("disk: write {count} pages at {lpn}");

        let mut inner = self.inner.lock();
        let Inner { ftl, bounce } = &mut *inner;
        bounce.clear();
        for seg in segments {
            bounce.extend_from_slice(seg);
        }
        ftl.write(lpn, count, bounce)?;
        Ok(len)
    }

    /// Read at byte `offset` and scatter into `segments`.
    pub fn read_sg(&self, offset: u64, segments: &mut [&mut [u8]]) -> Result<usize, BlockError> {
        let len = segments.iter().map(|s| s.len()).sum();
        let (lpn, count) = self.check(offset, len)?;
        trace!("disk: read {count} pages at {lpn}");

        let mut inner = self.inner.lock();
        let Inner { ftl, bounce } = &mut *inner;
        bounce.resize(len, 0);
        ftl.read(lpn, count, bounce)?;

        let mut at = 0;
        for seg in segments.iter_mut() {
            seg.copy_from_slice(&bounce[at..at + seg.len()]);
            at += seg.len();
        }
        Ok(len)
    }

    pub fn write_at(&self, offset: u64, buf: &[u8]) -> Result<usize, BlockError> {
        self.write_sg(offset, &[buf])
    }

    pub fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize, BlockError> {
        self.read_sg(offset, &mut [buf])
    }

    /// Last close of the device.
    pub fn release(&self) -> Result<(), BlockError> {
        debug!("disk: release");
        self.inner.lock().ftl.sync()?;
        Ok(())
    }

    pub fn into_inner(self) -> FtlLayer<N> {
        self.inner.into_inner().ftl
    }
}

impl<N: NandDevice + Send> BlockDevice for FlashDisk<N> {
    fn block_size(&self) -> usize {
        self.page_size
    }

    fn total_blocks(&self) -> u64 {
        u64::from(self.pages)
    }

    fn read_blocks(&self, lba: u64, buf: &mut [u8]) -> Result<(), BlockError> {
        self.read_at(lba * self.page_size as u64, buf).map(|_| ())
    }

    fn write_blocks(&self, lba: u64, buf: &[u8]) -> Result<(), BlockError> {
        self.write_at(lba * self.page_size as u64, buf).map(|_| ())
    }

    /// Same as the buffer-flush ioctl: everything written so far survives
    /// power loss once this returns.
    fn flush(&self) -> Result<(), BlockError> {
        debug!("disk: flush");
        self.inner.lock().ftl.sync()?;
        Ok(())
    }
}
