//! Flash translation layer.
//!
//! Maps logical pages onto the VFL's virtual pages. Writes always go to a
//! fresh page; the map is kept in RAM and persisted as a checkpoint in two
//! dedicated control blocks. Between checkpoints the spare area of every
//! written page (`lpn`, `usn`) acts as the write log: mount replays the
//! blocks that were free or open when the checkpoint was taken.
//!
//! Garbage collected blocks are not erased until a checkpoint that no
//! longer references them is on media, so the newest checkpoint plus the
//! replay log always describe intact data.

use std::collections::VecDeque;

use byte_unit::Byte;
use log::{debug, error, info, trace, warn};
use num_integer::Integer;
use thiserror::Error;

use crate::bytes::{verify_sealed, Reader, Writer};
use crate::config::*;
use crate::nand::{BlockState, NandDevice};
use crate::spare::{MetaKind, SpareData, META_F_LAST};
use crate::vfl::{VflError, VflLayer};

const CKPT_MAGIC: &[u8; 4] = b"FTLC";
const CKPT_VERSION: u16 = 1;
const NO_LPN: Lpn = Lpn::MAX;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum FtlError {
    #[error("pages {lpn}..{lpn}+{count} are outside the {limit} logical pages")]
    OutOfRange { lpn: Lpn, count: u32, limit: u32 },
    #[error("buffer of {got} bytes, expected {expected}")]
    BufferSize { got: usize, expected: usize },
    #[error("logical page {0} was lost to an uncorrectable error")]
    Uncorrectable(Lpn),
    #[error("virtual page {vpn} does not hold logical page {lpn}")]
    Mismatch { lpn: Lpn, vpn: Vpn },
    #[error("no free block left")]
    NoSpace,
    #[error("device too small for the requested over-provisioning")]
    TooSmall,
    #[error("no valid FTL checkpoint found")]
    NoCheckpoint,
    #[error("FTL checkpoint does not fit in a control block")]
    CheckpointTooLarge,
    #[error(transparent)]
    Vfl(#[from] VflError),
}

/// A request that stopped part way. `completed` pages were transferred
/// before `error` occurred.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("transfer stopped after {completed} pages: {error}")]
pub struct TransferError {
    pub completed: u32,
    #[source]
    pub error: FtlError,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum L2PValue {
    Invalid,
    Valid(Vpn),
    /// The only copy was destroyed; reads fail until it is rewritten.
    Lost,
}

impl L2PValue {
    fn to_raw(self) -> u32 {
        match self {
            L2PValue::Invalid => INVALID_VPN,
            L2PValue::Lost => LOST_VPN,
            L2PValue::Valid(vpn) => vpn,
        }
    }

    fn from_raw(raw: u32) -> Self {
        match raw {
            INVALID_VPN => L2PValue::Invalid,
            LOST_VPN => L2PValue::Lost,
            vpn => L2PValue::Valid(vpn),
        }
    }
}

#[derive(Clone, Debug)]
pub struct Block {
    block_id: VBlock,
    valid_counter: Counter,
    cursor: PageId, // points to the next page
    erase_counter: Counter,
}

impl Block {
    pub fn new(block_id: VBlock) -> Self {
        Block {
            block_id,
            valid_counter: 0,
            cursor: 0,
            erase_counter: 0,
        }
    }

    fn full(&self, pages: u32) -> bool {
        self.cursor >= pages
    }

    fn write_one_page(&mut self, pages: u32) {
        debug_assert!(self.cursor < pages, "write more pages than block has");
        self.cursor += 1;
    }

    fn erase(&mut self) {
        self.cursor = 0;
        self.valid_counter = 0;
        self.erase_counter += 1;
    }
}

#[derive(Debug, Default, Clone)]
pub struct FtlStats {
    pub host_writes: u64,
    pub gc_writes: u64,
    pub gc_runs: u64,
    pub wear_level_runs: u64,
    pub checkpoints: u64,
    pub replayed: u64,
    pub lost_pages: u64,
}

impl FtlStats {
    pub fn write_amplification(&self) -> f64 {
        if self.host_writes == 0 {
            return 1.0;
        }
        (self.host_writes + self.gc_writes) as f64 / self.host_writes as f64
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Stream {
    Host,
    Gc,
}

struct Checkpoint {
    next_usn: Usn,
    l2p: Vec<L2PValue>,
    erase_counts: Vec<Counter>,
    scan: Vec<VBlock>,
}

/// Where a checkpoint group was found while scanning the control blocks.
struct CkptCopy {
    usn_dec: u32,
    bytes: Vec<u8>,
}

pub struct FtlLayer<N: NandDevice> {
    vfl: VflLayer<N>,
    config: FtlConfig,

    l2p: Vec<L2PValue>,
    p2l: Vec<Lpn>,
    blocks: Vec<Block>,

    host_open_block: Option<VBlock>,
    host_gc_open_block: Option<VBlock>,

    free_blocks: VecDeque<VBlock>,
    full_blocks: Vec<VBlock>,
    // Collected, but still referenced by the checkpoint on media.
    pending_blocks: Vec<VBlock>,

    ctrl: [VBlock; FTL_CTRL_BLOCKS],
    ctrl_cursor: (usize, PageId),
    ckpt_gen: u32,

    next_usn: Usn,
    dirty: bool,
    stats: FtlStats,
}

/// Distance of `usn` past the checkpoint base, if it was written after it.
fn replay_distance(base: Usn, usn: Usn) -> Option<u32> {
    let d = usn.wrapping_sub(base);
    (d < 1 << 31).then_some(d)
}

impl<N: NandDevice> FtlLayer<N> {
    fn empty(vfl: VflLayer<N>, config: FtlConfig, logical_pages: usize) -> Self {
        let ctrl: [VBlock; FTL_CTRL_BLOCKS] = core::array::from_fn(|i| i as VBlock);
        let total = vfl.total_pages() as usize;
        let blocks = (0..vfl.user_blocks()).map(Block::new).collect();
        FtlLayer {
            vfl,
            config,
            l2p: vec![L2PValue::Invalid; logical_pages],
            p2l: vec![NO_LPN; total],
            blocks,
            host_open_block: None,
            host_gc_open_block: None,
            free_blocks: VecDeque::new(),
            full_blocks: Vec::new(),
            pending_blocks: Vec::new(),
            ctrl,
            ctrl_cursor: (0, 0),
            ckpt_gen: u32::MAX,
            next_usn: config.first_usn,
            dirty: false,
            stats: FtlStats::default(),
        }
    }

    /// Start from a blank device: every data block is erased and an empty
    /// checkpoint is written.
    pub fn format(mut vfl: VflLayer<N>, config: FtlConfig) -> Result<Self, FtlError> {
        let ppvb = vfl.pages_per_vblock();
        let page_size = vfl.geometry().bytes_per_page;
        let data_blocks = vfl.user_blocks().saturating_sub(FTL_CTRL_BLOCKS as u32);
        let reserved = config.reserved_blocks() as u32;
        if data_blocks <= reserved {
            return Err(FtlError::TooSmall);
        }

        let all_pages = ((data_blocks - reserved) * ppvb) as usize;
        let op_pages = (all_pages as f64 * (config.op_percent / 100.)).trunc() as usize;
        let logical_pages = all_pages.saturating_sub(op_pages);
        if logical_pages == 0 {
            return Err(FtlError::TooSmall);
        }

        trace!("ftl: all_pages: {}", all_pages);
        trace!("ftl: op_pages: {}", op_pages);
        info!(
            "ftl: physical capacity {} bytes, {}",
            all_pages * page_size,
            Byte::from(all_pages * page_size).get_appropriate_unit(true).to_string()
        );
        info!(
            "ftl: user capacity {} bytes, {}",
            logical_pages * page_size,
            Byte::from(logical_pages * page_size).get_appropriate_unit(true).to_string()
        );

        let ctrl: Vec<VBlock> = (0..FTL_CTRL_BLOCKS as u32).collect();
        vfl.store_ftl_ctrl_block(&ctrl)?;

        let mut ftl = Self::empty(vfl, config, logical_pages);
        for vb in 0..ftl.vfl.user_blocks() {
            ftl.vfl.erase(vb)?;
            if !ftl.ctrl.contains(&vb) {
                ftl.blocks[vb as usize].erase();
                ftl.free_blocks.push_back(vb);
            }
        }
        ftl.checkpoint()?;
        info!("ftl: formatted, {} logical pages", logical_pages);
        Ok(ftl)
    }

    /// Mount: load the newest checkpoint, then replay the write log.
    pub fn setup(mut vfl: VflLayer<N>, config: FtlConfig) -> Result<Self, FtlError> {
        let ctrl_list = vfl.get_ftl_ctrl_block();
        if ctrl_list.len() != FTL_CTRL_BLOCKS {
            return Err(FtlError::NoCheckpoint);
        }

        let mut copies = Vec::new();
        let mut newest: Option<(u32, (usize, PageId))> = None;
        for (idx, &vb) in ctrl_list.iter().enumerate() {
            let (written, lowest) = scan_ctrl_block(&mut vfl, vb, &mut copies)?;
            if let Some(gen) = lowest {
                if newest.map_or(true, |(best, _)| gen < best) {
                    newest = Some((gen, (idx, written)));
                }
            }
        }

        copies.sort_by_key(|c| c.usn_dec);
        let lowest = copies.first().map(|c| c.usn_dec);
        let total_pages = vfl.total_pages();
        let user_blocks = vfl.user_blocks();
        let ckpt = copies
            .iter()
            .find_map(|c| {
                let parsed = parse_checkpoint(&c.bytes, total_pages, user_blocks);
                if parsed.is_none() {
                    warn!("ftl: checkpoint generation {:#x} failed verification", c.usn_dec);
                }
                parsed
            })
            .ok_or(FtlError::NoCheckpoint)?;

        let mut ftl = Self::empty(vfl, config, ckpt.l2p.len());
        ftl.ctrl.copy_from_slice(&ctrl_list);
        if let Some((_, cursor)) = newest {
            ftl.ctrl_cursor = cursor;
        }
        ftl.ckpt_gen = lowest.unwrap_or(u32::MAX);
        ftl.next_usn = ckpt.next_usn;

        let ppvb = ftl.vfl.pages_per_vblock();
        for (block, &count) in ftl.blocks.iter_mut().zip(&ckpt.erase_counts) {
            block.erase_counter = count;
            block.cursor = ppvb;
        }
        for (lpn, &entry) in ckpt.l2p.iter().enumerate() {
            match entry {
                L2PValue::Valid(vpn) => ftl.map(lpn as Lpn, vpn),
                other => ftl.l2p[lpn] = other,
            }
        }

        let replayed = ftl.replay(ckpt.next_usn, &ckpt.scan)?;

        for vb in 0..user_blocks {
            if ftl.ctrl.contains(&vb) {
                continue;
            }
            if ftl.blocks[vb as usize].valid_counter != 0 {
                ftl.full_blocks.push(vb);
            } else if ckpt.scan.contains(&vb) {
                ftl.free_blocks.push_back(vb);
            } else {
                // Went stale without a checkpoint listing it. Writing here
                // before one does would hide the pages from replay.
                ftl.pending_blocks.push(vb);
            }
        }

        info!(
            "ftl: mounted checkpoint {:#x}: {} logical pages, {} replayed, {} free blocks, {} pending",
            ftl.ckpt_gen,
            ftl.l2p.len(),
            replayed,
            ftl.free_blocks.len(),
            ftl.pending_blocks.len()
        );

        if replayed > 0 {
            ftl.dirty = true;
        }
        ftl.sync()?;
        Ok(ftl)
    }

    /// Re-apply pages written after the checkpoint, oldest first so the
    /// higher usn wins.
    fn replay(&mut self, base: Usn, scan: &[VBlock]) -> Result<usize, FtlError> {
        let ppvb = self.vfl.pages_per_vblock();
        let chunk = self.vfl.geometry().banks;
        let page_size = self.page_size();
        let mut buf = vec![0u8; chunk as usize * page_size];
        let mut found: Vec<(u32, Lpn, Vpn)> = Vec::new();

        for &vb in scan {
            let first = vb * ppvb;
            let mut offset = 0;
            'block: while offset < ppvb {
                let n = chunk.min(ppvb - offset);
                let results = self
                    .vfl
                    .read_multiple_pages_in_vb(vb, offset, n, &mut buf, true)?;
                for (i, result) in results.into_iter().enumerate() {
                    let vpn = first + offset + i as u32;
                    match result {
                        Ok(None) => {
                            self.blocks[vb as usize].cursor = offset + i as u32;
                            break 'block;
                        }
                        Ok(Some(spare)) => {
                            let Some((lpn, usn)) = spare.as_user() else {
                                warn!("ftl: control page in data block at {vpn}");
                                continue;
                            };
                            match replay_distance(base, usn) {
                                Some(d) if (lpn as usize) < self.l2p.len() => {
                                    found.push((d, lpn, vpn))
                                }
                                _ => {}
                            }
                        }
                        Err(VflError::Ecc(_)) | Err(VflError::Spare { .. }) => {
                            warn!("ftl: unreadable page {vpn} during replay")
                        }
                        Err(e) => return Err(e.into()),
                    }
                }
                offset += n;
            }
        }

        found.sort_by_key(|&(d, _, _)| d);
        for &(_, lpn, vpn) in &found {
            trace!("ftl: replay lpn {lpn} -> {vpn}");
            self.map(lpn, vpn);
        }
        if let Some(&(d, _, _)) = found.last() {
            self.next_usn = base.wrapping_add(d).wrapping_add(1);
        }
        self.stats.replayed += found.len() as u64;
        Ok(found.len())
    }

    pub fn logical_pages(&self) -> u32 {
        self.l2p.len() as u32
    }

    pub fn page_size(&self) -> usize {
        self.vfl.geometry().bytes_per_page
    }

    pub fn stats(&self) -> &FtlStats {
        &self.stats
    }

    pub fn vfl(&self) -> &VflLayer<N> {
        &self.vfl
    }

    pub fn vfl_mut(&mut self) -> &mut VflLayer<N> {
        &mut self.vfl
    }

    /// Hand the lower layers back, e.g. to simulate losing power.
    pub fn into_vfl(self) -> VflLayer<N> {
        self.vfl
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Virtual page currently holding `lpn`.
    pub fn lookup(&self, lpn: Lpn) -> Option<Vpn> {
        match self.l2p.get(lpn as usize)? {
            L2PValue::Valid(vpn) => Some(*vpn),
            _ => None,
        }
    }

    pub fn block_state(&self, vb: VBlock) -> BlockState {
        if self.free_blocks.contains(&vb) {
            BlockState::Free
        } else if self.pending_blocks.contains(&vb) {
            BlockState::Garbage
        } else {
            BlockState::Allocated
        }
    }

    pub fn erase_count(&self, vb: VBlock) -> Counter {
        self.blocks[vb as usize].erase_counter
    }

    fn check_request(&self, lpn: Lpn, count: u32, len: usize) -> Result<(), FtlError> {
        let limit = self.logical_pages();
        if lpn.checked_add(count).map_or(true, |end| end > limit) {
            return Err(FtlError::OutOfRange { lpn, count, limit });
        }
        let expected = count as usize * self.page_size();
        if len < expected {
            return Err(FtlError::BufferSize { got: len, expected });
        }
        Ok(())
    }

    /// Write `count` pages starting at `lpn`. Returns the pages written.
    pub fn write(&mut self, lpn: Lpn, count: u32, buf: &[u8]) -> Result<u32, TransferError> {
        self.check_request(lpn, count, buf.len())
            .map_err(|error| TransferError { completed: 0, error })?;

        let page_size = self.page_size();
        for (i, data) in buf.chunks(page_size).take(count as usize).enumerate() {
            self.write_page(lpn + i as Lpn, data)
                .map_err(|error| TransferError {
                    completed: i as u32,
                    error,
                })?;
        }
        Ok(count)
    }

    /// Read `count` pages starting at `lpn`. Never written pages read as
    /// zeros.
    pub fn read(&mut self, lpn: Lpn, count: u32, buf: &mut [u8]) -> Result<u32, TransferError> {
        self.check_request(lpn, count, buf.len())
            .map_err(|error| TransferError { completed: 0, error })?;

        let page_size = self.page_size();
        for (i, data) in buf.chunks_mut(page_size).take(count as usize).enumerate() {
            self.read_page(lpn + i as Lpn, data)
                .map_err(|error| TransferError {
                    completed: i as u32,
                    error,
                })?;
        }
        Ok(count)
    }

    fn read_page(&mut self, lpn: Lpn, data: &mut [u8]) -> Result<(), FtlError> {
        match self.l2p[lpn as usize] {
            L2PValue::Invalid => {
                data.fill(0);
                Ok(())
            }
            L2PValue::Lost => Err(FtlError::Uncorrectable(lpn)),
            L2PValue::Valid(vpn) => {
                let spare = self.vfl.read(vpn, data, false)?;
                match spare.and_then(|s| s.as_user()) {
                    Some((owner, _)) if owner == lpn => Ok(()),
                    _ => {
                        error!("ftl: page {vpn} does not belong to lpn {lpn}");
                        Err(FtlError::Mismatch { lpn, vpn })
                    }
                }
            }
        }
    }

    fn write_page(&mut self, lpn: Lpn, data: &[u8]) -> Result<(), FtlError> {
        let vpn = self.program(Stream::Host, lpn, data)?;
        self.map(lpn, vpn);
        self.stats.host_writes += 1;
        Ok(())
    }

    /// Persist the map if anything changed since the last checkpoint.
    pub fn sync(&mut self) -> Result<(), FtlError> {
        if self.dirty || !self.pending_blocks.is_empty() {
            self.checkpoint()?;
        }
        Ok(())
    }

    fn map(&mut self, lpn: Lpn, vpn: Vpn) {
        if let L2PValue::Valid(old) = self.l2p[lpn as usize] {
            self.unmap(old);
        }
        let ppvb = self.vfl.pages_per_vblock();
        self.l2p[lpn as usize] = L2PValue::Valid(vpn);
        self.p2l[vpn as usize] = lpn;
        self.blocks[(vpn / ppvb) as usize].valid_counter += 1;
    }

    fn unmap(&mut self, vpn: Vpn) {
        let ppvb = self.vfl.pages_per_vblock();
        self.p2l[vpn as usize] = NO_LPN;
        let block = &mut self.blocks[(vpn / ppvb) as usize];
        debug_assert!(block.valid_counter > 0, "valid counter underflow in {}", block.block_id);
        block.valid_counter -= 1;
    }

    fn mark_lost(&mut self, vpn: Vpn) {
        let lpn = self.p2l[vpn as usize];
        if lpn == NO_LPN || self.l2p[lpn as usize] != L2PValue::Valid(vpn) {
            return;
        }
        error!("ftl: lpn {lpn} lost at {vpn}");
        self.unmap(vpn);
        self.l2p[lpn as usize] = L2PValue::Lost;
        self.stats.lost_pages += 1;
        self.dirty = true;
    }

    fn open_slot(&mut self, stream: Stream) -> &mut Option<VBlock> {
        match stream {
            Stream::Host => &mut self.host_open_block,
            Stream::Gc => &mut self.host_gc_open_block,
        }
    }

    /// Program one page of user data on the given stream's open block,
    /// opening a new block first if needed.
    fn program(&mut self, stream: Stream, lpn: Lpn, data: &[u8]) -> Result<Vpn, FtlError> {
        let ppvb = self.vfl.pages_per_vblock();
        let current = *self.open_slot(stream);
        let vb = match current {
            Some(vb) if !self.blocks[vb as usize].full(ppvb) => vb,
            current => {
                if let Some(vb) = current {
                    self.full_blocks.push(vb);
                    *self.open_slot(stream) = None;
                }
                if stream == Stream::Host {
                    self.ensure_free()?;
                }
                let vb = self.allocate()?;
                *self.open_slot(stream) = Some(vb);
                vb
            }
        };

        let block = &mut self.blocks[vb as usize];
        let vpn = vb * ppvb + block.cursor;
        block.write_one_page(ppvb);
        let usn = self.next_usn;
        self.next_usn = usn.wrapping_add(1);
        self.dirty = true;

        self.vfl.write(vpn, data, &SpareData::user(lpn, usn))?;
        trace!("ftl: lpn {lpn} usn {usn} -> {vpn}");
        Ok(vpn)
    }

    /// Take the least worn free block and erase it.
    fn allocate(&mut self) -> Result<VBlock, FtlError> {
        let idx = self
            .free_blocks
            .iter()
            .enumerate()
            .min_by_key(|(_, &vb)| self.blocks[vb as usize].erase_counter)
            .map(|(idx, _)| idx)
            .ok_or(FtlError::NoSpace)?;
        let vb = self.free_blocks.remove(idx).ok_or(FtlError::NoSpace)?;

        if let Err(e) = self.vfl.erase(vb) {
            self.free_blocks.push_back(vb);
            return Err(e.into());
        }
        self.blocks[vb as usize].erase();
        debug!(
            "ftl: opened block {vb} (erases {}), {} free left",
            self.blocks[vb as usize].erase_counter,
            self.free_blocks.len()
        );
        Ok(vb)
    }

    /// Keep at least `gc_threshold` free blocks around.
    fn ensure_free(&mut self) -> Result<(), FtlError> {
        let threshold = self.config.gc_threshold;
        let mut rounds = 0;
        while self.free_blocks.len() < threshold {
            rounds += 1;
            if rounds > self.blocks.len() * 2 {
                error!("ftl: garbage collection makes no progress");
                return Err(FtlError::NoSpace);
            }

            let free = self.free_blocks.len();
            let pending = self.pending_blocks.len();
            if pending > 0 && (free + pending >= threshold || free < 2) {
                self.checkpoint()?;
                continue;
            }
            match self.pick_victim() {
                Some(victim) => self.gc(victim)?,
                None if pending > 0 => self.checkpoint()?,
                None => return Err(FtlError::NoSpace),
            }
        }
        self.wear_level()
    }

    /// Greedy: fewest valid pages, then fewest erases.
    fn pick_victim(&self) -> Option<VBlock> {
        let ppvb = self.vfl.pages_per_vblock();
        self.full_blocks
            .iter()
            .copied()
            .min_by_key(|&vb| {
                let b = &self.blocks[vb as usize];
                (b.valid_counter, b.erase_counter)
            })
            .filter(|&vb| self.blocks[vb as usize].valid_counter < ppvb)
    }

    /// Move the live pages of `victim` to the GC stream and park the block
    /// until the next checkpoint.
    fn gc(&mut self, victim: VBlock) -> Result<(), FtlError> {
        let ppvb = self.vfl.pages_per_vblock();
        let first = victim * ppvb;
        self.full_blocks.retain(|&vb| vb != victim);

        let cursor = self.blocks[victim as usize].cursor.min(ppvb);
        let live: Vec<PageId> = (0..cursor)
            .filter(|&o| self.p2l[(first + o) as usize] != NO_LPN)
            .collect();
        debug!(
            "ftl: gc block {victim}: {} live pages, {} erases",
            live.len(),
            self.blocks[victim as usize].erase_counter
        );

        let page_size = self.page_size();
        let chunk = self.vfl.geometry().banks as usize;
        let mut buf = vec![0u8; chunk * page_size];
        for offsets in live.chunks(chunk) {
            let results = self
                .vfl
                .read_scattered_pages_in_vb(victim, offsets, &mut buf, false)?;
            for (i, result) in results.into_iter().enumerate() {
                let vpn = first + offsets[i];
                match result {
                    Ok(Some(spare)) => match spare.as_user() {
                        Some((lpn, _)) if self.l2p[lpn as usize] == L2PValue::Valid(vpn) => {
                            let data = &buf[i * page_size..(i + 1) * page_size];
                            let new = self.program(Stream::Gc, lpn, data)?;
                            self.map(lpn, new);
                            self.stats.gc_writes += 1;
                        }
                        _ => self.mark_lost(vpn),
                    },
                    Ok(None)
                    | Err(VflError::Ecc(_))
                    | Err(VflError::Empty(_))
                    | Err(VflError::Spare { .. }) => self.mark_lost(vpn),
                    Err(e) => return Err(e.into()),
                }
            }
        }

        debug_assert_eq!(self.blocks[victim as usize].valid_counter, 0);
        self.pending_blocks.push(victim);
        self.stats.gc_runs += 1;
        self.dirty = true;
        Ok(())
    }

    /// Static wear leveling: when the erase spread grows too wide, recycle
    /// the coldest block holding data so it rejoins the free pool.
    fn wear_level(&mut self) -> Result<(), FtlError> {
        if self.free_blocks.len() < 2 {
            return Ok(());
        }
        let Some(coldest) = self
            .full_blocks
            .iter()
            .copied()
            .min_by_key(|&vb| self.blocks[vb as usize].erase_counter)
        else {
            return Ok(());
        };
        let hottest = self
            .blocks
            .iter()
            .filter(|b| !self.ctrl.contains(&b.block_id))
            .map(|b| b.erase_counter)
            .max()
            .unwrap_or(0);
        let cold = self.blocks[coldest as usize].erase_counter;
        if hottest - cold > self.config.wear_level_delta {
            debug!("ftl: wear leveling block {coldest} ({cold} vs {hottest} erases)");
            self.gc(coldest)?;
            self.stats.wear_level_runs += 1;
        }
        Ok(())
    }

    fn checkpoint_bytes(&self) -> Vec<u8> {
        let scan: Vec<VBlock> = self
            .free_blocks
            .iter()
            .chain(&self.pending_blocks)
            .chain(self.host_open_block.iter())
            .chain(self.host_gc_open_block.iter())
            .copied()
            .collect();

        let mut w = Writer::new();
        w.bytes(CKPT_MAGIC);
        w.u16(CKPT_VERSION);
        w.u32(self.next_usn);
        w.u32(self.l2p.len() as u32);
        w.u32(self.blocks.len() as u32);
        w.u32(scan.len() as u32);
        for entry in &self.l2p {
            w.u32(entry.to_raw());
        }
        for block in &self.blocks {
            w.u32(block.erase_counter);
        }
        for vb in scan {
            w.u32(vb);
        }
        w.seal()
    }

    /// Write the next checkpoint generation, then release the blocks it
    /// no longer references.
    fn checkpoint(&mut self) -> Result<(), FtlError> {
        let ppvb = self.vfl.pages_per_vblock();
        let page_size = self.page_size();
        let bytes = self.checkpoint_bytes();
        let pages = Integer::div_ceil(&bytes.len(), &page_size) as u32;
        if pages > ppvb {
            return Err(FtlError::CheckpointTooLarge);
        }

        let (mut idx, mut next) = self.ctrl_cursor;
        if next + pages > ppvb {
            idx = (idx + 1) % FTL_CTRL_BLOCKS;
            next = 0;
            self.vfl.erase(self.ctrl[idx])?;
        }

        self.ckpt_gen = self.ckpt_gen.wrapping_sub(1);
        let mut page = vec![0xFF; page_size];
        for (i, chunk) in bytes.chunks(page_size).enumerate() {
            page.fill(0xFF);
            page[..chunk.len()].copy_from_slice(chunk);
            let spare = SpareData::Meta {
                kind: MetaKind::FtlCheckpoint,
                usn_dec: self.ckpt_gen,
                idx: i as u16,
                flags: if i as u32 + 1 == pages { META_F_LAST } else { 0 },
            };
            let vpn = self.ctrl[idx] * ppvb + next;
            next += 1;
            self.ctrl_cursor = (idx, next);
            self.vfl.write(vpn, &page, &spare)?;
        }

        let released = self.pending_blocks.len();
        self.free_blocks.extend(self.pending_blocks.drain(..));
        self.dirty = false;
        self.stats.checkpoints += 1;
        debug!(
            "ftl: checkpoint {:#x} ({} pages), released {} blocks, next usn {}",
            self.ckpt_gen, pages, released, self.next_usn
        );
        Ok(())
    }
}

/// Collect every complete checkpoint group in a control block. Returns the
/// number of programmed pages and the newest generation seen.
fn scan_ctrl_block<N: NandDevice>(
    vfl: &mut VflLayer<N>,
    vb: VBlock,
    copies: &mut Vec<CkptCopy>,
) -> Result<(PageId, Option<u32>), FtlError> {
    let ppvb = vfl.pages_per_vblock();
    let page_size = vfl.geometry().bytes_per_page;
    let mut data = vec![0u8; page_size];
    let mut group: Option<(u32, Vec<u8>)> = None;
    let mut lowest: Option<u32> = None;
    let mut written = 0;

    for offset in 0..ppvb {
        let spare = match vfl.read(vb * ppvb + offset, &mut data, true) {
            Ok(None) => break,
            Ok(Some(spare)) => spare,
            Err(VflError::Ecc(_)) | Err(VflError::Spare { .. }) => {
                written = offset + 1;
                group = None;
                continue;
            }
            Err(e) => return Err(e.into()),
        };
        written = offset + 1;

        let Some((usn_dec, idx, flags)) = spare.as_meta(MetaKind::FtlCheckpoint) else {
            group = None;
            continue;
        };
        lowest = Some(lowest.map_or(usn_dec, |l| l.min(usn_dec)));
        group = match group.take() {
            _ if idx == 0 => Some((usn_dec, data.clone())),
            Some((gen, mut bytes)) if gen == usn_dec && bytes.len() == idx as usize * page_size => {
                bytes.extend_from_slice(&data);
                Some((gen, bytes))
            }
            _ => None,
        };
        if flags & META_F_LAST != 0 {
            if let Some((usn_dec, bytes)) = group.take() {
                copies.push(CkptCopy { usn_dec, bytes });
            }
        }
    }
    Ok((written, lowest))
}

fn parse_checkpoint(data: &[u8], total_pages: u32, user_blocks: u32) -> Option<Checkpoint> {
    let mut r = Reader::new(data);
    if r.bytes(4)? != CKPT_MAGIC || r.u16()? != CKPT_VERSION {
        return None;
    }
    let next_usn = r.u32()?;
    let logical = r.u32()? as usize;
    if r.u32()? != user_blocks {
        return None;
    }
    let scan_len = r.u32()? as usize;
    if logical > total_pages as usize || scan_len > user_blocks as usize {
        return None;
    }

    let mut l2p = Vec::with_capacity(logical);
    for _ in 0..logical {
        let entry = L2PValue::from_raw(r.u32()?);
        if matches!(entry, L2PValue::Valid(vpn) if vpn >= total_pages) {
            return None;
        }
        l2p.push(entry);
    }
    let erase_counts = (0..user_blocks).map(|_| r.u32()).collect::<Option<Vec<_>>>()?;
    let scan = (0..scan_len).map(|_| r.u32()).collect::<Option<Vec<_>>>()?;
    if scan.iter().any(|&vb| vb >= user_blocks) {
        return None;
    }

    if !verify_sealed(data, r.sealed_body_len() + 8) {
        return None;
    }
    Some(Checkpoint {
        next_usn,
        l2p,
        erase_counts,
        scan,
    })
}
