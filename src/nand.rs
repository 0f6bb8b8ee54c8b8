//! Raw NAND access.

use core::fmt;

use thiserror::Error;

use crate::config::{Bank, BlockId, PageId};

/// Each NAND device is described once at detection time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NandGeometry {
    pub device_id: u32,
    pub banks: u32,
    pub blocks_per_bank: u32,
    pub pages_per_block: u32,
    pub bytes_per_page: usize,
    pub bytes_per_spare: usize,
    /// Bit errors per page the controller can correct.
    pub ecc_bits: u32,
}

struct KnownDevice {
    id: u32,
    blocks_per_bank: u32,
    pages_per_block: u32,
    sectors_per_page: usize,
    bytes_per_spare: usize,
    ecc_bits: u32,
}

// Chips found in S5L8900/S5L8930 era handsets.
const KNOWN_DEVICES: &[KnownDevice] = &[
    KnownDevice { id: 0x2555_D5EC, blocks_per_bank: 8192, pages_per_block: 128, sectors_per_page: 4, bytes_per_spare: 64, ecc_bits: 4 },
    KnownDevice { id: 0xB614_D5EC, blocks_per_bank: 4096, pages_per_block: 128, sectors_per_page: 8, bytes_per_spare: 128, ecc_bits: 4 },
    KnownDevice { id: 0xB655_D7EC, blocks_per_bank: 8192, pages_per_block: 128, sectors_per_page: 8, bytes_per_spare: 128, ecc_bits: 4 },
    KnownDevice { id: 0xA514_D3AD, blocks_per_bank: 4096, pages_per_block: 128, sectors_per_page: 4, bytes_per_spare: 64, ecc_bits: 4 },
    KnownDevice { id: 0xA555_D5AD, blocks_per_bank: 8192, pages_per_block: 128, sectors_per_page: 4, bytes_per_spare: 64, ecc_bits: 4 },
    KnownDevice { id: 0xA585_D598, blocks_per_bank: 8320, pages_per_block: 128, sectors_per_page: 4, bytes_per_spare: 64, ecc_bits: 4 },
    KnownDevice { id: 0xBA94_D598, blocks_per_bank: 4096, pages_per_block: 128, sectors_per_page: 8, bytes_per_spare: 216, ecc_bits: 8 },
    KnownDevice { id: 0xBC94_D7EC, blocks_per_bank: 4096, pages_per_block: 128, sectors_per_page: 8, bytes_per_spare: 128, ecc_bits: 8 },
];

pub const SECTOR_SIZE: usize = 512;

impl NandGeometry {
    /// Looks up a chip id read back from the flash controller.
    pub fn from_device_id(id: u32, banks: u32) -> Option<Self> {
        KNOWN_DEVICES.iter().find(|d| d.id == id).map(|d| NandGeometry {
            device_id: d.id,
            banks,
            blocks_per_bank: d.blocks_per_bank,
            pages_per_block: d.pages_per_block,
            bytes_per_page: d.sectors_per_page * SECTOR_SIZE,
            bytes_per_spare: d.bytes_per_spare,
            ecc_bits: d.ecc_bits,
        })
    }

    pub fn pages_per_bank(&self) -> u32 {
        self.blocks_per_bank * self.pages_per_block
    }

    pub fn total_bytes(&self) -> u64 {
        u64::from(self.banks) * u64::from(self.pages_per_bank()) * self.bytes_per_page as u64
    }

    pub fn contains(&self, addr: PageAddress) -> bool {
        addr.bank < self.banks
            && addr.block < self.blocks_per_bank
            && addr.page < self.pages_per_block
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PageAddress {
    pub bank: Bank,
    pub block: BlockId,
    pub page: PageId,
}

impl PageAddress {
    pub fn new(bank: Bank, block: BlockId, page: PageId) -> Self {
        PageAddress { bank, block, page }
    }

    /// Page number within the bank.
    pub fn page_index(&self, geometry: &NandGeometry) -> u32 {
        self.block * geometry.pages_per_block + self.page
    }
}

impl fmt::Display for PageAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}/{}", self.bank, self.block, self.page)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockState {
    Free,
    Allocated,
    Garbage,
    Bad,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum NandError {
    #[error("page was never written")]
    EmptyBlock,
    #[error("uncorrectable ECC error")]
    Ecc,
    #[error("program failed on bank {bank} block {block}")]
    ProgramFailed { bank: Bank, block: BlockId },
    #[error("erase failed on bank {bank} block {block}")]
    EraseFailed { bank: Bank, block: BlockId },
    #[error("bank {0} timed out")]
    Timeout(Bank),
    #[error("bank {0} did not come out of reset")]
    ResetFailed(Bank),
    #[error("address {0} out of range")]
    OutOfRange(PageAddress),
    #[error("buffer of {got} bytes, expected {expected}")]
    BufferSize { got: usize, expected: usize },
}

impl NandError {
    /// Failures that say the block itself is worn out.
    pub fn is_media_defect(&self) -> bool {
        matches!(
            self,
            NandError::ProgramFailed { .. } | NandError::EraseFailed { .. }
        )
    }
}

/// Each NAND array behind the flash controller is represented by a type
/// implementing this trait.
pub trait NandDevice {
    fn geometry(&self) -> NandGeometry;

    /// Read one page and its spare area.
    ///
    /// Correctable bit errors are fixed in `data` when `do_ecc` is set. A
    /// page that was never programmed returns `EmptyBlock`; with
    /// `check_blank` it must also read back as fully erased, otherwise the
    /// page is reported as `Ecc`.
    fn read(
        &mut self,
        addr: PageAddress,
        data: &mut [u8],
        spare: &mut [u8],
        do_ecc: bool,
        check_blank: bool,
    ) -> Result<(), NandError>;

    /// Read a batch of pages. Every page gets its own result; a failure on
    /// one page does not stop the others. `data` and `spare` hold the pages
    /// back to back.
    fn read_multiple(
        &mut self,
        addrs: &[PageAddress],
        data: &mut [u8],
        spare: &mut [u8],
        do_ecc: bool,
        check_blank: bool,
    ) -> Vec<Result<(), NandError>> {
        let geometry = self.geometry();
        let (page, oob) = (geometry.bytes_per_page, geometry.bytes_per_spare);
        if data.len() < addrs.len() * page || spare.len() < addrs.len() * oob {
            let err = NandError::BufferSize {
                got: data.len(),
                expected: addrs.len() * page,
            };
            return vec![Err(err); addrs.len()];
        }

        addrs
            .iter()
            .zip(data.chunks_mut(page).zip(spare.chunks_mut(oob)))
            .map(|(&addr, (data, spare))| self.read(addr, data, spare, do_ecc, check_blank))
            .collect()
    }

    /// Program one page. Pages within a block must be programmed in order
    /// and only once per erase.
    fn write(
        &mut self,
        addr: PageAddress,
        data: &[u8],
        spare: &[u8],
        do_ecc: bool,
    ) -> Result<(), NandError>;

    fn erase(&mut self, bank: Bank, block: BlockId) -> Result<(), NandError>;

    fn bank_reset(&mut self, bank: Bank, timeout_ms: u32) -> Result<(), NandError>;

    fn is_bad(&mut self, bank: Bank, block: BlockId) -> bool;

    /// Mark the block bad. Nothing can be done if this fails.
    fn set_bad(&mut self, bank: Bank, block: BlockId);
}
