pub type Bank = u32;
pub type BlockId = u32;
pub type PageId = u32;
pub type Counter = u32;

/// Address in the VFL's flat virtual page space.
pub type Vpn = u32;
/// Address in the block device's logical page space.
pub type Lpn = u32;
/// Virtual block, i.e. one physical block per bank.
pub type VBlock = u32;
/// Update sequence number.
pub type Usn = u32;

// VFL
pub const VFL_CTRL_BLOCKS: BlockId = 2;
pub const VFL_MAX_RETRIES: usize = 8;
pub const FTL_CTRL_SLOTS: usize = 3;
pub const BANK_RESET_TIMEOUT_MS: u32 = 100;

// FTL
pub const FTL_CTRL_BLOCKS: usize = 2;
pub const OPEN_BLOCKS: usize = 2;
pub const FREE_BLOCKS: usize = 3;
pub const WEAR_LEVEL_DELTA: Counter = 64;

// I2C
pub const I2C_BUSES: usize = 2;
pub const I2C_POLL_DELAY_US: u32 = 5;
pub const I2C_POLL_LIMIT: u32 = 20_000;

pub const INVALID_VPN: Vpn = Vpn::MAX;
pub const LOST_VPN: Vpn = Vpn::MAX - 1;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FtlConfig {
    /// Over-provisioning, in percent of the data area.
    pub op_percent: f64,
    /// Usn handed out by the first write after a format.
    pub first_usn: Usn,
    /// GC kicks in when fewer free blocks than this are left.
    pub gc_threshold: usize,
    /// Erase-count spread that triggers static wear leveling.
    pub wear_level_delta: Counter,
}

impl Default for FtlConfig {
    fn default() -> Self {
        FtlConfig {
            op_percent: 7.0,
            first_usn: 1,
            gc_threshold: FREE_BLOCKS,
            wear_level_delta: WEAR_LEVEL_DELTA,
        }
    }
}

impl FtlConfig {
    pub fn new_with_op(op: f64) -> Self {
        FtlConfig {
            op_percent: op,
            ..Default::default()
        }
    }

    pub fn with_first_usn(mut self, usn: Usn) -> Self {
        self.first_usn = usn;
        self
    }

    /// Blocks that must stay out of the logical capacity so GC always has
    /// somewhere to go.
    pub fn reserved_blocks(&self) -> usize {
        self.gc_threshold + OPEN_BLOCKS + 1
    }
}
