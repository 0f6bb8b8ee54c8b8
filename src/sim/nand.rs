use log::info;
use rand::rngs::SmallRng;
use rand::{Rng, RngCore, SeedableRng};

use crate::config::{Bank, BlockId};
use crate::delay::{Delay, NoDelay};
use crate::nand::{NandDevice, NandError, NandGeometry, PageAddress};

const BLOCK_BAD_MARK: u8 = 0x01;
const BLOCK_FAILED: u8 = 0x02;
const BLOCK_BOTH: u8 = BLOCK_FAILED | BLOCK_BAD_MARK;

const RESET_POLL_US: u32 = 10;
const UNREADABLE: u32 = u32::MAX;

/// Small two-bank part: 64 blocks of 16 pages of 512 bytes per bank.
pub const SIM_GEOMETRY: NandGeometry = NandGeometry {
    device_id: 0x5157_0001,
    banks: 2,
    blocks_per_bank: 64,
    pages_per_block: 16,
    bytes_per_page: 512,
    bytes_per_spare: 16,
    ecc_bits: 4,
};

#[derive(Debug, Default, Clone)]
pub struct SimStats {
    pub is_bad: usize,
    pub mark_bad: usize,
    pub erase: usize,
    pub erase_fail: usize,
    pub prog: usize,
    pub prog_fail: usize,
    pub read: usize,
    pub read_empty: usize,
    pub read_ecc_fixed: usize,
    pub read_ecc_fail: usize,
    pub resets: usize,
}

#[derive(Clone, Copy)]
struct BlockStatus {
    flags: u8,
    // Index of the next unprogrammed page. 0 means a fully erased block.
    next_page: u32,
    // If non-zero, the number of operations until permanent failure.
    timebomb: usize,
}

struct SimBank {
    blocks: Vec<BlockStatus>,
    // What the array currently holds, bit errors included.
    raw: Vec<u8>,
    // What was programmed, i.e. what ECC can reconstruct.
    shadow: Vec<u8>,
    spare: Vec<u8>,
    programmed: Vec<bool>,
    flips: Vec<u32>,
    reset_polls: u32,
}

/// In-memory NAND array with fault injection.
pub struct SimNand {
    geometry: NandGeometry,
    banks: Vec<SimBank>,
    stats: SimStats,
    power_budget: Option<usize>,
    rng: SmallRng,
    delay: Box<dyn Delay>,
}

impl SimNand {
    pub fn new(geometry: NandGeometry) -> Self {
        Self::with_delay(geometry, Box::new(NoDelay::new()))
    }

    pub fn with_delay(geometry: NandGeometry, delay: Box<dyn Delay>) -> Self {
        let pages = geometry.pages_per_bank() as usize;
        let bank = || SimBank {
            blocks: vec![
                BlockStatus {
                    flags: 0,
                    next_page: 0,
                    timebomb: 0,
                };
                geometry.blocks_per_bank as usize
            ],
            raw: vec![0xFF; pages * geometry.bytes_per_page],
            shadow: vec![0xFF; pages * geometry.bytes_per_page],
            spare: vec![0xFF; pages * geometry.bytes_per_spare],
            programmed: vec![false; pages],
            flips: vec![0; pages],
            reset_polls: 0,
        };

        SimNand {
            geometry,
            banks: (0..geometry.banks).map(|_| bank()).collect(),
            stats: SimStats::default(),
            power_budget: None,
            rng: SmallRng::seed_from_u64(u64::from(geometry.device_id)),
            delay,
        }
    }

    pub fn stats(&self) -> &SimStats {
        &self.stats
    }

    fn page_slot(&self, addr: PageAddress) -> usize {
        addr.page_index(&self.geometry) as usize
    }

    fn check(&self, addr: PageAddress, data: usize, spare: usize) -> Result<(), NandError> {
        if !self.geometry.contains(addr) {
            return Err(NandError::OutOfRange(addr));
        }
        if data != self.geometry.bytes_per_page {
            return Err(NandError::BufferSize {
                got: data,
                expected: self.geometry.bytes_per_page,
            });
        }
        if spare > self.geometry.bytes_per_spare {
            return Err(NandError::BufferSize {
                got: spare,
                expected: self.geometry.bytes_per_spare,
            });
        }
        Ok(())
    }

    fn powered(&mut self, bank: Bank) -> Result<(), NandError> {
        match self.power_budget.as_mut() {
            Some(0) => Err(NandError::Timeout(bank)),
            Some(left) => {
                *left -= 1;
                Ok(())
            }
            None => Ok(()),
        }
    }

    fn timebomb_tick(&mut self, bank: Bank, block: BlockId) {
        let status = &mut self.banks[bank as usize].blocks[block as usize];
        if status.timebomb != 0 {
            status.timebomb -= 1;
            if status.timebomb == 0 {
                status.flags |= BLOCK_FAILED;
            }
        }
    }

    /// Block wears out on the spot: every later program or erase fails.
    pub fn sim_set_failed(&mut self, bank: Bank, block: BlockId) {
        self.banks[bank as usize].blocks[block as usize].flags |= BLOCK_FAILED;
    }

    /// Block fails after `ttl` more program/erase operations.
    pub fn sim_set_timebomb(&mut self, bank: Bank, block: BlockId, ttl: usize) {
        self.banks[bank as usize].blocks[block as usize].timebomb = ttl;
    }

    /// Factory-marked bad block.
    pub fn sim_inject_bad(&mut self, bank: Bank, block: BlockId) {
        self.banks[bank as usize].blocks[block as usize].flags |= BLOCK_BOTH;
    }

    pub fn sim_inject_random_bad(&mut self, count: usize) {
        for _ in 0..count {
            let bank = self.rng.gen_range(0..self.geometry.banks);
            let block = self.rng.gen_range(0..self.geometry.blocks_per_bank);
            self.sim_inject_bad(bank, block);
        }
    }

    /// Flip `count` distinct bits in the stored data of a page.
    pub fn sim_flip_bits(&mut self, addr: PageAddress, count: u32) {
        let slot = self.page_slot(addr);
        let page = self.geometry.bytes_per_page;
        let bits = page * 8;
        let mut chosen: Vec<usize> = Vec::with_capacity(count as usize);
        while chosen.len() < count as usize {
            let bit = self.rng.gen_range(0..bits);
            if !chosen.contains(&bit) {
                chosen.push(bit);
            }
        }

        let bank = &mut self.banks[addr.bank as usize];
        for bit in chosen {
            bank.raw[slot * page + bit / 8] ^= 1 << (bit % 8);
        }
        bank.flips[slot] = bank.flips[slot].saturating_add(count);
    }

    /// The page loses its programmed state and decays to almost-erased.
    /// Without a blank check it passes for an unwritten page.
    pub fn sim_decay_to_blank(&mut self, addr: PageAddress) {
        let slot = self.page_slot(addr);
        let (page, oob) = (self.geometry.bytes_per_page, self.geometry.bytes_per_spare);
        let bit = self.rng.gen_range(0..page * 8);
        let bank = &mut self.banks[addr.bank as usize];
        bank.raw[slot * page..(slot + 1) * page].fill(0xFF);
        bank.spare[slot * oob..(slot + 1) * oob].fill(0xFF);
        bank.raw[slot * page + bit / 8] &= !(1 << (bit % 8));
        bank.programmed[slot] = false;
    }

    /// The bank needs `polls` status polls before it leaves reset.
    /// `u32::MAX` hangs it for good.
    pub fn sim_hang_bank(&mut self, bank: Bank, polls: u32) {
        self.banks[bank as usize].reset_polls = polls;
    }

    /// Let `ops` more program/erase operations through, then drop power:
    /// every later one times out without touching the array.
    pub fn sim_power_cut_after(&mut self, ops: usize) {
        self.power_budget = Some(ops);
    }

    pub fn sim_restore_power(&mut self) {
        self.power_budget = None;
    }

    fn rep_status(&self, bank: usize, block: usize) -> char {
        let status = self.banks[bank].blocks[block];
        match status.flags {
            BLOCK_FAILED => 'b',
            BLOCK_BAD_MARK => '?',
            BLOCK_BOTH => 'B',
            _ => {
                if status.next_page != 0 {
                    ':'
                } else {
                    '.'
                }
            }
        }
    }

    pub fn sim_dump(&self) {
        info!("NAND operation counts: {:?}", self.stats);
        for bank in 0..self.banks.len() {
            let map: String = (0..self.geometry.blocks_per_bank as usize)
                .map(|block| self.rep_status(bank, block))
                .collect();
            info!("    bank {bank}: {map}");
        }
    }
}

fn seq_gen(seed: u64, buf: &mut [u8]) {
    SmallRng::seed_from_u64(seed).fill_bytes(buf);
}

impl NandDevice for SimNand {
    fn geometry(&self) -> NandGeometry {
        self.geometry
    }

    fn read(
        &mut self,
        addr: PageAddress,
        data: &mut [u8],
        spare: &mut [u8],
        do_ecc: bool,
        check_blank: bool,
    ) -> Result<(), NandError> {
        self.check(addr, data.len(), spare.len())?;
        if self.banks[addr.bank as usize].reset_polls == u32::MAX {
            return Err(NandError::Timeout(addr.bank));
        }
        self.stats.read += 1;

        let slot = self.page_slot(addr);
        let (page, oob) = (self.geometry.bytes_per_page, self.geometry.bytes_per_spare);
        let bank = &self.banks[addr.bank as usize];
        let raw = &bank.raw[slot * page..(slot + 1) * page];
        let oob_raw = &bank.spare[slot * oob..slot * oob + spare.len()];

        if !bank.programmed[slot] {
            let blank = raw.iter().chain(oob_raw).all(|&b| b == 0xFF);
            data.copy_from_slice(raw);
            spare.copy_from_slice(oob_raw);
            if check_blank && !blank {
                self.stats.read_ecc_fail += 1;
                return Err(NandError::Ecc);
            }
            self.stats.read_empty += 1;
            return Err(NandError::EmptyBlock);
        }

        spare.copy_from_slice(oob_raw);
        let flips = bank.flips[slot];
        if !do_ecc || flips == 0 {
            data.copy_from_slice(raw);
            return Ok(());
        }
        if flips > self.geometry.ecc_bits {
            data.copy_from_slice(raw);
            self.stats.read_ecc_fail += 1;
            return Err(NandError::Ecc);
        }
        data.copy_from_slice(&bank.shadow[slot * page..(slot + 1) * page]);
        self.stats.read_ecc_fixed += 1;
        Ok(())
    }

    fn write(
        &mut self,
        addr: PageAddress,
        data: &[u8],
        spare: &[u8],
        _do_ecc: bool,
    ) -> Result<(), NandError> {
        self.check(addr, data.len(), spare.len())?;
        self.powered(addr.bank)?;
        let status = self.banks[addr.bank as usize].blocks[addr.block as usize];
        assert!(
            status.flags & BLOCK_BAD_MARK == 0,
            "sim: write called on block which is marked bad: {addr}"
        );
        assert!(
            addr.page >= status.next_page,
            "sim: out-of-order page programming at {addr} (expected page {})",
            status.next_page
        );

        self.stats.prog += 1;
        self.banks[addr.bank as usize].blocks[addr.block as usize].next_page = addr.page + 1;
        self.timebomb_tick(addr.bank, addr.block);

        let slot = self.page_slot(addr);
        let (page, oob) = (self.geometry.bytes_per_page, self.geometry.bytes_per_spare);
        let failed = self.banks[addr.bank as usize].blocks[addr.block as usize].flags & BLOCK_FAILED != 0;
        let bank = &mut self.banks[addr.bank as usize];
        bank.programmed[slot] = true;

        if failed {
            self.stats.prog_fail += 1;
            let seed = u64::from(addr.page_index(&self.geometry)) * 57 + 29;
            seq_gen(seed, &mut bank.raw[slot * page..(slot + 1) * page]);
            bank.flips[slot] = UNREADABLE;
            return Err(NandError::ProgramFailed {
                bank: addr.bank,
                block: addr.block,
            });
        }

        bank.raw[slot * page..(slot + 1) * page].copy_from_slice(data);
        bank.shadow[slot * page..(slot + 1) * page].copy_from_slice(data);
        let oob_slot = &mut bank.spare[slot * oob..(slot + 1) * oob];
        oob_slot.fill(0xFF);
        oob_slot[..spare.len()].copy_from_slice(spare);
        bank.flips[slot] = 0;
        Ok(())
    }

    fn erase(&mut self, bank: Bank, block: BlockId) -> Result<(), NandError> {
        let first = PageAddress::new(bank, block, 0);
        if !self.geometry.contains(first) {
            return Err(NandError::OutOfRange(first));
        }
        self.powered(bank)?;
        assert!(
            self.banks[bank as usize].blocks[block as usize].flags & BLOCK_BAD_MARK == 0,
            "sim: erase called on block which is marked bad: {bank}:{block}"
        );

        self.stats.erase += 1;
        self.banks[bank as usize].blocks[block as usize].next_page = 0;
        self.timebomb_tick(bank, block);

        let ppb = self.geometry.pages_per_block as usize;
        let (page, oob) = (self.geometry.bytes_per_page, self.geometry.bytes_per_spare);
        let first_slot = self.page_slot(first);
        let pages = first_slot..first_slot + ppb;
        let failed = self.banks[bank as usize].blocks[block as usize].flags & BLOCK_FAILED != 0;
        let sim_bank = &mut self.banks[bank as usize];

        if failed {
            self.stats.erase_fail += 1;
            let seed = u64::from(block) * 57 + 29;
            seq_gen(seed, &mut sim_bank.raw[pages.start * page..pages.end * page]);
            for slot in pages {
                sim_bank.programmed[slot] = true;
                sim_bank.flips[slot] = UNREADABLE;
            }
            return Err(NandError::EraseFailed { bank, block });
        }

        sim_bank.raw[pages.start * page..pages.end * page].fill(0xFF);
        sim_bank.shadow[pages.start * page..pages.end * page].fill(0xFF);
        sim_bank.spare[pages.start * oob..pages.end * oob].fill(0xFF);
        for slot in pages {
            sim_bank.programmed[slot] = false;
            sim_bank.flips[slot] = 0;
        }
        Ok(())
    }

    fn bank_reset(&mut self, bank: Bank, timeout_ms: u32) -> Result<(), NandError> {
        if bank >= self.geometry.banks {
            return Err(NandError::OutOfRange(PageAddress::new(bank, 0, 0)));
        }
        self.stats.resets += 1;
        let polls = timeout_ms.saturating_mul(1000) / RESET_POLL_US;
        for _ in 0..polls {
            let left = &mut self.banks[bank as usize].reset_polls;
            if *left == 0 {
                return Ok(());
            }
            if *left != u32::MAX {
                *left -= 1;
            }
            self.delay.delay_us(RESET_POLL_US);
        }
        Err(NandError::ResetFailed(bank))
    }

    fn is_bad(&mut self, bank: Bank, block: BlockId) -> bool {
        assert!(
            bank < self.geometry.banks && block < self.geometry.blocks_per_bank,
            "sim: is_bad called on invalid block {bank}:{block}"
        );
        self.stats.is_bad += 1;
        self.banks[bank as usize].blocks[block as usize].flags & BLOCK_BAD_MARK != 0
    }

    fn set_bad(&mut self, bank: Bank, block: BlockId) {
        assert!(
            bank < self.geometry.banks && block < self.geometry.blocks_per_bank,
            "sim: set_bad called on invalid block {bank}:{block}"
        );
        self.stats.mark_bad += 1;
        self.banks[bank as usize].blocks[block as usize].flags |= BLOCK_BAD_MARK;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn page(byte: u8) -> Vec<u8> {
        vec![byte; SIM_GEOMETRY.bytes_per_page]
    }

    #[test]
    fn never_written_page_is_empty_not_corrupt() {
        let mut nand = SimNand::new(SIM_GEOMETRY);
        let mut data = page(0);
        let mut spare = [0u8; 16];
        let addr = PageAddress::new(1, 5, 3);
        assert_eq!(nand.read(addr, &mut data, &mut spare, true, true), Err(NandError::EmptyBlock));
        assert!(data.iter().all(|&b| b == 0xFF));
    }

    #[test]
    fn corrected_bits_are_fixed_and_excess_is_ecc() {
        let mut nand = SimNand::new(SIM_GEOMETRY);
        let addr = PageAddress::new(0, 2, 0);
        nand.erase(0, 2).unwrap();
        nand.write(addr, &page(0xA5), &[0x40; 12], true).unwrap();

        nand.sim_flip_bits(addr, SIM_GEOMETRY.ecc_bits);
        let mut data = page(0);
        let mut spare = [0u8; 12];
        nand.read(addr, &mut data, &mut spare, true, true).unwrap();
        assert_eq!(data, page(0xA5));

        nand.read(addr, &mut data, &mut spare, false, false).unwrap();
        assert_ne!(data, page(0xA5));

        nand.sim_flip_bits(addr, 1);
        assert_eq!(nand.read(addr, &mut data, &mut spare, true, true), Err(NandError::Ecc));
    }

    #[test]
    fn blank_check_catches_decayed_page() {
        let mut nand = SimNand::new(SIM_GEOMETRY);
        let addr = PageAddress::new(0, 1, 0);
        nand.erase(0, 1).unwrap();
        nand.write(addr, &page(0x00), &[0x40; 12], true).unwrap();
        nand.sim_decay_to_blank(addr);

        let mut data = page(0);
        let mut spare = [0u8; 12];
        assert_eq!(nand.read(addr, &mut data, &mut spare, true, false), Err(NandError::EmptyBlock));
        assert_eq!(nand.read(addr, &mut data, &mut spare, true, true), Err(NandError::Ecc));
    }

    #[test]
    fn read_multiple_reports_each_page() {
        let mut nand = SimNand::new(SIM_GEOMETRY);
        nand.erase(0, 4).unwrap();
        nand.erase(1, 4).unwrap();
        nand.write(PageAddress::new(0, 4, 0), &page(1), &[0x40; 12], true).unwrap();
        nand.write(PageAddress::new(1, 4, 0), &page(2), &[0x40; 12], true).unwrap();
        nand.sim_flip_bits(PageAddress::new(0, 4, 0), 9);

        let addrs = [
            PageAddress::new(0, 4, 0),
            PageAddress::new(1, 4, 0),
            PageAddress::new(1, 4, 1),
        ];
        let mut data = vec![0u8; 3 * SIM_GEOMETRY.bytes_per_page];
        let mut spare = vec![0u8; 3 * SIM_GEOMETRY.bytes_per_spare];
        let results = nand.read_multiple(&addrs, &mut data, &mut spare, true, true);
        assert_eq!(results, vec![Err(NandError::Ecc), Ok(()), Err(NandError::EmptyBlock)]);
        assert_eq!(data[512..1024], page(2)[..]);
    }

    #[test]
    fn timebomb_fails_block_later() {
        let mut nand = SimNand::new(SIM_GEOMETRY);
        nand.sim_set_timebomb(0, 7, 2);
        nand.erase(0, 7).unwrap();
        assert_eq!(
            nand.write(PageAddress::new(0, 7, 0), &page(3), &[0x40; 12], true),
            Err(NandError::ProgramFailed { bank: 0, block: 7 })
        );
        assert_eq!(nand.erase(0, 7), Err(NandError::EraseFailed { bank: 0, block: 7 }));
        assert_eq!(nand.stats().prog_fail, 1);
    }

    #[test]
    fn hung_bank_times_out_reset() {
        let delay = std::sync::Arc::new(NoDelay::new());
        let mut nand = SimNand::with_delay(SIM_GEOMETRY, Box::new(delay.clone()));
        nand.sim_hang_bank(1, 3);
        assert_eq!(nand.bank_reset(1, 1), Ok(()));
        assert_eq!(delay.waited_us(), 3 * u64::from(RESET_POLL_US));

        nand.sim_hang_bank(1, u32::MAX);
        assert_eq!(nand.bank_reset(1, 1), Err(NandError::ResetFailed(1)));
        assert_eq!(nand.bank_reset(0, 1), Ok(()));
    }

    #[test]
    fn power_cut_freezes_array() {
        let mut nand = SimNand::new(SIM_GEOMETRY);
        nand.sim_power_cut_after(1);
        nand.erase(0, 3).unwrap();
        assert_eq!(nand.erase(0, 4), Err(NandError::Timeout(0)));
        nand.sim_restore_power();
        nand.erase(0, 4).unwrap();
    }
}
