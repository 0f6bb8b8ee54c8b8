//! Virtual flash layer.
//!
//! A virtual block is one physical block on every bank; consecutive virtual
//! pages stripe across banks so sequential writes keep all chip-enables busy.
//! Each bank keeps its own virtual-to-physical block remap plus a pool of
//! replacement blocks, and bad blocks are swapped out of the remap as they
//! fail.
//!
//! The whole mapping lives in a small context that is written, with a
//! decreasing generation number, to the first `VFL_CTRL_BLOCKS` physical
//! blocks of every bank. Mount picks the newest generation that verifies.

use log::{debug, error, info, trace, warn};
use num_integer::Integer;
use thiserror::Error;

use crate::bytes::{verify_sealed, Reader, Writer};
use crate::config::{
    Bank, BlockId, VBlock, Vpn, BANK_RESET_TIMEOUT_MS, FTL_CTRL_SLOTS, VFL_CTRL_BLOCKS,
    VFL_MAX_RETRIES,
};
use crate::nand::{BlockState, NandDevice, NandError, NandGeometry, PageAddress};
use crate::spare::{MetaKind, SpareData, SpareError, META_F_LAST};

const CTX_MAGIC: &[u8; 4] = b"VFLC";
const CTX_VERSION: u16 = 2;
const NO_BLOCK: u16 = u16::MAX;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum VflError {
    #[error("virtual page {0} is empty")]
    Empty(Vpn),
    #[error("uncorrectable ECC error at virtual page {0}")]
    Ecc(Vpn),
    #[error("virtual page {0} out of range")]
    InvalidPage(Vpn),
    #[error("virtual block {0} out of range")]
    InvalidBlock(VBlock),
    #[error("bad spare on virtual page {vpn}: {source}")]
    Spare { vpn: Vpn, source: SpareError },
    #[error("reserved block pool of bank {0} is exhausted")]
    PoolExhausted(Bank),
    #[error("bank {0} has too many bad blocks")]
    TooManyBadBlocks(Bank),
    #[error("gave up on virtual page {0} after repeated failures")]
    TooManyRetries(Vpn),
    #[error("no valid VFL context found")]
    NoValidContext,
    #[error("VFL context does not fit in a block")]
    ContextTooLarge,
    #[error("VFL context could not be written to any bank")]
    ContextWriteFailed,
    #[error("too many FTL control blocks: {0}")]
    TooManyCtrlBlocks(usize),
    #[error(transparent)]
    Nand(#[from] NandError),
}

impl VflError {
    fn is_media_defect(&self) -> bool {
        matches!(self, VflError::Nand(e) if e.is_media_defect())
    }
}

#[derive(Debug, Default, Clone)]
pub struct VflStats {
    pub relocations: usize,
    pub retired: usize,
    pub commits: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct BankMap {
    remap: Vec<u16>,
    pool: Vec<u16>,
    bad: Vec<u16>,
    /// Mapped blocks that returned uncorrectable data. They stay in service
    /// until the next erase of their virtual block swaps them out.
    retire: Vec<u16>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct VflContext {
    usn_dec: u32,
    user_blocks: u16,
    ftl_ctrl: [u16; FTL_CTRL_SLOTS],
    banks: Vec<BankMap>,
}

impl VflContext {
    fn to_bytes(&self, geometry: &NandGeometry) -> Vec<u8> {
        let mut w = Writer::new();
        w.bytes(CTX_MAGIC);
        w.u16(CTX_VERSION);
        w.u16(geometry.banks as u16);
        w.u16(geometry.blocks_per_bank as u16);
        w.u16(self.user_blocks);
        w.u32(self.usn_dec);
        for &b in &self.ftl_ctrl {
            w.u16(b);
        }
        for bank in &self.banks {
            for &b in &bank.remap {
                w.u16(b);
            }
            w.u16(bank.pool.len() as u16);
            for &b in &bank.pool {
                w.u16(b);
            }
            w.u16(bank.bad.len() as u16);
            for &b in &bank.bad {
                w.u16(b);
            }
            w.u16(bank.retire.len() as u16);
            for &b in &bank.retire {
                w.u16(b);
            }
        }
        w.seal()
    }

    fn from_bytes(data: &[u8], geometry: &NandGeometry) -> Option<Self> {
        let mut r = Reader::new(data);
        if r.bytes(4)? != CTX_MAGIC || r.u16()? != CTX_VERSION {
            return None;
        }
        if u32::from(r.u16()?) != geometry.banks
            || u32::from(r.u16()?) != geometry.blocks_per_bank
        {
            return None;
        }
        let user_blocks = r.u16()?;
        let usn_dec = r.u32()?;
        let mut ftl_ctrl = [NO_BLOCK; FTL_CTRL_SLOTS];
        for slot in ftl_ctrl.iter_mut() {
            *slot = r.u16()?;
        }

        let in_range = |b: &u16| u32::from(*b) < geometry.blocks_per_bank;
        let mut banks = Vec::with_capacity(geometry.banks as usize);
        for _ in 0..geometry.banks {
            let remap: Vec<u16> = (0..user_blocks).map(|_| r.u16()).collect::<Option<_>>()?;
            let pool_len = r.u16()?;
            let pool: Vec<u16> = (0..pool_len).map(|_| r.u16()).collect::<Option<_>>()?;
            let bad_len = r.u16()?;
            let bad: Vec<u16> = (0..bad_len).map(|_| r.u16()).collect::<Option<_>>()?;
            let retire_len = r.u16()?;
            let retire: Vec<u16> = (0..retire_len).map(|_| r.u16()).collect::<Option<_>>()?;
            if !remap.iter().chain(&pool).chain(&bad).all(in_range)
                || !retire.iter().all(|b| remap.contains(b))
            {
                return None;
            }
            banks.push(BankMap {
                remap,
                pool,
                bad,
                retire,
            });
        }

        if !verify_sealed(data, r.sealed_body_len() + 8) {
            return None;
        }
        Some(VflContext {
            usn_dec,
            user_blocks,
            ftl_ctrl,
            banks,
        })
    }
}

#[derive(Debug, Clone, Copy)]
struct CtrlCursor {
    block: BlockId,
    next_page: u32,
}

/// A complete control group found during the mount scan.
struct CtxCopy {
    bank: Bank,
    usn_dec: u32,
    bytes: Vec<u8>,
}

pub struct VflLayer<N: NandDevice> {
    nand: N,
    geometry: NandGeometry,
    ctx: VflContext,
    cursors: Vec<CtrlCursor>,
    spare_buf: Vec<u8>,
    stats: VflStats,
}

/// Replacement blocks kept back per bank.
fn reserved_blocks(geometry: &NandGeometry) -> u32 {
    (geometry.blocks_per_bank / 16).max(2)
}

impl<N: NandDevice> VflLayer<N> {
    fn with_context(nand: N, ctx: VflContext, cursors: Vec<CtrlCursor>) -> Self {
        let geometry = nand.geometry();
        VflLayer {
            nand,
            geometry,
            ctx,
            cursors,
            spare_buf: vec![0xFF; geometry.bytes_per_spare],
            stats: VflStats::default(),
        }
    }

    /// Lay down a fresh mapping. Factory-bad blocks are skipped and the
    /// remainder of each bank past the user area becomes its reserve pool.
    pub fn format(mut nand: N) -> Result<Self, VflError> {
        let geometry = nand.geometry();
        let user_blocks = geometry
            .blocks_per_bank
            .checked_sub(VFL_CTRL_BLOCKS + reserved_blocks(&geometry))
            .filter(|&n| n > 0 && n < u32::from(NO_BLOCK))
            .ok_or(VflError::TooManyBadBlocks(0))?;

        let mut banks = Vec::with_capacity(geometry.banks as usize);
        let mut cursors = Vec::with_capacity(geometry.banks as usize);
        for bank in 0..geometry.banks {
            nand.bank_reset(bank, BANK_RESET_TIMEOUT_MS)?;

            let (good, bad): (Vec<BlockId>, Vec<BlockId>) = (VFL_CTRL_BLOCKS
                ..geometry.blocks_per_bank)
                .partition(|&b| !nand.is_bad(bank, b));
            if (good.len() as u32) < user_blocks {
                return Err(VflError::TooManyBadBlocks(bank));
            }

            let mut ctrl = None;
            let mut bad_ctrl = Vec::new();
            for block in 0..VFL_CTRL_BLOCKS {
                if nand.is_bad(bank, block) {
                    bad_ctrl.push(block as u16);
                    continue;
                }
                match nand.erase(bank, block) {
                    Ok(()) => {
                        ctrl.get_or_insert(block);
                    }
                    Err(e) if e.is_media_defect() => {
                        nand.set_bad(bank, block);
                        bad_ctrl.push(block as u16);
                    }
                    Err(e) => return Err(e.into()),
                }
            }
            let block = ctrl.ok_or(VflError::TooManyBadBlocks(bank))?;
            cursors.push(CtrlCursor {
                block,
                next_page: 0,
            });

            let (remap, pool) = good.split_at(user_blocks as usize);
            banks.push(BankMap {
                remap: remap.iter().map(|&b| b as u16).collect(),
                // Popped from the back, so hand out low blocks first.
                pool: pool.iter().rev().map(|&b| b as u16).collect(),
                bad: bad_ctrl
                    .into_iter()
                    .chain(bad.iter().map(|&b| b as u16))
                    .collect(),
                retire: Vec::new(),
            });
            debug!(
                "vfl: bank {bank}: {} user, {} reserve, {} factory bad",
                remap.len(),
                pool.len(),
                bad.len()
            );
        }

        let ctx = VflContext {
            usn_dec: u32::MAX,
            user_blocks: user_blocks as u16,
            ftl_ctrl: [NO_BLOCK; FTL_CTRL_SLOTS],
            banks,
        };
        let ctx_len = ctx.to_bytes(&geometry).len();
        let ctx_pages = Integer::div_ceil(&ctx_len, &geometry.bytes_per_page);
        if ctx_pages as u32 > geometry.pages_per_block {
            return Err(VflError::ContextTooLarge);
        }

        let mut vfl = Self::with_context(nand, ctx, cursors);
        vfl.commit()?;
        info!(
            "vfl: formatted {} banks, {} virtual blocks of {} pages",
            geometry.banks,
            user_blocks,
            vfl.pages_per_vblock()
        );
        Ok(vfl)
    }

    /// Mount: reset all banks, then find the newest context generation that
    /// verifies. Banks holding an older or damaged copy are brought up to
    /// date.
    pub fn open(mut nand: N) -> Result<Self, VflError> {
        let geometry = nand.geometry();
        for bank in 0..geometry.banks {
            nand.bank_reset(bank, BANK_RESET_TIMEOUT_MS)?;
        }

        let mut copies = Vec::new();
        let mut cursors = Vec::with_capacity(geometry.banks as usize);
        for bank in 0..geometry.banks {
            cursors.push(scan_ctrl_blocks(&mut nand, bank, &mut copies)?);
        }

        copies.sort_by_key(|c| c.usn_dec);
        let ctx = copies
            .iter()
            .find_map(|c| match VflContext::from_bytes(&c.bytes, &geometry) {
                Some(ctx) if ctx.usn_dec == c.usn_dec => Some(ctx),
                _ => {
                    warn!(
                        "vfl: context generation {:#x} on bank {} failed verification",
                        c.usn_dec, c.bank
                    );
                    None
                }
            })
            .ok_or(VflError::NoValidContext)?;

        let agreeing = copies
            .iter()
            .filter(|c| c.usn_dec == ctx.usn_dec)
            .filter(|c| VflContext::from_bytes(&c.bytes, &geometry).as_ref() == Some(&ctx))
            .count();

        info!(
            "vfl: mounted context generation {:#x} ({}/{} banks agree)",
            ctx.usn_dec, agreeing, geometry.banks
        );

        // Damaged newer generations still use up their numbers.
        let lowest = copies.first().map_or(ctx.usn_dec, |c| c.usn_dec);
        let mut vfl = Self::with_context(nand, VflContext { usn_dec: lowest, ..ctx }, cursors);
        // A control block that died after the last generation was cut.
        let mut stale = agreeing < geometry.banks as usize;
        for bank in 0..geometry.banks {
            for block in 0..VFL_CTRL_BLOCKS {
                if vfl.nand.is_bad(bank, block)
                    && !vfl.ctx.banks[bank as usize].bad.contains(&(block as u16))
                {
                    vfl.mark_ctrl_bad(bank, block);
                    stale = true;
                }
            }
        }
        if stale {
            warn!("vfl: refreshing stale context copies");
            vfl.commit()?;
        }
        Ok(vfl)
    }

    pub fn geometry(&self) -> NandGeometry {
        self.geometry
    }

    pub fn stats(&self) -> &VflStats {
        &self.stats
    }

    pub fn nand(&self) -> &N {
        &self.nand
    }

    pub fn nand_mut(&mut self) -> &mut N {
        &mut self.nand
    }

    pub fn into_nand(self) -> N {
        self.nand
    }

    pub fn user_blocks(&self) -> u32 {
        u32::from(self.ctx.user_blocks)
    }

    pub fn pages_per_vblock(&self) -> u32 {
        self.geometry.pages_per_block * self.geometry.banks
    }

    pub fn total_pages(&self) -> u32 {
        self.user_blocks() * self.pages_per_vblock()
    }

    /// Physical page currently backing `vpn`.
    pub fn locate(&self, vpn: Vpn) -> Result<PageAddress, VflError> {
        if vpn >= self.total_pages() {
            return Err(VflError::InvalidPage(vpn));
        }
        let ppvb = self.pages_per_vblock();
        let (vb, offset) = (vpn / ppvb, vpn % ppvb);
        let bank = offset % self.geometry.banks;
        let block = self.ctx.banks[bank as usize].remap[vb as usize];
        Ok(PageAddress::new(
            bank,
            BlockId::from(block),
            offset / self.geometry.banks,
        ))
    }

    fn check_vblock(&self, vb: VBlock) -> Result<(), VflError> {
        if vb >= self.user_blocks() {
            return Err(VflError::InvalidBlock(vb));
        }
        Ok(())
    }

    /// Status of a physical block as far as the VFL is concerned.
    pub fn block_state(&self, bank: Bank, block: BlockId) -> BlockState {
        let Some(map) = self.ctx.banks.get(bank as usize) else {
            return BlockState::Bad;
        };
        if block >= self.geometry.blocks_per_bank {
            return BlockState::Bad;
        }
        let id = block as u16;
        if map.bad.contains(&id) {
            BlockState::Bad
        } else if map.pool.contains(&id) {
            BlockState::Free
        } else if map.remap.contains(&id) || block < VFL_CTRL_BLOCKS {
            BlockState::Allocated
        } else {
            BlockState::Bad
        }
    }

    fn interpret(
        &mut self,
        vpn: Vpn,
        addr: PageAddress,
        result: Result<(), NandError>,
        spare: &[u8],
        empty_ok: bool,
    ) -> Result<Option<SpareData>, VflError> {
        match result {
            Ok(()) => SpareData::decode(spare)
                .map(Some)
                .map_err(|source| VflError::Spare { vpn, source }),
            Err(NandError::EmptyBlock) if empty_ok => Ok(None),
            Err(NandError::EmptyBlock) => Err(VflError::Empty(vpn)),
            Err(NandError::Ecc) => {
                self.schedule_bad(addr.bank, addr.block);
                Err(VflError::Ecc(vpn))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Read one virtual page. `Ok(None)` is an unwritten page, which is only
    /// acceptable when the caller is scanning with `empty_ok`.
    pub fn read(
        &mut self,
        vpn: Vpn,
        data: &mut [u8],
        empty_ok: bool,
    ) -> Result<Option<SpareData>, VflError> {
        let addr = self.locate(vpn)?;
        let result = self
            .nand
            .read(addr, data, &mut self.spare_buf, true, true);
        let spare = self.spare_buf.clone();
        trace!("vfl: read {vpn} @ {addr}: {result:?}");
        self.interpret(vpn, addr, result, &spare, empty_ok)
    }

    /// Batched read of `count` consecutive pages of one virtual block.
    pub fn read_multiple_pages_in_vb(
        &mut self,
        vb: VBlock,
        first: u32,
        count: u32,
        data: &mut [u8],
        empty_ok: bool,
    ) -> Result<Vec<Result<Option<SpareData>, VflError>>, VflError> {
        let end = first
            .checked_add(count)
            .ok_or(VflError::InvalidPage(first))?;
        let offsets: Vec<u32> = (first..end).collect();
        self.read_scattered_pages_in_vb(vb, &offsets, data, empty_ok)
    }

    /// Batched read of arbitrary pages of one virtual block. Each page gets
    /// its own result; the outer error is only for bad arguments.
    pub fn read_scattered_pages_in_vb(
        &mut self,
        vb: VBlock,
        offsets: &[u32],
        data: &mut [u8],
        empty_ok: bool,
    ) -> Result<Vec<Result<Option<SpareData>, VflError>>, VflError> {
        self.check_vblock(vb)?;
        let (page, oob) = (self.geometry.bytes_per_page, self.geometry.bytes_per_spare);
        let needed = offsets.len() * page;
        if data.len() < needed {
            return Err(NandError::BufferSize {
                got: data.len(),
                expected: needed,
            }
            .into());
        }

        let base = vb * self.pages_per_vblock();
        let mut addrs = Vec::with_capacity(offsets.len());
        for &offset in offsets {
            if offset >= self.pages_per_vblock() {
                return Err(VflError::InvalidPage(base + offset));
            }
            addrs.push(self.locate(base + offset)?);
        }

        let mut spare = vec![0xFF; offsets.len() * oob];
        let results =
            self.nand
                .read_multiple(&addrs, &mut data[..needed], &mut spare, true, true);

        let mut out = Vec::with_capacity(results.len());
        for (i, result) in results.into_iter().enumerate() {
            let vpn = base + offsets[i];
            let oob_slice = &spare[i * oob..(i + 1) * oob];
            out.push(self.interpret(vpn, addrs[i], result, oob_slice, empty_ok));
        }
        Ok(out)
    }

    /// Program one virtual page. A program failure retires the physical
    /// block, moves what was already written to a replacement and retries
    /// there, so success means the data is on media.
    pub fn write(&mut self, vpn: Vpn, data: &[u8], spare: &SpareData) -> Result<(), VflError> {
        let mut addr = self.locate(vpn)?;
        let mut raw = vec![0xFF; self.geometry.bytes_per_spare];
        spare
            .encode(&mut raw)
            .map_err(|source| VflError::Spare { vpn, source })?;

        for _ in 0..VFL_MAX_RETRIES {
            match self.nand.write(addr, data, &raw, true) {
                Ok(()) => {
                    trace!("vfl: wrote {vpn} @ {addr}");
                    return Ok(());
                }
                Err(e) if e.is_media_defect() => {
                    warn!("vfl: write of {vpn} failed at {addr}: {e}");
                    let vb = vpn / self.pages_per_vblock();
                    addr.block = self.relocate(addr.bank, vb, addr.page)?;
                }
                Err(e) => return Err(e.into()),
            }
        }
        Err(VflError::TooManyRetries(vpn))
    }

    /// Erase a virtual block on every bank. Blocks that fail, or that were
    /// scheduled for retirement after ECC trouble, are replaced.
    pub fn erase(&mut self, vb: VBlock) -> Result<(), VflError> {
        self.check_vblock(vb)?;
        for bank in 0..self.geometry.banks {
            let map = &self.ctx.banks[bank as usize];
            let block = BlockId::from(map.remap[vb as usize]);
            if map.retire.contains(&(block as u16)) {
                debug!("vfl: retiring scheduled block {bank}:{block}");
                self.relocate(bank, vb, 0)?;
                continue;
            }
            match self.nand.erase(bank, block) {
                Ok(()) => {}
                Err(e) if e.is_media_defect() => {
                    warn!("vfl: erase of virtual block {vb} failed: {e}");
                    self.relocate(bank, vb, 0)?;
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    pub fn store_ftl_ctrl_block(&mut self, blocks: &[VBlock]) -> Result<(), VflError> {
        if blocks.len() > FTL_CTRL_SLOTS {
            return Err(VflError::TooManyCtrlBlocks(blocks.len()));
        }
        let mut slots = [NO_BLOCK; FTL_CTRL_SLOTS];
        for (slot, &vb) in slots.iter_mut().zip(blocks) {
            self.check_vblock(vb)?;
            *slot = vb as u16;
        }
        if slots != self.ctx.ftl_ctrl {
            self.ctx.ftl_ctrl = slots;
            self.commit()?;
        }
        Ok(())
    }

    pub fn get_ftl_ctrl_block(&self) -> Vec<VBlock> {
        self.ctx
            .ftl_ctrl
            .iter()
            .filter(|&&b| b != NO_BLOCK)
            .map(|&b| VBlock::from(b))
            .collect()
    }

    /// Remember a block for retirement at its next erase. The list is part
    /// of the context, so a remount before that erase does not forget it.
    fn schedule_bad(&mut self, bank: Bank, block: BlockId) {
        let retire = &mut self.ctx.banks[bank as usize].retire;
        if retire.contains(&(block as u16)) {
            return;
        }
        warn!("vfl: scheduling {bank}:{block} for retirement");
        retire.push(block as u16);
        if let Err(e) = self.commit() {
            warn!("vfl: retirement of {bank}:{block} not persisted: {e}");
        }
    }

    fn retire(&mut self, bank: Bank, block: BlockId) {
        warn!("vfl: retiring bad block {bank}:{block}");
        self.nand.set_bad(bank, block);
        let map = &mut self.ctx.banks[bank as usize];
        if !map.bad.contains(&(block as u16)) {
            map.bad.push(block as u16);
        }
        map.retire.retain(|&b| b != block as u16);
        self.stats.retired += 1;
    }

    /// Swap the physical block behind `vb` on `bank` for one from the pool,
    /// carrying over its first `copy_pages` pages. Returns the new block.
    fn relocate(&mut self, bank: Bank, vb: VBlock, copy_pages: u32) -> Result<BlockId, VflError> {
        let old = BlockId::from(self.ctx.banks[bank as usize].remap[vb as usize]);
        self.retire(bank, old);

        for _ in 0..VFL_MAX_RETRIES {
            let new = self.ctx.banks[bank as usize]
                .pool
                .pop()
                .map(BlockId::from)
                .ok_or_else(|| {
                    error!("vfl: no replacement left on bank {bank}");
                    VflError::PoolExhausted(bank)
                })?;

            match self.erase_and_copy(bank, old, new, copy_pages) {
                Ok(()) => {
                    self.ctx.banks[bank as usize].remap[vb as usize] = new as u16;
                    self.stats.relocations += 1;
                    info!("vfl: virtual block {vb} on bank {bank} moved {old} -> {new}");
                    self.commit()?;
                    return Ok(new);
                }
                Err(e) if e.is_media_defect() => self.retire(bank, new),
                Err(e) => {
                    self.ctx.banks[bank as usize].pool.push(new as u16);
                    return Err(e);
                }
            }
        }
        Err(VflError::TooManyRetries(vb * self.pages_per_vblock()))
    }

    fn erase_and_copy(
        &mut self,
        bank: Bank,
        from: BlockId,
        to: BlockId,
        pages: u32,
    ) -> Result<(), VflError> {
        self.nand.erase(bank, to)?;
        let mut data = vec![0u8; self.geometry.bytes_per_page];
        let mut spare = vec![0u8; self.geometry.bytes_per_spare];
        for page in 0..pages {
            let src = PageAddress::new(bank, from, page);
            match self.nand.read(src, &mut data, &mut spare, true, false) {
                Ok(()) => {
                    self.nand
                        .write(PageAddress::new(bank, to, page), &data, &spare, true)?;
                }
                Err(NandError::EmptyBlock) => {}
                Err(NandError::Ecc) => error!("vfl: lost page {src} while relocating"),
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    /// Write the next context generation to every bank. Succeeds if at
    /// least one bank took it.
    fn commit(&mut self) -> Result<(), VflError> {
        self.ctx.usn_dec = self.ctx.usn_dec.wrapping_sub(1);
        let bytes = self.ctx.to_bytes(&self.geometry);
        let page = self.geometry.bytes_per_page;
        let pages: Vec<Vec<u8>> = bytes
            .chunks(page)
            .map(|chunk| {
                let mut p = vec![0xFF; page];
                p[..chunk.len()].copy_from_slice(chunk);
                p
            })
            .collect();

        let mut written = 0;
        for bank in 0..self.geometry.banks {
            match self.write_ctx_on_bank(bank, &pages) {
                Ok(()) => written += 1,
                Err(e) => warn!("vfl: context copy on bank {bank} failed: {e}"),
            }
        }
        if written == 0 {
            error!("vfl: context generation {:#x} not persisted", self.ctx.usn_dec);
            return Err(VflError::ContextWriteFailed);
        }
        self.stats.commits += 1;
        debug!(
            "vfl: committed context generation {:#x} to {written} banks",
            self.ctx.usn_dec
        );
        Ok(())
    }

    /// A control block never enters the remap, so it goes straight onto the
    /// bad list. The next generation records it.
    fn mark_ctrl_bad(&mut self, bank: Bank, block: BlockId) {
        self.nand.set_bad(bank, block);
        let bad = &mut self.ctx.banks[bank as usize].bad;
        if !bad.contains(&(block as u16)) {
            bad.push(block as u16);
        }
    }

    fn write_ctx_on_bank(&mut self, bank: Bank, pages: &[Vec<u8>]) -> Result<(), VflError> {
        let count = pages.len() as u32;
        let mut cursor = self.cursors[bank as usize];
        if cursor.next_page + count > self.geometry.pages_per_block
            || self.nand.is_bad(bank, cursor.block)
        {
            // Rotate to the other control block; the newest copy stays
            // intact in the current one until this one is complete.
            let other = (1..=VFL_CTRL_BLOCKS)
                .map(|i| (cursor.block + i) % VFL_CTRL_BLOCKS)
                .find(|&b| !self.nand.is_bad(bank, b))
                .ok_or(VflError::TooManyBadBlocks(bank))?;
            if let Err(e) = self.nand.erase(bank, other) {
                if e.is_media_defect() {
                    warn!("vfl: control block {bank}:{other} failed erase, marking bad");
                    self.mark_ctrl_bad(bank, other);
                }
                return Err(e.into());
            }
            cursor = CtrlCursor {
                block: other,
                next_page: 0,
            };
        }

        let mut spare = vec![0xFF; self.geometry.bytes_per_spare];
        for (idx, data) in pages.iter().enumerate() {
            SpareData::Meta {
                kind: MetaKind::VflContext,
                usn_dec: self.ctx.usn_dec,
                idx: idx as u16,
                flags: if idx + 1 == pages.len() { META_F_LAST } else { 0 },
            }
            .encode(&mut spare)
            .map_err(|source| VflError::Spare { vpn: 0, source })?;

            let addr = PageAddress::new(bank, cursor.block, cursor.next_page);
            cursor.next_page += 1;
            if let Err(e) = self.nand.write(addr, data, &spare, true) {
                if e.is_media_defect() {
                    warn!("vfl: control block {bank}:{} failed program, marking bad", cursor.block);
                    self.mark_ctrl_bad(bank, cursor.block);
                }
                // Force a rotation next time.
                cursor.next_page = self.geometry.pages_per_block;
                self.cursors[bank as usize] = cursor;
                return Err(e.into());
            }
        }
        self.cursors[bank as usize] = cursor;
        Ok(())
    }
}

/// Walk both control blocks of a bank, collecting every complete context
/// group. Returns where the next generation should go on this bank.
fn scan_ctrl_blocks<N: NandDevice>(
    nand: &mut N,
    bank: Bank,
    copies: &mut Vec<CtxCopy>,
) -> Result<CtrlCursor, VflError> {
    let geometry = nand.geometry();
    let mut data = vec![0u8; geometry.bytes_per_page];
    let mut spare = vec![0u8; geometry.bytes_per_spare];
    let mut newest: Option<(u32, CtrlCursor)> = None;
    let mut fallback = None;

    for block in 0..VFL_CTRL_BLOCKS {
        if nand.is_bad(bank, block) {
            continue;
        }
        let mut group: Option<(u32, Vec<u8>)> = None;
        let mut written = 0;
        let mut block_newest: Option<u32> = None;

        for page in 0..geometry.pages_per_block {
            let addr = PageAddress::new(bank, block, page);
            match nand.read(addr, &mut data, &mut spare, true, true) {
                Ok(()) => {}
                Err(NandError::EmptyBlock) => break,
                Err(NandError::Ecc) => {
                    warn!("vfl: unreadable control page {addr}");
                    written = page + 1;
                    group = None;
                    continue;
                }
                Err(e) => return Err(e.into()),
            }
            written = page + 1;

            let Some((usn_dec, idx, flags)) = SpareData::decode(&spare)
                .ok()
                .and_then(|s| s.as_meta(MetaKind::VflContext))
            else {
                group = None;
                continue;
            };
            block_newest = Some(block_newest.map_or(usn_dec, |n| n.min(usn_dec)));

            group = match group.take() {
                _ if idx == 0 => Some((usn_dec, data.clone())),
                Some((g, mut bytes))
                    if g == usn_dec && bytes.len() == idx as usize * geometry.bytes_per_page =>
                {
                    bytes.extend_from_slice(&data);
                    Some((g, bytes))
                }
                _ => None,
            };
            if flags & META_F_LAST != 0 {
                if let Some((usn_dec, bytes)) = group.take() {
                    copies.push(CtxCopy {
                        bank,
                        usn_dec,
                        bytes,
                    });
                }
            }
        }

        let cursor = CtrlCursor {
            block,
            next_page: written,
        };
        fallback.get_or_insert(cursor);
        if let Some(n) = block_newest {
            if newest.map_or(true, |(best, _)| n < best) {
                newest = Some((n, cursor));
            }
        }
    }

    Ok(newest.map(|(_, cursor)| cursor).or(fallback).unwrap_or_else(|| {
        warn!("vfl: bank {bank} has no usable control block");
        CtrlCursor {
            block: 0,
            next_page: geometry.pages_per_block,
        }
    }))
}
