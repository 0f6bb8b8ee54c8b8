#![allow(dead_code)]

use std::collections::HashSet;

use apple_flash::config::{FtlConfig, Lpn};
use apple_flash::ftl::FtlLayer;
use apple_flash::sim::{SimNand, SIM_GEOMETRY};
use apple_flash::vfl::VflLayer;
use simplelog::*;

pub fn init_logger() {
    let _ = TestLogger::init(LevelFilter::Info, Config::default());
}

pub fn format(nand: SimNand, config: FtlConfig) -> FtlLayer<SimNand> {
    let vfl = VflLayer::format(nand).expect("vfl format");
    FtlLayer::format(vfl, config).expect("ftl format")
}

pub fn fresh(config: FtlConfig) -> FtlLayer<SimNand> {
    format(SimNand::new(SIM_GEOMETRY), config)
}

pub fn mount(nand: SimNand, config: FtlConfig) -> FtlLayer<SimNand> {
    let vfl = VflLayer::open(nand).expect("vfl open");
    FtlLayer::setup(vfl, config).expect("ftl setup")
}

/// Pull the plug: nothing is synced, the chips keep whatever was
/// programmed.
pub fn crash(ftl: FtlLayer<SimNand>) -> SimNand {
    let mut nand = ftl.into_vfl().into_nand();
    nand.sim_restore_power();
    nand
}

pub fn fill(buf: &mut [u8], lpn: Lpn, gen: u32) {
    buf.fill((lpn.wrapping_mul(31) ^ gen) as u8);
    buf[..4].copy_from_slice(&lpn.to_le_bytes());
    buf[4..8].copy_from_slice(&gen.to_le_bytes());
}

/// What every logical page should hold.
pub struct Model {
    gens: Vec<Option<u32>>,
    page: Vec<u8>,
}

impl Model {
    pub fn new(ftl: &FtlLayer<SimNand>) -> Self {
        Model {
            gens: vec![None; ftl.logical_pages() as usize],
            page: vec![0; ftl.page_size()],
        }
    }

    pub fn pages(&self) -> u32 {
        self.gens.len() as u32
    }

    /// Write the next generation of `lpn`; the model only moves forward
    /// when the FTL accepted the page.
    pub fn write(&mut self, ftl: &mut FtlLayer<SimNand>, lpn: Lpn) -> bool {
        let gen = self.gens[lpn as usize].map_or(0, |g| g + 1);
        fill(&mut self.page, lpn, gen);
        match ftl.write(lpn, 1, &self.page) {
            Ok(1) => {
                self.gens[lpn as usize] = Some(gen);
                true
            }
            Ok(n) => panic!("wrote {n} pages for a one page request"),
            Err(e) => {
                assert_eq!(e.completed, 0);
                false
            }
        }
    }

    pub fn verify(&mut self, ftl: &mut FtlLayer<SimNand>) {
        let mut expected = vec![0u8; self.page.len()];
        for lpn in 0..self.pages() {
            ftl.read(lpn, 1, &mut self.page)
                .unwrap_or_else(|e| panic!("read of lpn {lpn} failed: {e}"));
            match self.gens[lpn as usize] {
                Some(gen) => fill(&mut expected, lpn, gen),
                None => expected.fill(0),
            }
            assert!(
                self.page == expected,
                "lpn {lpn}: expected generation {:?}, got {:02x?}",
                self.gens[lpn as usize],
                &self.page[..8]
            );
        }
    }
}

/// Every mapped page is owned by exactly one lpn and its spare agrees.
pub fn check_single_owner(ftl: &mut FtlLayer<SimNand>) {
    let mut seen = HashSet::new();
    let mut buf = vec![0u8; ftl.page_size()];
    for lpn in 0..ftl.logical_pages() {
        let Some(vpn) = ftl.lookup(lpn) else {
            continue;
        };
        assert!(seen.insert(vpn), "vpn {vpn} mapped twice (second: lpn {lpn})");
        let spare = ftl
            .vfl_mut()
            .read(vpn, &mut buf, false)
            .unwrap_or_else(|e| panic!("mapped page {vpn} unreadable: {e}"))
            .and_then(|s| s.as_user());
        assert_eq!(spare.map(|(owner, _)| owner), Some(lpn), "owner of {vpn}");
    }
}

pub fn snapshot(ftl: &FtlLayer<SimNand>) -> Vec<Option<u32>> {
    (0..ftl.logical_pages()).map(|lpn| ftl.lookup(lpn)).collect()
}
