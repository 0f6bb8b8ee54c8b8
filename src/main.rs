use std::error::Error;

use apple_flash::block::{BlockDevice, FlashDisk};
use apple_flash::bus::I2cRegistry;
use apple_flash::config::{FtlConfig, Lpn, I2C_BUSES};
use apple_flash::delay::StdDelay;
use apple_flash::ftl::FtlLayer;
use apple_flash::sim::{SimI2c, SimNand, SIM_GEOMETRY};
use apple_flash::vfl::VflLayer;
use log::info;
use rand::prelude::*;
use simplelog::*;
use time::macros::format_description;

fn fill(buf: &mut [u8], lpn: Lpn, gen: u32) {
    buf.fill((lpn ^ gen) as u8);
    buf[..4].copy_from_slice(&lpn.to_le_bytes());
    buf[4..8].copy_from_slice(&gen.to_le_bytes());
}

fn main() -> Result<(), Box<dyn Error>> {
    let log_cfg = ConfigBuilder::new()
        .set_time_format_custom(format_description!("[hour]:[minute]:[second].[subsecond]"))
        .build();

    SimpleLogger::init(LevelFilter::Info, log_cfg)?;

    let op = 7.0;
    let config = FtlConfig::new_with_op(op);
    let mut nand = SimNand::new(SIM_GEOMETRY);
    nand.sim_inject_random_bad(4);
    let vfl = VflLayer::format(nand)?;
    let disk = FlashDisk::new(FtlLayer::format(vfl, config)?);
    let max_lba = disk.total_blocks() as Lpn;
    let mut page = vec![0u8; disk.block_size()];
    let mut gens = vec![0u32; max_lba as usize];

    for lpn in 0..max_lba {
        fill(&mut page, lpn, 0);
        disk.write_blocks(lpn.into(), &page)?;
    }
    info!("Drive preconditioned");

    let mut rng: SmallRng = SmallRng::seed_from_u64(7);

    for c in 0..4 {
        for _ in 0..max_lba {
            let lpn = rng.gen_range(0..max_lba);
            gens[lpn as usize] += 1;
            fill(&mut page, lpn, gens[lpn as usize]);
            disk.write_blocks(lpn.into(), &page)?;
        }
        info!("Capacity {} randomly written", c);
    }
    disk.release()?;

    let ftl = disk.into_inner();
    let stats = ftl.stats().clone();
    info!(
        "{} host writes, {} gc writes, WA {:.3}, {} wear leveling runs",
        stats.host_writes,
        stats.gc_writes,
        stats.write_amplification(),
        stats.wear_level_runs
    );
    let nand = ftl.into_vfl().into_nand();
    nand.sim_dump();

    let disk = FlashDisk::new(FtlLayer::setup(VflLayer::open(nand)?, config)?);
    let mut expected = vec![0u8; page.len()];
    for lpn in 0..max_lba {
        disk.read_blocks(lpn.into(), &mut page)?;
        fill(&mut expected, lpn, gens[lpn as usize]);
        if page != expected {
            return Err(format!("lpn {lpn} does not match after remount").into());
        }
    }
    info!("All {} pages verified after remount", max_lba);

    let mut eeprom = SimI2c::new();
    eeprom.add_target(0x50, b"s5l8900");
    let buses = (1..I2C_BUSES).map(|_| SimI2c::new());
    let i2c = I2cRegistry::new(std::iter::once(eeprom).chain(buses).collect(), StdDelay);
    let mut id = [0u8; 7];
    i2c.write_read(0, 0x50, &[0x00], &mut id)?;
    info!("I2C target 0x50 reports {:?}", String::from_utf8_lossy(&id));

    Ok(())
}
