mod util;

use apple_flash::config::{Bank, BlockId, FtlConfig, Lpn};
use apple_flash::ftl::FtlLayer;
use apple_flash::nand::{BlockState, NandDevice};
use apple_flash::sim::{SimNand, SIM_GEOMETRY};
use log::info;
use rand::prelude::*;
use util::*;

/// Blocks a scenario expects to see retired by the end of the run.
type Expected = Vec<(Bank, BlockId)>;

/// Physical blocks backing some virtual block, and what the VFL thinks of
/// them. Nothing mapped may be marked bad on the chip.
fn check_mapping(ftl: &mut FtlLayer<SimNand>, retired: &[(Bank, BlockId)]) {
    let ppvb = ftl.vfl().pages_per_vblock();
    let banks = ftl.vfl().geometry().banks;
    for vb in 0..ftl.vfl().user_blocks() {
        for bank in 0..banks {
            let addr = ftl.vfl().locate(vb * ppvb + bank).unwrap();
            assert!(
                !retired.contains(&(addr.bank, addr.block)),
                "virtual block {vb} still backed by retired {addr}"
            );
            assert_eq!(ftl.vfl().block_state(addr.bank, addr.block), BlockState::Allocated);
            assert!(!ftl.vfl_mut().nand_mut().is_bad(addr.bank, addr.block));
        }
    }
    for &(bank, block) in retired {
        assert_eq!(
            ftl.vfl().block_state(bank, block),
            BlockState::Bad,
            "{bank}:{block} not known as bad"
        );
    }
}

fn workload(ftl: &mut FtlLayer<SimNand>, model: &mut Model, seed: u64) {
    let pages = model.pages();
    let mut rng = SmallRng::seed_from_u64(seed);
    for lpn in 0..pages {
        assert!(model.write(ftl, lpn), "sequential write of {lpn} failed");
    }
    for i in 0..pages * 2 {
        let lpn: Lpn = rng.gen_range(0..pages);
        assert!(model.write(ftl, lpn), "random write of {lpn} failed");
        if i % 500 == 499 {
            ftl.sync().unwrap();
        }
    }
}

/// Each scenario damages the chip before it is formatted.
fn run(name: &str, scen: fn(&mut SimNand) -> Expected) {
    init_logger();
    info!("========================================");
    info!("{}", name);
    info!("========================================");

    let mut nand = SimNand::new(SIM_GEOMETRY);
    let expected = scen(&mut nand);
    let config = FtlConfig::default();

    let mut ftl = format(nand, config);
    let mut model = Model::new(&ftl);
    workload(&mut ftl, &mut model, name.len() as u64);
    model.verify(&mut ftl);
    ftl.sync().unwrap();

    let mut retired: Expected = Vec::new();
    {
        let geometry = ftl.vfl().geometry();
        let nand = ftl.vfl_mut().nand_mut();
        for bank in 0..geometry.banks {
            for block in 2..geometry.blocks_per_bank {
                if nand.is_bad(bank, block) {
                    retired.push((bank, block));
                }
            }
        }
    }
    for e in &expected {
        assert!(retired.contains(e), "{name}: {e:?} was never retired");
    }
    ftl.vfl().nand().sim_dump();

    // Bad blocks stay bad across remount and are never handed out again.
    let mut ftl = mount(ftl.into_vfl().into_nand(), config);
    check_mapping(&mut ftl, &retired);
    model.verify(&mut ftl);
    check_single_owner(&mut ftl);

    workload(&mut ftl, &mut model, 99);
    let mut ftl = mount(crash(ftl), config);
    check_mapping(&mut ftl, &retired);
    model.verify(&mut ftl);
}

fn scen_control(_n: &mut SimNand) -> Expected {
    vec![]
}

fn scen_factory_bad(n: &mut SimNand) -> Expected {
    n.sim_inject_bad(0, 15);
    n.sim_inject_bad(1, 40);
    n.sim_inject_bad(1, 61);
    vec![(0, 15), (1, 40), (1, 61)]
}

fn scen_instant_fail(n: &mut SimNand) -> Expected {
    // Backs the first FTL control block.
    n.sim_set_failed(0, 2);
    vec![(0, 2)]
}

fn scen_data_timebomb(n: &mut SimNand) -> Expected {
    n.sim_set_timebomb(0, 10, 3);
    n.sim_set_timebomb(1, 10, 5);
    vec![(0, 10), (1, 10)]
}

fn scen_mid_block(n: &mut SimNand) -> Expected {
    // Fails part way through programming the block.
    n.sim_set_timebomb(1, 33, 9);
    vec![(1, 33)]
}

fn scen_cascade(n: &mut SimNand) -> Expected {
    // The first replacement handed out on bank 0 is dead on arrival.
    n.sim_set_timebomb(0, 10, 4);
    n.sim_set_failed(0, 60);
    vec![(0, 10), (0, 60)]
}

fn scen_checkpoint_block(n: &mut SimNand) -> Expected {
    n.sim_set_timebomb(1, 3, 20);
    vec![(1, 3)]
}

fn scen_vfl_ctrl(n: &mut SimNand) -> Expected {
    n.sim_set_timebomb(0, 0, 4);
    n.sim_set_timebomb(0, 12, 3);
    vec![(0, 12)]
}

fn scen_bad_day(n: &mut SimNand) -> Expected {
    n.sim_inject_bad(1, 50);
    for block in 20..23 {
        n.sim_set_timebomb(0, block, 3);
    }
    n.sim_set_timebomb(1, 20, 4);
    n.sim_set_timebomb(1, 30, 9);
    vec![(1, 50), (0, 20), (0, 21), (0, 22), (1, 20), (1, 30)]
}

#[test]
fn test_recovery() {
    run("Control", scen_control);
    run("Factory bad blocks", scen_factory_bad);
    run("Instant fail", scen_instant_fail);
    run("Data block timebomb", scen_data_timebomb);
    run("Mid-block failure", scen_mid_block);
    run("Relocation cascade", scen_cascade);
    run("Checkpoint block failure", scen_checkpoint_block);
    run("VFL control block failure", scen_vfl_ctrl);
    run("Bad day", scen_bad_day);
}
