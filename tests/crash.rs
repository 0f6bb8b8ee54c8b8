mod util;

use apple_flash::config::{FtlConfig, Lpn};
use log::info;
use rand::prelude::*;
use util::*;

/// Write until the power budget runs out, then check that every
/// acknowledged page survives and that mounting twice gives the same map.
fn power_cut_after(ops: usize, config: FtlConfig) {
    let mut ftl = fresh(config);
    let mut model = Model::new(&ftl);
    let pages = model.pages();
    let mut rng = SmallRng::seed_from_u64(ops as u64);

    for lpn in 0..pages / 2 {
        assert!(model.write(&mut ftl, lpn));
    }
    ftl.sync().unwrap();

    ftl.vfl_mut().nand_mut().sim_power_cut_after(ops);
    let mut acked = 0;
    for i in 0..pages * 3 {
        let lpn: Lpn = rng.gen_range(0..pages);
        if !model.write(&mut ftl, lpn) {
            break;
        }
        acked += 1;
        if i % 211 == 210 && ftl.sync().is_err() {
            break;
        }
    }
    info!("power cut after {ops} ops: {acked} writes acknowledged");

    let mut ftl = mount(crash(ftl), config);
    model.verify(&mut ftl);
    check_single_owner(&mut ftl);
    let first = snapshot(&ftl);

    let mut ftl = mount(crash(ftl), config);
    assert_eq!(snapshot(&ftl), first, "remount after {ops} ops changed the map");
    model.verify(&mut ftl);

    // The device keeps working afterwards.
    for lpn in (0..pages).step_by(7) {
        assert!(model.write(&mut ftl, lpn));
    }
    ftl.sync().unwrap();
    let mut ftl = mount(crash(ftl), config);
    model.verify(&mut ftl);
}

#[test]
fn acknowledged_writes_survive_power_loss() {
    init_logger();
    for ops in [0, 1, 2, 3, 17, 64, 65, 66] {
        power_cut_after(ops, FtlConfig::default());
    }
}

#[test]
fn blocks_gone_stale_before_a_clean_mount_are_replayed() {
    init_logger();
    let config = FtlConfig::default();
    let mut ftl = fresh(config);
    let mut model = Model::new(&ftl);

    // Churn a small hot set so plenty of blocks are full but fully stale
    // when the checkpoint is taken.
    for i in 0..6000 {
        assert!(model.write(&mut ftl, 100 + i % 8));
    }
    ftl.sync().unwrap();
    let mut ftl = mount(crash(ftl), config);
    assert_eq!(ftl.stats().replayed, 0);

    // A burst spanning several blocks, never synced.
    for lpn in 500..756 {
        assert!(model.write(&mut ftl, lpn));
    }
    let mut ftl = mount(crash(ftl), config);
    model.verify(&mut ftl);
    check_single_owner(&mut ftl);
}

#[test]
fn power_loss_during_gc_and_checkpoints() {
    init_logger();
    for i in 0..32 {
        power_cut_after(600 + i * 97, FtlConfig::default());
    }
}

#[test]
fn power_loss_with_wrapping_usn() {
    init_logger();
    for ops in [5, 300, 1100, 2300] {
        power_cut_after(ops, FtlConfig::default().with_first_usn(u32::MAX - 700));
    }
}

#[test]
fn newest_copy_wins_across_usn_wrap() {
    init_logger();
    let bases = [
        u32::MAX - 2,
        u32::MAX - 1,
        u32::MAX,
        0,
        (1 << 31) - 1,
        1 << 31,
    ];
    for base in bases {
        for sync_between in [false, true] {
            // Either both copies are in the same block, or the filler pushes
            // the second copy into the next one.
            for filler in [0u32, 40] {
                let config = FtlConfig::default().with_first_usn(base);
                let mut ftl = fresh(config);
                let mut model = Model::new(&ftl);

                assert!(model.write(&mut ftl, 3));
                if sync_between {
                    ftl.sync().unwrap();
                }
                for lpn in 100..100 + filler {
                    assert!(model.write(&mut ftl, lpn));
                }
                assert!(model.write(&mut ftl, 3));

                let mut ftl = mount(crash(ftl), config);
                model.verify(&mut ftl);
                check_single_owner(&mut ftl);
            }
        }
    }
}

#[test]
fn rewrites_straddling_wrap_without_sync() {
    init_logger();
    for k in 0..6 {
        let config = FtlConfig::default().with_first_usn(u32::MAX - k);
        let mut ftl = fresh(config);
        let mut model = Model::new(&ftl);
        for _ in 0..4 {
            for lpn in 0..12 {
                assert!(model.write(&mut ftl, lpn));
            }
        }
        let mut ftl = mount(crash(ftl), config);
        model.verify(&mut ftl);
        check_single_owner(&mut ftl);
    }
}

#[test]
fn long_run_through_wrap_with_gc() {
    init_logger();
    let config = FtlConfig::default().with_first_usn(u32::MAX - 1500);
    let mut ftl = fresh(config);
    let mut model = Model::new(&ftl);
    let pages = model.pages();
    let mut rng = SmallRng::seed_from_u64(0x5eed);

    for round in 0..4 {
        for _ in 0..pages {
            let lpn = rng.gen_range(0..pages);
            assert!(model.write(&mut ftl, lpn));
        }
        if round % 2 == 1 {
            ftl.sync().unwrap();
        }
        ftl = mount(crash(ftl), config);
        model.verify(&mut ftl);
    }
    check_single_owner(&mut ftl);
}
