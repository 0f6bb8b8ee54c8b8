mod util;

use std::sync::Arc;
use std::thread;

use apple_flash::bus::{BusError, I2cRegistry, IicStat, Register};
use apple_flash::delay::NoDelay;
use apple_flash::sim::{RegWrite, SimI2c};
use spin::Mutex;
use util::init_logger;

const THREADS: u8 = 4;
const ROUNDS: usize = 40;

fn target(thread: u8) -> u8 {
    0x20 + thread
}

/// Walk the register log of one controller. Every transaction must run
/// from its start to its stop without bytes from anyone else in between.
fn check_log(log: &[RegWrite]) -> usize {
    let mut owner: Option<u8> = None;
    let mut latched = 0u32;
    let mut transactions = 0;

    for w in log {
        match w.reg {
            Register::Ds => match owner {
                None => latched = w.value,
                Some(address) => assert_eq!(
                    w.value,
                    u32::from(address),
                    "byte {:#04x} inside a transaction to {address:#04x}",
                    w.value
                ),
            },
            Register::Stat if w.value & IicStat::START_STOP.bits() != 0 => {
                assert!(owner.is_none(), "start while {owner:02x?} holds the bus");
                owner = Some((latched >> 1) as u8);
            }
            Register::Stat => {
                assert!(owner.is_some(), "stop without a start");
                owner = None;
                transactions += 1;
            }
            _ => {}
        }
    }
    assert!(owner.is_none(), "bus left held");
    transactions
}

#[test]
fn transactions_on_a_bus_never_interleave() {
    init_logger();
    let log = Arc::new(Mutex::new(Vec::new()));
    let mut sim = SimI2c::with_log(log.clone());
    for t in 0..THREADS {
        sim.add_target(target(t), &[]);
    }
    let i2c = I2cRegistry::new(vec![sim], NoDelay::new());

    thread::scope(|s| {
        for t in 0..THREADS {
            let i2c = &i2c;
            s.spawn(move || {
                let address = target(t);
                // Pointer and payload both carry the target address, so a
                // stray byte in the log names the thread it came from.
                let payload = [address; 6];
                let mut back = [0u8; 5];
                for round in 0..ROUNDS {
                    if round % 3 == 2 {
                        assert_eq!(i2c.recv(0, address, true, &mut back), Ok(5));
                    } else {
                        assert_eq!(i2c.send(0, address, true, &payload), Ok(6));
                    }
                }
            });
        }
    });

    let log = log.lock();
    assert_eq!(check_log(&log), THREADS as usize * ROUNDS);
    i2c.with_bus(0, |sim| {
        for t in 0..THREADS {
            let regs = sim.target_regs(target(t)).unwrap();
            let a = target(t) as usize;
            assert!(regs[a..a + 5].iter().all(|&b| b == target(t)));
        }
        assert!(!sim.bus_busy());
    })
    .unwrap();
}

#[test]
fn buses_run_independently() {
    init_logger();
    let logs: Vec<_> = (0..2).map(|_| Arc::new(Mutex::new(Vec::new()))).collect();
    let sims = logs
        .iter()
        .map(|log| {
            let mut sim = SimI2c::with_log(log.clone());
            sim.add_target(0x20, &[]);
            sim.add_target(0x21, &[]);
            sim
        })
        .collect();
    let i2c = I2cRegistry::new(sims, NoDelay::new());
    // Bus 1 is wedged; bus 0 must not care.
    i2c.with_bus(1, |sim| sim.sim_stall(u32::MAX)).unwrap();

    thread::scope(|s| {
        s.spawn(|| {
            for _ in 0..ROUNDS {
                assert_eq!(i2c.send(0, 0x20, true, &[0x20, 0x20]), Ok(2));
            }
        });
        s.spawn(|| {
            assert_eq!(i2c.send(1, 0x21, true, &[0x21]), Err(BusError::Timeout));
        });
        s.spawn(|| {
            for _ in 0..ROUNDS {
                assert_eq!(i2c.send(0, 0x21, true, &[0x21]), Ok(1));
            }
        });
    });

    assert_eq!(check_log(&logs[0].lock()), 2 * ROUNDS);
}

#[test]
fn repeated_start_keeps_the_bus() {
    init_logger();
    let mut sim = SimI2c::new();
    sim.add_target(0x50, b"\x00\x01\x02\x03\x04\x05\x06\x07");
    let log = sim.log();
    let i2c = I2cRegistry::new(vec![sim], NoDelay::new());

    let mut out = [0u8; 3];
    i2c.write_read(0, 0x50, &[0x04], &mut out).unwrap();
    assert_eq!(out, [4, 5, 6]);

    // Exactly one stop, at the very end of the read.
    let stops = log
        .lock()
        .iter()
        .filter(|w| w.reg == Register::Stat && w.value & IicStat::START_STOP.bits() == 0)
        .count();
    assert_eq!(stops, 1);
    assert_eq!(
        i2c.with_bus(0, |sim| sim.master_acks()).unwrap(),
        vec![true, true, false]
    );
}
