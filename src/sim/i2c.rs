use std::sync::Arc;

use log::trace;
use spin::Mutex;

use crate::bus::{I2cRegisters, IicCon, IicStat, Register};

/// One register write as seen by the controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegWrite {
    pub reg: Register,
    pub value: u32,
}

/// A target device: 256 byte registers behind an auto-incrementing
/// pointer. The first byte of every write sets the pointer.
struct SimTarget {
    address: u8,
    regs: [u8; 256],
    pointer: u8,
    pointer_set: bool,
    received: usize,
    nack_after: Option<usize>,
}

impl SimTarget {
    /// Returns whether the byte was acknowledged.
    fn receive(&mut self, byte: u8) -> bool {
        if self.nack_after.is_some_and(|n| self.received >= n) {
            return false;
        }
        self.received += 1;
        if self.pointer_set {
            self.regs[self.pointer as usize] = byte;
            self.pointer = self.pointer.wrapping_add(1);
        } else {
            self.pointer = byte;
            self.pointer_set = true;
        }
        true
    }

    fn transmit(&mut self) -> u8 {
        let byte = self.regs[self.pointer as usize];
        self.pointer = self.pointer.wrapping_add(1);
        byte
    }
}

/// Register-level model of the I2C controller with targets attached.
pub struct SimI2c {
    con: u32,
    stat: u32,
    ds: u32,
    add: u32,
    lc: u32,
    irq: u32,
    targets: Vec<SimTarget>,
    // Address latched by the last start, if the bus is held.
    active: Option<u8>,
    start_requested: bool,
    stop_requested: bool,
    master_acks: Vec<bool>,
    stall: u32,
    log: Arc<Mutex<Vec<RegWrite>>>,
}

impl Default for SimI2c {
    fn default() -> Self {
        Self::new()
    }
}

impl SimI2c {
    pub fn new() -> Self {
        Self::with_log(Arc::new(Mutex::new(Vec::new())))
    }

    /// Record register writes into a log shared with the caller.
    pub fn with_log(log: Arc<Mutex<Vec<RegWrite>>>) -> Self {
        SimI2c {
            con: 0,
            stat: 0,
            ds: 0,
            add: 0,
            lc: 0,
            irq: 0,
            targets: Vec::new(),
            active: None,
            start_requested: false,
            stop_requested: false,
            master_acks: Vec::new(),
            stall: 0,
            log,
        }
    }

    pub fn add_target(&mut self, address: u8, init: &[u8]) {
        let mut regs = [0u8; 256];
        let n = init.len().min(regs.len());
        regs[..n].copy_from_slice(&init[..n]);
        self.targets.push(SimTarget {
            address,
            regs,
            pointer: 0,
            pointer_set: false,
            received: 0,
            nack_after: None,
        });
    }

    pub fn target_regs(&self, address: u8) -> Option<&[u8]> {
        self.targets
            .iter()
            .find(|t| t.address == address)
            .map(|t| &t.regs[..])
    }

    pub fn log(&self) -> Arc<Mutex<Vec<RegWrite>>> {
        self.log.clone()
    }

    /// ACK bit the master sent after each byte it received.
    pub fn master_acks(&self) -> Vec<bool> {
        self.master_acks.clone()
    }

    pub fn bus_busy(&self) -> bool {
        self.stat & IicStat::START_STOP.bits() != 0
    }

    /// Swallow the next `count` interrupts. `u32::MAX` stalls for good.
    pub fn sim_stall(&mut self, count: u32) {
        self.stall = count;
    }

    /// The target stops acknowledging after `bytes` more data bytes.
    pub fn sim_nack_after(&mut self, address: u8, bytes: usize) {
        if let Some(t) = self.targets.iter_mut().find(|t| t.address == address) {
            t.received = 0;
            t.nack_after = Some(bytes);
        }
    }

    fn target(&mut self) -> Option<&mut SimTarget> {
        let address = self.active?;
        self.targets.iter_mut().find(|t| t.address == address)
    }

    fn set_nack(&mut self, nack: bool) {
        let bit = IicStat::LAST_BIT_NACK.bits();
        if nack {
            self.stat |= bit;
        } else {
            self.stat &= !bit;
        }
    }

    fn raise(&mut self) {
        if self.stall > 0 {
            if self.stall != u32::MAX {
                self.stall -= 1;
            }
            return;
        }
        self.con |= IicCon::INT_PENDING.bits();
        self.irq |= 1;
    }

    fn start(&mut self) {
        self.start_requested = false;
        let address = (self.ds >> 1) as u8 & 0x7F;
        self.active = Some(address);
        self.stat |= IicStat::START_STOP.bits();
        let read = self.ds & 1 == 1;
        let present = match self.target() {
            Some(t) => {
                // A repeated start for reading keeps the pointer just set.
                if !read {
                    t.pointer_set = false;
                }
                true
            }
            None => false,
        };
        trace!("sim i2c: start {address:#04x}, present {present}");
        self.set_nack(!present);
        self.raise();
    }

    fn stop(&mut self) {
        trace!("sim i2c: stop");
        self.stop_requested = false;
        self.active = None;
        self.stat &= !IicStat::START_STOP.bits();
    }

    fn resume(&mut self) {
        let tx = self.stat & IicStat::MODE_TX.bits() != 0;
        let ack_gen = self.con & IicCon::ACK_GEN.bits() != 0;
        let byte = self.ds as u8;
        if tx {
            let acked = self.target().is_some_and(|t| t.receive(byte));
            self.set_nack(!acked);
        } else {
            let byte = self.target().map_or(0xFF, |t| t.transmit());
            self.ds = u32::from(byte);
            self.master_acks.push(ack_gen);
        }
        self.raise();
    }
}

impl I2cRegisters for SimI2c {
    fn read(&mut self, reg: Register) -> u32 {
        match reg {
            Register::Con => self.con,
            Register::Stat => self.stat,
            Register::Add => self.add,
            Register::Ds => self.ds,
            Register::Lc => self.lc,
            Register::IrqStatus => self.irq,
        }
    }

    fn write(&mut self, reg: Register, value: u32) {
        self.log.lock().push(RegWrite { reg, value });
        match reg {
            Register::Stat => {
                let keep = IicStat::START_STOP | IicStat::LAST_BIT_NACK;
                self.stat = (self.stat & keep.bits()) | (value & !keep.bits());
                if value & IicStat::START_STOP.bits() != 0 {
                    self.start_requested = true;
                } else if self.active.is_some() {
                    self.stop_requested = true;
                }
            }
            Register::Con => {
                let was_pending = self.con & IicCon::INT_PENDING.bits() != 0;
                let pending = IicCon::INT_PENDING.bits();
                self.con = (value & !pending) | (self.con & value & pending);
                if value & pending != 0 {
                    return;
                }
                if self.start_requested {
                    self.start();
                } else if self.stop_requested {
                    self.stop();
                } else if self.active.is_some() && was_pending {
                    self.resume();
                }
            }
            Register::Ds => self.ds = value & 0xFF,
            Register::Add => self.add = value,
            Register::Lc => self.lc = value,
            Register::IrqStatus => self.irq &= !value,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_sets_pointer_then_data() {
        let mut t = SimTarget {
            address: 1,
            regs: [0; 256],
            pointer: 0,
            pointer_set: false,
            received: 0,
            nack_after: None,
        };
        assert!(t.receive(0x10));
        assert!(t.receive(0xAA));
        assert!(t.receive(0xBB));
        assert_eq!(t.regs[0x10..0x12], [0xAA, 0xBB]);
        t.pointer = 0x10;
        assert_eq!(t.transmit(), 0xAA);
    }

    #[test]
    fn start_to_absent_target_nacks() {
        let mut sim = SimI2c::new();
        sim.write(Register::Ds, 0x42 << 1);
        sim.write(Register::Stat, (IicStat::MODE_MASTER | IicStat::MODE_TX | IicStat::START_STOP).bits());
        sim.write(Register::Con, IicCon::default().bits());
        assert!(sim.bus_busy());
        assert_ne!(sim.read(Register::Stat) & IicStat::LAST_BIT_NACK.bits(), 0);
        assert_ne!(sim.read(Register::Con) & IicCon::INT_PENDING.bits(), 0);
        assert_eq!(sim.log().lock().len(), 3);
    }
}
