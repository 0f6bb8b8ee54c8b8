//! Register-level I2C master.
//!
//! One transaction at a time per bus: the caller holds the bus lock from the
//! start condition until the stop (or until it hands the held bus to a
//! chained transfer). Each transfer is an explicit state machine stepped
//! from a polling loop; the controller raises `INT_PENDING` after every
//! address or data byte and the engine resumes it by clearing the bit.

use bitflags::bitflags;
use log::{debug, trace, warn};
use spin::Mutex;
use thiserror::Error;

use crate::config::{I2C_POLL_DELAY_US, I2C_POLL_LIMIT};
use crate::delay::Delay;

bitflags! {
    /// Control register.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct IicCon: u32 {
        const ACK_GEN = 1 << 7;
        /// Tx clock source is PCLK/512 instead of PCLK/16.
        const TXCLK_DIV512 = 1 << 6;
        const INT_ENABLE = 1 << 5;
        /// Set by hardware; writing it clear resumes the bus.
        const INT_PENDING = 1 << 4;
        const PRESCALER = 0xF;
    }
}

bitflags! {
    /// Control/status register.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct IicStat: u32 {
        const MODE_MASTER = 1 << 7;
        const MODE_TX = 1 << 6;
        /// Write 1 for start, 0 for stop. Reads 1 while the bus is busy.
        const START_STOP = 1 << 5;
        const DATA_OUTPUT = 1 << 4;
        const ARB_LOST = 1 << 3;
        /// No ACK was received for the last byte.
        const LAST_BIT_NACK = 1 << 0;
    }
}

impl IicCon {
    pub fn clock(prescaler: u8, div512: bool) -> Self {
        let mut con = IicCon::from_bits_retain(u32::from(prescaler) & IicCon::PRESCALER.bits());
        con.set(IicCon::TXCLK_DIV512, div512);
        con | IicCon::ACK_GEN | IicCon::INT_ENABLE
    }
}

impl Default for IicCon {
    fn default() -> Self {
        IicCon::clock(0xF, false)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Register {
    Con,
    Stat,
    Add,
    Ds,
    Lc,
    /// Latched interrupt causes, write 1 to clear.
    IrqStatus,
}

/// Access to one controller's register block.
pub trait I2cRegisters: Send {
    fn read(&mut self, reg: Register) -> u32;
    fn write(&mut self, reg: Register, value: u32);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum BusError {
    #[error("target did not acknowledge")]
    NoAck,
    #[error("bus timed out")]
    Timeout,
    #[error("address {0:#x} is not a 7-bit address")]
    InvalidAddress(u8),
    #[error("no I2C bus {0}")]
    NoSuchBus(usize),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Setup,
    Tx,
    RxSetup,
    Rx,
    Finish,
    Done,
}

enum Buffer<'a> {
    Tx(&'a [u8]),
    Rx(&'a mut [u8]),
}

/// One `send` or `recv`, alive for the duration of the call.
pub struct Transaction<'a> {
    address: u8,
    buf: Buffer<'a>,
    send_stop: bool,
    cursor: usize,
    error: Option<BusError>,
    state: State,
    con: IicCon,
}

impl<'a> Transaction<'a> {
    pub fn send(address: u8, send_stop: bool, buf: &'a [u8], con: IicCon) -> Self {
        Self::new(address, send_stop, Buffer::Tx(buf), con)
    }

    pub fn recv(address: u8, send_stop: bool, buf: &'a mut [u8], con: IicCon) -> Self {
        Self::new(address, send_stop, Buffer::Rx(buf), con)
    }

    fn new(address: u8, send_stop: bool, buf: Buffer<'a>, con: IicCon) -> Self {
        Transaction {
            address,
            buf,
            send_stop,
            cursor: 0,
            error: None,
            state: State::Setup,
            con: con - IicCon::INT_PENDING,
        }
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn cursor(&self) -> usize {
        self.cursor
    }

    fn is_read(&self) -> bool {
        matches!(self.buf, Buffer::Rx(_))
    }

    fn len(&self) -> usize {
        match &self.buf {
            Buffer::Tx(b) => b.len(),
            Buffer::Rx(b) => b.len(),
        }
    }

    fn mode(&self) -> IicStat {
        if self.is_read() {
            IicStat::MODE_MASTER
        } else {
            IicStat::MODE_MASTER | IicStat::MODE_TX
        }
    }

    fn fail(&mut self, error: BusError) {
        debug!("i2c: {:#04x}: {error} at byte {}", self.address, self.cursor);
        self.error.get_or_insert(error);
    }

    /// Run the current state's actions. Returns the next state and whether
    /// it should run at once instead of waiting for the controller.
    pub fn step<R: I2cRegisters + ?Sized>(
        &mut self,
        regs: &mut R,
        delay: &dyn Delay,
    ) -> (State, bool) {
        let (next, proceed) = match self.state {
            State::Setup => {
                let rw = u32::from(self.is_read());
                regs.write(Register::Ds, (u32::from(self.address) << 1) | rw);
                regs.write(
                    Register::Stat,
                    (self.mode() | IicStat::START_STOP | IicStat::DATA_OUTPUT).bits(),
                );
                // Clearing the pending bit lets the start go out.
                regs.write(Register::Con, self.con.bits());
                if self.is_read() {
                    (State::RxSetup, false)
                } else {
                    (State::Tx, false)
                }
            }
            State::Tx => {
                let stat = IicStat::from_bits_retain(regs.read(Register::Stat));
                if stat.contains(IicStat::LAST_BIT_NACK) {
                    self.fail(BusError::NoAck);
                    (State::Finish, true)
                } else if self.cursor < self.len() {
                    let byte = match &self.buf {
                        Buffer::Tx(b) => b[self.cursor],
                        Buffer::Rx(_) => 0,
                    };
                    regs.write(Register::Ds, u32::from(byte));
                    self.cursor += 1;
                    regs.write(Register::Con, self.con.bits());
                    (State::Tx, false)
                } else {
                    (State::Finish, true)
                }
            }
            State::RxSetup => {
                let stat = IicStat::from_bits_retain(regs.read(Register::Stat));
                if self.cursor == 0 && stat.contains(IicStat::LAST_BIT_NACK) {
                    self.fail(BusError::NoAck);
                    (State::Finish, true)
                } else if self.cursor < self.len() {
                    let mut con = self.con;
                    if self.len() - self.cursor == 1 {
                        // NACK the final byte.
                        con.remove(IicCon::ACK_GEN);
                    }
                    regs.write(Register::Con, con.bits());
                    (State::Rx, false)
                } else {
                    (State::Finish, true)
                }
            }
            State::Rx => {
                let byte = regs.read(Register::Ds) as u8;
                if let Buffer::Rx(b) = &mut self.buf {
                    b[self.cursor] = byte;
                }
                self.cursor += 1;
                (State::RxSetup, true)
            }
            State::Finish => {
                if self.send_stop {
                    regs.write(Register::Stat, (self.mode() | IicStat::DATA_OUTPUT).bits());
                    regs.write(Register::Con, self.con.bits());
                    if !wait_bus_release(regs, delay) {
                        warn!("i2c: {:#04x}: bus still busy after stop", self.address);
                        self.fail(BusError::Timeout);
                    }
                }
                (State::Done, false)
            }
            State::Done => (State::Done, false),
        };
        trace!("i2c: {:#04x}: {:?} -> {:?}", self.address, self.state, next);
        self.state = next;
        (next, proceed)
    }

    /// Drive the transaction to `Done`. Returns the bytes transferred.
    pub fn run<R: I2cRegisters + ?Sized>(
        mut self,
        regs: &mut R,
        delay: &dyn Delay,
    ) -> Result<usize, BusError> {
        if self.address > 0x7F {
            return Err(BusError::InvalidAddress(self.address));
        }
        while self.state != State::Done {
            let (next, proceed) = self.step(regs, delay);
            if proceed || next == State::Done {
                continue;
            }
            if wait_pending(regs, delay) {
                drain_irq(regs);
            } else {
                self.fail(BusError::Timeout);
                self.state = State::Finish;
            }
        }
        match self.error {
            Some(e) => Err(e),
            None => Ok(self.cursor),
        }
    }

    /// Skip straight to the stop condition.
    fn finish<R: I2cRegisters + ?Sized>(
        mut self,
        regs: &mut R,
        delay: &dyn Delay,
    ) -> Result<usize, BusError> {
        self.state = State::Finish;
        self.step(regs, delay);
        self.error.map_or(Ok(0), Err)
    }
}

fn wait_pending<R: I2cRegisters + ?Sized>(regs: &mut R, delay: &dyn Delay) -> bool {
    for _ in 0..I2C_POLL_LIMIT {
        if IicCon::from_bits_retain(regs.read(Register::Con)).contains(IicCon::INT_PENDING) {
            return true;
        }
        delay.delay_us(I2C_POLL_DELAY_US);
    }
    false
}

fn wait_bus_release<R: I2cRegisters + ?Sized>(regs: &mut R, delay: &dyn Delay) -> bool {
    for _ in 0..I2C_POLL_LIMIT {
        if !IicStat::from_bits_retain(regs.read(Register::Stat)).contains(IicStat::START_STOP) {
            return true;
        }
        delay.delay_us(I2C_POLL_DELAY_US);
    }
    false
}

fn drain_irq<R: I2cRegisters + ?Sized>(regs: &mut R) {
    loop {
        let pending = regs.read(Register::IrqStatus);
        if pending == 0 {
            break;
        }
        regs.write(Register::IrqStatus, pending);
    }
}

/// Every I2C controller in the system, each behind its own lock.
pub struct I2cRegistry<R: I2cRegisters, D: Delay> {
    buses: Vec<Mutex<R>>,
    delay: D,
    con: IicCon,
}

impl<R: I2cRegisters, D: Delay> I2cRegistry<R, D> {
    pub fn new(buses: Vec<R>, delay: D) -> Self {
        Self::with_clock(buses, delay, IicCon::default())
    }

    pub fn with_clock(buses: Vec<R>, delay: D, con: IicCon) -> Self {
        I2cRegistry {
            buses: buses.into_iter().map(Mutex::new).collect(),
            delay,
            con,
        }
    }

    pub fn bus_count(&self) -> usize {
        self.buses.len()
    }

    fn bus(&self, bus: usize) -> Result<&Mutex<R>, BusError> {
        self.buses.get(bus).ok_or(BusError::NoSuchBus(bus))
    }

    /// Write `buf` to `address`. With `send_stop` false the bus stays held
    /// for a following transfer.
    pub fn send(
        &self,
        bus: usize,
        address: u8,
        send_stop: bool,
        buf: &[u8],
    ) -> Result<usize, BusError> {
        let mut regs = self.bus(bus)?.lock();
        Transaction::send(address, send_stop, buf, self.con).run(&mut *regs, &self.delay)
    }

    pub fn recv(
        &self,
        bus: usize,
        address: u8,
        send_stop: bool,
        buf: &mut [u8],
    ) -> Result<usize, BusError> {
        let mut regs = self.bus(bus)?.lock();
        Transaction::recv(address, send_stop, buf, self.con).run(&mut *regs, &self.delay)
    }

    /// Register read idiom: write `wr` without a stop, then read `rd`
    /// after a repeated start, all under one lock.
    pub fn write_read(
        &self,
        bus: usize,
        address: u8,
        wr: &[u8],
        rd: &mut [u8],
    ) -> Result<(), BusError> {
        let mut regs = self.bus(bus)?.lock();
        let sent = Transaction::send(address, false, wr, self.con).run(&mut *regs, &self.delay);
        if let Err(e) = sent {
            // Release the bus before reporting. The first error is the one
            // the caller sees.
            let stop = Transaction::send(address, true, &[], self.con);
            if let Err(stop) = stop.finish(&mut *regs, &self.delay) {
                warn!("i2c: {address:#04x}: releasing bus after {e} also failed: {stop}");
            }
            return Err(e);
        }
        Transaction::recv(address, true, rd, self.con).run(&mut *regs, &self.delay)?;
        Ok(())
    }

    /// Run `f` with exclusive access to a bus's registers.
    pub fn with_bus<T>(&self, bus: usize, f: impl FnOnce(&mut R) -> T) -> Result<T, BusError> {
        let mut regs = self.bus(bus)?.lock();
        Ok(f(&mut *regs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::delay::NoDelay;
    use crate::sim::SimI2c;

    fn registry() -> I2cRegistry<SimI2c, NoDelay> {
        let mut sim = SimI2c::new();
        sim.add_target(0x50, &[0u8; 16]);
        I2cRegistry::new(vec![sim, SimI2c::new()], NoDelay::new())
    }

    #[test]
    fn send_then_read_back_register() {
        let i2c = registry();
        assert_eq!(i2c.send(0, 0x50, true, &[0x04, 0xDE, 0xAD]), Ok(3));

        let mut out = [0u8; 2];
        i2c.write_read(0, 0x50, &[0x04], &mut out).unwrap();
        assert_eq!(out, [0xDE, 0xAD]);
        let regs = i2c.with_bus(0, |sim| sim.target_regs(0x50).unwrap()[4..6].to_vec()).unwrap();
        assert_eq!(regs, vec![0xDE, 0xAD]);
    }

    #[test]
    fn last_received_byte_is_nacked() {
        let i2c = registry();
        i2c.send(0, 0x50, true, &[0x00, 1, 2, 3]).unwrap();
        let mut out = [0u8; 3];
        i2c.write_read(0, 0x50, &[0x00], &mut out).unwrap();
        assert_eq!(out, [1, 2, 3]);
        let acks = i2c.with_bus(0, |sim| sim.master_acks()).unwrap();
        assert_eq!(acks, vec![true, true, false]);
    }

    #[test]
    fn missing_target_is_no_ack_and_bus_is_released() {
        let i2c = registry();
        assert_eq!(i2c.send(0, 0x21, true, &[1]), Err(BusError::NoAck));
        let mut out = [0u8; 1];
        assert_eq!(i2c.recv(0, 0x21, true, &mut out), Err(BusError::NoAck));
        assert!(!i2c.with_bus(0, |sim| sim.bus_busy()).unwrap());
        assert_eq!(i2c.send(0, 0x50, true, &[0]), Ok(1));
    }

    #[test]
    fn data_nack_stops_transfer() {
        let i2c = registry();
        i2c.with_bus(0, |sim| sim.sim_nack_after(0x50, 2)).unwrap();
        assert_eq!(i2c.send(0, 0x50, true, &[0, 1, 2, 3]), Err(BusError::NoAck));
    }

    #[test]
    fn stalled_controller_times_out() {
        let i2c = registry();
        i2c.with_bus(0, |sim| sim.sim_stall(u32::MAX)).unwrap();
        assert_eq!(i2c.send(0, 0x50, true, &[0]), Err(BusError::Timeout));
        i2c.with_bus(0, |sim| sim.sim_stall(0)).unwrap();
        assert_eq!(i2c.send(0, 0x50, true, &[0]), Ok(1));
    }

    #[test]
    fn failed_write_read_reports_first_error_and_frees_bus() {
        let i2c = registry();
        let mut out = [0u8; 2];
        i2c.with_bus(0, |sim| sim.sim_stall(u32::MAX)).unwrap();
        assert_eq!(i2c.write_read(0, 0x50, &[0x04], &mut out), Err(BusError::Timeout));
        assert!(!i2c.with_bus(0, |sim| sim.bus_busy()).unwrap());

        i2c.with_bus(0, |sim| {
            sim.sim_stall(0);
            sim.sim_nack_after(0x50, 0);
        })
        .unwrap();
        assert_eq!(i2c.write_read(0, 0x50, &[0x04], &mut out), Err(BusError::NoAck));
        assert!(!i2c.with_bus(0, |sim| sim.bus_busy()).unwrap());
        assert!(i2c.with_bus(0, |sim| sim.master_acks()).unwrap().is_empty());
    }

    #[test]
    fn bad_arguments() {
        let i2c = registry();
        assert_eq!(i2c.send(5, 0x50, true, &[0]), Err(BusError::NoSuchBus(5)));
        assert_eq!(i2c.send(0, 0x80, true, &[0]), Err(BusError::InvalidAddress(0x80)));
    }

    #[test]
    fn rx_capture_falls_through_to_rx_setup() {
        let mut sim = SimI2c::new();
        sim.add_target(0x10, &[9, 8]);
        let delay = NoDelay::new();
        let mut buf = [0u8; 1];
        let mut txn = Transaction::recv(0x10, true, &mut buf, IicCon::default());
        assert_eq!(txn.step(&mut sim, &delay), (State::RxSetup, false));
        assert_eq!(txn.step(&mut sim, &delay), (State::Rx, false));
        assert_eq!(txn.step(&mut sim, &delay), (State::RxSetup, true));
        assert_eq!(txn.step(&mut sim, &delay), (State::Finish, true));
        assert_eq!(txn.step(&mut sim, &delay), (State::Done, false));
        assert_eq!(txn.state(), State::Done);
        assert_eq!(txn.cursor(), 1);
        drop(txn);
        assert_eq!(buf, [9]);
    }

    #[test]
    fn clock_bits() {
        let con = IicCon::clock(0x3, true);
        assert_eq!(con.bits() & 0xF, 3);
        assert!(con.contains(IicCon::TXCLK_DIV512 | IicCon::ACK_GEN | IicCon::INT_ENABLE));
        assert!(!con.contains(IicCon::INT_PENDING));
    }
}
