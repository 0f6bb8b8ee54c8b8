//! Injectable busy-wait policy.
//!
//! Hardware polling loops (bank reset, I2C interrupt-pending) sleep between
//! register checks through this trait so tests can run against simulated
//! hardware without real delays.

use core::sync::atomic::{AtomicU64, Ordering};
use std::thread;
use std::time::Duration;

pub trait Delay: Send + Sync {
    fn delay_us(&self, us: u32);
}

/// Sleeps the calling thread.
#[derive(Debug, Default, Clone, Copy)]
pub struct StdDelay;

impl Delay for StdDelay {
    fn delay_us(&self, us: u32) {
        thread::sleep(Duration::from_micros(us.into()));
    }
}

/// Returns immediately, only counting how long it was asked to wait.
#[derive(Debug, Default)]
pub struct NoDelay {
    waited_us: AtomicU64,
}

impl NoDelay {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn waited_us(&self) -> u64 {
        self.waited_us.load(Ordering::Relaxed)
    }
}

impl Delay for NoDelay {
    fn delay_us(&self, us: u32) {
        self.waited_us.fetch_add(us.into(), Ordering::Relaxed);
    }
}

impl<D: Delay> Delay for &D {
    fn delay_us(&self, us: u32) {
        (**self).delay_us(us)
    }
}

impl<D: Delay> Delay for std::sync::Arc<D> {
    fn delay_us(&self, us: u32) {
        (**self).delay_us(us)
    }
}
