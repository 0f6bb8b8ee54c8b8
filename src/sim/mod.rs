//! Simulated hardware for tests and the demo binary.

mod i2c;
mod nand;

pub use i2c::{RegWrite, SimI2c};
pub use nand::{SimNand, SimStats, SIM_GEOMETRY};
