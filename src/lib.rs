//! NAND storage translation stack and I2C bus engine for S5L89xx-class
//! SoCs.
//!
//! Storage is layered bottom-up: a [`nand::NandDevice`] provides raw pages,
//! [`vfl::VflLayer`] hides banks and bad blocks behind a flat virtual page
//! space, [`ftl::FtlLayer`] maps logical pages with garbage collection,
//! wear leveling and crash recovery, and [`block::FlashDisk`] serializes
//! block requests onto it. [`bus::I2cRegistry`] drives the I2C controllers
//! independently of the storage stack.

pub mod block;
pub mod bus;
pub mod bytes;
pub mod config;
pub mod delay;
pub mod ftl;
pub mod nand;
pub mod sim;
pub mod spare;
pub mod vfl;
