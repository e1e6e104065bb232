//! Application-microcontroller (AM) side.
//!
//! The AM mirrors device state on SPI NAND, tracks the two firmware
//! slots, buffers cloud records, and drives the ASP link as the
//! requesting party. Only the memory map is touched from parallel
//! tasks, so it alone carries a lock — with a hard 6-second
//! acquisition deadline instead of unbounded blocking.

pub mod link;
pub mod memmap;
pub mod nand;

pub use link::{AmLink, SpiTransport};
pub use memmap::{am_map, AmDeviceInfo, AmMemoryMap};
pub use nand::NandBackend;
