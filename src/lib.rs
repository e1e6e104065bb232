//! PumpSense firmware library.
//!
//! Core logic shared by the two processors of the field sensor:
//!
//! - **SSM** (sensor/state microcontroller): samples the capacitive water
//!   column, runs the water-volume algorithm, persists daily records to
//!   EEPROM, and raises the attention line toward the AM.
//! - **AM** (application microcontroller): mirrors device state on SPI
//!   NAND, tracks firmware image slots, and forwards records to the cloud.
//!
//! All hardware access happens behind the port traits in [`app::ports`];
//! the modules here are pure logic so they can be exercised on the host by
//! the integration and property test suites. Board glue (GPIO/I2C/SPI
//! peripheral init, vendor drivers, the CLI) lives out of tree.

#![deny(unused_must_use)]

pub mod algo;
pub mod am;
pub mod app;
pub mod asp;
pub mod config;
pub mod diagnostics;
pub mod nvm;
pub mod registry;
pub mod rollup;
pub mod telemetry;

mod error;
mod wire;
pub use error::ErrorBits;

pub mod adapters;

/// Firmware version reported in status frames and record headers.
pub const FW_VERSION: (u8, u8, u8) = (2, 1, 9);
