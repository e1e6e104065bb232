//! Application control layer (SSM).
//!
//! [`service::AppService`] owns every subsystem — protocol codec, NVM
//! store, water algorithm, rollup, diagnostics — and is driven by a
//! single-threaded cooperative main loop: interrupts only queue bytes
//! and set flags; all state mutation happens in [`service::AppService::poll`].

pub mod attention;
pub mod ports;
pub mod service;

pub use attention::Attention;
pub use ports::{Battery, Clock, EnvSensor, FrameLink, PadSampler, Platform, Rtc, StrokeStats, SysControl, WakeLine};
pub use service::AppService;
