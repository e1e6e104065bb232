//! Capacitive water-volume pipeline.
//!
//! Raw per-pad capacitance counts arrive at ~20 Hz and flow through:
//!
//! ```text
//!  tick ──▶ PadWindows (50/20/50 double buffer)
//!                │  window processable every 70 samples
//!                ▼
//!          process_window:
//!            delta filter ─▶ presence detect ─▶ promotion
//!            calibration check/update ─▶ height selection
//!            session integration ─▶ session-end detection
//! ```
//!
//! Eight electrodes sit vertically in the water column; pad 1 is the
//! highest, pad 8 the lowest and most sensitive. All constants are
//! empirical and preserved bit-exact from field calibration.

pub mod calib;
pub mod delta;
pub mod presence;
pub mod volume;
pub mod window;

pub use calib::{Calibration, PadCalib};
pub use delta::DeltaBank;
pub use presence::{detect_water_change, promote_pad_states, PadState, Presence};
pub use volume::{process_window, session_volume, ReasonCode, ReasonList, WaterAlgoState};
pub use window::{PadWindows, Window};

/// Number of capacitive pads in the column.
pub const NUM_PADS: usize = 8;

/// Per-pad water heights (fixed units, pad 1 down to pad 8).
pub const PAD_HEIGHTS: [i16; NUM_PADS] = [262, 229, 197, 164, 131, 98, 66, 33];

/// Per-pad draining timeouts for presence detection, in processed
/// samples (pad 1 down to pad 8).
pub const DRAIN_THRESHOLDS: [u8; NUM_PADS] = [20, 30, 40, 50, 60, 70, 80, 90];

/// Open-air baseline substituted when no learned value is available.
pub const OPEN_AIR_FALLBACK: i16 = 800;

/// The full algorithm state: windows plus per-session data plus
/// calibration. Owned by the control loop and driven once per tick.
pub struct WaterAlgo {
    pub windows: PadWindows,
    pub state: WaterAlgoState,
    pub calib: Calibration,
    /// Liters accumulated since the last hourly harvest.
    hourly_liters: u32,
}

impl Default for WaterAlgo {
    fn default() -> Self {
        Self::new()
    }
}

impl WaterAlgo {
    pub fn new() -> Self {
        Self {
            windows: PadWindows::new(),
            state: WaterAlgoState::new(),
            calib: Calibration::new(),
            hourly_liters: 0,
        }
    }

    /// Re-initialize everything except the calibration, which persists
    /// until explicitly reset.
    pub fn reinit(&mut self) {
        self.windows = PadWindows::new();
        self.state = WaterAlgoState::new();
        self.hourly_liters = 0;
    }

    /// Deposit one 8-pad snapshot; when this completes a window, the
    /// window is processed and its reason codes are returned.
    pub fn tick(&mut self, sample: [u16; NUM_PADS]) -> Option<ReasonList> {
        self.windows.push(sample)?;
        let before = self.state.water_volume_sum;
        let reasons = process_window(&mut self.state, &mut self.calib, &self.windows);
        let gained = self.state.water_volume_sum.saturating_sub(before);
        if gained > 0 {
            self.hourly_liters = self.hourly_liters.saturating_add(gained as u32);
            self.state.water_volume_sum = 0;
        }
        Some(reasons)
    }

    /// Water currently detected on the column.
    pub fn water_present(&self) -> bool {
        self.state.present
    }

    /// Drain the liters accumulated since the last call (hour rollup).
    pub fn take_hourly_liters(&mut self) -> u32 {
        core::mem::take(&mut self.hourly_liters)
    }

    /// Liters integrated but not yet harvested by the hour rollup,
    /// including the running session. Used for the activation watermark.
    pub fn pending_liters(&self) -> u32 {
        self.hourly_liters
    }
}
