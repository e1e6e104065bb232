//! Error-bit taxonomy shared by the runtime error word, the daily record,
//! and the status frame.
//!
//! Two bands live in one `u32`:
//!
//! - bits 0..=12 — peripheral/system errors, set and cleared at runtime;
//! - bits 13..=31 — algorithm conditions escalated to critical, produced
//!   by shifting an algorithm bit left by [`ErrorBits::ALGO_OFFSET`].
//!
//! The algorithm bits also appear **unshifted** in the daily record's
//! error field, where they share the word with a copy of the runtime
//! band taken at midnight.

use core::fmt;

/// A 32-bit error word. Detectors set bits, resolvers clear the same
/// bits, and the control loop arms its reset timer off the critical band.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ErrorBits(pub u32);

impl ErrorBits {
    // ── System band (bits 0..=12) ─────────────────────────────
    pub const MAG_ERROR: u32 = 1 << 0;
    pub const TEMP_HUMID_ERROR: u32 = 1 << 1;
    pub const CAP_SENSE_ERROR: u32 = 1 << 2;
    pub const EEPROM_READ_ERROR: u32 = 1 << 3;
    pub const EEPROM_WRITE_ERROR: u32 = 1 << 4;
    pub const RTC_COMM_ERROR: u32 = 1 << 5;
    pub const SPI_ERROR: u32 = 1 << 6;
    pub const I2C_ERROR: u32 = 1 << 7;
    pub const CAP_SENSE_NO_DATA: u32 = 1 << 8;
    pub const CAP_SENSE_SAMPLE_ERROR: u32 = 1 << 9;
    pub const NO_RTC_TIME: u32 = 1 << 10;
    pub const AM_NOT_RESPONSIVE: u32 = 1 << 11;
    pub const CURRENT_DRAW_HIGH: u32 = 1 << 12;

    // ── Algorithm band (natural positions, shifted by ALGO_OFFSET
    //    when escalated into the system word) ──────────────────
    pub const ALGO_OFFSET: u32 = 13;

    pub const ORIENTATION_CALIB: u32 = 1 << 0;
    pub const OFFSET_CALIB: u32 = 1 << 1;
    pub const STROKE_BUFFER_OVERFLOW: u32 = 1 << 2;
    pub const MAGNET_PRESENT: u32 = 1 << 3;
    pub const TRANS_BUFFER_OVERFLOW: u32 = 1 << 4;
    pub const CALIB_PRESENT_RESET: u32 = 1 << 5;
    pub const WATER_CALIB: u32 = 1 << 6;
    pub const WATER_CALIB_RESET: u32 = 1 << 7;
    pub const WATER_CALIB_NEG: u32 = 1 << 8;
    pub const WATER_BAD_SAMPLE: u32 = 1 << 9;
    pub const WATER_STANDING: u32 = 1 << 10;
    pub const WATER_CLOGGED_PUMP: u32 = 1 << 11;
    pub const WATER_VOLUME_CAPPED: u32 = 1 << 12;
    pub const MISSED_SAMPLE_THRESH: u32 = 1 << 13;
    pub const AVG_SAMPLE_PERIOD_DRIFT: u32 = 1 << 14;
    pub const CALIB_MAJOR_CHANGE_RESET: u32 = 1 << 15;
    pub const CALIB_ORIENT_RESET: u32 = 1 << 16;
    pub const CALIB_NEW_OFFSET_VAL_1: u32 = 1 << 17;
    pub const CALIB_NEW_OFFSET_VAL_2: u32 = 1 << 18;

    /// Bits that never arm the reset timer: a system reset would not fix
    /// them, or the device can keep measuring regardless.
    pub const NON_CRITICAL_MASK: u32 = Self::TEMP_HUMID_ERROR | Self::NO_RTC_TIME;

    pub const fn new() -> Self {
        Self(0)
    }

    /// Lift an algorithm bit into the critical band of the system word.
    pub const fn escalate_algo(bit: u32) -> u32 {
        bit << Self::ALGO_OFFSET
    }

    pub fn set(&mut self, bits: u32) {
        self.0 |= bits;
    }

    pub fn clear(&mut self, bits: u32) {
        self.0 &= !bits;
    }

    pub fn contains(self, bits: u32) -> bool {
        self.0 & bits != 0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// The subset of set bits that arm the 20-minute reset timer.
    pub fn critical(self) -> u32 {
        self.0 & !Self::NON_CRITICAL_MASK
    }

    pub fn word(self) -> u32 {
        self.0
    }
}

impl fmt::Display for ErrorBits {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#010x}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn non_critical_bits_do_not_show_as_critical() {
        let mut e = ErrorBits::new();
        e.set(ErrorBits::TEMP_HUMID_ERROR);
        e.set(ErrorBits::NO_RTC_TIME);
        assert_eq!(e.critical(), 0);

        e.set(ErrorBits::MAG_ERROR);
        assert_eq!(e.critical(), ErrorBits::MAG_ERROR);
    }

    #[test]
    fn escalated_algo_bits_land_above_the_system_band() {
        let escalated = ErrorBits::escalate_algo(ErrorBits::AVG_SAMPLE_PERIOD_DRIFT);
        assert_eq!(escalated, 1 << 27);

        let mut e = ErrorBits::new();
        e.set(escalated);
        assert_ne!(e.critical(), 0);
    }

    #[test]
    fn clear_removes_only_the_named_bits() {
        let mut e = ErrorBits::new();
        e.set(ErrorBits::SPI_ERROR | ErrorBits::I2C_ERROR);
        e.clear(ErrorBits::SPI_ERROR);
        assert!(!e.contains(ErrorBits::SPI_ERROR));
        assert!(e.contains(ErrorBits::I2C_ERROR));
    }
}
