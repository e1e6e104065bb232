//! The device-info record: everything that must survive a reset.

use log::warn;

use crate::config::{
    RuntimeConfig, DEFAULT_RED_FLAG_OFF_PCT, DEFAULT_RED_FLAG_ON_PCT,
    DEFAULT_WAKE_INTERVAL_ACTIVATED, DEFAULT_WAKE_INTERVAL_DEACTIVATED, MAX_RED_FLAG_PCT,
    MAX_WAKE_INTERVAL_DAYS, MIN_WAKE_INTERVAL_DAYS,
};
use crate::telemetry::{AppState, ResetState};
use crate::wire::{Reader, Writer};

/// Bumped on layout changes; a stored mismatch defaults the section.
pub const NVM_VERSION: u16 = 1;

/// RTC synchronisation progress, persisted so the AM knows whether the
/// next wake needs a first-time sync or a periodic refresh.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum RtcTimeStatus {
    #[default]
    FirstTimeSync = 0,
    SyncPeriodic = 1,
    Updated = 2,
}

impl RtcTimeStatus {
    pub fn from_u8(v: u8) -> Self {
        match v {
            1 => Self::SyncPeriodic,
            2 => Self::Updated,
            _ => Self::FirstTimeSync,
        }
    }
}

/// Single-record device-info section contents.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceInfo {
    pub nvm_version: u16,
    pub state: AppState,
    pub first_act_date: u32,
    pub recent_act_date: u32,
    pub recent_deact_date: u32,
    pub num_act: u8,
    pub num_deact: u8,
    pub am_wake_rate_days: u16,
    pub reset_state: ResetState,
    pub unexpected_reset_counter: u32,
    pub time_of_last_unexpected_reset: u32,
    pub total_liters: u32,
    pub rtc_time_status: RtcTimeStatus,
    pub stroke_detection_on: bool,
    pub red_flag_on_pct: u16,
    pub red_flag_off_pct: u16,
    /// Mirrors the ring's full flag so a cold boot can tell a full ring
    /// from an empty one when `head == tail`.
    pub sensor_data_buffer_full: bool,
}

impl Default for DeviceInfo {
    fn default() -> Self {
        Self {
            nvm_version: NVM_VERSION,
            state: AppState::Deactivated,
            first_act_date: 0,
            recent_act_date: 0,
            recent_deact_date: 0,
            num_act: 0,
            num_deact: 0,
            am_wake_rate_days: DEFAULT_WAKE_INTERVAL_ACTIVATED,
            reset_state: ResetState::Por,
            unexpected_reset_counter: 0,
            time_of_last_unexpected_reset: 0,
            total_liters: 0,
            rtc_time_status: RtcTimeStatus::FirstTimeSync,
            stroke_detection_on: false,
            red_flag_on_pct: DEFAULT_RED_FLAG_ON_PCT,
            red_flag_off_pct: DEFAULT_RED_FLAG_OFF_PCT,
            sensor_data_buffer_full: false,
        }
    }
}

impl DeviceInfo {
    /// Payload length, trailing checksum excluded.
    pub const ENCODED_LEN: usize = 39;
    pub const ENTRY_LEN: usize = Self::ENCODED_LEN + 1;

    pub fn encode(&self, buf: &mut [u8]) -> usize {
        let mut w = Writer::new(buf);
        w.put_u16(self.nvm_version);
        w.put_u8(self.state as u8);
        w.put_u32(self.first_act_date);
        w.put_u32(self.recent_act_date);
        w.put_u32(self.recent_deact_date);
        w.put_u8(self.num_act);
        w.put_u8(self.num_deact);
        w.put_u16(self.am_wake_rate_days);
        w.put_u8(self.reset_state as u8);
        w.put_u32(self.unexpected_reset_counter);
        w.put_u32(self.time_of_last_unexpected_reset);
        w.put_u32(self.total_liters);
        w.put_u8(self.rtc_time_status as u8);
        w.put_bool(self.stroke_detection_on);
        w.put_u16(self.red_flag_on_pct);
        w.put_u16(self.red_flag_off_pct);
        w.put_bool(self.sensor_data_buffer_full);
        debug_assert_eq!(w.pos(), Self::ENCODED_LEN);
        w.pos()
    }

    pub fn decode(buf: &[u8]) -> Option<Self> {
        if buf.len() < Self::ENCODED_LEN {
            return None;
        }
        let mut r = Reader::new(buf);
        Some(Self {
            nvm_version: r.take_u16(),
            state: AppState::from_u8(r.take_u8()),
            first_act_date: r.take_u32(),
            recent_act_date: r.take_u32(),
            recent_deact_date: r.take_u32(),
            num_act: r.take_u8(),
            num_deact: r.take_u8(),
            am_wake_rate_days: r.take_u16(),
            reset_state: ResetState::from_u8(r.take_u8()),
            unexpected_reset_counter: r.take_u32(),
            time_of_last_unexpected_reset: r.take_u32(),
            total_liters: r.take_u32(),
            rtc_time_status: RtcTimeStatus::from_u8(r.take_u8()),
            stroke_detection_on: r.take_bool(),
            red_flag_on_pct: r.take_u16(),
            red_flag_off_pct: r.take_u16(),
            sensor_data_buffer_full: r.take_bool(),
        })
    }

    /// Range-check the tunable fields, substituting defaults for any
    /// stored garbage so the application never runs on bad values.
    pub fn sanitize(&mut self) {
        if self.am_wake_rate_days < MIN_WAKE_INTERVAL_DAYS
            || self.am_wake_rate_days > MAX_WAKE_INTERVAL_DAYS
        {
            warn!("device-info: wake rate out of range, using default");
            self.am_wake_rate_days = if self.state == AppState::Deactivated {
                DEFAULT_WAKE_INTERVAL_DEACTIVATED
            } else {
                DEFAULT_WAKE_INTERVAL_ACTIVATED
            };
        }
        if self.red_flag_on_pct > MAX_RED_FLAG_PCT {
            self.red_flag_on_pct = DEFAULT_RED_FLAG_ON_PCT;
        }
        if self.red_flag_off_pct > MAX_RED_FLAG_PCT {
            self.red_flag_off_pct = DEFAULT_RED_FLAG_OFF_PCT;
        }
    }

    pub fn runtime_config(&self) -> RuntimeConfig {
        RuntimeConfig {
            wake_interval_days: self.am_wake_rate_days,
            stroke_alg_on: self.stroke_detection_on,
            red_flag_on_pct: self.red_flag_on_pct,
            red_flag_off_pct: self.red_flag_off_pct,
        }
    }

    pub fn apply_config(&mut self, cfg: &RuntimeConfig) {
        self.am_wake_rate_days = cfg.wake_interval_days;
        self.stroke_detection_on = cfg.stroke_alg_on;
        self.red_flag_on_pct = cfg.red_flag_on_pct;
        self.red_flag_off_pct = cfg.red_flag_off_pct;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip() {
        let mut info = DeviceInfo::default();
        info.state = AppState::Activated;
        info.recent_act_date = 1_650_000_000;
        info.num_act = 2;
        info.total_liters = 98_765;
        info.reset_state = ResetState::Err;
        info.sensor_data_buffer_full = true;

        let mut buf = [0u8; DeviceInfo::ENCODED_LEN];
        let n = info.encode(&mut buf);
        assert_eq!(n, DeviceInfo::ENCODED_LEN);
        assert_eq!(DeviceInfo::decode(&buf), Some(info));
    }

    #[test]
    fn sanitize_fixes_out_of_range_wake_rate_by_state() {
        let mut info = DeviceInfo {
            am_wake_rate_days: 900,
            state: AppState::Deactivated,
            ..DeviceInfo::default()
        };
        info.sanitize();
        assert_eq!(info.am_wake_rate_days, DEFAULT_WAKE_INTERVAL_DEACTIVATED);

        let mut info = DeviceInfo {
            am_wake_rate_days: 0,
            state: AppState::Activated,
            ..DeviceInfo::default()
        };
        info.sanitize();
        assert_eq!(info.am_wake_rate_days, DEFAULT_WAKE_INTERVAL_ACTIVATED);
    }

    #[test]
    fn sanitize_keeps_valid_values() {
        let mut info = DeviceInfo {
            am_wake_rate_days: 14,
            red_flag_on_pct: 30,
            red_flag_off_pct: 80,
            ..DeviceInfo::default()
        };
        let before = info;
        info.sanitize();
        assert_eq!(info, before);
    }
}
