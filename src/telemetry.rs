//! Persisted record schemas.
//!
//! Two record shapes exist: the [`DailyRecord`] the SSM accumulates and
//! logs to EEPROM (and ships over ASP), and the [`CloudRecord`] the AM
//! wraps around it for the cloud hop. Both are explicit little-endian
//! byte layouts with a trailing two's-complement checksum; nothing here
//! depends on compiler struct packing.

use crate::wire::{checksum, Reader, Writer};

pub const HOURS_PER_DAY: usize = 24;
/// Capacity of the sensor-data ring on both processors (8 weeks of days).
pub const MAX_SENSOR_DATA_LOGS: usize = 56;
/// Bounded debug-log text carried in the cloud record header.
pub const DEBUG_LOG_LEN: usize = 100;
/// Product identifier reported in every cloud record.
pub const PRODUCT_ID: u32 = 4;

// ───────────────────────────────────────────────────────────────
// Shared state enums (wire values used in records and ASP status)
// ───────────────────────────────────────────────────────────────

/// High-level device state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum AppState {
    Activated = 0,
    #[default]
    Deactivated = 1,
    Fault = 2,
}

impl AppState {
    pub fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Activated,
            1 => Self::Deactivated,
            _ => Self::Fault,
        }
    }
}

/// Persisted reset source. `Err` is written right after boot so that a
/// spurious reset is recognizable on the next power-up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum ResetState {
    #[default]
    Por = 0,
    Swr = 1,
    Ok = 2,
    Err = 99,
}

impl ResetState {
    pub fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Por,
            1 => Self::Swr,
            2 => Self::Ok,
            _ => Self::Err,
        }
    }
}

// ───────────────────────────────────────────────────────────────
// Daily record (SSM)
// ───────────────────────────────────────────────────────────────

/// One day of hour-aligned aggregates, built by the rollup and persisted
/// to the EEPROM sensor-data ring.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DailyRecord {
    /// Epoch of the first sample of the day.
    pub timestamp: u32,
    pub liters_per_hour: [u16; HOURS_PER_DAY],
    pub temp_per_hour: [u8; HOURS_PER_DAY],
    pub humidity_per_hour: [u8; HOURS_PER_DAY],
    pub strokes_per_hour: [u16; HOURS_PER_DAY],
    pub stroke_height_per_hour: [u8; HOURS_PER_DAY],
    pub daily_liters: u16,
    /// Rolling same-weekday average over the past four weeks.
    pub avg_liters: u16,
    /// Liters since activation.
    pub total_liters: u32,
    pub breakdown: bool,
    pub pump_capacity: u16,
    pub pump_usage: u16,
    pub dry_strokes: u16,
    pub dry_stroke_height: u16,
    pub battery_voltage_mv: u16,
    pub state: AppState,
    pub error_bits: u32,
    pub unexpected_resets: u32,
    pub time_of_last_reset: u32,
    pub activated_date: u32,
}

impl Default for DailyRecord {
    fn default() -> Self {
        Self {
            timestamp: 0,
            liters_per_hour: [0; HOURS_PER_DAY],
            temp_per_hour: [0; HOURS_PER_DAY],
            humidity_per_hour: [0; HOURS_PER_DAY],
            strokes_per_hour: [0; HOURS_PER_DAY],
            stroke_height_per_hour: [0; HOURS_PER_DAY],
            daily_liters: 0,
            avg_liters: 0,
            total_liters: 0,
            breakdown: false,
            pump_capacity: 0,
            pump_usage: 0,
            dry_strokes: 0,
            dry_stroke_height: 0,
            battery_voltage_mv: 3600,
            state: AppState::Fault,
            error_bits: 0,
            unexpected_resets: 0,
            time_of_last_reset: 0,
            activated_date: 0,
        }
    }
}

impl DailyRecord {
    /// Encoded length without the trailing checksum byte.
    pub const ENCODED_LEN: usize = 208;
    /// Stored entry length (payload + trailing checksum).
    pub const ENTRY_LEN: usize = Self::ENCODED_LEN + 1;

    /// Serialize the payload portion into `buf` (≥ `ENCODED_LEN` bytes).
    pub fn encode(&self, buf: &mut [u8]) -> usize {
        let mut w = Writer::new(buf);
        w.put_u32(self.timestamp);
        for v in self.liters_per_hour {
            w.put_u16(v);
        }
        w.put_bytes(&self.temp_per_hour);
        w.put_bytes(&self.humidity_per_hour);
        for v in self.strokes_per_hour {
            w.put_u16(v);
        }
        w.put_bytes(&self.stroke_height_per_hour);
        w.put_u16(self.daily_liters);
        w.put_u16(self.avg_liters);
        w.put_u32(self.total_liters);
        w.put_bool(self.breakdown);
        w.put_u16(self.pump_capacity);
        w.put_u16(self.pump_usage);
        w.put_u16(self.dry_strokes);
        w.put_u16(self.dry_stroke_height);
        w.put_u16(self.battery_voltage_mv);
        w.put_u8(self.state as u8);
        w.put_u32(self.error_bits);
        w.put_u32(self.unexpected_resets);
        w.put_u32(self.time_of_last_reset);
        w.put_u32(self.activated_date);
        debug_assert_eq!(w.pos(), Self::ENCODED_LEN);
        w.pos()
    }

    /// Serialize payload plus trailing checksum (`ENTRY_LEN` bytes).
    pub fn encode_with_checksum(&self, buf: &mut [u8]) -> usize {
        let n = self.encode(buf);
        buf[n] = checksum(&buf[..n]);
        n + 1
    }

    /// Decode the payload portion (no checksum verification).
    pub fn decode(buf: &[u8]) -> Option<Self> {
        if buf.len() < Self::ENCODED_LEN {
            return None;
        }
        let mut r = Reader::new(buf);
        let timestamp = r.take_u32();
        let mut liters_per_hour = [0u16; HOURS_PER_DAY];
        for v in &mut liters_per_hour {
            *v = r.take_u16();
        }
        let temp_per_hour = r.take_bytes::<HOURS_PER_DAY>();
        let humidity_per_hour = r.take_bytes::<HOURS_PER_DAY>();
        let mut strokes_per_hour = [0u16; HOURS_PER_DAY];
        for v in &mut strokes_per_hour {
            *v = r.take_u16();
        }
        let stroke_height_per_hour = r.take_bytes::<HOURS_PER_DAY>();
        Some(Self {
            timestamp,
            liters_per_hour,
            temp_per_hour,
            humidity_per_hour,
            strokes_per_hour,
            stroke_height_per_hour,
            daily_liters: r.take_u16(),
            avg_liters: r.take_u16(),
            total_liters: r.take_u32(),
            breakdown: r.take_bool(),
            pump_capacity: r.take_u16(),
            pump_usage: r.take_u16(),
            dry_strokes: r.take_u16(),
            dry_stroke_height: r.take_u16(),
            battery_voltage_mv: r.take_u16(),
            state: AppState::from_u8(r.take_u8()),
            error_bits: r.take_u32(),
            unexpected_resets: r.take_u32(),
            time_of_last_reset: r.take_u32(),
            activated_date: r.take_u32(),
        })
    }

    /// Decode an entry that carries its trailing checksum; `None` when
    /// the checksum does not match.
    pub fn decode_checked(buf: &[u8]) -> Option<Self> {
        if buf.len() < Self::ENTRY_LEN {
            return None;
        }
        if checksum(&buf[..Self::ENCODED_LEN]) != buf[Self::ENCODED_LEN] {
            return None;
        }
        Self::decode(buf)
    }
}

// ───────────────────────────────────────────────────────────────
// Cloud record (AM)
// ───────────────────────────────────────────────────────────────

/// AM-side record: transmission header plus the day's aggregates. This
/// is the shape persisted to NAND and handed to the cellular/MQTT path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloudRecord {
    pub product_id: u32,
    pub timestamp: u32,
    /// Monotonic message number; wraps from 2³²−1 back to 1.
    pub msg_number: u32,
    pub fw_version: (u32, u32, u32),
    pub battery_voltage_mv: u16,
    pub power_remaining_pct: u16,
    pub state: AppState,
    pub activated_date: u32,
    pub magnet_detected: bool,
    pub error_bits: u32,
    pub num_ssm_resets: u32,
    pub last_ssm_reset_date: u32,
    pub num_am_resets: u32,
    pub last_am_reset_date: u32,
    pub debug_log: heapless::String<DEBUG_LOG_LEN>,

    pub liters_per_hour: [u16; HOURS_PER_DAY],
    pub temp_per_hour: [u8; HOURS_PER_DAY],
    pub humidity_per_hour: [u8; HOURS_PER_DAY],
    pub strokes_per_hour: [u16; HOURS_PER_DAY],
    pub stroke_height_per_hour: [u8; HOURS_PER_DAY],
    pub daily_liters: u16,
    pub avg_liters: u16,
    pub total_liters: u32,
    pub breakdown: bool,
    pub pump_capacity: u16,
    pub pump_usage: u16,
    pub dry_strokes: u16,
    pub dry_stroke_height: u16,
}

impl Default for CloudRecord {
    fn default() -> Self {
        Self {
            product_id: PRODUCT_ID,
            timestamp: 0,
            msg_number: 1,
            fw_version: (0, 0, 0),
            battery_voltage_mv: 0,
            power_remaining_pct: 100,
            state: AppState::Deactivated,
            activated_date: 0,
            magnet_detected: false,
            error_bits: 0,
            num_ssm_resets: 0,
            last_ssm_reset_date: 0,
            num_am_resets: 0,
            last_am_reset_date: 0,
            debug_log: heapless::String::new(),
            liters_per_hour: [0; HOURS_PER_DAY],
            temp_per_hour: [0; HOURS_PER_DAY],
            humidity_per_hour: [0; HOURS_PER_DAY],
            strokes_per_hour: [0; HOURS_PER_DAY],
            stroke_height_per_hour: [0; HOURS_PER_DAY],
            daily_liters: 0,
            avg_liters: 0,
            total_liters: 0,
            breakdown: false,
            pump_capacity: 0,
            pump_usage: 0,
            dry_strokes: 0,
            dry_stroke_height: 0,
        }
    }
}

impl CloudRecord {
    pub const ENCODED_LEN: usize = 339;
    pub const ENTRY_LEN: usize = Self::ENCODED_LEN + 1;

    /// Build a cloud record around a daily record received from the SSM.
    pub fn from_daily(daily: &DailyRecord) -> Self {
        Self {
            timestamp: daily.timestamp,
            battery_voltage_mv: daily.battery_voltage_mv,
            state: daily.state,
            activated_date: daily.activated_date,
            error_bits: daily.error_bits,
            num_ssm_resets: daily.unexpected_resets,
            last_ssm_reset_date: daily.time_of_last_reset,
            liters_per_hour: daily.liters_per_hour,
            temp_per_hour: daily.temp_per_hour,
            humidity_per_hour: daily.humidity_per_hour,
            strokes_per_hour: daily.strokes_per_hour,
            stroke_height_per_hour: daily.stroke_height_per_hour,
            daily_liters: daily.daily_liters,
            avg_liters: daily.avg_liters,
            total_liters: daily.total_liters,
            breakdown: daily.breakdown,
            pump_capacity: daily.pump_capacity,
            pump_usage: daily.pump_usage,
            dry_strokes: daily.dry_strokes,
            dry_stroke_height: daily.dry_stroke_height,
            ..Self::default()
        }
    }

    pub fn encode(&self, buf: &mut [u8]) -> usize {
        let mut w = Writer::new(buf);
        w.put_u32(self.product_id);
        w.put_u32(self.timestamp);
        w.put_u32(self.msg_number);
        w.put_u32(self.fw_version.0);
        w.put_u32(self.fw_version.1);
        w.put_u32(self.fw_version.2);
        w.put_u16(self.battery_voltage_mv);
        w.put_u16(self.power_remaining_pct);
        w.put_u8(self.state as u8);
        w.put_u32(self.activated_date);
        w.put_bool(self.magnet_detected);
        w.put_u32(self.error_bits);
        w.put_u32(self.num_ssm_resets);
        w.put_u32(self.last_ssm_reset_date);
        w.put_u32(self.num_am_resets);
        w.put_u32(self.last_am_reset_date);
        let mut log = [0u8; DEBUG_LOG_LEN];
        log[..self.debug_log.len()].copy_from_slice(self.debug_log.as_bytes());
        w.put_bytes(&log);
        for v in self.liters_per_hour {
            w.put_u16(v);
        }
        w.put_bytes(&self.temp_per_hour);
        w.put_bytes(&self.humidity_per_hour);
        for v in self.strokes_per_hour {
            w.put_u16(v);
        }
        w.put_bytes(&self.stroke_height_per_hour);
        w.put_u16(self.daily_liters);
        w.put_u16(self.avg_liters);
        w.put_u32(self.total_liters);
        w.put_bool(self.breakdown);
        w.put_u16(self.pump_capacity);
        w.put_u16(self.pump_usage);
        w.put_u16(self.dry_strokes);
        w.put_u16(self.dry_stroke_height);
        debug_assert_eq!(w.pos(), Self::ENCODED_LEN);
        w.pos()
    }

    pub fn decode(buf: &[u8]) -> Option<Self> {
        if buf.len() < Self::ENCODED_LEN {
            return None;
        }
        let mut r = Reader::new(buf);
        let product_id = r.take_u32();
        let timestamp = r.take_u32();
        let msg_number = r.take_u32();
        let fw_version = (r.take_u32(), r.take_u32(), r.take_u32());
        let battery_voltage_mv = r.take_u16();
        let power_remaining_pct = r.take_u16();
        let state = AppState::from_u8(r.take_u8());
        let activated_date = r.take_u32();
        let magnet_detected = r.take_bool();
        let error_bits = r.take_u32();
        let num_ssm_resets = r.take_u32();
        let last_ssm_reset_date = r.take_u32();
        let num_am_resets = r.take_u32();
        let last_am_reset_date = r.take_u32();
        let log_raw = r.take_bytes::<DEBUG_LOG_LEN>();
        let log_end = log_raw.iter().position(|&b| b == 0).unwrap_or(DEBUG_LOG_LEN);
        let mut debug_log = heapless::String::new();
        for &b in &log_raw[..log_end] {
            let _ = debug_log.push(b as char);
        }
        let mut liters_per_hour = [0u16; HOURS_PER_DAY];
        for v in &mut liters_per_hour {
            *v = r.take_u16();
        }
        let temp_per_hour = r.take_bytes::<HOURS_PER_DAY>();
        let humidity_per_hour = r.take_bytes::<HOURS_PER_DAY>();
        let mut strokes_per_hour = [0u16; HOURS_PER_DAY];
        for v in &mut strokes_per_hour {
            *v = r.take_u16();
        }
        let stroke_height_per_hour = r.take_bytes::<HOURS_PER_DAY>();
        Some(Self {
            product_id,
            timestamp,
            msg_number,
            fw_version,
            battery_voltage_mv,
            power_remaining_pct,
            state,
            activated_date,
            magnet_detected,
            error_bits,
            num_ssm_resets,
            last_ssm_reset_date,
            num_am_resets,
            last_am_reset_date,
            debug_log,
            liters_per_hour,
            temp_per_hour,
            humidity_per_hour,
            strokes_per_hour,
            stroke_height_per_hour,
            daily_liters: r.take_u16(),
            avg_liters: r.take_u16(),
            total_liters: r.take_u32(),
            breakdown: r.take_bool(),
            pump_capacity: r.take_u16(),
            pump_usage: r.take_u16(),
            dry_strokes: r.take_u16(),
            dry_stroke_height: r.take_u16(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_daily() -> DailyRecord {
        let mut rec = DailyRecord {
            timestamp: 1_700_000_000,
            daily_liters: 412,
            avg_liters: 388,
            total_liters: 120_345,
            breakdown: true,
            battery_voltage_mv: 3571,
            state: AppState::Activated,
            error_bits: 0x0000_4002,
            unexpected_resets: 3,
            time_of_last_reset: 1_699_990_000,
            activated_date: 1_650_000_000,
            ..DailyRecord::default()
        };
        for h in 0..HOURS_PER_DAY {
            rec.liters_per_hour[h] = (h as u16) * 7;
            rec.temp_per_hour[h] = 20 + h as u8;
            rec.humidity_per_hour[h] = 40 + h as u8;
            rec.strokes_per_hour[h] = (h as u16) * 11;
            rec.stroke_height_per_hour[h] = h as u8;
        }
        rec
    }

    #[test]
    fn daily_record_round_trip() {
        let rec = sample_daily();
        let mut buf = [0u8; DailyRecord::ENTRY_LEN];
        let n = rec.encode_with_checksum(&mut buf);
        assert_eq!(n, DailyRecord::ENTRY_LEN);

        let back = DailyRecord::decode_checked(&buf).expect("checksum must verify");
        assert_eq!(back, rec);
    }

    #[test]
    fn daily_record_fits_one_asp_frame() {
        // The stored entry rides as a single ASP payload.
        assert!(DailyRecord::ENTRY_LEN <= crate::asp::MAX_PAYLOAD);
    }

    #[test]
    fn corrupt_entry_is_rejected() {
        let rec = sample_daily();
        let mut buf = [0u8; DailyRecord::ENTRY_LEN];
        rec.encode_with_checksum(&mut buf);
        buf[10] ^= 0xff;
        assert!(DailyRecord::decode_checked(&buf).is_none());
    }

    #[test]
    fn cloud_record_round_trip() {
        let mut rec = CloudRecord::from_daily(&sample_daily());
        rec.msg_number = 77;
        rec.fw_version = (2, 1, 9);
        let _ = rec.debug_log.push_str("boot ok");

        let mut buf = [0u8; CloudRecord::ENCODED_LEN];
        let n = rec.encode(&mut buf);
        assert_eq!(n, CloudRecord::ENCODED_LEN);

        let back = CloudRecord::decode(&buf).expect("decodes");
        assert_eq!(back, rec);
    }
}
