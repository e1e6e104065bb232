//! Hour-aligned aggregation into the daily record, plus red-flag
//! tracking against the four-week same-weekday average.

use log::info;

use crate::config::{DEFAULT_RED_FLAG_OFF_PCT, DEFAULT_RED_FLAG_ON_PCT};
use crate::telemetry::{AppState, DailyRecord, HOURS_PER_DAY};

/// Days contributing to the rolling average (four of each weekday).
pub const DAILY_LITERS_TO_AVG: usize = 28;
const WEEKS_TO_AVG: usize = DAILY_LITERS_TO_AVG / 7;

/// One hour's inputs, gathered from the water algorithm, the stroke
/// pipeline, and the environment sensor.
#[derive(Debug, Clone, Copy, Default)]
pub struct HourlySample {
    pub liters: u16,
    pub temp_c: u8,
    pub humidity_pct: u8,
    pub strokes: u16,
    pub stroke_height: u8,
}

/// Once-per-day fields filled in at midnight.
#[derive(Debug, Clone, Copy, Default)]
pub struct DailySingletons {
    pub battery_voltage_mv: u16,
    pub state: AppState,
    pub activated_date: u32,
    pub unexpected_resets: u32,
    pub time_of_last_reset: u32,
    pub error_bits: u32,
    pub total_liters: u32,
}

/// What an hour advance produced.
#[derive(Debug, Clone, Copy, Default)]
pub struct HourOutcome {
    /// A full day is buffered and ready for persistence.
    pub daily_ready: bool,
    /// The red flag rose on this day (edge, not level).
    pub new_red_flag: bool,
}

// ───────────────────────────────────────────────────────────────
// Red-flag tracking
// ───────────────────────────────────────────────────────────────

/// Rolling four-week daily-liters history, bucketed by weekday, with
/// on/off hysteresis for the breakdown flag.
pub struct RedFlagTracker {
    /// Last four values per weekday.
    history: [[u16; WEEKS_TO_AVG]; 7],
    filled: [u8; 7],
    next: [u8; 7],
    on_pct: u16,
    off_pct: u16,
    breakdown: bool,
}

impl Default for RedFlagTracker {
    fn default() -> Self {
        Self::new(DEFAULT_RED_FLAG_ON_PCT, DEFAULT_RED_FLAG_OFF_PCT)
    }
}

impl RedFlagTracker {
    pub fn new(on_pct: u16, off_pct: u16) -> Self {
        Self {
            history: [[0; WEEKS_TO_AVG]; 7],
            filled: [0; 7],
            next: [0; 7],
            on_pct,
            off_pct,
            breakdown: false,
        }
    }

    pub fn set_thresholds(&mut self, on_pct: u16, off_pct: u16) {
        self.on_pct = on_pct;
        self.off_pct = off_pct;
    }

    pub fn breakdown(&self) -> bool {
        self.breakdown
    }

    /// Average for this weekday over the recorded weeks (0 when no
    /// history yet).
    pub fn weekday_avg(&self, weekday: usize) -> u16 {
        let n = usize::from(self.filled[weekday]);
        if n == 0 {
            return 0;
        }
        let sum: u32 = self.history[weekday][..n].iter().map(|&v| u32::from(v)).sum();
        (sum / n as u32) as u16
    }

    /// Evaluate today against the history, latch/clear the breakdown
    /// flag, then fold today into the history. Returns (avg, breakdown).
    pub fn end_of_day(&mut self, weekday: usize, daily_liters: u16) -> (u16, bool) {
        let avg = self.weekday_avg(weekday);

        let on_level = u32::from(avg) * u32::from(self.on_pct) / 100;
        let off_level = u32::from(avg) * u32::from(self.off_pct) / 100;
        if avg > 0 && u32::from(daily_liters) < on_level {
            if !self.breakdown {
                info!("red flag: {daily_liters} L < {on_level} L threshold");
            }
            self.breakdown = true;
        } else if u32::from(daily_liters) > off_level {
            self.breakdown = false;
        }

        let slot = usize::from(self.next[weekday]);
        self.history[weekday][slot] = daily_liters;
        self.next[weekday] = ((slot + 1) % WEEKS_TO_AVG) as u8;
        if usize::from(self.filled[weekday]) < WEEKS_TO_AVG {
            self.filled[weekday] += 1;
        }

        (avg, self.breakdown)
    }

    /// Wipe the history and the latched flag (ResetAlarms command).
    pub fn reset(&mut self) {
        self.history = [[0; WEEKS_TO_AVG]; 7];
        self.filled = [0; 7];
        self.next = [0; 7];
        self.breakdown = false;
    }
}

/// Weekday (0 = Thursday epoch alignment folded away: 0..6 stable per
/// calendar day, which is all the averaging needs).
pub fn weekday_of(epoch: u32) -> usize {
    ((epoch / 86_400 + 4) % 7) as usize
}

// ───────────────────────────────────────────────────────────────
// Hourly rollup
// ───────────────────────────────────────────────────────────────

/// Builds one [`DailyRecord`] hour by hour.
pub struct HourlyRollup {
    record: DailyRecord,
    hour_idx: u8,
    first_hour: bool,
    daily_ready: bool,
    red_flag: RedFlagTracker,
    /// Suppresses repeated new-red-flag wakes while the flag stays up.
    red_flag_seen: bool,
}

impl Default for HourlyRollup {
    fn default() -> Self {
        Self::new()
    }
}

impl HourlyRollup {
    pub fn new() -> Self {
        Self {
            record: DailyRecord::default(),
            hour_idx: 0,
            first_hour: true,
            daily_ready: false,
            red_flag: RedFlagTracker::default(),
            red_flag_seen: false,
        }
    }

    pub fn set_red_flag_thresholds(&mut self, on_pct: u16, off_pct: u16) {
        self.red_flag.set_thresholds(on_pct, off_pct);
    }

    pub fn reset_red_flag_data(&mut self) {
        self.red_flag.reset();
        self.red_flag_seen = false;
        self.record.breakdown = false;
    }

    pub fn hour_index(&self) -> u8 {
        self.hour_idx
    }

    /// Re-anchor the hour index from the RTC (activation, time sync).
    pub fn set_hour_index(&mut self, hour: u8) {
        self.hour_idx = hour % HOURS_PER_DAY as u8;
        self.first_hour = true;
    }

    pub fn daily_ready(&self) -> bool {
        self.daily_ready
    }

    /// Mutable access for the owners of record-level bits (diagnostics
    /// flags, midnight error snapshot).
    pub fn record_mut(&mut self) -> &mut DailyRecord {
        &mut self.record
    }

    pub fn record(&self) -> &DailyRecord {
        &self.record
    }

    /// Advance to the next hour and fold `sample` into the slot that
    /// just completed. At midnight the once-per-day fields land, the
    /// daily aggregates are finalized, and the record is marked ready.
    pub fn advance_hour(
        &mut self,
        now_epoch: u32,
        sample: HourlySample,
        singles: &DailySingletons,
    ) -> HourOutcome {
        let mut outcome = HourOutcome::default();

        self.hour_idx = (self.hour_idx + 1) % HOURS_PER_DAY as u8;
        info!("rollup: hour {}", self.hour_idx);

        if self.first_hour {
            self.first_hour = false;
            self.record.timestamp = now_epoch;
        }

        // The slot being closed out: the previous hour.
        let slot = if self.hour_idx == 0 {
            self.record.battery_voltage_mv = singles.battery_voltage_mv;
            self.record.state = singles.state;
            self.record.activated_date = singles.activated_date;
            self.record.unexpected_resets = singles.unexpected_resets;
            self.record.time_of_last_reset = singles.time_of_last_reset;
            self.record.error_bits |= singles.error_bits;
            self.record.total_liters = singles.total_liters;

            self.daily_ready = true;
            self.first_hour = true;
            outcome.daily_ready = true;
            HOURS_PER_DAY - 1
        } else {
            usize::from(self.hour_idx) - 1
        };

        self.record.liters_per_hour[slot] = sample.liters;
        self.record.temp_per_hour[slot] = sample.temp_c;
        self.record.humidity_per_hour[slot] = sample.humidity_pct;
        self.record.strokes_per_hour[slot] = sample.strokes;
        self.record.stroke_height_per_hour[slot] = sample.stroke_height;

        if slot == HOURS_PER_DAY - 1 {
            let daily: u32 = self
                .record
                .liters_per_hour
                .iter()
                .map(|&v| u32::from(v))
                .sum();
            self.record.daily_liters = daily.min(u32::from(u16::MAX)) as u16;

            let (avg, breakdown) =
                self.red_flag.end_of_day(weekday_of(now_epoch), self.record.daily_liters);
            self.record.avg_liters = avg;
            self.record.breakdown = breakdown;

            if breakdown {
                if !self.red_flag_seen {
                    self.red_flag_seen = true;
                    outcome.new_red_flag = true;
                }
            } else {
                self.red_flag_seen = false;
            }
        }

        outcome
    }

    /// Hand out the completed record for persistence and start the next
    /// day fresh (hour arrays zeroed, daily scalars cleared).
    pub fn take_ready_record(&mut self) -> DailyRecord {
        let record = self.record.clone();
        self.daily_ready = false;

        self.record.liters_per_hour = [0; HOURS_PER_DAY];
        self.record.temp_per_hour = [0; HOURS_PER_DAY];
        self.record.humidity_per_hour = [0; HOURS_PER_DAY];
        self.record.strokes_per_hour = [0; HOURS_PER_DAY];
        self.record.stroke_height_per_hour = [0; HOURS_PER_DAY];
        self.record.daily_liters = 0;
        self.record.total_liters = 0;
        self.record.avg_liters = 0;
        self.record.error_bits = 0;

        record
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(liters: u16) -> HourlySample {
        HourlySample {
            liters,
            temp_c: 25,
            humidity_pct: 50,
            strokes: liters / 2,
            stroke_height: 10,
        }
    }

    fn run_full_day(rollup: &mut HourlyRollup, epoch: u32, liters: u16) -> HourOutcome {
        let singles = DailySingletons {
            battery_voltage_mv: 3600,
            state: AppState::Activated,
            ..DailySingletons::default()
        };
        let mut last = HourOutcome::default();
        for _ in 0..HOURS_PER_DAY {
            last = rollup.advance_hour(epoch, sample(liters), &singles);
        }
        last
    }

    #[test]
    fn hourly_fields_land_in_the_previous_hour_slot() {
        let mut rollup = HourlyRollup::new();
        rollup.set_hour_index(5);
        rollup.advance_hour(1000, sample(42), &DailySingletons::default());
        assert_eq!(rollup.hour_index(), 6);
        assert_eq!(rollup.record().liters_per_hour[5], 42);
    }

    #[test]
    fn midnight_finalizes_the_day() {
        let mut rollup = HourlyRollup::new();
        rollup.set_hour_index(0);
        let outcome = run_full_day(&mut rollup, 86_400 * 10, 10);
        assert!(outcome.daily_ready);
        assert!(rollup.daily_ready());

        let rec = rollup.take_ready_record();
        assert_eq!(rec.daily_liters, 240);
        assert_eq!(rec.battery_voltage_mv, 3600);
        assert_eq!(rec.state, AppState::Activated);
        assert!(!rollup.daily_ready());
        // Next day starts clean.
        assert_eq!(rollup.record().daily_liters, 0);
        assert_eq!(rollup.record().liters_per_hour, [0; HOURS_PER_DAY]);
    }

    #[test]
    fn timestamp_set_on_first_hour_of_each_day() {
        let mut rollup = HourlyRollup::new();
        rollup.set_hour_index(0);
        rollup.advance_hour(111, sample(1), &DailySingletons::default());
        assert_eq!(rollup.record().timestamp, 111);
        // Later hours of the same day do not restamp.
        rollup.advance_hour(222, sample(1), &DailySingletons::default());
        assert_eq!(rollup.record().timestamp, 111);
    }

    #[test]
    fn red_flag_latches_when_liters_collapse() {
        let mut rollup = HourlyRollup::new();
        rollup.set_red_flag_thresholds(25, 75);
        rollup.set_hour_index(0);

        // Four healthy same-weekday histories: 240 L/day.
        for week in 0..4u32 {
            let outcome = run_full_day(&mut rollup, 86_400 * 7 * week, 10);
            assert!(!outcome.new_red_flag);
            let _ = rollup.take_ready_record();
        }

        // A collapsed day on the same weekday: 24 L < 25% of 240 L.
        let outcome = run_full_day(&mut rollup, 86_400 * 28, 1);
        assert!(outcome.new_red_flag, "red flag edge reported");
        let rec = rollup.take_ready_record();
        assert!(rec.breakdown);
        assert_eq!(rec.avg_liters, 240);

        // The flag stays up on the next bad day, but the edge does not
        // repeat.
        let outcome = run_full_day(&mut rollup, 86_400 * 35, 1);
        assert!(!outcome.new_red_flag);
        assert!(rollup.take_ready_record().breakdown);
    }

    #[test]
    fn red_flag_clears_above_the_off_threshold() {
        let mut tracker = RedFlagTracker::new(25, 75);
        for _ in 0..4 {
            tracker.end_of_day(2, 200);
        }
        tracker.end_of_day(2, 10);
        assert!(tracker.breakdown());

        // 100 L is between on (·25%) and off (·75%) of the ~152 avg —
        // hysteresis holds the flag.
        let (avg, flagged) = tracker.end_of_day(2, 100);
        assert!(flagged, "inside the hysteresis band, avg {avg}");

        // Well above the off threshold clears it.
        let (_, flagged) = tracker.end_of_day(2, 300);
        assert!(!flagged);
    }

    #[test]
    fn weekday_average_ignores_other_weekdays() {
        let mut tracker = RedFlagTracker::new(25, 75);
        tracker.end_of_day(1, 100);
        tracker.end_of_day(2, 900);
        assert_eq!(tracker.weekday_avg(1), 100);
        assert_eq!(tracker.weekday_avg(2), 900);
        assert_eq!(tracker.weekday_avg(3), 0);
    }

    #[test]
    fn empty_history_never_flags() {
        let mut tracker = RedFlagTracker::new(25, 75);
        let (avg, flagged) = tracker.end_of_day(0, 0);
        assert_eq!(avg, 0);
        assert!(!flagged, "zero average must not trip the flag");
    }
}
