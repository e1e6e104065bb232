//! Online per-pad calibration.
//!
//! Each pad learns the typical drop `open_air − covered` while water
//! demonstrably covers it (both pads of an adjacent pair read Present).
//! The mean streams in over at most 30 samples and freezes; a pad is
//! *done* once 50 samples have contributed. Consistency failures reset
//! the whole bank — a stale calibration is worse than none.

use log::info;

use super::presence::{PadState, Presence};
use super::{NUM_PADS, OPEN_AIR_FALLBACK};

/// Samples after which the streaming mean stops moving.
const MEAN_CAP: i16 = 30;
/// Samples after which a pad's calibration is considered complete.
const DONE_COUNT: i16 = 50;
/// A completed mean below this is physically implausible and poisons
/// height selection; it triggers a full reset.
const MIN_PLAUSIBLE_MEAN: i16 = 7;
/// A drop this small while supposedly covered is a bad sample.
const BAD_SAMPLE_DELTA: i16 = 10;
/// Tolerance band for the periodic consistency check.
const CHECK_TOLERANCE: i16 = 6;
/// Consecutive failed checks before the bank resets.
const CHECK_STRIKES: u8 = 3;

/// One pad's calibration: streaming mean, sample count, done flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PadCalib {
    pub mean: i16,
    pub count: i16,
    pub done: bool,
}

/// Flags reported by one calibration update.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CalibFlags {
    /// Pad 1 completed — the whole column is calibrated.
    pub calibrated: bool,
    /// At least one bad (too-small) sample was discarded.
    pub neg_delta: bool,
    /// The bank was reset because a completed mean was implausible.
    pub reset: bool,
}

/// Streaming-mean update for one pad.
///
/// `count` has already been incremented by the caller. A bad sample
/// (`open_air − current ≤ 10`) leaves the mean untouched and rolls the
/// increment back. The mean follows
/// `((n−1)·mean)/n + ceil((open_air − current)/n)` up to 30 samples,
/// then holds while the count keeps climbing toward the done threshold.
pub fn add_to_average(count: i16, mean: i16, current: i16, open_air: i16) -> (i16, i16, bool) {
    let delta = open_air - current;
    if delta <= BAD_SAMPLE_DELTA {
        return (mean, count - 1, true);
    }
    if count == 1 {
        return (delta, 1, false);
    }
    if count > 1 && count <= MEAN_CAP {
        let div = i32::from(delta) / i32::from(count);
        let ceil = if i32::from(delta) % i32::from(count) > 0 {
            div + 1
        } else {
            div
        };
        let mean = i32::from(count - 1) * i32::from(mean) / i32::from(count) + ceil;
        return (mean as i16, count, false);
    }
    if count > MEAN_CAP {
        return (mean, count, false);
    }
    (0, 0, false)
}

/// The calibration bank for all eight pads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Calibration {
    pub pads: [PadCalib; NUM_PADS],
}

impl Calibration {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reset_all(&mut self) {
        self.pads = [PadCalib::default(); NUM_PADS];
    }

    /// Add the current sample to whichever pads the presence pattern
    /// proves are fully covered, then evaluate completion.
    ///
    /// Pads calibrate top-down in first-match pairs: if pads k and k+1
    /// both read Present and pad k+1 is not yet done, pads k+1..8 are
    /// all under water and all take this sample (the topmost pair also
    /// feeds pad 1 itself). A missing open-air baseline suspends
    /// calibration for the window and re-seeds the fallback baseline.
    pub fn update(
        &mut self,
        pads: &[PadState; NUM_PADS],
        open_air: &mut [i16; NUM_PADS],
        sample: [i16; NUM_PADS],
        cal_error_count: &mut u8,
    ) -> CalibFlags {
        let mut flags = CalibFlags::default();

        if open_air.iter().any(|&oa| oa == 0) {
            *open_air = [OPEN_AIR_FALLBACK; NUM_PADS];
            return flags;
        }

        let present =
            |k: usize| pads[k].presence == Presence::Present;

        // First matching covered pair decides which pads calibrate.
        let mut from: Option<usize> = None;
        if present(0) && present(1) && self.pads[1].done && !self.pads[0].done {
            // Only the top pad is still learning.
            self.calibrate_pad(0, sample[0], open_air[0], &mut flags);
        } else {
            for k in 0..NUM_PADS - 1 {
                if present(k) && present(k + 1) && !self.pads[k + 1].done {
                    from = Some(if k == 0 { 0 } else { k + 1 });
                    break;
                }
            }
            if let Some(first) = from {
                for j in first..NUM_PADS {
                    self.calibrate_pad(j, sample[j], open_air[j], &mut flags);
                }
            }
        }

        // Completion and plausibility checks.
        for k in 0..NUM_PADS {
            if self.pads[k].count >= DONE_COUNT {
                self.pads[k].done = true;
                if k == 0 {
                    flags.calibrated = true;
                }
                if self.pads[k].mean < MIN_PLAUSIBLE_MEAN {
                    info!("calibration: implausible mean on pad {}, resetting bank", k + 1);
                    self.reset_all();
                    *cal_error_count = 0;
                    flags.reset = true;
                }
            }
        }

        flags
    }

    fn calibrate_pad(&mut self, k: usize, current: i16, open_air: i16, flags: &mut CalibFlags) {
        let pad = &mut self.pads[k];
        if pad.count < i16::from(u8::MAX) {
            pad.count += 1;
        }
        let (mean, count, bad) = add_to_average(pad.count, pad.mean, current, open_air);
        pad.mean = mean;
        pad.count = count;
        if bad {
            flags.neg_delta = true;
        }
    }

    /// Periodic consistency check (every 20th processed sample while
    /// measuring): for the first adjacent pair both Present whose lower
    /// pad is done, every done region below must still read within
    /// ±6 of its calibrated mean. Three consecutive mismatches reset
    /// the whole bank. Returns true when the bank was reset.
    pub fn check(
        &mut self,
        pads: &[PadState; NUM_PADS],
        open_air: &[i16; NUM_PADS],
        sample: &[i16; NUM_PADS],
        cal_error_count: &mut u8,
    ) -> bool {
        let present = |k: usize| pads[k].presence == Presence::Present;

        for k in 0..NUM_PADS - 1 {
            if present(k) && present(k + 1) && self.pads[k + 1].done {
                let consistent = (k + 1..NUM_PADS).all(|j| {
                    let thresh = open_air[j] - sample[j];
                    let mean = self.pads[j].mean;
                    (mean - CHECK_TOLERANCE..=mean + CHECK_TOLERANCE).contains(&thresh)
                });
                if consistent {
                    *cal_error_count = 0;
                    return false;
                }
                *cal_error_count += 1;
                break;
            }
        }

        if *cal_error_count >= CHECK_STRIKES {
            info!("calibration: {CHECK_STRIKES} consecutive mismatches, resetting bank");
            self.reset_all();
            *cal_error_count = 0;
            return true;
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn all_present() -> [PadState; NUM_PADS] {
        [PadState {
            presence: Presence::Present,
            draining_count: 0,
        }; NUM_PADS]
    }

    fn open_air() -> [i16; NUM_PADS] {
        [800; NUM_PADS]
    }

    #[test]
    fn first_sample_sets_the_raw_delta() {
        let (mean, count, bad) = add_to_average(1, 0, 760, 800);
        assert_eq!((mean, count, bad), (40, 1, false));
    }

    #[test]
    fn bad_sample_rolls_back_and_flags() {
        let (mean, count, bad) = add_to_average(5, 37, 795, 800);
        assert_eq!(mean, 37, "mean untouched");
        assert_eq!(count, 4, "increment rolled back");
        assert!(bad);
    }

    #[test]
    fn streaming_mean_uses_ceiling_division() {
        // n=2, old mean 40, delta 41: (1*40)/2 + ceil(41/2) = 20 + 21.
        let (mean, count, bad) = add_to_average(2, 40, 759, 800);
        assert_eq!((mean, count, bad), (41, 2, false));
    }

    #[test]
    fn mean_freezes_after_thirty_samples() {
        let (mean, count, _) = add_to_average(31, 44, 700, 800);
        assert_eq!(mean, 44, "mean held past the cap");
        assert_eq!(count, 31, "count keeps climbing toward done");
    }

    #[test]
    fn column_calibrates_and_pad_one_completion_reports() {
        let mut calib = Calibration::new();
        let pads = all_present();
        let mut oa = open_air();
        let mut errs = 0u8;

        let mut flags = CalibFlags::default();
        for _ in 0..50 {
            flags = calib.update(&pads, &mut oa, [760; NUM_PADS], &mut errs);
        }
        assert!(flags.calibrated, "pad 1 done after 50 samples");
        for pad in &calib.pads {
            assert!(pad.done);
            assert_eq!(pad.mean, 40);
        }
    }

    #[test]
    fn counts_keep_climbing_while_mean_is_capped() {
        let mut calib = Calibration::new();
        let pads = all_present();
        let mut oa = open_air();
        let mut errs = 0u8;

        for _ in 0..40 {
            calib.update(&pads, &mut oa, [760; NUM_PADS], &mut errs);
        }
        assert!(!calib.pads[0].done);
        assert_eq!(calib.pads[0].count, 40);
        assert_eq!(calib.pads[0].mean, 40);
    }

    #[test]
    fn implausible_completed_mean_resets_the_bank() {
        let mut calib = Calibration::new();
        let pads = all_present();
        let mut oa = open_air();
        let mut errs = 3u8;

        // Seed a completed-but-implausible bank directly.
        for pad in &mut calib.pads {
            pad.mean = 5;
            pad.count = 50;
        }
        let flags = calib.update(&pads, &mut oa, [788; NUM_PADS], &mut errs);
        assert!(flags.reset);
        assert_eq!(errs, 0);
        assert_eq!(calib.pads, [PadCalib::default(); NUM_PADS]);
    }

    #[test]
    fn missing_open_air_reseeds_fallback_and_skips() {
        let mut calib = Calibration::new();
        let pads = all_present();
        let mut oa = open_air();
        oa[3] = 0;
        let mut errs = 0u8;

        let flags = calib.update(&pads, &mut oa, [700; NUM_PADS], &mut errs);
        assert_eq!(flags, CalibFlags::default());
        assert_eq!(oa, [OPEN_AIR_FALLBACK; NUM_PADS]);
        assert_eq!(calib.pads[4].count, 0, "no samples taken this round");
    }

    #[test]
    fn partial_coverage_calibrates_only_the_wet_pads() {
        let mut calib = Calibration::new();
        let mut pads = [PadState::default(); NUM_PADS];
        // Water up to pad 5 (indices 4..8 wet).
        for p in &mut pads[4..] {
            p.presence = Presence::Present;
        }
        let mut oa = open_air();
        let mut errs = 0u8;

        calib.update(&pads, &mut oa, [750; NUM_PADS], &mut errs);
        // Pair (5,6) matches; pads 6..8 calibrate.
        assert_eq!(calib.pads[4].count, 0);
        for pad in &calib.pads[5..] {
            assert_eq!(pad.count, 1);
            assert_eq!(pad.mean, 50);
        }
    }

    #[test]
    fn consistency_check_counts_strikes_then_resets() {
        let mut calib = Calibration::new();
        let pads = all_present();
        let oa = open_air();
        let mut errs = 0u8;

        for pad in &mut calib.pads {
            pad.mean = 40;
            pad.count = 50;
            pad.done = true;
        }

        // Reading far off the calibrated mean: three strikes.
        let off = [700i16; NUM_PADS]; // drop of 100 vs mean 40
        assert!(!calib.check(&pads, &oa, &off, &mut errs));
        assert_eq!(errs, 1);
        assert!(!calib.check(&pads, &oa, &off, &mut errs));
        assert_eq!(errs, 2);
        assert!(calib.check(&pads, &oa, &off, &mut errs), "third strike resets");
        assert_eq!(errs, 0);
        assert!(!calib.pads[0].done);
    }

    #[test]
    fn consistent_readings_clear_the_strike_counter() {
        let mut calib = Calibration::new();
        let pads = all_present();
        let oa = open_air();
        let mut errs = 2u8;

        for pad in &mut calib.pads {
            pad.mean = 40;
            pad.count = 50;
            pad.done = true;
        }

        // Drop of 42 is within ±6 of the mean.
        let good = [758i16; NUM_PADS];
        assert!(!calib.check(&pads, &oa, &good, &mut errs));
        assert_eq!(errs, 0);
    }
}
