//! The windowed water-volume computation.
//!
//! Runs once per completed window over exactly 70 samples: the
//! 20-sample non-overlap region plus the 50-sample look-ahead, each
//! compared against the sample 40 positions back. Two states:
//!
//! - `WaitForWater`: watch the bottom pads for the sharp negative
//!   differential of water arriving; opportunistically re-learn the
//!   open-air baselines right before declaring water on.
//! - `Measuring`: classify every pad, maintain calibration, select the
//!   water height, integrate it, and watch for the end of the session.
//!
//! On session end the integral turns into liters through an empirical
//! scaler keyed by how static the water column was.

use heapless::Vec;

use super::calib::Calibration;
use super::presence::{detect_water_change, promote_pad_states, PadState, Presence};
use super::window::PadWindows;
use super::{DeltaBank, DRAIN_THRESHOLDS, NUM_PADS, OPEN_AIR_FALLBACK, PAD_HEIGHTS};

/// Samples processed per window.
const SAMPLES_PER_WINDOW: i16 = 70;
/// Index of the first processed sample within the 120-sample window.
const PROCESS_BASE: i16 = 51;
/// Look-back distance for the water-present differentials.
const PRESENT_OFFSET: i16 = 40;

/// Water-on: the three-pad differential sum crossing this.
const WATER_ON_SUM: i16 = -13;
/// Water-on: any single bottom-pad differential crossing this.
const WATER_ON_SINGLE: i16 = -7;
/// Open-air relearn happens only after this many dry samples.
const OA_RELEARN_MIN_SAMPLES: u16 = 300;

/// Session end: consecutive samples with zero height and quiet bottom
/// pads.
const NOT_PRESENT_LIMIT: u16 = 60;
/// Session end: constant-height timeout (heights up to pad 2).
const CONSTANT_HEIGHT_LIMIT: u16 = 600;
/// Session end: auxiliary timeout for stuck upper readings.
const CONSTANT_HEIGHT_LIMIT_HIGH: u16 = 2400;
/// Standing-water flag: constant height at or below pad 7.
const STANDING_WATER_HEIGHT: i16 = 66;
/// Water-stopped latch set / cleared / confirmed thresholds.
const WATER_STOPPED_SET: i16 = 15;
const PAD8_STOP_DIFF: i16 = 6;
const WATER_STOPPED_CONFIRM: i16 = 4;

/// Pipeline state: waiting for water, or integrating a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AlgoState {
    #[default]
    WaitForWater,
    Measuring,
}

/// Per-window observations worth surfacing (deduplicated, bounded).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReasonCode {
    WaterCalibCalibrated,
    WaterCalibReset,
    WaterCalibNegDelta,
    WaterBadSample,
    StandingWater,
    CloggedPump,
    VolumeCapped,
}

pub type ReasonList = Vec<ReasonCode, 8>;

fn add_reason(list: &mut ReasonList, code: ReasonCode) {
    if !list.contains(&code) {
        let _ = list.push(code);
    }
}

/// Everything the algorithm carries between windows.
pub struct WaterAlgoState {
    pub algo_state: AlgoState,
    /// Water seen during the current/most recent window.
    pub present: bool,
    pub water_stopped: bool,
    pub pad8_stop_flag: bool,
    /// 1-based window index where water turned on (0 = none).
    pub present_start_idx: u16,
    pub present_stop_idx: u16,
    pub pads: [PadState; NUM_PADS],
    pub open_air: [i16; NUM_PADS],
    /// Integral of per-sample water height over the session.
    pub water_int_value: i32,
    /// Cumulative session volumes awaiting the hourly harvest.
    pub water_volume_sum: i32,
    pub no_change_counter: i32,
    pub accum_processed_samples: i32,
    pub accum_water_samples: i32,
    pub session_samples: i32,
    pub constant_height_counter: u16,
    pub prev_water_height: i32,
    pub cal_error_count: u8,
    pub not_present_counter: u16,
    /// Dry samples since the open-air baseline was last learned.
    pub open_air_counter: u16,
    pub delta: DeltaBank,
}

impl Default for WaterAlgoState {
    fn default() -> Self {
        Self::new()
    }
}

impl WaterAlgoState {
    pub fn new() -> Self {
        Self {
            algo_state: AlgoState::WaitForWater,
            present: false,
            water_stopped: false,
            pad8_stop_flag: false,
            present_start_idx: 0,
            present_stop_idx: 0,
            pads: [PadState::default(); NUM_PADS],
            open_air: [OPEN_AIR_FALLBACK; NUM_PADS],
            water_int_value: 0,
            water_volume_sum: 0,
            no_change_counter: 0,
            accum_processed_samples: 0,
            accum_water_samples: 0,
            session_samples: 0,
            constant_height_counter: 0,
            prev_water_height: 0,
            cal_error_count: 0,
            not_present_counter: 0,
            open_air_counter: 0,
            delta: DeltaBank::new(),
        }
    }
}

/// Session volume in liters from the height integral.
///
/// `scaler = (11811160064 − 3506 · pct · 2¹⁵) >> 15` where `pct` is
/// the percentage of water samples whose height did not change. The
/// constants are empirical; they are preserved bit-exact.
pub fn session_volume(water_int: i32, no_change: i32, session_samples: i32) -> i16 {
    if session_samples == 0 {
        return 0;
    }
    let pct: i64 = if no_change < 21_474_836 {
        i64::from(no_change) * 100 / i64::from(session_samples)
    } else {
        100
    };
    let scaler = (11_811_160_064_i64 - 3_506_i64 * (pct << 15)) >> 15;
    ((i64::from(water_int) * scaler + 536_870_912) >> 30) as i16
}

/// Process the active window. Mutates `state` and `calib`; returns the
/// window's reason codes.
pub fn process_window(
    state: &mut WaterAlgoState,
    calib: &mut Calibration,
    windows: &PadWindows,
) -> ReasonList {
    let mut reasons = ReasonList::new();
    let mut check_cal_counter: u8 = 0;
    let mut start_idx: i16 = 0;
    let mut stop_idx: i16 = -PROCESS_BASE;

    for idx in 0..SAMPLES_PER_WINDOW {
        let current = windows.read_sample((idx + PROCESS_BASE) as u16);
        let past = windows.read_sample((idx + PROCESS_BASE - PRESENT_OFFSET) as u16);
        let (Some(cur), Some(past)) = (current, past) else {
            add_reason(&mut reasons, ReasonCode::WaterBadSample);
            continue;
        };

        if state.accum_processed_samples < i32::MAX {
            state.accum_processed_samples += 1;
        }

        let deltas = state.delta.push(cur);

        let d5 = cur[4] - past[4];
        let d6 = cur[5] - past[5];
        let d7 = cur[6] - past[6];
        let d8 = cur[7] - past[7];
        let diff_sum = d6 + d7 + d8;

        match state.algo_state {
            AlgoState::WaitForWater => {
                if state.open_air_counter < u16::MAX {
                    state.open_air_counter += 1;
                }

                let water_on = diff_sum <= WATER_ON_SUM
                    || d8 <= WATER_ON_SINGLE
                    || d7 <= WATER_ON_SINGLE
                    || d6 <= WATER_ON_SINGLE
                    || d5 <= WATER_ON_SINGLE;
                if water_on {
                    state.present = true;
                    state.algo_state = AlgoState::Measuring;

                    // Only one starting index per window, even if the
                    // session restarts within it.
                    if start_idx == 0 {
                        start_idx = idx + PROCESS_BASE;
                        stop_idx = SAMPLES_PER_WINDOW - 1;
                    }

                    // The samples 40 back are still dry: a fresh
                    // open-air baseline, but only if the pads have been
                    // dry long enough to trust it.
                    if state.open_air_counter >= OA_RELEARN_MIN_SAMPLES {
                        match windows.read_sample((idx + PROCESS_BASE - PRESENT_OFFSET) as u16) {
                            Some(oa) => state.open_air = oa,
                            None => {
                                state.open_air = [OPEN_AIR_FALLBACK; NUM_PADS];
                                calib.reset_all();
                                state.cal_error_count = 0;
                                add_reason(&mut reasons, ReasonCode::WaterCalibReset);
                            }
                        }
                    }
                }
            }

            AlgoState::Measuring => {
                // Entering the window already measuring means the water
                // was on across the window boundary.
                if start_idx == 0 {
                    start_idx = 1;
                    stop_idx = SAMPLES_PER_WINDOW - 1;
                }

                for k in 0..NUM_PADS {
                    detect_water_change(deltas[k], &mut state.pads[k], DRAIN_THRESHOLDS[k]);
                }
                promote_pad_states(&mut state.pads);

                if check_cal_counter == 20 {
                    if calib.check(&state.pads, &state.open_air, &cur, &mut state.cal_error_count) {
                        add_reason(&mut reasons, ReasonCode::WaterCalibReset);
                    }
                    check_cal_counter = 0;
                } else if check_cal_counter < u8::MAX {
                    check_cal_counter += 1;
                }

                let flags = calib.update(&state.pads, &mut state.open_air, cur, &mut state.cal_error_count);
                if flags.calibrated {
                    add_reason(&mut reasons, ReasonCode::WaterCalibCalibrated);
                }
                if flags.neg_delta {
                    add_reason(&mut reasons, ReasonCode::WaterCalibNegDelta);
                }
                if flags.reset {
                    add_reason(&mut reasons, ReasonCode::WaterCalibReset);
                }

                // Water height: walk the column top-down; calibration
                // wins over the differential view; the differential
                // view promotes the pads below its pair.
                let mut height: i16 = 0;
                for k in 0..NUM_PADS {
                    let calib_height = if calib.pads[k].done
                        && state.open_air[k] - cur[k] > calib.pads[k].mean - 5
                    {
                        PAD_HEIGHTS[k]
                    } else {
                        0
                    };

                    let diff_height = if k < NUM_PADS - 1 {
                        if state.pads[k].presence != Presence::NotPresent
                            && state.pads[k + 1].presence != Presence::NotPresent
                        {
                            PAD_HEIGHTS[k]
                        } else {
                            0
                        }
                    } else if state.pads[k].presence != Presence::NotPresent {
                        PAD_HEIGHTS[k]
                    } else {
                        0
                    };

                    if calib_height != 0 {
                        height = calib_height;
                    } else if diff_height != 0 {
                        height = diff_height;
                    }

                    if diff_height != 0 && k < NUM_PADS - 1 {
                        let master = state.pads[k];
                        for j in k + 1..NUM_PADS {
                            if state.pads[j].presence < master.presence {
                                state.pads[j] = master;
                            }
                        }
                    }

                    if calib_height != 0 || diff_height != 0 {
                        break;
                    }
                }

                // Quiet bottom pads with no height: water has left.
                if height == 0 && deltas[6] < 3 && deltas[7] < 3 {
                    if state.not_present_counter < u16::MAX {
                        state.not_present_counter += 1;
                    }
                } else {
                    state.not_present_counter = 0;
                }

                if height > 0 {
                    if state.session_samples < i32::MAX {
                        state.session_samples += 1;
                    }
                    if state.accum_water_samples < i32::MAX {
                        state.accum_water_samples += 1;
                    }
                    if state.prev_water_height == i32::from(height)
                        && state.no_change_counter < i32::MAX
                    {
                        state.no_change_counter += 1;
                    }
                }

                // The "back" of the water-off point: a strong positive
                // differential latches water-stopped, pad 8 confirms,
                // and the sum settling ends the session.
                let mut water_not_present = false;
                if diff_sum >= WATER_STOPPED_SET {
                    state.water_stopped = true;
                }
                if diff_sum < 0 && state.water_stopped {
                    state.pad8_stop_flag = false;
                    state.water_stopped = false;
                }
                if state.water_stopped && d8 >= PAD8_STOP_DIFF {
                    state.pad8_stop_flag = true;
                }
                if diff_sum < WATER_STOPPED_CONFIRM && state.water_stopped && state.pad8_stop_flag {
                    water_not_present = true;
                }

                if state.prev_water_height == i32::from(height) && height <= 229 && height != 0 {
                    if state.constant_height_counter < u16::MAX {
                        state.constant_height_counter += 1;
                    }
                    if state.constant_height_counter >= CONSTANT_HEIGHT_LIMIT
                        && height <= STANDING_WATER_HEIGHT
                    {
                        add_reason(&mut reasons, ReasonCode::StandingWater);
                    }
                } else {
                    state.constant_height_counter = 0;
                }

                if state.water_int_value <= i32::MAX - i32::from(height) {
                    state.water_int_value += i32::from(height);
                } else {
                    state.water_int_value = i32::MAX;
                }
                state.prev_water_height = i32::from(height);

                let session_over = state.not_present_counter > NOT_PRESENT_LIMIT
                    || (state.constant_height_counter >= CONSTANT_HEIGHT_LIMIT && height <= 229)
                    || (state.constant_height_counter >= CONSTANT_HEIGHT_LIMIT_HIGH && height > 229)
                    || water_not_present;

                if session_over {
                    stop_idx = idx;

                    if state.constant_height_counter >= CONSTANT_HEIGHT_LIMIT_HIGH && height > 229 {
                        add_reason(&mut reasons, ReasonCode::CloggedPump);
                    }

                    let volume = session_volume(
                        state.water_int_value,
                        state.no_change_counter,
                        state.session_samples,
                    );
                    if state.water_volume_sum <= i32::MAX - i32::from(volume) {
                        state.water_volume_sum += i32::from(volume);
                    } else {
                        state.water_volume_sum = i32::MAX;
                        add_reason(&mut reasons, ReasonCode::VolumeCapped);
                    }

                    state.algo_state = AlgoState::WaitForWater;
                    state.present = false;
                    state.water_stopped = false;
                    state.pad8_stop_flag = false;
                    state.not_present_counter = 0;
                    state.constant_height_counter = 0;
                    state.prev_water_height = 0;
                    state.cal_error_count = 0;
                    state.open_air_counter = 0;
                    for pad in &mut state.pads {
                        pad.reset();
                    }
                    state.water_int_value = 0;
                    state.session_samples = 0;
                    state.no_change_counter = 0;
                    // The accumulated volume is left alone; the hourly
                    // rollup harvests it.
                }
            }
        }
    }

    state.present_start_idx = start_idx as u16;
    state.present_stop_idx = (stop_idx + PROCESS_BASE) as u16;
    reasons
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::algo::WaterAlgo;

    #[test]
    fn session_volume_anchor_values() {
        // pct = 57 → scaler = (11811160064 − 3506·57·2¹⁵) >> 15 = 160606.
        assert_eq!(session_volume(100_000, 57, 100), 15);
        // pct = 0 → scaler = 360448.
        assert_eq!(session_volume(100_000, 0, 100), 34);
        // pct = 100 → scaler = 9848.
        assert_eq!(session_volume(100_000, 100, 100), 1);
        assert_eq!(session_volume(1_000_000, 100, 100), 9);
        // No session samples, no volume.
        assert_eq!(session_volume(100_000, 0, 0), 0);
    }

    #[test]
    fn session_volume_is_monotone_in_the_integral() {
        let mut prev = 0;
        for int in [0, 1_000, 50_000, 500_000, 5_000_000] {
            let v = session_volume(int, 10, 100);
            assert!(v >= prev);
            prev = v;
        }
    }

    fn feed_flat(algo: &mut WaterAlgo, pads: [u16; NUM_PADS], n: usize) -> Vec<ReasonList, 16> {
        let mut out = Vec::new();
        for _ in 0..n {
            if let Some(r) = algo.tick(pads) {
                let _ = out.push(r);
            }
        }
        out
    }

    #[test]
    fn dry_stream_stays_waiting() {
        let mut algo = WaterAlgo::new();
        feed_flat(&mut algo, [800; NUM_PADS], 400);
        assert_eq!(algo.state.algo_state, AlgoState::WaitForWater);
        assert!(!algo.water_present());
        assert_eq!(algo.state.water_int_value, 0);
    }

    #[test]
    fn bottom_pad_drop_turns_water_on() {
        let mut algo = WaterAlgo::new();
        // 150 dry samples, then pads 6-8 drop hard.
        feed_flat(&mut algo, [800; NUM_PADS], 150);
        let mut wet = [800u16; NUM_PADS];
        wet[5] = 760;
        wet[6] = 760;
        wet[7] = 760;
        feed_flat(&mut algo, wet, 40);
        assert_eq!(algo.state.algo_state, AlgoState::Measuring);
        assert!(algo.water_present());
        assert_ne!(algo.state.present_start_idx, 0);
    }

    #[test]
    fn water_integral_grows_while_column_is_wet() {
        let mut algo = WaterAlgo::new();
        feed_flat(&mut algo, [800; NUM_PADS], 150);
        let mut wet = [800u16; NUM_PADS];
        for pad in 4..NUM_PADS {
            wet[pad] = 740;
        }
        feed_flat(&mut algo, wet, 110);
        assert_eq!(algo.state.algo_state, AlgoState::Measuring);
        assert!(algo.state.water_int_value > 0, "height integral accumulates");
        assert!(algo.state.session_samples > 0);
    }

    #[test]
    fn quiet_bottom_pads_end_the_session() {
        let mut algo = WaterAlgo::new();
        feed_flat(&mut algo, [800; NUM_PADS], 150);
        let mut wet = [800u16; NUM_PADS];
        wet[6] = 750;
        wet[7] = 750;
        // Water on briefly…
        feed_flat(&mut algo, wet, 50);
        assert_eq!(algo.state.algo_state, AlgoState::Measuring);
        // …then the signal flattens at the wet level: the pads drain
        // out and the not-present counter runs down the session.
        feed_flat(&mut algo, wet, 700);
        assert_eq!(algo.state.algo_state, AlgoState::WaitForWater);
        assert!(!algo.water_present());
        assert_eq!(algo.state.water_int_value, 0, "session integral reset");
        assert_eq!(algo.state.session_samples, 0);
        for pad in &algo.state.pads {
            assert_eq!(pad.presence, Presence::NotPresent);
        }
    }

    #[test]
    fn processed_sample_counter_tracks_windows() {
        let mut algo = WaterAlgo::new();
        feed_flat(&mut algo, [800; NUM_PADS], 120);
        assert_eq!(algo.state.accum_processed_samples, 70);
        feed_flat(&mut algo, [800; NUM_PADS], 70);
        assert_eq!(algo.state.accum_processed_samples, 140);
    }
}
