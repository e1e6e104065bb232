//! Per-pad smoothed delta filter.
//!
//! Each pad keeps a 5-sample ring plus one accumulator slot holding the
//! previous emitted delta. Once 5 samples are buffered, the filter
//! emits `sign * (max5 − min5) + prev_delta`, halved with arithmetic
//! shifting, where the sign follows the polarity of
//! `newest − oldest`. Outputs are zero until the buffer fills.

use super::NUM_PADS;

const RING_LEN: usize = 5;
/// Slot holding the previous delta, after the 5 raw samples.
const PREV_SLOT: usize = RING_LEN;

/// Delta filters for all eight pads.
pub struct DeltaBank {
    /// Per pad: 5 raw samples plus the previous delta.
    bufs: [[i16; RING_LEN + 1]; NUM_PADS],
    fill: usize,
}

impl Default for DeltaBank {
    fn default() -> Self {
        Self::new()
    }
}

impl DeltaBank {
    pub fn new() -> Self {
        Self {
            bufs: [[0; RING_LEN + 1]; NUM_PADS],
            fill: 0,
        }
    }

    /// Push one 8-pad sample; returns the per-pad deltas. The first
    /// four samples only fill the ring and emit zero; the fifth sample
    /// completes the window and emits the first real delta.
    pub fn push(&mut self, sample: [i16; NUM_PADS]) -> [i16; NUM_PADS] {
        if self.fill < RING_LEN - 1 {
            for (buf, &s) in self.bufs.iter_mut().zip(sample.iter()) {
                buf[self.fill] = s;
            }
            self.fill += 1;
            return [0; NUM_PADS];
        }

        let mut out = [0i16; NUM_PADS];
        for (pad, (buf, &s)) in self.bufs.iter_mut().zip(sample.iter()).enumerate() {
            buf[RING_LEN - 1] = s;

            let mut min = buf[0];
            let mut max = buf[0];
            for &v in &buf[..RING_LEN] {
                if v > max {
                    max = v;
                } else if v < min {
                    min = v;
                }
            }

            // Sign by the polarity of newest − oldest, then average
            // with the previous delta by halving away from zero.
            let swing = if s - buf[0] < 1 { min - max } else { max - min };
            let mut delta = swing + buf[PREV_SLOT];
            delta = if delta < 0 {
                -(((1 - delta) as u16 >> 1) as i16)
            } else {
                ((delta + 1) as u16 >> 1) as i16
            };

            buf[PREV_SLOT] = delta;
            // Shift the raw ring; the newest sample stays in the last
            // raw slot until the next push overwrites it.
            for i in 1..RING_LEN {
                buf[i - 1] = buf[i];
            }
            out[pad] = delta;
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn push_flat(bank: &mut DeltaBank, v: i16, times: usize) -> [i16; NUM_PADS] {
        let mut last = [0; NUM_PADS];
        for _ in 0..times {
            last = bank.push([v; NUM_PADS]);
        }
        last
    }

    #[test]
    fn first_four_samples_emit_zero() {
        let mut bank = DeltaBank::new();
        for i in 0..4 {
            let out = bank.push([100 + i; NUM_PADS]);
            assert_eq!(out, [0; NUM_PADS], "sample {i}");
        }
    }

    #[test]
    fn flat_signal_emits_zero_delta() {
        let mut bank = DeltaBank::new();
        let out = push_flat(&mut bank, 800, 20);
        assert_eq!(out, [0; NUM_PADS]);
    }

    #[test]
    fn falling_edge_emits_negative_delta() {
        let mut bank = DeltaBank::new();
        push_flat(&mut bank, 800, 5);
        let out = bank.push([760; NUM_PADS]);
        // swing = min − max = −40; prev = 0; halved away from zero.
        assert_eq!(out[0], -20);
    }

    #[test]
    fn rising_edge_emits_positive_delta() {
        let mut bank = DeltaBank::new();
        push_flat(&mut bank, 800, 5);
        let out = bank.push([840; NUM_PADS]);
        assert_eq!(out[0], 20);
    }

    #[test]
    fn fifth_sample_delta_is_bounded_by_swing_plus_prev() {
        // |delta| ≤ ((max5 − min5) + |prev|) halved (rounded up).
        let mut bank = DeltaBank::new();
        let samples = [810i16, 795, 820, 790, 805];
        let mut out = [0; NUM_PADS];
        for s in samples {
            out = bank.push([s; NUM_PADS]);
        }
        // min 790, max 820, falling polarity: −((30 + 1) >> 1).
        assert_eq!(out[0], -15);
        let swing = 820 - 790;
        assert!(out[0].unsigned_abs() <= ((swing + 1) / 2) as u16);
    }

    #[test]
    fn delta_grows_while_step_is_in_window_then_settles() {
        let mut bank = DeltaBank::new();
        push_flat(&mut bank, 800, 5);
        let d1 = bank.push([700; NUM_PADS])[0];
        assert_eq!(d1, -50);

        // The step stays inside the 5-sample window for a few pushes,
        // compounding with the smoothed previous delta.
        assert_eq!(push_flat(&mut bank, 700, 1)[0], -75);

        // Once the window is all 700s the swing is zero and the
        // smoothed delta halves down until the ±1 rounding floor.
        let mut last = 0;
        for _ in 0..20 {
            last = push_flat(&mut bank, 700, 1)[0];
        }
        assert_eq!(last, -1, "negative halving floors at -1");
    }
}
