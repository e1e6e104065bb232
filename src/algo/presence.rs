//! Per-pad water presence detection and cross-pad state promotion.

use super::NUM_PADS;

/// Presence classification for one pad. Ordering matters: promotion
/// only ever raises a pad toward `Present`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
#[repr(u8)]
pub enum Presence {
    #[default]
    NotPresent = 0,
    Draining = 1,
    Present = 2,
}

/// One pad's presence state plus its draining countdown.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PadState {
    pub presence: Presence,
    pub draining_count: u8,
}

impl PadState {
    pub fn reset(&mut self) {
        self.presence = Presence::NotPresent;
        self.draining_count = 0;
    }
}

/// Classify one pad from its smoothed delta.
///
/// A sharp negative delta is the front of water arriving (water over a
/// pad pulls the count down hard). Once wet, the pad sits in `Draining`
/// until either the per-pad timeout elapses or a positive delta shows
/// the water has left.
pub fn detect_water_change(delta: i16, state: &mut PadState, drain_timeout: u8) {
    if delta <= -5 {
        state.presence = Presence::Present;
        state.draining_count = 0;
        return;
    }

    if state.presence == Presence::Present || state.presence == Presence::Draining {
        state.presence = Presence::Draining;
        if state.draining_count < u8::MAX {
            state.draining_count += 1;
        }
        // A pad can also be knocked out of draining by promotion when
        // an upper pad still clearly sees water.
        if state.draining_count > drain_timeout || delta >= 4 {
            state.presence = Presence::NotPresent;
            state.draining_count = 0;
        }
    }
}

/// One pass of adjacent-pad promotion.
///
/// For the first pad k (top-down) that is `Present` while its lower
/// neighbor is not `NotPresent`, every pad below k with a strictly
/// lower presence value is raised to k's state. This keeps the lower,
/// more sensitive pads from reporting "draining" while an upper pad
/// still clearly sees water. Draining countdowns of the touched pads
/// restart.
pub fn promote_pad_states(pads: &mut [PadState; NUM_PADS]) {
    for k in 0..NUM_PADS - 1 {
        if pads[k].presence == Presence::Present && pads[k + 1].presence != Presence::NotPresent {
            let master = pads[k].presence;
            for j in k + 1..NUM_PADS {
                if pads[j].presence < master {
                    pads[j].presence = master;
                    pads[j].draining_count = 0;
                } else if pads[j].presence == master {
                    pads[j].draining_count = 0;
                }
            }
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pad(p: Presence, count: u8) -> PadState {
        PadState {
            presence: p,
            draining_count: count,
        }
    }

    #[test]
    fn sharp_negative_delta_marks_present() {
        let mut s = PadState::default();
        detect_water_change(-5, &mut s, 20);
        assert_eq!(s.presence, Presence::Present);
        assert_eq!(s.draining_count, 0);
    }

    #[test]
    fn small_delta_moves_present_to_draining() {
        let mut s = pad(Presence::Present, 0);
        detect_water_change(0, &mut s, 20);
        assert_eq!(s.presence, Presence::Draining);
        assert_eq!(s.draining_count, 1);
    }

    #[test]
    fn draining_times_out_to_not_present() {
        let mut s = pad(Presence::Present, 0);
        for _ in 0..20 {
            detect_water_change(0, &mut s, 20);
            assert_ne!(s.presence, Presence::NotPresent);
        }
        detect_water_change(0, &mut s, 20);
        assert_eq!(s.presence, Presence::NotPresent);
        assert_eq!(s.draining_count, 0);
    }

    #[test]
    fn positive_delta_cuts_draining_short() {
        let mut s = pad(Presence::Present, 0);
        detect_water_change(4, &mut s, 90);
        assert_eq!(s.presence, Presence::NotPresent);
    }

    #[test]
    fn not_present_pad_ignores_small_deltas() {
        let mut s = PadState::default();
        detect_water_change(3, &mut s, 20);
        detect_water_change(-4, &mut s, 20);
        assert_eq!(s.presence, Presence::NotPresent);
        assert_eq!(s.draining_count, 0);
    }

    #[test]
    fn promotion_raises_everything_below_the_master() {
        let mut pads = [PadState::default(); NUM_PADS];
        pads[2] = pad(Presence::Present, 0);
        pads[3] = pad(Presence::Draining, 17);
        pads[5] = pad(Presence::Draining, 4);

        promote_pad_states(&mut pads);

        // Pads above the master are untouched.
        assert_eq!(pads[0].presence, Presence::NotPresent);
        assert_eq!(pads[1].presence, Presence::NotPresent);
        // Everything below pad 3 (index 2) is raised to Present with a
        // fresh countdown.
        for p in &pads[3..] {
            assert_eq!(p.presence, Presence::Present);
            assert_eq!(p.draining_count, 0);
        }
    }

    #[test]
    fn promotion_needs_a_wet_lower_neighbor() {
        let mut pads = [PadState::default(); NUM_PADS];
        pads[2] = pad(Presence::Present, 0);
        // Pad below it is NotPresent — no promotion from index 2.
        promote_pad_states(&mut pads);
        assert_eq!(pads[3].presence, Presence::NotPresent);
        assert_eq!(pads[7].presence, Presence::NotPresent);
    }

    #[test]
    fn only_the_first_matching_pair_promotes() {
        let mut pads = [PadState::default(); NUM_PADS];
        pads[1] = pad(Presence::Present, 0);
        pads[2] = pad(Presence::Draining, 9);
        pads[5] = pad(Presence::Present, 0);
        pads[6] = pad(Presence::Draining, 3);

        promote_pad_states(&mut pads);

        // The pair at index 1 wins; pad 6's own countdown was reset by
        // the same pass, not by a second promotion.
        for p in &pads[2..] {
            assert_eq!(p.presence, Presence::Present);
            assert_eq!(p.draining_count, 0);
        }
    }

    #[test]
    fn promotion_output_stays_in_domain() {
        // Presence values never leave {NotPresent, Draining, Present}
        // and promotion is monotone: no pad is ever demoted.
        let mut pads = [
            pad(Presence::Present, 1),
            pad(Presence::Draining, 2),
            pad(Presence::NotPresent, 0),
            pad(Presence::Draining, 7),
            pad(Presence::Present, 0),
            pad(Presence::NotPresent, 0),
            pad(Presence::Draining, 90),
            pad(Presence::Present, 3),
        ];
        let before = pads;
        promote_pad_states(&mut pads);
        for (b, a) in before.iter().zip(pads.iter()) {
            assert!(a.presence >= b.presence);
        }
    }
}
