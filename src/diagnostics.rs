//! Algorithm timing diagnostics.
//!
//! The water pipeline must run every 50 ms. Two monitors watch the
//! actual cadence and escalate through three levels:
//!
//! 1. flag the condition in the current day's record (cleared at the
//!    daily rollover);
//! 2. re-initialize the algorithm state;
//! 3. raise the condition into the critical error band (shifted by 13)
//!    so the 20-minute reset timer arms.

use log::error;

use crate::ErrorBits;

/// Nominal sample period.
const SAMPLE_PERIOD_MS: u64 = 50;
/// Late-run threshold: period beyond nominal + 10%.
const LATE_PERIOD_MS: u64 = SAMPLE_PERIOD_MS + SAMPLE_PERIOD_MS / 10;
/// A gap this long means at least one sample was dropped outright.
const DROPPED_PERIOD_MS: u64 = 100;
/// Late runs accumulated before the period is declared drifting.
const LATE_RUNS_THRESHOLD: u8 = 20;
/// Missed samples tolerated per evaluation window.
const MISSED_SAMPLES_THRESHOLD: u8 = 6;
/// Missed-sample evaluation window.
const MISSED_WINDOW_MS: u64 = 3_000;

/// Action the control loop must take for this tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiagAction {
    None,
    /// Set `bit` in the daily record's error field.
    FlagDaily { bit: u32 },
    /// Re-initialize the algorithm state (second strike today).
    ReinitAlgorithm { bit: u32 },
    /// Escalate to the critical band (third strike today).
    Escalate { bit: u32 },
}

/// Per-rule escalation ladder.
#[derive(Debug, Default)]
struct Ladder {
    flagged: bool,
    reinit_done: bool,
}

impl Ladder {
    fn next(&mut self, bit: u32) -> DiagAction {
        if !self.flagged {
            self.flagged = true;
            DiagAction::FlagDaily { bit }
        } else if !self.reinit_done {
            self.reinit_done = true;
            DiagAction::ReinitAlgorithm { bit }
        } else {
            DiagAction::Escalate { bit }
        }
    }

    fn reset(&mut self) {
        self.flagged = false;
        self.reinit_done = false;
    }
}

/// Watches the tick cadence of the water pipeline.
pub struct AlgoDiagnostics {
    late_runs: u8,
    missed_samples: u8,
    window_start_ms: u64,
    period: Ladder,
    missed: Ladder,
    first_tick: bool,
}

impl Default for AlgoDiagnostics {
    fn default() -> Self {
        Self::new()
    }
}

impl AlgoDiagnostics {
    pub fn new() -> Self {
        Self {
            late_runs: 0,
            missed_samples: 0,
            window_start_ms: 0,
            period: Ladder::default(),
            missed: Ladder::default(),
            first_tick: true,
        }
    }

    /// Evaluate one algorithm tick. `last_run_ms` is when the pipeline
    /// last ran, `now_ms` the current tick. Returns up to two actions
    /// (period rule, missed-sample rule).
    pub fn observe(&mut self, last_run_ms: u64, now_ms: u64) -> [DiagAction; 2] {
        let mut actions = [DiagAction::None, DiagAction::None];

        // The very first call after power-up has no meaningful gap.
        if self.first_tick {
            self.first_tick = false;
            self.window_start_ms = now_ms;
            return actions;
        }

        let gap = now_ms.saturating_sub(last_run_ms);

        // A gap longer than the whole evaluation window means the loop
        // was suspended (low-power stop, EEPROM stall), not that the
        // running loop dropped samples. Cadence statistics restart.
        if gap > MISSED_WINDOW_MS {
            self.window_start_ms = now_ms;
            self.missed_samples = 0;
            return actions;
        }

        if gap > LATE_PERIOD_MS {
            self.late_runs = self.late_runs.saturating_add(1);
            if gap > DROPPED_PERIOD_MS {
                let dropped = (gap / SAMPLE_PERIOD_MS - 1).min(u64::from(u8::MAX)) as u8;
                self.missed_samples = self.missed_samples.saturating_add(dropped);
            }
        } else if self.late_runs > 0 {
            self.late_runs -= 1;
        }

        if self.late_runs >= LATE_RUNS_THRESHOLD {
            error!("algo diagnostics: {LATE_RUNS_THRESHOLD} late runs, sample period drifting");
            actions[0] = self.period.next(ErrorBits::AVG_SAMPLE_PERIOD_DRIFT);
            self.late_runs = 0;
        }

        if now_ms.saturating_sub(self.window_start_ms) >= MISSED_WINDOW_MS {
            if self.missed_samples >= MISSED_SAMPLES_THRESHOLD {
                error!(
                    "algo diagnostics: {} missed samples in window",
                    self.missed_samples
                );
                actions[1] = self.missed.next(ErrorBits::MISSED_SAMPLE_THRESH);
            }
            self.window_start_ms = now_ms;
            self.missed_samples = 0;
        }

        actions
    }

    /// Midnight: the daily record's bits were cleared, so the ladders
    /// restart from level one.
    pub fn reset_daily(&mut self) {
        self.period.reset();
        self.missed.reset();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Drive `n` ticks with a constant period, starting at `t0`.
    fn drive(diag: &mut AlgoDiagnostics, t0: u64, period: u64, n: u64) -> Vec<DiagAction> {
        let mut out = Vec::new();
        let mut last = t0;
        for i in 1..=n {
            let now = t0 + i * period;
            for action in diag.observe(last, now) {
                if action != DiagAction::None {
                    out.push(action);
                }
            }
            last = now;
        }
        out
    }

    #[test]
    fn on_time_ticks_raise_nothing() {
        let mut diag = AlgoDiagnostics::new();
        let actions = drive(&mut diag, 0, 50, 200);
        assert!(actions.is_empty());
    }

    #[test]
    fn slightly_late_ticks_escalate_through_all_levels() {
        let mut diag = AlgoDiagnostics::new();
        // 60 ms period: consistently late but never dropping samples.
        let actions = drive(&mut diag, 0, 60, 70);
        assert_eq!(
            actions,
            vec![
                DiagAction::FlagDaily {
                    bit: ErrorBits::AVG_SAMPLE_PERIOD_DRIFT
                },
                DiagAction::ReinitAlgorithm {
                    bit: ErrorBits::AVG_SAMPLE_PERIOD_DRIFT
                },
                DiagAction::Escalate {
                    bit: ErrorBits::AVG_SAMPLE_PERIOD_DRIFT
                },
            ]
        );
    }

    #[test]
    fn occasional_lateness_decays_without_action() {
        let mut diag = AlgoDiagnostics::new();
        let mut last = 0u64;
        let mut now = 0u64;
        for i in 0..1000u64 {
            // One late tick in every four.
            now += if i % 4 == 0 { 60 } else { 50 };
            let actions = diag.observe(last, now);
            assert_eq!(actions, [DiagAction::None, DiagAction::None]);
            last = now;
        }
    }

    #[test]
    fn dropped_samples_trip_the_missed_rule() {
        let mut diag = AlgoDiagnostics::new();
        // 400 ms gaps: 7 samples dropped each, well past 6 per window.
        let actions = drive(&mut diag, 0, 400, 10);
        assert!(actions.contains(&DiagAction::FlagDaily {
            bit: ErrorBits::MISSED_SAMPLE_THRESH
        }));
    }

    #[test]
    fn daily_reset_restarts_the_ladder() {
        let mut diag = AlgoDiagnostics::new();
        let actions = drive(&mut diag, 0, 60, 25);
        assert_eq!(actions.len(), 1);
        assert!(matches!(actions[0], DiagAction::FlagDaily { .. }));

        diag.reset_daily();
        let actions = drive(&mut diag, 100_000, 60, 25);
        assert!(
            matches!(actions[0], DiagAction::FlagDaily { .. }),
            "after the daily reset the ladder starts at level one again"
        );
    }

    #[test]
    fn escalated_bit_lands_in_the_critical_band() {
        let escalated = ErrorBits::escalate_algo(ErrorBits::MISSED_SAMPLE_THRESH);
        assert_eq!(escalated, 1 << 26);
        let mut word = ErrorBits::new();
        word.set(escalated);
        assert_ne!(word.critical(), 0);
    }
}
