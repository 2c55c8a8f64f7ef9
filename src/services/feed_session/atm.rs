//! Pure ATM-shift trigger: requires two qualifying underlying ticks
//! separated by at least `atm_hysteresis_ms` before firing, so that a
//! single noisy print never forces a rebuild (SPEC_FULL.md §4.4.3).

use crate::domain::window::round_to_step;

#[derive(Debug, Clone, Copy)]
pub struct AtmTracker {
    current_atm: i64,
    step: i64,
    pending: Option<(i64, i64)>, // (candidate_atm, first_observed_ms)
}

impl AtmTracker {
    pub fn new(current_atm: i64, step: i64) -> Self {
        Self {
            current_atm,
            step,
            pending: None,
        }
    }

    pub fn current_atm(&self) -> i64 {
        self.current_atm
    }

    /// Feed a fresh underlying spot print. Returns `Some(candidate_atm)`
    /// the moment the hysteresis window has been satisfied — the caller
    /// is responsible for calling `commit` once it has actually rebuilt
    /// the window around that candidate.
    pub fn observe(&mut self, spot: f64, now_ms: i64, hysteresis_ms: i64) -> Option<i64> {
        let candidate = round_to_step(spot, self.step);
        if candidate == self.current_atm {
            self.pending = None;
            return None;
        }
        match self.pending {
            Some((c, first_ms)) if c == candidate => {
                if now_ms - first_ms >= hysteresis_ms {
                    self.pending = None;
                    Some(candidate)
                } else {
                    None
                }
            }
            _ => {
                self.pending = Some((candidate, now_ms));
                None
            }
        }
    }

    pub fn commit(&mut self, new_atm: i64) {
        self.current_atm = new_atm;
        self.pending = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_tick_past_threshold_does_not_trigger_alone() {
        let mut t = AtmTracker::new(23500, 50);
        assert_eq!(t.observe(23560.0, 1_000, 250), None);
    }

    #[test]
    fn two_ticks_within_hysteresis_window_do_not_trigger() {
        let mut t = AtmTracker::new(23500, 50);
        assert_eq!(t.observe(23560.0, 1_000, 250), None);
        assert_eq!(t.observe(23560.0, 1_100, 250), None);
    }

    #[test]
    fn two_ticks_past_hysteresis_window_trigger_with_candidate() {
        let mut t = AtmTracker::new(23500, 50);
        assert_eq!(t.observe(23560.0, 1_000, 250), None);
        assert_eq!(t.observe(23560.0, 1_300, 250), Some(23550));
    }

    #[test]
    fn a_different_candidate_resets_the_pending_timer() {
        let mut t = AtmTracker::new(23500, 50);
        assert_eq!(t.observe(23560.0, 1_000, 250), None); // candidate 23550
        assert_eq!(t.observe(23610.0, 1_300, 250), None); // candidate 23600, resets
        assert_eq!(t.observe(23610.0, 1_600, 250), Some(23600));
    }

    #[test]
    fn commit_updates_current_atm_and_clears_pending() {
        let mut t = AtmTracker::new(23500, 50);
        t.observe(23560.0, 1_000, 250);
        t.commit(23550);
        assert_eq!(t.current_atm(), 23550);
        assert_eq!(t.observe(23560.0, 1_300, 250), None);
    }

    #[test]
    fn a_bounce_back_to_the_current_atm_cancels_pending() {
        let mut t = AtmTracker::new(23500, 50);
        t.observe(23560.0, 1_000, 250);
        assert_eq!(t.observe(23500.0, 1_050, 250), None);
        assert_eq!(t.observe(23560.0, 1_400, 250), None); // timer restarted, not yet due
    }
}
