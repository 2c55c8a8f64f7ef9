//! Explicit queued-switch state, replacing the distilled source's
//! silent-failure pattern with a typed, bounded-retry record.

use chrono::{DateTime, Utc};

use super::instrument::InstrumentKey;

pub const MAX_SWITCH_RETRIES: u32 = 3;
pub const SWITCH_STALENESS_CAP_SECS: i64 = 15;

#[derive(Debug, Clone)]
pub struct PendingSwitch {
    pub new_underlying_key: InstrumentKey,
    pub requested_keys: Vec<InstrumentKey>,
    pub expiry: String,
    pub enqueue_ts: DateTime<Utc>,
    pub retry_count: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PendingSwitchOutcome {
    Proceed,
    Stale,
    RetriesExhausted,
}

impl PendingSwitch {
    pub fn new(new_underlying_key: InstrumentKey, requested_keys: Vec<InstrumentKey>, expiry: String, now: DateTime<Utc>) -> Self {
        Self {
            new_underlying_key,
            requested_keys,
            expiry,
            enqueue_ts: now,
            retry_count: 0,
        }
    }

    /// Whether this pending switch may still be acted on `now`.
    pub fn evaluate(&self, now: DateTime<Utc>) -> PendingSwitchOutcome {
        if (now - self.enqueue_ts).num_seconds() > SWITCH_STALENESS_CAP_SECS {
            return PendingSwitchOutcome::Stale;
        }
        if self.retry_count >= MAX_SWITCH_RETRIES {
            return PendingSwitchOutcome::RetriesExhausted;
        }
        PendingSwitchOutcome::Proceed
    }

    pub fn bump_retry(&mut self) {
        self.retry_count += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn key() -> InstrumentKey {
        InstrumentKey::normalize("NSE_INDEX|Nifty 50")
    }

    #[test]
    fn fresh_switch_proceeds() {
        let now = Utc::now();
        let p = PendingSwitch::new(key(), vec![], "2025-02-27".into(), now);
        assert_eq!(p.evaluate(now), PendingSwitchOutcome::Proceed);
    }

    #[test]
    fn stale_after_cap_exceeded() {
        let enqueued = Utc::now() - Duration::seconds(SWITCH_STALENESS_CAP_SECS + 1);
        let p = PendingSwitch::new(key(), vec![], "2025-02-27".into(), enqueued);
        assert_eq!(p.evaluate(Utc::now()), PendingSwitchOutcome::Stale);
    }

    #[test]
    fn retries_exhausted_after_max() {
        let now = Utc::now();
        let mut p = PendingSwitch::new(key(), vec![], "2025-02-27".into(), now);
        for _ in 0..MAX_SWITCH_RETRIES {
            p.bump_retry();
        }
        assert_eq!(p.evaluate(now), PendingSwitchOutcome::RetriesExhausted);
    }
}
