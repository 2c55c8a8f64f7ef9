//! In-session mutable state owned exclusively by the ingest task
//! (SPEC_FULL.md §5 — "Shared-resource policy").

use std::collections::{HashMap, HashSet};
use std::time::Instant;

use crate::domain::instrument::InstrumentKey;
use crate::domain::tick::Tick;
use crate::domain::window::LiveWindow;

/// Consecutive misses from the live set before an instrument is purged,
/// giving ATM bounces a one-shift grace period (SPEC_FULL.md §3).
pub const HYSTERESIS_MISSES_BEFORE_PURGE: u32 = 2;

#[derive(Debug, Clone, Default)]
pub struct InstrumentState {
    pub tick: Tick,
    pub last_derive_ts_ms: i64,
    pub misses: u32,
}

/// Single-writer (ingest) / single-reader (flush) buffer of the
/// most-recent unflushed delta per instrument.
#[derive(Debug, Default)]
pub struct UpdateBuffer {
    deltas: HashMap<InstrumentKey, Tick>,
}

impl UpdateBuffer {
    pub fn record(&mut self, key: InstrumentKey, tick: Tick) {
        self.deltas.insert(key, tick);
    }

    pub fn is_empty(&self) -> bool {
        self.deltas.is_empty()
    }

    pub fn contains_key(&self, key: &InstrumentKey) -> bool {
        self.deltas.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.deltas.len()
    }

    /// Atomically swap out the buffer for a fresh empty one.
    pub fn take(&mut self) -> HashMap<InstrumentKey, Tick> {
        std::mem::take(&mut self.deltas)
    }
}

/// A window rebuild in flight: the new window is already decided and
/// subscribe/unsubscribe already issued to BFC, but FS is waiting for
/// either the first tick on an added key or the deadline to elapse
/// before it announces `FEED_STATE{Live, ..}` (SPEC_FULL.md §4.4.3, §5).
pub struct PendingRebuild {
    pub new_window: LiveWindow,
    pub awaiting: HashSet<InstrumentKey>,
    pub deadline: Instant,
    /// A further ATM trigger arrived while this rebuild was settling;
    /// coalesce into one more rebuild at the latest observed ATM once
    /// this one finalizes (SPEC_FULL.md §4.4.3 step 6).
    pub superseded_by: Option<i64>,
}
