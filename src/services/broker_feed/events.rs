//! Tagged event stream the Broker Feed Client hands to its caller —
//! replaces the distilled source's mixed-shape callbacks (SPEC_FULL.md §9).

use crate::domain::instrument::{InstrumentKey};
use crate::domain::tick::Tick;

#[derive(Debug, Clone)]
pub enum BfcEvent {
    Connected,
    Disconnected(String),
    AuthInvalid,
    EntitlementDenied(String),
    Tick(InstrumentKey, Tick),
    UpstreamError { kind: String, msg: String },
}

/// Subscription mode requested for a set of keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedMode {
    Full,
    Ltpc,
}

impl FeedMode {
    pub fn as_wire(self) -> &'static str {
        match self {
            FeedMode::Full => "full",
            FeedMode::Ltpc => "ltpc",
        }
    }
}

/// Commands the session issues to the upstream connection. Queued
/// internally if the socket isn't connected yet (SPEC_FULL.md §4.1).
#[derive(Debug, Clone)]
pub enum BfcCommand {
    Subscribe(Vec<InstrumentKey>, FeedMode),
    Unsubscribe(Vec<InstrumentKey>),
    ChangeMode(Vec<InstrumentKey>, FeedMode),
    Close,
}
