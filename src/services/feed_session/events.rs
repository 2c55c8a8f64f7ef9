//! Tagged inbound/outbound event shapes for the Feed Session — the
//! typed-variant replacement for the distilled source's ad hoc shapes
//! (SPEC_FULL.md §9).

use std::collections::HashMap;

use crate::domain::instrument::InstrumentKey;
use crate::domain::status::FeedStatus;
use crate::domain::tick::TickDelta;
use crate::utils::errors::FeedError;

/// Commands a client transport (via SB) delivers into a Feed Session.
#[derive(Debug, Clone)]
pub enum ClientCommand {
    ClientHello,
    SwitchUnderlying {
        underlying_key: InstrumentKey,
        expiry_date: Option<String>,
        requested_keys: Vec<InstrumentKey>,
    },
    SwitchExpiry {
        expiry_date: String,
    },
    /// Advisory only — FS is the single source of truth for subscriptions
    /// (SPEC_FULL.md §4.4.1). Logged, never acted on while live.
    AdvisorySubscribe(Vec<InstrumentKey>),
    AdvisoryUnsubscribe(Vec<InstrumentKey>),
    Ping { ts: i64 },
}

/// Events the Feed Session emits toward the Session Broadcaster.
#[derive(Debug, Clone)]
pub enum FsEvent {
    MarketUpdate(HashMap<InstrumentKey, TickDelta>),
    FeedState {
        status: FeedStatus,
        underlying: InstrumentKey,
        current_atm: i64,
        live_strikes: Vec<i64>,
        max_strike_distance: i64,
        version: u64,
    },
    FeedHealth {
        state: FeedStatus,
        active_keys: usize,
        buffer_size: usize,
        reset_locked: bool,
    },
    UpstoxFeedConnected,
    UpstoxFeedDisconnected {
        reason: String,
    },
    MarketStatusClosed {
        msg: String,
    },
    FeedUnavailable {
        msg: String,
    },
    SubscriptionAck {
        count: usize,
        underlying: InstrumentKey,
    },
    Error(FeedError),
    SessionExpired,
}
