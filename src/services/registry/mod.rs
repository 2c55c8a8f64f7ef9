//! Process-level registry mapping a logged-in user to their running
//! Feed Session + Session Broadcaster. Grounded on `services/scheduler.rs`'s
//! `DashMap<Uuid, AbortHandle>` static task map, generalized to a
//! per-user entry pair lazily created on first connect (SPEC_FULL.md §3.1,
//! §5 — "one Feed Session per logged-in user, independent of transport
//! count").

use std::sync::Arc;

use dashmap::DashMap;
use once_cell::sync::Lazy;

use crate::config::settings::FeedConfig;
use crate::services::broadcaster::{self, BroadcasterHandle};
use crate::services::catalog::InstrumentCatalog;
use crate::services::credential_store::CredentialStore;
use crate::services::feed_session::{self, FeedSessionHandle};

/// A user's live Feed Session plus the broadcaster fanning its events
/// out to attached transports.
#[derive(Clone)]
pub struct UserSession {
    pub feed_session: FeedSessionHandle,
    pub broadcaster: BroadcasterHandle,
}

type SessionMap = DashMap<i64, UserSession>;
static SESSIONS: Lazy<SessionMap> = Lazy::new(SessionMap::default);

/// Fetch the user's existing session, or spawn a fresh Feed Session +
/// Broadcaster pair and register it.
pub fn get_or_create(
    user_id: i64,
    config: FeedConfig,
    catalog: Arc<dyn InstrumentCatalog>,
    credential_store: Arc<dyn CredentialStore>,
    broker_ws_url: String,
    broker_bearer_token: String,
) -> UserSession {
    if let Some(existing) = SESSIONS.get(&user_id) {
        return existing.clone();
    }

    let (feed_session, fs_events) = feed_session::spawn(
        user_id,
        config.clone(),
        catalog,
        credential_store,
        broker_ws_url,
        broker_bearer_token,
    );
    let broadcaster = broadcaster::spawn(user_id, fs_events, feed_session.clone(), config);
    let session = UserSession { feed_session, broadcaster };
    SESSIONS.insert(user_id, session.clone());
    session
}

/// Look up a user's session without creating one.
pub fn lookup(user_id: i64) -> Option<UserSession> {
    SESSIONS.get(&user_id).map(|e| e.clone())
}

/// Drop a user's session from the registry (idle expiry, logout).
pub fn remove(user_id: i64) {
    SESSIONS.remove(&user_id);
}

pub fn active_session_count() -> usize {
    SESSIONS.len()
}
