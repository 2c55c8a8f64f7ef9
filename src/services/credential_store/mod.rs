//! Per-user broker bearer-token validity cache.
//!
//! A thin Redis-backed collaborator: the only piece of cross-session
//! mutable state besides the `Registry` (see SPEC_FULL.md §3.1). FS
//! calls `mark_token_expired` on `AuthInvalid` (§4.4.7); the process-level
//! auth layer consults `is_valid` before letting a client reattach.

use async_trait::async_trait;

use crate::db::redis::RedisPool;

#[async_trait]
pub trait CredentialStore: Send + Sync {
    async fn is_valid(&self, user_id: i64) -> bool;
    async fn mark_token_expired(&self, user_id: i64);
}

const TOKEN_EXPIRED_TTL_SECS: usize = 24 * 60 * 60;

/// Redis-backed implementation: absence of the "expired" key means the
/// broker token is assumed valid (fail open on cache miss, since the
/// broker itself is the source of truth and will reject a stale token).
#[derive(Clone)]
pub struct RedisCredentialStore {
    redis: RedisPool,
}

impl RedisCredentialStore {
    pub fn new(redis: RedisPool) -> Self {
        Self { redis }
    }

    fn key(&self, user_id: i64) -> String {
        self.redis.with_prefix("broker_token_expired", user_id.to_string())
    }
}

#[async_trait]
impl CredentialStore for RedisCredentialStore {
    async fn is_valid(&self, user_id: i64) -> bool {
        match self.redis.get_json::<_, bool>(self.key(user_id)).await {
            Ok(Some(true)) => false,
            Ok(_) => true,
            Err(e) => {
                log::warn!("credential store lookup failed for user {user_id}: {e}");
                true
            }
        }
    }

    async fn mark_token_expired(&self, user_id: i64) {
        if let Err(e) = self
            .redis
            .set_json(self.key(user_id), &true, TOKEN_EXPIRED_TTL_SECS)
            .await
        {
            log::error!("failed to mark token expired for user {user_id}: {e}");
        }
    }
}

/// In-memory fixture for tests.
#[derive(Default)]
pub struct FixtureCredentialStore {
    expired: dashmap::DashSet<i64>,
}

#[async_trait]
impl CredentialStore for FixtureCredentialStore {
    async fn is_valid(&self, user_id: i64) -> bool {
        !self.expired.contains(&user_id)
    }

    async fn mark_token_expired(&self, user_id: i64) {
        self.expired.insert(user_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fresh_user_is_valid() {
        let store = FixtureCredentialStore::default();
        assert!(store.is_valid(42).await);
    }

    #[tokio::test]
    async fn marking_expired_flips_validity() {
        let store = FixtureCredentialStore::default();
        store.mark_token_expired(42).await;
        assert!(!store.is_valid(42).await);
        assert!(store.is_valid(43).await);
    }
}
