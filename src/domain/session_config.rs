//! Owned, atomically-replaced per-session configuration.

use super::instrument::InstrumentKey;

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub user_id: i64,
    pub underlying_key: InstrumentKey,
    pub expiry: String,
    pub step: i64,
    pub half_width: u32,
}

impl SessionConfig {
    pub fn new(user_id: i64, underlying_key: InstrumentKey, expiry: String, step: i64, half_width: u32) -> Self {
        Self {
            user_id,
            underlying_key,
            expiry,
            step,
            half_width,
        }
    }
}
