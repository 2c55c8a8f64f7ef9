//! Postgres-backed `InstrumentCatalog`: loads the full strike table for
//! known underlyings/expiries at start-up into an in-memory, read-mostly
//! snapshot (the `db/queries.rs` `sqlx::query_as` convention, but
//! runtime-checked like `services/scheduler.rs::StrategyRow` since the
//! catalog schema isn't part of this crate's compile-time-checked set).

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use sqlx::PgPool;

use crate::domain::chain::{OptionChain, StrikeRow};
use crate::domain::instrument::InstrumentKey;
use crate::utils::errors::CatalogError;

use super::InstrumentCatalog;

#[derive(sqlx::FromRow, Clone)]
struct StrikeTableRow {
    underlying_key: String,
    expiry: String,
    strike: i64,
    step: i64,
    call_key: String,
    put_key: String,
    lot_size: i32,
    trading_symbol_call: String,
    trading_symbol_put: String,
}

/// Snapshot swapped in wholesale on reload; cheap to clone (`Arc` inside).
#[derive(Clone)]
pub struct PostgresCatalog {
    chains: Arc<BTreeMap<(String, String), OptionChain>>,
}

impl PostgresCatalog {
    /// Load the entire strike table once at start-up.
    pub async fn load(pool: &PgPool) -> Result<Self, CatalogError> {
        let rows: Vec<StrikeTableRow> = sqlx::query_as::<_, StrikeTableRow>(
            r#"SELECT underlying_key, expiry, strike, step, call_key, put_key,
                      lot_size, trading_symbol_call, trading_symbol_put
                 FROM option_chain_strikes
                ORDER BY underlying_key, expiry, strike ASC"#,
        )
        .fetch_all(pool)
        .await
        .map_err(|e| CatalogError::Unavailable(e.to_string()))?;

        let mut chains: BTreeMap<(String, String), OptionChain> = BTreeMap::new();
        for r in rows {
            let key = (r.underlying_key.clone(), r.expiry.clone());
            let chain = chains.entry(key).or_insert_with(|| OptionChain {
                step: r.step,
                rows: Vec::new(),
            });
            chain.rows.push(StrikeRow {
                strike: r.strike,
                call_key: InstrumentKey::normalize(&r.call_key),
                put_key: InstrumentKey::normalize(&r.put_key),
                lot_size: r.lot_size as u32,
                trading_symbol_call: r.trading_symbol_call,
                trading_symbol_put: r.trading_symbol_put,
            });
        }

        Ok(Self {
            chains: Arc::new(chains),
        })
    }

    fn chain_for(&self, underlying: &InstrumentKey, expiry: &str) -> Result<&OptionChain, CatalogError> {
        self.chains
            .get(&(underlying.as_str().to_string(), expiry.to_string()))
            .ok_or_else(|| CatalogError::UnknownExpiry(expiry.to_string()))
    }
}

#[async_trait]
impl InstrumentCatalog for PostgresCatalog {
    async fn chain_around(
        &self,
        underlying: &InstrumentKey,
        expiry: &str,
        atm: i64,
        count: u32,
    ) -> Result<OptionChain, CatalogError> {
        let chain = self.chain_for(underlying, expiry)?;
        let span = count as i64 * chain.step;
        let rows = chain
            .rows
            .iter()
            .filter(|r| (r.strike - atm).abs() <= span)
            .cloned()
            .collect();
        Ok(OptionChain {
            step: chain.step,
            rows,
        })
    }

    async fn step_for(&self, underlying: &InstrumentKey, expiry: &str) -> Result<i64, CatalogError> {
        Ok(self.chain_for(underlying, expiry)?.step)
    }

    async fn lot_size_for(&self, key: &InstrumentKey) -> Result<u32, CatalogError> {
        for chain in self.chains.values() {
            if let Some(row) = chain
                .rows
                .iter()
                .find(|r| &r.call_key == key || &r.put_key == key)
            {
                return Ok(row.lot_size);
            }
        }
        Err(CatalogError::UnknownInstrument(key.as_str().to_string()))
    }

    async fn search(&self, prefix: &str) -> Result<Vec<InstrumentKey>, CatalogError> {
        let mut out = Vec::new();
        for chain in self.chains.values() {
            for row in &chain.rows {
                if row.trading_symbol_call.starts_with(prefix) {
                    out.push(row.call_key.clone());
                }
                if row.trading_symbol_put.starts_with(prefix) {
                    out.push(row.put_key.clone());
                }
            }
        }
        Ok(out)
    }
}
