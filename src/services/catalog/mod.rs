//! Instrument Catalog collaborator: read-mostly strike lookups.
//!
//! Treated as immutable within a session (see SPEC_FULL.md §9): a
//! background reload swaps the whole in-memory table for sessions
//! created after the reload, but an attached session keeps the handle
//! it started with.

pub mod postgres;

use std::collections::BTreeMap;

use async_trait::async_trait;

use crate::domain::chain::{OptionChain, StrikeRow};
use crate::domain::instrument::InstrumentKey;
use crate::utils::errors::CatalogError;

#[async_trait]
pub trait InstrumentCatalog: Send + Sync {
    /// Up to `2*count + 1` contiguous strikes centered on `atm`, clipped
    /// to whatever the chain actually carries.
    async fn chain_around(
        &self,
        underlying: &InstrumentKey,
        expiry: &str,
        atm: i64,
        count: u32,
    ) -> Result<OptionChain, CatalogError>;

    async fn step_for(&self, underlying: &InstrumentKey, expiry: &str) -> Result<i64, CatalogError>;

    async fn lot_size_for(&self, key: &InstrumentKey) -> Result<u32, CatalogError>;

    async fn search(&self, prefix: &str) -> Result<Vec<InstrumentKey>, CatalogError>;
}

/// In-memory fixture used by tests and by `AppMode::demo` wiring. Holds a
/// full chain per `(underlying, expiry)` pair, already sorted by strike.
#[derive(Debug, Clone, Default)]
pub struct FixtureCatalog {
    chains: BTreeMap<(String, String), OptionChain>,
}

impl FixtureCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_chain(mut self, underlying: &InstrumentKey, expiry: &str, chain: OptionChain) -> Self {
        self.chains
            .insert((underlying.as_str().to_string(), expiry.to_string()), chain);
        self
    }

    fn get_chain(&self, underlying: &InstrumentKey, expiry: &str) -> Result<&OptionChain, CatalogError> {
        self.chains
            .get(&(underlying.as_str().to_string(), expiry.to_string()))
            .ok_or_else(|| CatalogError::UnknownExpiry(expiry.to_string()))
    }
}

#[async_trait]
impl InstrumentCatalog for FixtureCatalog {
    async fn chain_around(
        &self,
        underlying: &InstrumentKey,
        expiry: &str,
        atm: i64,
        count: u32,
    ) -> Result<OptionChain, CatalogError> {
        let chain = self.get_chain(underlying, expiry)?;
        let count = count as i64;
        let rows: Vec<StrikeRow> = chain
            .rows
            .iter()
            .filter(|r| (r.strike - atm).abs() <= count * chain.step)
            .cloned()
            .collect();
        Ok(OptionChain {
            step: chain.step,
            rows,
        })
    }

    async fn step_for(&self, underlying: &InstrumentKey, expiry: &str) -> Result<i64, CatalogError> {
        Ok(self.get_chain(underlying, expiry)?.step)
    }

    async fn lot_size_for(&self, key: &InstrumentKey) -> Result<u32, CatalogError> {
        for chain in self.chains.values() {
            for row in &chain.rows {
                if &row.call_key == key || &row.put_key == key {
                    return Ok(row.lot_size);
                }
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

#[cfg(test)]
mod tests {
    use super::*;

    fn row(strike: i64) -> StrikeRow {
        StrikeRow {
            strike,
            call_key: InstrumentKey::normalize(&format!("NSE_FO|{strike}CE")),
            put_key: InstrumentKey::normalize(&format!("NSE_FO|{strike}PE")),
            lot_size: 50,
            trading_symbol_call: format!("NIFTY{strike}CE"),
            trading_symbol_put: format!("NIFTY{strike}PE"),
        }
    }

    fn catalog() -> FixtureCatalog {
        let underlying = InstrumentKey::normalize("NSE_INDEX|Nifty 50");
        let rows = (-10..=10).map(|k| row(23500 + k * 50)).collect();
        FixtureCatalog::new().with_chain(
            &underlying,
            "2025-02-27",
            OptionChain { step: 50, rows },
        )
    }

    #[tokio::test]
    async fn chain_around_clips_to_count() {
        let underlying = InstrumentKey::normalize("NSE_INDEX|Nifty 50");
        let c = catalog();
        let chain = c
            .chain_around(&underlying, "2025-02-27", 23500, 3)
            .await
            .unwrap();
        assert_eq!(chain.rows.len(), 7);
    }

    #[tokio::test]
    async fn unknown_expiry_errors() {
        let underlying = InstrumentKey::normalize("NSE_INDEX|Nifty 50");
        let c = catalog();
        let err = c
            .chain_around(&underlying, "1999-01-01", 23500, 3)
            .await
            .unwrap_err();
        matches!(err, CatalogError::UnknownExpiry(_));
    }

    #[tokio::test]
    async fn lot_size_lookup_by_leg_key() {
        let c = catalog();
        let key = InstrumentKey::normalize("NSE_FO|23500CE");
        assert_eq!(c.lot_size_for(&key).await.unwrap(), 50);
    }
}
