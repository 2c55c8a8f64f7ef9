//! Option chain shapes returned by the Instrument Catalog collaborator.

use serde::{Deserialize, Serialize};

use super::instrument::InstrumentKey;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StrikeRow {
    pub strike: i64,
    pub call_key: InstrumentKey,
    pub put_key: InstrumentKey,
    pub lot_size: u32,
    pub trading_symbol_call: String,
    pub trading_symbol_put: String,
}

/// Sorted (ascending strike), uniform-step slice of a chain.
#[derive(Debug, Clone, Default)]
pub struct OptionChain {
    pub step: i64,
    pub rows: Vec<StrikeRow>,
}

impl OptionChain {
    pub fn row_for_strike(&self, strike: i64) -> Option<&StrikeRow> {
        // rows are sorted ascending by construction (IC contract); binary search.
        self.rows
            .binary_search_by_key(&strike, |r| r.strike)
            .ok()
            .map(|i| &self.rows[i])
    }

    pub fn strikes(&self) -> impl Iterator<Item = i64> + '_ {
        self.rows.iter().map(|r| r.strike)
    }
}
