//! ATM-centered live-strike window: the backend-authoritative subscription
//! set a client is allowed to render against.

use std::collections::BTreeSet;
use std::collections::HashSet;

use super::chain::OptionChain;
use super::instrument::InstrumentKey;

#[derive(Debug, Clone)]
pub struct LiveWindow {
    pub atm_strike: i64,
    pub step: i64,
    pub half_width: u32,
    pub live_strikes: BTreeSet<i64>,
    pub subscribed_keys: HashSet<InstrumentKey>,
    pub version: u64,
}

impl LiveWindow {
    /// Build a fresh window centered on `atm`, clipped to whatever strikes
    /// the chain actually carries (so an ATM near the edge of the chain
    /// still yields a contiguous — if narrower — window, never a gap).
    pub fn build(
        underlying_key: &InstrumentKey,
        chain: &OptionChain,
        atm: i64,
        step: i64,
        half_width: u32,
        version: u64,
    ) -> Self {
        let candidate_strikes = candidate_strikes(atm, step, half_width);
        let available: BTreeSet<i64> = chain.strikes().collect();
        let live_strikes: BTreeSet<i64> = candidate_strikes
            .into_iter()
            .filter(|s| available.contains(s))
            .collect();

        let mut subscribed_keys = HashSet::with_capacity(live_strikes.len() * 2 + 1);
        subscribed_keys.insert(underlying_key.clone());
        for strike in &live_strikes {
            if let Some(row) = chain.row_for_strike(*strike) {
                subscribed_keys.insert(row.call_key.clone());
                subscribed_keys.insert(row.put_key.clone());
            }
        }

        Self {
            atm_strike: atm,
            step,
            half_width,
            live_strikes,
            subscribed_keys,
            version,
        }
    }

    pub fn contains_strike(&self, strike: i64) -> bool {
        self.live_strikes.contains(&strike)
    }

    pub fn max_strike_distance(&self) -> i64 {
        self.half_width as i64 * self.step
    }
}

/// `{atm + k*step : k in [-half_width, +half_width]}`, unclipped.
pub fn candidate_strikes(atm: i64, step: i64, half_width: u32) -> BTreeSet<i64> {
    let w = half_width as i64;
    (-w..=w).map(|k| atm + k * step).collect()
}

/// Nearest multiple of `step` to `spot`, rounding half away from zero.
pub fn round_to_step(spot: f64, step: i64) -> i64 {
    if step <= 0 {
        return spot.round() as i64;
    }
    ((spot / step as f64).round() as i64) * step
}

/// Diff between an old and new subscription set: `(add, drop)`.
pub fn diff_keys(
    old: &HashSet<InstrumentKey>,
    new: &HashSet<InstrumentKey>,
) -> (Vec<InstrumentKey>, Vec<InstrumentKey>) {
    let add = new.difference(old).cloned().collect();
    let drop = old.difference(new).cloned().collect();
    (add, drop)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::chain::StrikeRow;

    fn chain_around(center: i64, step: i64, count: i64) -> OptionChain {
        let rows = (-count..=count)
            .map(|k| {
                let strike = center + k * step;
                StrikeRow {
                    strike,
                    call_key: InstrumentKey::normalize(&format!("NSE_FO|{strike}CE")),
                    put_key: InstrumentKey::normalize(&format!("NSE_FO|{strike}PE")),
                    lot_size: 50,
                    trading_symbol_call: format!("SYM{strike}CE"),
                    trading_symbol_put: format!("SYM{strike}PE"),
                }
            })
            .collect();
        OptionChain { step, rows }
    }

    #[test]
    fn half_width_zero_yields_only_atm() {
        let chain = chain_around(23500, 50, 20);
        let underlying = InstrumentKey::normalize("NSE_INDEX|Nifty 50");
        let w = LiveWindow::build(&underlying, &chain, 23500, 50, 0, 1);
        assert_eq!(w.live_strikes.len(), 1);
        assert!(w.live_strikes.contains(&23500));
    }

    #[test]
    fn clipping_at_chain_edge_has_no_gaps() {
        // chain only spans 5 strikes either side; ask for W=8.
        let chain = chain_around(23500, 50, 5);
        let underlying = InstrumentKey::normalize("NSE_INDEX|Nifty 50");
        let w = LiveWindow::build(&underlying, &chain, 23500, 50, 8, 1);
        let strikes: Vec<i64> = w.live_strikes.iter().copied().collect();
        assert_eq!(strikes.first().copied(), Some(23250));
        assert_eq!(strikes.last().copied(), Some(23750));
        // contiguous: every consecutive pair differs by exactly `step`
        for pair in strikes.windows(2) {
            assert_eq!(pair[1] - pair[0], 50);
        }
    }

    #[test]
    fn subscribed_keys_include_underlying_and_both_legs() {
        let chain = chain_around(23500, 50, 8);
        let underlying = InstrumentKey::normalize("NSE_INDEX|Nifty 50");
        let w = LiveWindow::build(&underlying, &chain, 23500, 50, 1, 1);
        assert!(w.subscribed_keys.contains(&underlying));
        assert_eq!(w.subscribed_keys.len(), 1 + 3 * 2);
    }

    #[test]
    fn diff_keys_computes_add_and_drop() {
        let chain = chain_around(23500, 50, 8);
        let underlying = InstrumentKey::normalize("NSE_INDEX|Nifty 50");
        let old = LiveWindow::build(&underlying, &chain, 23500, 50, 1, 1);
        let new = LiveWindow::build(&underlying, &chain, 23600, 50, 1, 2);
        let (add, drop) = diff_keys(&old.subscribed_keys, &new.subscribed_keys);
        assert!(!add.is_empty());
        assert!(!drop.is_empty());
        for k in &add {
            assert!(!old.subscribed_keys.contains(k));
        }
        for k in &drop {
            assert!(!new.subscribed_keys.contains(k));
        }
    }

    #[test]
    fn round_to_step_rounds_to_nearest_multiple() {
        assert_eq!(round_to_step(23512.0, 50), 23500);
        assert_eq!(round_to_step(23537.0, 50), 23550);
        assert_eq!(round_to_step(23525.0, 50), 23550); // half rounds away from zero
    }

    #[test]
    fn idempotent_rebuild_same_atm_yields_same_window() {
        let chain = chain_around(23500, 50, 8);
        let underlying = InstrumentKey::normalize("NSE_INDEX|Nifty 50");
        let a = LiveWindow::build(&underlying, &chain, 23500, 50, 8, 1);
        let b = LiveWindow::build(&underlying, &chain, 23500, 50, 8, 1);
        assert_eq!(a.live_strikes, b.live_strikes);
        assert_eq!(a.subscribed_keys, b.subscribed_keys);
    }
}
