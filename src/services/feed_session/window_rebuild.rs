//! Pure helpers for deciding the next `LiveWindow` and what it costs to
//! get there. Kept separate from `mod.rs` so the decision logic can be
//! exercised without spinning up the task loop.

use crate::domain::chain::OptionChain;
use crate::domain::instrument::InstrumentKey;
use crate::domain::window::{diff_keys, LiveWindow};

/// What changed going from `old` (if any) to a window centered on `atm`.
pub struct RebuildPlan {
    pub window: LiveWindow,
    pub add: Vec<InstrumentKey>,
    pub drop: Vec<InstrumentKey>,
}

pub fn plan_rebuild(
    underlying_key: &InstrumentKey,
    chain: &OptionChain,
    atm: i64,
    half_width: u32,
    version: u64,
    old: Option<&LiveWindow>,
) -> RebuildPlan {
    let window = LiveWindow::build(underlying_key, chain, atm, chain.step, half_width, version);
    let empty = Default::default();
    let old_keys = old.map(|w| &w.subscribed_keys).unwrap_or(&empty);
    let (add, drop) = diff_keys(old_keys, &window.subscribed_keys);
    RebuildPlan { window, add, drop }
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
    fn first_build_has_no_drops() {
        let chain = chain_around(23500, 50, 10);
        let underlying = InstrumentKey::normalize("NSE_INDEX|Nifty 50");
        let plan = plan_rebuild(&underlying, &chain, 23500, 2, 1, None);
        assert!(plan.drop.is_empty());
        assert!(!plan.add.is_empty());
    }

    #[test]
    fn shifting_atm_adds_and_drops_the_non_overlapping_edges() {
        let chain = chain_around(23500, 50, 10);
        let underlying = InstrumentKey::normalize("NSE_INDEX|Nifty 50");
        let first = plan_rebuild(&underlying, &chain, 23500, 2, 1, None);
        let second = plan_rebuild(&underlying, &chain, 23600, 2, 2, Some(&first.window));
        assert!(!second.add.is_empty());
        assert!(!second.drop.is_empty());
    }
}
