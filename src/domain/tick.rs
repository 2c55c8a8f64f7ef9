//! Normalized market tick and the field-wise merge discipline.
//!
//! Every numeric field is optional so that "upstream didn't send this
//! field this frame" is distinguishable from "the value is zero" —
//! the class of bug the distilled source mixed up (see DESIGN.md).

use serde::{Deserialize, Serialize};

/// A single normalized update for one instrument.
///
/// Any field left `None` means "no information in this frame", and
/// merging preserves whatever was already known for that field.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Tick {
    pub ltp: Option<f64>,
    pub volume: Option<u64>,
    pub oi: Option<u64>,
    pub bid: Option<f64>,
    pub ask: Option<f64>,
    pub bid_qty: Option<u64>,
    pub ask_qty: Option<u64>,
    pub bid_ts: Option<i64>,
    pub ask_ts: Option<i64>,
    pub bid_simulated: Option<bool>,
    pub ask_simulated: Option<bool>,
    pub iv: Option<f64>,
    pub delta: Option<f64>,
    pub gamma: Option<f64>,
    pub theta: Option<f64>,
    pub vega: Option<f64>,
    pub recv_ts: i64,
    pub seq: u64,
    pub synthetic_flag: bool,
}

impl Tick {
    /// `true` if the tick carries no option analytics at all.
    pub fn missing_analytics(&self) -> bool {
        self.iv.is_none()
            && self.delta.is_none()
            && self.gamma.is_none()
            && self.theta.is_none()
            && self.vega.is_none()
    }

    /// Field-wise merge of a freshly-arrived tick onto existing state.
    ///
    /// `ltp` is sticky: an incoming zero or absent LTP never clobbers a
    /// previously known good price. All other fields are overwritten
    /// only when the incoming value is present.
    pub fn merge_from(&mut self, incoming: &Tick) {
        if let Some(ltp) = incoming.ltp {
            if ltp != 0.0 {
                self.ltp = Some(ltp);
            }
        }
        macro_rules! take_if_present {
            ($field:ident) => {
                if incoming.$field.is_some() {
                    self.$field = incoming.$field;
                }
            };
        }
        take_if_present!(volume);
        take_if_present!(oi);
        take_if_present!(bid);
        take_if_present!(ask);
        take_if_present!(bid_qty);
        take_if_present!(ask_qty);
        take_if_present!(bid_ts);
        take_if_present!(ask_ts);
        take_if_present!(bid_simulated);
        take_if_present!(ask_simulated);
        take_if_present!(iv);
        take_if_present!(delta);
        take_if_present!(gamma);
        take_if_present!(theta);
        take_if_present!(vega);

        self.recv_ts = incoming.recv_ts;
        self.seq = incoming.seq;
        self.synthetic_flag = incoming.synthetic_flag;
    }
}

/// The wire shape of a single instrument's entry inside `MARKET_UPDATE.data`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TickDelta {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ltp: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub volume: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub oi: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bid: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ask: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bid_qty: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ask_qty: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub iv: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delta: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gamma: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub theta: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vega: Option<f64>,
    pub seq: u64,
    #[serde(skip_serializing_if = "is_false")]
    pub synthetic: bool,
}

fn is_false(b: &bool) -> bool {
    !*b
}

impl From<&Tick> for TickDelta {
    fn from(t: &Tick) -> Self {
        Self {
            ltp: t.ltp,
            volume: t.volume,
            oi: t.oi,
            bid: t.bid,
            ask: t.ask,
            bid_qty: t.bid_qty,
            ask_qty: t.ask_qty,
            iv: t.iv,
            delta: t.delta,
            gamma: t.gamma,
            theta: t.theta,
            vega: t.vega,
            seq: t.seq,
            synthetic: t.synthetic_flag,
        }
    }
}

/// Per-instrument sequence discipline: `true` if `incoming` should be
/// accepted (strictly greater `seq` than what's already applied).
pub fn accepts_seq(applied_seq: u64, incoming_seq: u64, has_state: bool) -> bool {
    if !has_state {
        return true;
    }
    incoming_seq > applied_seq
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tick(seq: u64, ltp: Option<f64>) -> Tick {
        Tick {
            ltp,
            seq,
            recv_ts: seq as i64,
            ..Default::default()
        }
    }

    #[test]
    fn sequence_regression_rejected() {
        assert!(!accepts_seq(11, 9, true));
        assert!(accepts_seq(11, 12, true));
        assert!(!accepts_seq(11, 11, true));
    }

    #[test]
    fn first_tick_for_key_always_accepted() {
        assert!(accepts_seq(0, 0, false));
    }

    #[test]
    fn zero_ltp_does_not_clobber_good_price() {
        let mut state = tick(1, Some(100.5));
        let update = tick(2, Some(0.0));
        state.merge_from(&update);
        assert_eq!(state.ltp, Some(100.5));
        assert_eq!(state.seq, 2);
    }

    #[test]
    fn absent_ltp_preserves_prior_value() {
        let mut state = tick(1, Some(100.5));
        let update = Tick {
            volume: Some(10),
            ..tick(2, None)
        };
        state.merge_from(&update);
        assert_eq!(state.ltp, Some(100.5));
        assert_eq!(state.volume, Some(10));
    }

    #[test]
    fn present_nonzero_ltp_overwrites() {
        let mut state = tick(1, Some(100.5));
        let update = tick(2, Some(101.25));
        state.merge_from(&update);
        assert_eq!(state.ltp, Some(101.25));
    }

    #[test]
    fn replay_sequence_applies_only_increasing_ticks() {
        // seq values [10, 11, 9, 12] — 9 must be rejected before merge.
        let mut state = tick(10, Some(1.0));
        let mut applied = vec![10u64];
        for (seq, ltp) in [(11u64, 2.0), (9, 3.0), (12, 4.0)] {
            if accepts_seq(state.seq, seq, true) {
                state.merge_from(&tick(seq, Some(ltp)));
                applied.push(seq);
            }
        }
        assert_eq!(applied, vec![10, 11, 12]);
        assert_eq!(state.ltp, Some(4.0));
    }
}
