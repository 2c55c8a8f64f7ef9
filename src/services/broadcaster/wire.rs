//! Wire frame shapes: `FsEvent` -> outbound JSON text, and inbound
//! client JSON -> `ClientCommand` (SPEC_FULL.md §6).

use serde_json::json;

use crate::domain::instrument::InstrumentKey;
use crate::services::feed_session::events::{ClientCommand, FsEvent};
use crate::utils::errors::FeedError;

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Render an `FsEvent` to its wire JSON text, plus whether it belongs
/// in the coalescing `MARKET_UPDATE` slot (`true`) or the never-dropped
/// control queue (`false`).
pub fn to_wire_frame(ev: &FsEvent) -> (String, bool) {
    match ev {
        FsEvent::MarketUpdate(deltas) => {
            let frame = json!({"type": "MARKET_UPDATE", "data": deltas});
            (frame.to_string(), true)
        }
        FsEvent::FeedState {
            status,
            underlying,
            current_atm,
            live_strikes,
            max_strike_distance,
            version,
        } => {
            let frame = json!({
                "type": "FEED_STATE",
                "data": {
                    "status": status,
                    "underlying": underlying.as_str(),
                    "current_atm": current_atm,
                    "live_strikes": live_strikes,
                    "max_strike_distance": max_strike_distance,
                    "version": version,
                    "timestamp": now_ms(),
                }
            });
            (frame.to_string(), false)
        }
        FsEvent::FeedHealth { state, active_keys, buffer_size, reset_locked } => {
            let frame = json!({
                "type": "FEED_HEALTH",
                "data": {
                    "state": state,
                    "active_keys": active_keys,
                    "buffer_size": buffer_size,
                    "reset_locked": reset_locked,
                    "timestamp": now_ms(),
                }
            });
            (frame.to_string(), false)
        }
        FsEvent::UpstoxFeedConnected => {
            (json!({"type": "UPSTOX_FEED_CONNECTED"}).to_string(), false)
        }
        FsEvent::UpstoxFeedDisconnected { reason } => {
            let frame = json!({"type": "UPSTOX_FEED_DISCONNECTED", "data": {"reason": reason}});
            (frame.to_string(), false)
        }
        FsEvent::MarketStatusClosed { msg } => {
            let frame = json!({"type": "MARKET_STATUS", "data": {"status": "CLOSED", "msg": msg}});
            (frame.to_string(), false)
        }
        FsEvent::FeedUnavailable { msg } => {
            let frame = json!({"type": "FEED_UNAVAILABLE", "data": {"msg": msg}});
            (frame.to_string(), false)
        }
        FsEvent::SubscriptionAck { count, underlying } => {
            let frame = json!({
                "type": "SUBSCRIPTION_ACK",
                "data": {"count": count, "underlying": underlying.as_str()},
            });
            (frame.to_string(), false)
        }
        FsEvent::Error(err) => (error_frame(err), false),
        FsEvent::SessionExpired => (session_expired_frame(), false),
    }
}

pub fn error_frame(err: &FeedError) -> String {
    json!({"type": "ERROR", "data": {"kind": err.kind(), "msg": err.to_string()}}).to_string()
}

pub fn session_expired_frame() -> String {
    json!({"type": "SESSION_EXPIRED"}).to_string()
}

/// Parse one inbound client text frame into a `ClientCommand`.
/// Unrecognized `action` values surface as `FeedError::UnknownAction`.
pub fn parse_client_command(text: &str) -> Result<ClientCommand, FeedError> {
    let value: serde_json::Value =
        serde_json::from_str(text).map_err(|e| FeedError::UnknownAction(e.to_string()))?;
    let action = value.get("action").and_then(|v| v.as_str()).unwrap_or("");

    match action {
        "switch_underlying" => {
            let underlying_key = value
                .get("underlying_key")
                .and_then(|v| v.as_str())
                .ok_or_else(|| FeedError::UnknownAction("switch_underlying missing underlying_key".into()))?;
            let requested_keys = value
                .get("keys")
                .and_then(|v| v.as_array())
                .map(|arr| {
                    arr.iter()
                        .filter_map(|v| v.as_str())
                        .map(InstrumentKey::normalize)
                        .collect()
                })
                .unwrap_or_default();
            let expiry_date = value
                .get("expiry_date")
                .and_then(|v| v.as_str())
                .map(|s| s.to_string());
            Ok(ClientCommand::SwitchUnderlying {
                underlying_key: InstrumentKey::normalize(underlying_key),
                expiry_date,
                requested_keys,
            })
        }
        "switch_expiry" => {
            let expiry_date = value
                .get("expiry_date")
                .and_then(|v| v.as_str())
                .ok_or_else(|| FeedError::UnknownAction("switch_expiry missing expiry_date".into()))?
                .to_string();
            Ok(ClientCommand::SwitchExpiry { expiry_date })
        }
        "subscribe" => {
            let keys = parse_keys(&value);
            Ok(ClientCommand::AdvisorySubscribe(keys))
        }
        "unsubscribe" => {
            let keys = parse_keys(&value);
            Ok(ClientCommand::AdvisoryUnsubscribe(keys))
        }
        "ping" => {
            let ts = value.get("ts").and_then(|v| v.as_i64()).unwrap_or_else(now_ms);
            Ok(ClientCommand::Ping { ts })
        }
        other => Err(FeedError::UnknownAction(other.to_string())),
    }
}

fn parse_keys(value: &serde_json::Value) -> Vec<InstrumentKey> {
    value
        .get("keys")
        .and_then(|v| v.as_array())
        .map(|arr| {
            arr.iter()
                .filter_map(|v| v.as_str())
                .map(InstrumentKey::normalize)
                .collect()
        })
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_switch_underlying_with_advisory_keys() {
        let cmd = parse_client_command(
            r#"{"action":"switch_underlying","underlying_key":"NSE_INDEX|Nifty Bank","keys":["NSE_FO|1CE"],"expiry_date":"2025-03-27"}"#,
        )
        .unwrap();
        match cmd {
            ClientCommand::SwitchUnderlying { underlying_key, expiry_date, requested_keys } => {
                assert_eq!(underlying_key.as_str(), "NSE_INDEX|Nifty Bank");
                assert_eq!(expiry_date.as_deref(), Some("2025-03-27"));
                assert_eq!(requested_keys.len(), 1);
            }
            _ => panic!("expected SwitchUnderlying"),
        }
    }

    #[test]
    fn unknown_action_surfaces_as_feed_error() {
        let err = parse_client_command(r#"{"action":"teleport"}"#).unwrap_err();
        assert_eq!(err.kind(), "UnknownAction");
    }

    #[test]
    fn malformed_json_surfaces_as_unknown_action() {
        let err = parse_client_command("not json").unwrap_err();
        assert_eq!(err.kind(), "UnknownAction");
    }

    #[test]
    fn ping_defaults_ts_when_missing() {
        let cmd = parse_client_command(r#"{"action":"ping"}"#).unwrap();
        assert!(matches!(cmd, ClientCommand::Ping { .. }));
    }
}
