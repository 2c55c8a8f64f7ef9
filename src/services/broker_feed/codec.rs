//! Upstream binary frame decoding: a `u32` big-endian length prefix, a
//! one-byte message-type tag, then a JSON payload — reassembled across
//! partial network reads (SPEC_FULL.md §4.1).

use serde::Deserialize;

use crate::domain::instrument::InstrumentKey;
use crate::domain::tick::Tick;
use crate::utils::errors::BfcError;

/// Frames above this size are almost certainly a desynced stream; drop
/// and log rather than attempt to buffer an unbounded amount of memory.
pub const MAX_FRAME_BYTES: usize = 1 << 20;

const HEADER_LEN: usize = 4;

const MSG_TYPE_TICK: u8 = 0x01;
const MSG_TYPE_MARKET_CLOSED: u8 = 0x02;
const MSG_TYPE_HEARTBEAT: u8 = 0x03;

#[derive(Debug, Clone)]
pub enum DecodedFrame {
    Tick(InstrumentKey, Tick),
    MarketClosed,
    Heartbeat,
    Unknown(u8),
}

/// Upstream's on-wire tick shape: numeric fields arrive as strings or
/// are simply absent (SPEC_FULL.md §6 — "clients MUST parse to number";
/// the same is true of us on ingress).
#[derive(Debug, Deserialize)]
struct WireTick {
    instrument_key: String,
    seq: u64,
    #[serde(default)]
    ltp: Option<String>,
    #[serde(default)]
    volume: Option<u64>,
    #[serde(default)]
    oi: Option<u64>,
    #[serde(default)]
    bid: Option<String>,
    #[serde(default)]
    ask: Option<String>,
    #[serde(default)]
    bid_qty: Option<u64>,
    #[serde(default)]
    ask_qty: Option<u64>,
    #[serde(default)]
    bid_simulated: Option<bool>,
    #[serde(default)]
    ask_simulated: Option<bool>,
    #[serde(default)]
    iv: Option<f64>,
    #[serde(default)]
    delta: Option<f64>,
    #[serde(default)]
    gamma: Option<f64>,
    #[serde(default)]
    theta: Option<f64>,
    #[serde(default)]
    vega: Option<f64>,
}

fn parse_numeric_string(s: &Option<String>) -> Option<f64> {
    s.as_ref().and_then(|v| v.parse::<f64>().ok())
}

impl WireTick {
    fn into_domain(self, recv_ts: i64) -> (InstrumentKey, Tick) {
        let key = InstrumentKey::normalize(&self.instrument_key);
        let tick = Tick {
            ltp: parse_numeric_string(&self.ltp),
            volume: self.volume,
            oi: self.oi,
            bid: parse_numeric_string(&self.bid),
            ask: parse_numeric_string(&self.ask),
            bid_qty: self.bid_qty,
            ask_qty: self.ask_qty,
            bid_ts: None,
            ask_ts: None,
            bid_simulated: self.bid_simulated,
            ask_simulated: self.ask_simulated,
            iv: self.iv,
            delta: self.delta,
            gamma: self.gamma,
            theta: self.theta,
            vega: self.vega,
            recv_ts,
            seq: self.seq,
            synthetic_flag: false,
        };
        (key, tick)
    }
}

/// Accumulates bytes from successive socket reads and yields complete
/// frames as they become available.
#[derive(Default)]
pub struct FrameDecoder {
    buf: Vec<u8>,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Pull the next complete frame out of the buffer, if any. Returns
    /// `Ok(None)` when more bytes are needed. A malformed payload yields
    /// `Err` but does not poison the decoder — the frame is consumed and
    /// the caller may keep reading.
    pub fn next_frame(&mut self, recv_ts: i64) -> Result<Option<DecodedFrame>, BfcError> {
        loop {
            if self.buf.len() < HEADER_LEN {
                return Ok(None);
            }
            let len = u32::from_be_bytes(self.buf[..HEADER_LEN].try_into().unwrap()) as usize;
            if len == 0 {
                return Err(BfcError::ParseError("zero-length frame".into()));
            }
            if len > MAX_FRAME_BYTES {
                log::warn!("discarding oversized upstream frame ({len} bytes > cap)");
                // We don't have the bytes yet to skip past it reliably if
                // len also exceeds what's buffered; drop the accumulator
                // entirely and resync on the next header.
                self.buf.clear();
                return Ok(None);
            }
            if self.buf.len() < HEADER_LEN + len {
                return Ok(None); // partial frame; wait for more bytes
            }

            let frame_start = HEADER_LEN;
            let msg_type = self.buf[frame_start];
            let payload = self.buf[frame_start + 1..HEADER_LEN + len].to_vec();
            self.buf.drain(..HEADER_LEN + len);

            return match msg_type {
                MSG_TYPE_TICK => match serde_json::from_slice::<WireTick>(&payload) {
                    Ok(wt) => {
                        let (key, tick) = wt.into_domain(recv_ts);
                        Ok(Some(DecodedFrame::Tick(key, tick)))
                    }
                    Err(e) => Err(BfcError::ParseError(e.to_string())),
                },
                MSG_TYPE_MARKET_CLOSED => Ok(Some(DecodedFrame::MarketClosed)),
                MSG_TYPE_HEARTBEAT => Ok(Some(DecodedFrame::Heartbeat)),
                other => Ok(Some(DecodedFrame::Unknown(other))),
            };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode_tick_frame(json: &str) -> Vec<u8> {
        let mut payload = vec![MSG_TYPE_TICK];
        payload.extend_from_slice(json.as_bytes());
        let len = (payload.len() as u32).to_be_bytes();
        let mut out = len.to_vec();
        out.extend_from_slice(&payload);
        out
    }

    #[test]
    fn decodes_a_complete_tick_frame() {
        let mut dec = FrameDecoder::new();
        dec.push(&encode_tick_frame(
            r#"{"instrument_key":"NSE_FO:23500CE","seq":1,"ltp":"125.5"}"#,
        ));
        let frame = dec.next_frame(100).unwrap().unwrap();
        match frame {
            DecodedFrame::Tick(key, tick) => {
                assert_eq!(key.as_str(), "NSE_FO|23500CE");
                assert_eq!(tick.ltp, Some(125.5));
                assert_eq!(tick.seq, 1);
            }
            _ => panic!("expected a tick frame"),
        }
    }

    #[test]
    fn reassembles_a_frame_split_across_two_reads() {
        let mut dec = FrameDecoder::new();
        let full = encode_tick_frame(r#"{"instrument_key":"NSE_FO|1CE","seq":1,"ltp":"1.0"}"#);
        let (first, second) = full.split_at(full.len() / 2);
        dec.push(first);
        assert!(dec.next_frame(0).unwrap().is_none());
        dec.push(second);
        assert!(dec.next_frame(0).unwrap().is_some());
    }

    #[test]
    fn malformed_payload_does_not_poison_the_stream() {
        let mut dec = FrameDecoder::new();
        dec.push(&encode_tick_frame("not json"));
        assert!(dec.next_frame(0).is_err());
        // a subsequent well-formed frame still decodes fine
        dec.push(&encode_tick_frame(
            r#"{"instrument_key":"NSE_FO|1CE","seq":1,"ltp":"1.0"}"#,
        ));
        assert!(dec.next_frame(0).unwrap().is_some());
    }

    #[test]
    fn oversized_frame_is_discarded() {
        let mut dec = FrameDecoder::new();
        let huge_len = (MAX_FRAME_BYTES as u32 + 1).to_be_bytes();
        dec.push(&huge_len);
        assert!(dec.next_frame(0).unwrap().is_none());
        assert!(dec.buf.is_empty());
    }

    #[test]
    fn unknown_message_type_is_surfaced_not_dropped_silently() {
        let mut dec = FrameDecoder::new();
        let payload = vec![0xFFu8];
        let len = (payload.len() as u32).to_be_bytes();
        let mut frame = len.to_vec();
        frame.extend_from_slice(&payload);
        dec.push(&frame);
        match dec.next_frame(0).unwrap().unwrap() {
            DecodedFrame::Unknown(t) => assert_eq!(t, 0xFF),
            _ => panic!("expected Unknown"),
        }
    }
}
