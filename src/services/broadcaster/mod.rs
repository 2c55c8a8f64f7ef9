//! Session Broadcaster (SB): per-user fan-out to one or more connected
//! client transports, plus inbound client-command demuxing. Grounded on
//! `services/market_data.rs`'s per-connection task pattern, generalized
//! from a single websocket to N transports sharing one Feed Session
//! (SPEC_FULL.md §4.5).

pub mod wire;

use std::collections::VecDeque;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::config::settings::FeedConfig;
use crate::services::feed_session::events::FsEvent;
use crate::services::feed_session::FeedSessionHandle;
use crate::utils::errors::FeedError;

/// A transport the broadcaster can push serialized frames into.
/// `actix_ws::Session` is the production implementation (see
/// `routes::ws`); anything implementing this can stand in for tests.
#[async_trait]
pub trait OutboundSink: Send {
    async fn send_text(&mut self, frame: String) -> Result<(), ()>;
}

/// Bounded per-transport queue: control frames (`FEED_STATE`, errors,
/// notices) are never dropped; at most one coalesced `MARKET_UPDATE`
/// frame is ever pending, since a fresh one supersedes whatever was
/// queued (SPEC_FULL.md §4.5 overflow policy).
struct TransportQueue {
    control: VecDeque<String>,
    market_update: Option<String>,
}

impl TransportQueue {
    fn new() -> Self {
        Self { control: VecDeque::new(), market_update: None }
    }

    fn push_control(&mut self, frame: String) {
        self.control.push_back(frame);
    }

    fn push_market_update(&mut self, frame: String) {
        self.market_update = Some(frame);
    }

    fn pop(&mut self) -> Option<String> {
        self.control.pop_front().or_else(|| self.market_update.take())
    }
}

type SharedQueue = Arc<StdMutex<TransportQueue>>;

/// Cheap-to-clone handle to a running broadcaster. One per Feed Session.
#[derive(Clone)]
pub struct BroadcasterHandle {
    user_id: i64,
    transports: Arc<StdMutex<Vec<SharedQueue>>>,
    feed_session: FeedSessionHandle,
    last_activity_ms: Arc<AtomicI64>,
    next_transport_id: Arc<AtomicU64>,
}

impl BroadcasterHandle {
    /// Attach a fresh transport (a new browser tab/reconnect). Spawns
    /// the writer task that drains this transport's queue.
    pub fn attach<S: OutboundSink + 'static>(&self, sink: S) -> u64 {
        let id = self.next_transport_id.fetch_add(1, Ordering::Relaxed);
        let queue: SharedQueue = Arc::new(StdMutex::new(TransportQueue::new()));
        self.transports.lock().unwrap().push(queue.clone());
        self.touch();
        tokio::spawn(run_writer(queue, sink));
        id
    }

    /// Parse and forward an inbound client frame; unknown actions get
    /// an `ERROR{kind: UnknownAction}` pushed back to every transport.
    pub async fn handle_inbound(&self, text: &str) {
        self.touch();
        match wire::parse_client_command(text) {
            Ok(cmd) => self.feed_session.send(cmd).await,
            Err(err) => self.broadcast_control(wire::error_frame(&err)),
        }
    }

    pub fn touch(&self) {
        self.last_activity_ms.store(now_ms(), Ordering::Relaxed);
    }

    fn broadcast_control(&self, frame: String) {
        for q in self.transports.lock().unwrap().iter() {
            q.lock().unwrap().push_control(frame.clone());
        }
    }
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Spawn the broadcaster's dispatch loop: converts `FsEvent`s into wire
/// frames and fans them out to every attached transport, and watches
/// for cross-transport idle timeout.
pub fn spawn(
    user_id: i64,
    mut fs_events: mpsc::Receiver<FsEvent>,
    feed_session: FeedSessionHandle,
    config: FeedConfig,
) -> BroadcasterHandle {
    let handle = BroadcasterHandle {
        user_id,
        transports: Arc::new(StdMutex::new(Vec::new())),
        feed_session,
        last_activity_ms: Arc::new(AtomicI64::new(now_ms())),
        next_transport_id: Arc::new(AtomicU64::new(0)),
    };

    let dispatch_handle = handle.clone();
    tokio::spawn(async move {
        let mut idle_check = tokio::time::interval(Duration::from_secs(10));
        loop {
            tokio::select! {
                ev = fs_events.recv() => {
                    match ev {
                        Some(ev) => {
                            let (frame, is_market_update) = wire::to_wire_frame(&ev);
                            let txs = dispatch_handle.transports.lock().unwrap();
                            for q in txs.iter() {
                                let mut q = q.lock().unwrap();
                                if is_market_update {
                                    q.push_market_update(frame.clone());
                                } else {
                                    q.push_control(frame.clone());
                                }
                            }
                        }
                        None => {
                            log::debug!("feed session for user {user_id} closed its event stream, broadcaster shutting down");
                            crate::services::registry::remove(user_id);
                            break;
                        }
                    }
                }
                _ = idle_check.tick() => {
                    let idle_for_ms = now_ms() - dispatch_handle.last_activity_ms.load(Ordering::Relaxed);
                    let timeout_ms = (config.idle_session_timeout_s as i64) * 1000;
                    if idle_for_ms > timeout_ms {
                        log::info!("user {user_id} idle past {}s, expiring session", config.idle_session_timeout_s);
                        dispatch_handle.broadcast_control(wire::session_expired_frame());
                        crate::services::registry::remove(user_id);
                        break;
                    }
                }
            }
        }
    });

    handle
}

async fn run_writer<S: OutboundSink>(queue: SharedQueue, mut sink: S) {
    // Poll on a short tick rather than a `Notify`: the teacher's
    // connector tasks (`services/market_data.rs`) favor simple polling
    // loops over condvar-style wakeups for low-volume outbound paths.
    let mut tick = tokio::time::interval(Duration::from_millis(20));
    loop {
        tick.tick().await;
        loop {
            let frame = { queue.lock().unwrap().pop() };
            let Some(frame) = frame else { break };
            if sink.send_text(frame).await.is_err() {
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct RecordingSink {
        frames: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl OutboundSink for RecordingSink {
        async fn send_text(&mut self, frame: String) -> Result<(), ()> {
            self.frames.lock().unwrap().push(frame);
            Ok(())
        }
    }

    #[test]
    fn market_updates_coalesce_to_the_latest() {
        let mut q = TransportQueue::new();
        q.push_market_update("{\"seq\":1}".into());
        q.push_market_update("{\"seq\":2}".into());
        assert_eq!(q.pop(), Some("{\"seq\":2}".into()));
        assert_eq!(q.pop(), None);
    }

    #[test]
    fn control_frames_never_overwrite_each_other() {
        let mut q = TransportQueue::new();
        q.push_control("a".into());
        q.push_control("b".into());
        assert_eq!(q.pop(), Some("a".into()));
        assert_eq!(q.pop(), Some("b".into()));
    }

    #[test]
    fn control_frames_drain_before_the_market_update_slot() {
        let mut q = TransportQueue::new();
        q.push_market_update("mu".into());
        q.push_control("ctrl".into());
        assert_eq!(q.pop(), Some("ctrl".into()));
        assert_eq!(q.pop(), Some("mu".into()));
    }

    #[tokio::test]
    async fn attached_transport_receives_broadcast_control_frames() {
        let (_fs_handle, _fs_rx) = crate::services::feed_session::spawn(
            1,
            FeedConfig::default(),
            Arc::new(crate::services::catalog::FixtureCatalog::new()),
            Arc::new(crate::services::credential_store::FixtureCredentialStore::default()),
            "ws://localhost:1".into(),
            "token".into(),
        );
        let (_tx, rx) = mpsc::channel(8);
        let handle = spawn(1, rx, _fs_handle, FeedConfig::default());
        let frames = Arc::new(Mutex::new(Vec::new()));
        handle.attach(RecordingSink { frames: frames.clone() });
        handle.broadcast_control("hello".into());
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(frames.lock().unwrap().as_slice(), ["hello".to_string()]);
    }
}
