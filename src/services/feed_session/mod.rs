//! Feed Session (FS): the per-user state machine that binds a client to
//! a live market view. Owns the active underlying, ATM, live-strike
//! window, per-instrument sequence counters, last-known ticks, pending
//! switch state, and the update buffer. Consumes from the Broker Feed
//! Client, delegates to the Analytics Engine, emits to the Session
//! Broadcaster (SPEC_FULL.md §4.4).

pub mod atm;
pub mod events;
pub mod state;
pub mod window_rebuild;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{NaiveDate, Utc};
use futures::stream::FuturesUnordered;
use futures_util::StreamExt;
use tokio::sync::{mpsc, oneshot};

use crate::config::settings::FeedConfig;
use crate::domain::chain::OptionChain;
use crate::domain::instrument::InstrumentKey;
use crate::domain::pending_switch::{PendingSwitch, PendingSwitchOutcome};
use crate::domain::session_config::SessionConfig;
use crate::domain::status::{FeedStatus, FeedTransitionEvent};
use crate::domain::tick::{accepts_seq, Tick, TickDelta};
use crate::domain::window::LiveWindow;
use crate::services::analytics::worker::{AnalyticsPool, DeriveJob};
use crate::services::analytics::{AnalyticsRequest, AnalyticsResult, OptionType};
use crate::services::broker_feed::events::{BfcEvent, FeedMode};
use crate::services::broker_feed::BrokerFeedClient;
use crate::services::catalog::InstrumentCatalog;
use crate::services::credential_store::CredentialStore;
use crate::utils::errors::{CatalogError, FeedError};

use events::{ClientCommand, FsEvent};
use state::{InstrumentState, PendingRebuild, UpdateBuffer, HYSTERESIS_MISSES_BEFORE_PURGE};
use window_rebuild::plan_rebuild;

/// Assumed flat risk-free rate and dividend yield for the Analytics
/// Engine; the upstream feed never supplies either, and a per-underlying
/// curve is out of scope for this core (SPEC_FULL.md §4.3 treats AE as
/// a pure function of its inputs, not a source of market rates).
const ASSUMED_RISK_FREE_RATE: f64 = 0.065;
const ASSUMED_DIVIDEND_YIELD: f64 = 0.0;

/// Cheap-to-clone handle a caller (the Session Broadcaster, or a route
/// attaching a fresh transport) uses to deliver client commands into a
/// running Feed Session.
#[derive(Clone)]
pub struct FeedSessionHandle {
    pub user_id: i64,
    cmd_tx: mpsc::Sender<ClientCommand>,
}

impl FeedSessionHandle {
    pub async fn send(&self, cmd: ClientCommand) {
        let _ = self.cmd_tx.send(cmd).await;
    }
}

/// Spawn a Feed Session's ingest task and return a handle plus the
/// event stream it produces toward the Session Broadcaster.
pub fn spawn(
    user_id: i64,
    config: FeedConfig,
    catalog: Arc<dyn InstrumentCatalog>,
    credential_store: Arc<dyn CredentialStore>,
    broker_ws_url: String,
    broker_bearer_token: String,
) -> (FeedSessionHandle, mpsc::Receiver<FsEvent>) {
    let (cmd_tx, cmd_rx) = mpsc::channel(64);
    let (event_tx, event_rx) = mpsc::channel(1024);

    tokio::spawn(run(
        user_id,
        config,
        catalog,
        credential_store,
        broker_ws_url,
        broker_bearer_token,
        cmd_rx,
        event_tx,
    ));

    (FeedSessionHandle { user_id, cmd_tx }, event_rx)
}

/// Reverse lookup from an option instrument key back to its strike and
/// leg, needed to feed the Analytics Engine.
#[derive(Clone, Copy)]
struct LegInfo {
    strike: i64,
    option_type: OptionType,
}

struct Fs {
    user_id: i64,
    config: FeedConfig,
    catalog: Arc<dyn InstrumentCatalog>,
    credential_store: Arc<dyn CredentialStore>,
    broker_ws_url: String,
    broker_bearer_token: String,

    status: FeedStatus,
    session: Option<SessionConfig>,
    chain: Option<OptionChain>,
    window: Option<LiveWindow>,
    legs: HashMap<InstrumentKey, LegInfo>,
    atm: Option<atm::AtmTracker>,
    version: u64,

    states: HashMap<InstrumentKey, InstrumentState>,
    buffer: UpdateBuffer,

    bfc: Option<BrokerFeedClient>,
    awaiting_first_tick: bool,
    switch_deadline: Option<Instant>,
    pending_rebuild: Option<PendingRebuild>,
    pending_switch: Option<PendingSwitch>,

    market_closed_notified: bool,
    last_underlying_tick_at: Instant,
    terminal: bool,

    analytics: AnalyticsPool,
    seq_counter: u64,
}

impl Fs {
    fn new(
        user_id: i64,
        config: FeedConfig,
        catalog: Arc<dyn InstrumentCatalog>,
        credential_store: Arc<dyn CredentialStore>,
        broker_ws_url: String,
        broker_bearer_token: String,
    ) -> Self {
        let analytics = AnalyticsPool::spawn(
            config.analytics_worker_count,
            Duration::from_millis(config.analytics_soft_deadline_ms),
        );
        Self {
            user_id,
            config,
            catalog,
            credential_store,
            broker_ws_url,
            broker_bearer_token,
            status: FeedStatus::Disconnected,
            session: None,
            chain: None,
            window: None,
            legs: HashMap::new(),
            atm: None,
            version: 0,
            states: HashMap::new(),
            buffer: UpdateBuffer::default(),
            bfc: None,
            awaiting_first_tick: false,
            switch_deadline: None,
            pending_rebuild: None,
            pending_switch: None,
            market_closed_notified: false,
            last_underlying_tick_at: Instant::now(),
            terminal: false,
            analytics,
            seq_counter: 0,
        }
    }

    fn transition(&mut self, ev: FeedTransitionEvent) {
        if let Some(next) = self.status.next(ev) {
            self.status = next;
        }
    }

    fn underlying_key(&self) -> Option<&InstrumentKey> {
        self.session.as_ref().map(|s| &s.underlying_key)
    }
}

async fn run(
    user_id: i64,
    config: FeedConfig,
    catalog: Arc<dyn InstrumentCatalog>,
    credential_store: Arc<dyn CredentialStore>,
    broker_ws_url: String,
    broker_bearer_token: String,
    mut cmd_rx: mpsc::Receiver<ClientCommand>,
    event_tx: mpsc::Sender<FsEvent>,
) {
    let mut fs = Fs::new(
        user_id,
        config,
        catalog,
        credential_store,
        broker_ws_url,
        broker_bearer_token,
    );
    let mut bfc_events: Option<mpsc::Receiver<BfcEvent>> = None;
    let mut analytics_inflight: FuturesUnordered<oneshot::Receiver<(InstrumentKey, AnalyticsResult)>> =
        FuturesUnordered::new();

    let mut flush_timer = tokio::time::interval(Duration::from_millis(fs.config.flush_interval_ms));
    let mut health_timer = tokio::time::interval(Duration::from_millis(fs.config.health_interval_ms));

    loop {
        let far_future = Instant::now() + Duration::from_secs(3600);
        let rebuild_deadline = fs.pending_rebuild.as_ref().map(|p| p.deadline).unwrap_or(far_future);
        let switch_deadline = fs.switch_deadline.unwrap_or(far_future);

        tokio::select! {
            cmd = cmd_rx.recv() => {
                match cmd {
                    Some(cmd) => handle_client_command(&mut fs, cmd, &mut bfc_events, &event_tx).await,
                    None => break, // caller dropped the handle; session torn down
                }
            }

            bfc_event = recv_bfc_event(&mut bfc_events) => {
                match bfc_event {
                    Some(ev) => {
                        let reconnect_events = handle_bfc_event(&mut fs, ev, &mut analytics_inflight, &event_tx).await;
                        if reconnect_events {
                            retry_pending_switch(&mut fs, &mut bfc_events, &event_tx).await;
                        }
                    }
                    None => { bfc_events = None; }
                }
            }

            Some(Ok((key, result))) = analytics_inflight.next(), if !analytics_inflight.is_empty() => {
                apply_analytics_result(&mut fs, key, result);
            }

            _ = tokio::time::sleep_until(rebuild_deadline.into()), if fs.pending_rebuild.is_some() => {
                finalize_pending_rebuild(&mut fs, &event_tx).await;
            }

            _ = tokio::time::sleep_until(switch_deadline.into()), if fs.switch_deadline.is_some() => {
                fs.switch_deadline = None;
                let _ = event_tx.send(FsEvent::Error(FeedError::SwitchTimeout)).await;
            }

            _ = flush_timer.tick() => {
                flush(&mut fs, &event_tx).await;
            }

            _ = health_timer.tick() => {
                check_market_hours(&mut fs, &event_tx).await;
                if fs.pending_switch.is_some() {
                    retry_pending_switch(&mut fs, &mut bfc_events, &event_tx).await;
                }
                emit_health(&fs, &event_tx).await;
            }
        }
    }
}

async fn recv_bfc_event(rx: &mut Option<mpsc::Receiver<BfcEvent>>) -> Option<BfcEvent> {
    match rx {
        Some(r) => r.recv().await,
        None => std::future::pending().await,
    }
}

async fn handle_client_command(
    fs: &mut Fs,
    cmd: ClientCommand,
    bfc_events: &mut Option<mpsc::Receiver<BfcEvent>>,
    event_tx: &mpsc::Sender<FsEvent>,
) {
    match cmd {
        ClientCommand::ClientHello => {}
        ClientCommand::Ping { .. } => {}
        ClientCommand::AdvisorySubscribe(keys) => {
            log::debug!("ignoring advisory subscribe from user {} ({} keys): FS is authoritative", fs.user_id, keys.len());
        }
        ClientCommand::AdvisoryUnsubscribe(keys) => {
            log::debug!("ignoring advisory unsubscribe from user {} ({} keys)", fs.user_id, keys.len());
        }
        ClientCommand::SwitchUnderlying { underlying_key, expiry_date, requested_keys } => {
            let expiry = expiry_date.unwrap_or_else(|| {
                fs.session.as_ref().map(|s| s.expiry.clone()).unwrap_or_default()
            });
            begin_switch(fs, underlying_key, expiry, requested_keys, bfc_events, event_tx).await;
        }
        ClientCommand::SwitchExpiry { expiry_date } => {
            if let Some(underlying) = fs.underlying_key().cloned() {
                begin_switch(fs, underlying, expiry_date, Vec::new(), bfc_events, event_tx).await;
            }
        }
    }
}

async fn begin_switch(
    fs: &mut Fs,
    underlying_key: InstrumentKey,
    expiry: String,
    requested_keys: Vec<InstrumentKey>,
    bfc_events: &mut Option<mpsc::Receiver<BfcEvent>>,
    event_tx: &mpsc::Sender<FsEvent>,
) {
    if fs.terminal {
        let _ = event_tx
            .send(FsEvent::Error(FeedError::Unavailable(
                "session unavailable until reauthorized".into(),
            )))
            .await;
        return;
    }

    if !fs.credential_store.is_valid(fs.user_id).await {
        fs.terminal = true;
        fs.status = FeedStatus::Unavailable;
        let _ = event_tx.send(FsEvent::Error(FeedError::BrokerTokenInvalid)).await;
        return;
    }

    let step = match fs.catalog.step_for(&underlying_key, &expiry).await {
        Ok(s) => s,
        Err(CatalogError::Unavailable(_)) => {
            log::warn!("catalog unavailable for user {}'s switch to {underlying_key}, queuing retry", fs.user_id);
            fs.pending_switch = Some(PendingSwitch::new(underlying_key, requested_keys, expiry, Utc::now()));
            return;
        }
        Err(e) => {
            let _ = event_tx.send(FsEvent::Error(FeedError::from(e))).await;
            return;
        }
    };

    // Tear down whatever window/state the previous underlying held; a
    // fresh underlying means every prior instrument goes stale at once.
    fs.window = None;
    fs.chain = None;
    fs.legs.clear();
    fs.states.clear();
    fs.buffer = UpdateBuffer::default();
    fs.atm = None;
    fs.pending_rebuild = None;
    fs.market_closed_notified = false;

    fs.session = Some(SessionConfig::new(
        fs.user_id,
        underlying_key.clone(),
        expiry.clone(),
        step,
        fs.config.live_window_half_width,
    ));
    fs.awaiting_first_tick = true;
    fs.switch_deadline = Some(Instant::now() + Duration::from_millis(fs.config.reset_deadline_ms));

    if !requested_keys.is_empty() {
        log::debug!(
            "user {}: advisory requested_keys ({} keys) logged, not used to shape subscriptions",
            fs.user_id,
            requested_keys.len()
        );
    }

    fs.transition(FeedTransitionEvent::SwitchRequested);
    let _ = event_tx
        .send(FsEvent::FeedState {
            status: fs.status,
            underlying: underlying_key.clone(),
            current_atm: 0,
            live_strikes: Vec::new(),
            max_strike_distance: 0,
            version: fs.version,
        })
        .await;

    match &fs.bfc {
        Some(bfc) => {
            bfc.subscribe(vec![underlying_key], FeedMode::Full).await;
        }
        None => {
            let (bfc, rx) = BrokerFeedClient::connect(
                fs.broker_ws_url.clone(),
                fs.broker_bearer_token.clone(),
                fs.config.broker_reconnect_base_ms,
                fs.config.broker_reconnect_cap_ms,
            );
            bfc.subscribe(vec![underlying_key], FeedMode::Full).await;
            fs.bfc = Some(bfc);
            *bfc_events = Some(rx);
        }
    }
}

/// Returns `true` when the broker just (re)connected, the cue to retry
/// any switch queued behind a transient catalog outage.
async fn handle_bfc_event(
    fs: &mut Fs,
    ev: BfcEvent,
    analytics_inflight: &mut FuturesUnordered<oneshot::Receiver<(InstrumentKey, AnalyticsResult)>>,
    event_tx: &mpsc::Sender<FsEvent>,
) -> bool {
    match ev {
        BfcEvent::Connected => {
            let _ = event_tx.send(FsEvent::UpstoxFeedConnected).await;
            return true;
        }
        BfcEvent::Disconnected(reason) => {
            let _ = event_tx.send(FsEvent::UpstoxFeedDisconnected { reason }).await;
        }
        BfcEvent::AuthInvalid => {
            fs.terminal = true;
            fs.status = FeedStatus::Unavailable;
            fs.credential_store.mark_token_expired(fs.user_id).await;
            let _ = event_tx.send(FsEvent::Error(FeedError::BrokerTokenInvalid)).await;
        }
        BfcEvent::EntitlementDenied(msg) => {
            fs.terminal = true;
            fs.status = FeedStatus::Unavailable;
            let _ = event_tx.send(FsEvent::FeedUnavailable { msg }).await;
        }
        BfcEvent::UpstreamError { kind, msg } => {
            if kind == "MarketClosed" {
                fs.transition(FeedTransitionEvent::MarketClosedNotice);
                if !fs.market_closed_notified {
                    fs.market_closed_notified = true;
                    let _ = event_tx
                        .send(FsEvent::MarketStatusClosed { msg: "market closed".into() })
                        .await;
                }
            } else {
                log::warn!("upstream error ({kind}): {msg}");
            }
        }
        BfcEvent::Tick(key, tick) => {
            ingest_tick(fs, key, tick, analytics_inflight, event_tx).await;
        }
    }
    false
}

/// Re-attempt a switch that was queued because the catalog was
/// transiently unavailable when it was first requested.
async fn retry_pending_switch(
    fs: &mut Fs,
    bfc_events: &mut Option<mpsc::Receiver<BfcEvent>>,
    event_tx: &mpsc::Sender<FsEvent>,
) {
    let Some(mut pending) = fs.pending_switch.take() else { return };
    match pending.evaluate(Utc::now()) {
        PendingSwitchOutcome::Stale => {
            let _ = event_tx.send(FsEvent::Error(FeedError::ExpiryChanged)).await;
        }
        PendingSwitchOutcome::RetriesExhausted => {
            let _ = event_tx.send(FsEvent::Error(FeedError::SwitchTimeout)).await;
        }
        PendingSwitchOutcome::Proceed => {
            pending.bump_retry();
            match fs.catalog.step_for(&pending.new_underlying_key, &pending.expiry).await {
                Ok(_) => {
                    begin_switch(
                        fs,
                        pending.new_underlying_key,
                        pending.expiry,
                        pending.requested_keys,
                        bfc_events,
                        event_tx,
                    )
                    .await;
                }
                Err(_) => {
                    fs.pending_switch = Some(pending);
                }
            }
        }
    }
}

async fn ingest_tick(
    fs: &mut Fs,
    key: InstrumentKey,
    tick: Tick,
    analytics_inflight: &mut FuturesUnordered<oneshot::Receiver<(InstrumentKey, AnalyticsResult)>>,
    event_tx: &mpsc::Sender<FsEvent>,
) {
    let has_state = fs.states.contains_key(&key);
    let applied_seq = fs.states.get(&key).map(|s| s.tick.seq).unwrap_or(0);
    if !accepts_seq(applied_seq, tick.seq, has_state) {
        return; // sequence regression: silently dropped per SPEC_FULL.md §4.4.4
    }
    if has_state && tick.seq > applied_seq + 1 {
        log::warn!("sequence gap for {key}: {applied_seq} -> {tick.seq}");
    }

    let entry = fs.states.entry(key.clone()).or_default();
    entry.tick.merge_from(&tick);
    entry.misses = 0;
    let merged = entry.tick.clone();

    let is_underlying = fs.underlying_key() == Some(&key);

    if is_underlying {
        fs.last_underlying_tick_at = Instant::now();
        if let Some(spot) = merged.ltp {
            if fs.awaiting_first_tick {
                establish_initial_window(fs, spot, event_tx).await;
            } else {
                evaluate_atm_trigger(fs, spot, event_tx).await;
            }
        }
    } else if let Some(leg) = fs.legs.get(&key).copied() {
        if merged.missing_analytics() {
            let now_ms = Utc::now().timestamp_millis();
            if now_ms - entry.last_derive_ts_ms >= fs.config.analytics_min_interval_ms {
                entry.last_derive_ts_ms = now_ms;
                if let Some(spot) = fs.underlying_key().and_then(|u| fs.states.get(u)).and_then(|s| s.tick.ltp) {
                    submit_analytics(fs, key.clone(), leg, spot, &merged, analytics_inflight);
                }
            }
        }
    }

    // First tick for an awaited key settles the rebuild immediately
    // rather than waiting out the full deadline (SPEC_FULL.md §4.4.3
    // step 5: first tick or deadline, whichever is first).
    let awaited = fs.pending_rebuild.as_ref().map_or(false, |p| p.awaiting.contains(&key));

    fs.buffer.record(key, merged);

    if awaited {
        finalize_pending_rebuild(fs, event_tx).await;
    }
}

fn submit_analytics(
    fs: &Fs,
    key: InstrumentKey,
    leg: LegInfo,
    spot: f64,
    tick: &Tick,
    analytics_inflight: &mut FuturesUnordered<oneshot::Receiver<(InstrumentKey, AnalyticsResult)>>,
) {
    let Some(session) = &fs.session else { return };
    let t_years = years_to_expiry(&session.expiry);
    let (tx, rx) = oneshot::channel();
    fs.analytics.try_submit(DeriveJob {
        key,
        request: AnalyticsRequest {
            spot,
            strike: leg.strike as f64,
            option_type: leg.option_type,
            t_years,
            rate: ASSUMED_RISK_FREE_RATE,
            dividend_yield: ASSUMED_DIVIDEND_YIELD,
            observed_price: tick.ltp,
            observed_iv: tick.iv,
        },
        reply: tx,
    });
    analytics_inflight.push(rx);
}

fn years_to_expiry(expiry: &str) -> f64 {
    match NaiveDate::parse_from_str(expiry, "%Y-%m-%d") {
        Ok(date) => {
            let today = Utc::now().date_naive();
            let days = (date - today).num_days().max(0);
            (days as f64) / 365.0
        }
        Err(_) => 0.0,
    }
}

fn apply_analytics_result(fs: &mut Fs, key: InstrumentKey, result: AnalyticsResult) {
    if result.invalid_inputs {
        return;
    }
    if let Some(state) = fs.states.get_mut(&key) {
        state.tick.iv = result.iv;
        state.tick.delta = Some(result.delta);
        state.tick.gamma = Some(result.gamma);
        state.tick.theta = Some(result.theta);
        state.tick.vega = Some(result.vega);
        fs.buffer.record(key, state.tick.clone());
    }
}

/// The very first underlying tick after a switch: now we know spot, so
/// we can ask the catalog for a chain and build the initial window
/// (equivalent to an ATM rebuild from `old: None`).
async fn establish_initial_window(fs: &mut Fs, spot: f64, event_tx: &mpsc::Sender<FsEvent>) {
    let Some(session) = fs.session.clone() else { return };
    let atm = crate::domain::window::round_to_step(spot, session.step);

    let chain = match fs
        .catalog
        .chain_around(&session.underlying_key, &session.expiry, atm, session.half_width)
        .await
    {
        Ok(c) => c,
        Err(e) => {
            let _ = event_tx.send(FsEvent::Error(FeedError::from(e))).await;
            return;
        }
    };

    fs.version += 1;
    let plan = plan_rebuild(&session.underlying_key, &chain, atm, session.half_width, fs.version, None);

    if let Some(bfc) = &fs.bfc {
        if !plan.add.is_empty() {
            bfc.subscribe(plan.add.clone(), FeedMode::Full).await;
        }
    }

    rebuild_leg_index(fs, &chain);
    fs.chain = Some(chain);
    fs.atm = Some(atm::AtmTracker::new(atm, session.step));
    fs.awaiting_first_tick = false;
    fs.switch_deadline = None;
    fs.transition(FeedTransitionEvent::SubscriptionSettled);

    let _ = event_tx
        .send(FsEvent::FeedState {
            status: fs.status,
            underlying: session.underlying_key.clone(),
            current_atm: atm,
            live_strikes: plan.window.live_strikes.iter().copied().collect(),
            max_strike_distance: plan.window.max_strike_distance(),
            version: fs.version,
        })
        .await;
    let _ = event_tx
        .send(FsEvent::SubscriptionAck {
            count: plan.window.subscribed_keys.len(),
            underlying: session.underlying_key,
        })
        .await;

    fs.window = Some(plan.window);
}

async fn evaluate_atm_trigger(fs: &mut Fs, spot: f64, event_tx: &mpsc::Sender<FsEvent>) {
    let Some(tracker) = fs.atm.as_mut() else { return };
    let now_ms = Utc::now().timestamp_millis();
    let Some(candidate) = tracker.observe(spot, now_ms, fs.config.atm_hysteresis_ms) else { return };

    if let Some(pending) = fs.pending_rebuild.as_mut() {
        // A rebuild is already in flight; coalesce to one further
        // rebuild at the latest observed ATM (SPEC_FULL.md §4.4.3 step 6).
        pending.superseded_by = Some(candidate);
        return;
    }

    start_rebuild(fs, candidate, event_tx).await;
}

async fn start_rebuild(fs: &mut Fs, candidate_atm: i64, event_tx: &mpsc::Sender<FsEvent>) {
    let (Some(session), Some(chain)) = (fs.session.clone(), fs.chain.clone()) else { return };

    let new_chain = match fs
        .catalog
        .chain_around(&session.underlying_key, &session.expiry, candidate_atm, session.half_width)
        .await
    {
        Ok(c) => c,
        Err(_) => chain, // keep the existing chain slice; a transient catalog hiccup shouldn't stall the window
    };

    fs.version += 1;
    let plan = plan_rebuild(
        &session.underlying_key,
        &new_chain,
        candidate_atm,
        session.half_width,
        fs.version,
        fs.window.as_ref(),
    );

    fs.transition(FeedTransitionEvent::AtmRebuildTriggered);
    let _ = event_tx
        .send(FsEvent::FeedState {
            status: fs.status,
            underlying: session.underlying_key.clone(),
            current_atm: candidate_atm,
            live_strikes: Vec::new(),
            max_strike_distance: plan.window.max_strike_distance(),
            version: fs.version,
        })
        .await;

    if let Some(bfc) = &fs.bfc {
        if !plan.add.is_empty() {
            bfc.subscribe(plan.add.clone(), FeedMode::Full).await;
        }
        if !plan.drop.is_empty() {
            bfc.unsubscribe(plan.drop.clone()).await;
        }
    }

    rebuild_leg_index(fs, &new_chain);
    fs.chain = Some(new_chain);

    let awaiting = plan.add.iter().cloned().collect();
    fs.pending_rebuild = Some(PendingRebuild {
        new_window: plan.window,
        awaiting,
        deadline: Instant::now() + Duration::from_millis(fs.config.atm_rebuild_settle_ms),
        superseded_by: None,
    });
}

async fn finalize_pending_rebuild(fs: &mut Fs, event_tx: &mpsc::Sender<FsEvent>) {
    let Some(pending) = fs.pending_rebuild.take() else { return };
    let atm = pending.new_window.atm_strike;

    fs.window = Some(pending.new_window.clone());
    if let Some(tracker) = fs.atm.as_mut() {
        tracker.commit(atm);
    }
    purge_stale_instruments(fs);
    fs.transition(FeedTransitionEvent::SubscriptionSettled);

    let Some(session) = &fs.session else { return };
    let _ = event_tx
        .send(FsEvent::FeedState {
            status: fs.status,
            underlying: session.underlying_key.clone(),
            current_atm: atm,
            live_strikes: pending.new_window.live_strikes.iter().copied().collect(),
            max_strike_distance: pending.new_window.max_strike_distance(),
            version: fs.version,
        })
        .await;

    if let Some(next_atm) = pending.superseded_by {
        start_rebuild(fs, next_atm, event_tx).await;
    }
}

/// An instrument leaves the live set once, survives with hysteresis;
/// leaving twice in a row purges it (SPEC_FULL.md §3).
fn purge_stale_instruments(fs: &mut Fs) {
    let Some(window) = &fs.window else { return };
    let live: std::collections::HashSet<_> = fs.legs
        .iter()
        .filter(|(_, leg)| window.live_strikes.contains(&leg.strike))
        .map(|(k, _)| k.clone())
        .collect();
    let underlying = fs.underlying_key().cloned();

    fs.states.retain(|key, state| {
        if live.contains(key) || underlying.as_ref() == Some(key) {
            state.misses = 0;
            true
        } else {
            state.misses += 1;
            state.misses < HYSTERESIS_MISSES_BEFORE_PURGE
        }
    });
}

fn rebuild_leg_index(fs: &mut Fs, chain: &OptionChain) {
    fs.legs.clear();
    for row in &chain.rows {
        fs.legs.insert(row.call_key.clone(), LegInfo { strike: row.strike, option_type: OptionType::Call });
        fs.legs.insert(row.put_key.clone(), LegInfo { strike: row.strike, option_type: OptionType::Put });
    }
}

async fn flush(fs: &mut Fs, event_tx: &mpsc::Sender<FsEvent>) {
    let spot_ltp = fs
        .underlying_key()
        .and_then(|u| fs.states.get(u))
        .and_then(|s| s.tick.ltp);

    if let (Some(underlying), Some(spot)) = (fs.underlying_key().cloned(), spot_ltp) {
        if spot > 0.0 && !fs.buffer_contains(&underlying) {
            fs.seq_counter += 1;
            fs.buffer.record(
                underlying,
                Tick {
                    ltp: Some(spot),
                    seq: fs.seq_counter,
                    recv_ts: Utc::now().timestamp_millis(),
                    synthetic_flag: true,
                    ..Default::default()
                },
            );
        }
    }

    if fs.buffer.is_empty() {
        return;
    }

    let deltas: HashMap<InstrumentKey, TickDelta> = fs
        .buffer
        .take()
        .into_iter()
        .map(|(key, tick)| (key, TickDelta::from(&tick)))
        .collect();

    if !deltas.is_empty() {
        let _ = event_tx.send(FsEvent::MarketUpdate(deltas)).await;
    }
}

impl Fs {
    fn buffer_contains(&self, key: &InstrumentKey) -> bool {
        self.buffer.contains_key(key)
    }
}

async fn check_market_hours(fs: &mut Fs, event_tx: &mpsc::Sender<FsEvent>) {
    if !matches!(fs.status, FeedStatus::Live | FeedStatus::Resetting) {
        return;
    }
    let silent_for = fs.last_underlying_tick_at.elapsed();
    if silent_for > Duration::from_secs(60) && outside_market_hours(Utc::now()) {
        fs.transition(FeedTransitionEvent::HeartbeatSilenceOutsideMarketHours);
        if !fs.market_closed_notified {
            fs.market_closed_notified = true;
            let _ = event_tx
                .send(FsEvent::MarketStatusClosed { msg: "market closed".into() })
                .await;
        }
    }
}

/// Coarse weekday 09:15-15:30 IST window. Good enough to decide "is the
/// silence expected", not a trading-calendar authority.
fn outside_market_hours(now: chrono::DateTime<Utc>) -> bool {
    use chrono::{Timelike, Datelike, Weekday};
    let ist = now + chrono::Duration::minutes(330);
    if matches!(ist.weekday(), Weekday::Sat | Weekday::Sun) {
        return true;
    }
    let minutes = ist.hour() * 60 + ist.minute();
    !(9 * 60 + 15..=15 * 60 + 30).contains(&minutes)
}

async fn emit_health(fs: &Fs, event_tx: &mpsc::Sender<FsEvent>) {
    let _ = event_tx
        .send(FsEvent::FeedHealth {
            state: fs.status,
            active_keys: fs.window.as_ref().map(|w| w.subscribed_keys.len()).unwrap_or(0),
            buffer_size: fs.buffer.len(),
            reset_locked: fs.pending_rebuild.is_some(),
        })
        .await;
}
