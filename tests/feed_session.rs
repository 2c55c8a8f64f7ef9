//! End-to-end coverage for the Feed Session entry points, exercised the
//! way `tests/routes.rs`/`tests/simple_routes.rs` exercised the actix
//! `App` in the teacher repo: real task, fixture collaborators, no
//! mocking framework.

use std::sync::Arc;
use std::time::Duration;

use optrelay_backend::config::settings::FeedConfig;
use optrelay_backend::domain::chain::{OptionChain, StrikeRow};
use optrelay_backend::domain::instrument::InstrumentKey;
use optrelay_backend::domain::status::FeedStatus;
use optrelay_backend::services::catalog::FixtureCatalog;
use optrelay_backend::services::credential_store::{CredentialStore, FixtureCredentialStore};
use optrelay_backend::services::feed_session::events::{ClientCommand, FsEvent};
use optrelay_backend::services::feed_session::spawn;

fn nifty_chain(step: i64) -> OptionChain {
    let rows = (-4..=4)
        .map(|k| {
            let strike = 23_500 + k * step;
            StrikeRow {
                strike,
                call_key: InstrumentKey::normalize(&format!("NSE_FO|NIFTY{strike}CE")),
                put_key: InstrumentKey::normalize(&format!("NSE_FO|NIFTY{strike}PE")),
                lot_size: 50,
                trading_symbol_call: format!("NIFTY{strike}CE"),
                trading_symbol_put: format!("NIFTY{strike}PE"),
            }
        })
        .collect();
    OptionChain { step, rows }
}

#[tokio::test]
async fn switching_to_an_unknown_underlying_surfaces_a_catalog_error() {
    let catalog = Arc::new(FixtureCatalog::new());
    let credentials = Arc::new(FixtureCredentialStore::default());
    let (handle, mut events) = spawn(
        1,
        FeedConfig::default(),
        catalog,
        credentials,
        "ws://127.0.0.1:1".into(),
        "token".into(),
    );

    handle
        .send(ClientCommand::SwitchUnderlying {
            underlying_key: InstrumentKey::normalize("NSE_INDEX|Nifty 50"),
            expiry_date: Some("2025-03-27".into()),
            requested_keys: Vec::new(),
        })
        .await;

    let ev = tokio::time::timeout(Duration::from_secs(2), events.recv())
        .await
        .expect("event within timeout")
        .expect("channel open");

    assert!(matches!(ev, FsEvent::Error(_)), "expected an Error frame, got {ev:?}");
}

#[tokio::test]
async fn switching_to_a_known_underlying_announces_connecting_before_upstream_settles() {
    let underlying = InstrumentKey::normalize("NSE_INDEX|Nifty 50");
    let catalog = Arc::new(FixtureCatalog::new().with_chain(&underlying, "2025-03-27", nifty_chain(50)));
    let credentials = Arc::new(FixtureCredentialStore::default());
    let (handle, mut events) = spawn(
        2,
        FeedConfig::default(),
        catalog,
        credentials,
        "ws://127.0.0.1:1".into(),
        "token".into(),
    );

    handle
        .send(ClientCommand::SwitchUnderlying {
            underlying_key: underlying.clone(),
            expiry_date: Some("2025-03-27".into()),
            requested_keys: Vec::new(),
        })
        .await;

    let ev = tokio::time::timeout(Duration::from_secs(2), events.recv())
        .await
        .expect("event within timeout")
        .expect("channel open");

    match ev {
        FsEvent::FeedState { status, underlying: u, version, .. } => {
            assert_eq!(status, FeedStatus::Connecting);
            assert_eq!(u, underlying);
            assert_eq!(version, 0);
        }
        other => panic!("expected FeedState{{Connecting}}, got {other:?}"),
    }
}

#[tokio::test]
async fn invalid_credentials_short_circuit_a_switch_request() {
    let underlying = InstrumentKey::normalize("NSE_INDEX|Nifty 50");
    let catalog = Arc::new(FixtureCatalog::new().with_chain(&underlying, "2025-03-27", nifty_chain(50)));
    let credentials = Arc::new(FixtureCredentialStore::default());
    credentials.mark_token_expired(3).await;

    let (handle, mut events) = spawn(
        3,
        FeedConfig::default(),
        catalog,
        credentials,
        "ws://127.0.0.1:1".into(),
        "token".into(),
    );

    handle
        .send(ClientCommand::SwitchUnderlying {
            underlying_key: underlying,
            expiry_date: Some("2025-03-27".into()),
            requested_keys: Vec::new(),
        })
        .await;

    let ev = tokio::time::timeout(Duration::from_secs(2), events.recv())
        .await
        .expect("event within timeout")
        .expect("channel open");

    assert!(matches!(ev, FsEvent::Error(_)));
}
