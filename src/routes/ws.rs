//! WebSocket upgrade route: `GET /ws` (SPEC_FULL.md §6 "WebSocket endpoint").
//!
//! Verifies the session JWT the way `middleware/auth.rs` verifies its
//! `StdClaims`, attaches to (or creates) the user's Feed Session via the
//! `Registry`, and pumps the `actix-ws` session/message-stream pair into
//! the Session Broadcaster. Built as a plain task-per-connection, the
//! same style `services/broker_feed` uses for the upstream leg, rather
//! than an actor.

use std::sync::Arc;
use std::time::{Duration, Instant};

use actix_web::{get, web, Error, HttpRequest, HttpResponse};
use async_trait::async_trait;
use futures_util::StreamExt;
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::Deserialize;

use crate::config::settings::{FeedConfig, Settings};
use crate::services::broadcaster::OutboundSink;
use crate::services::catalog::InstrumentCatalog;
use crate::services::credential_store::CredentialStore;
use crate::services::registry;

#[derive(Debug, Deserialize)]
struct StdClaims {
    sub: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WsQuery {
    session: Option<String>,
}

/// Authorization header, falling back to a `?session=` query param
/// (browsers can't set headers on the WS upgrade request).
fn bearer_token(req: &HttpRequest, query: &WsQuery) -> Option<String> {
    req.headers()
        .get("Authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.strip_prefix("Bearer "))
        .map(str::to_owned)
        .or_else(|| query.session.clone())
}

fn authenticate(req: &HttpRequest, query: &WsQuery, jwt_secret: &str) -> Option<i64> {
    let token = bearer_token(req, query)?;
    let data = decode::<StdClaims>(
        &token,
        &DecodingKey::from_secret(jwt_secret.as_bytes()),
        &Validation::new(Algorithm::HS256),
    )
    .ok()?;
    data.claims.sub?.parse::<i64>().ok()
}

struct ActixSink {
    session: actix_ws::Session,
}

#[async_trait]
impl OutboundSink for ActixSink {
    async fn send_text(&mut self, frame: String) -> Result<(), ()> {
        self.session.text(frame).await.map_err(|_| ())
    }
}

#[get("/ws")]
pub async fn ws_route(
    req: HttpRequest,
    stream: web::Payload,
    query: web::Query<WsQuery>,
    settings: web::Data<Settings>,
    feed_config: web::Data<FeedConfig>,
    catalog: web::Data<Arc<dyn InstrumentCatalog>>,
    credential_store: web::Data<Arc<dyn CredentialStore>>,
) -> Result<HttpResponse, Error> {
    let Some(user_id) = authenticate(&req, &query, &settings.jwt_secret) else {
        return Ok(HttpResponse::Unauthorized().finish());
    };

    let (response, mut session, mut msg_stream) = actix_ws::handle(&req, stream)?;

    let credential_store = credential_store.get_ref().clone();

    if !credential_store.is_valid(user_id).await {
        let _ = session.close(None).await;
        return Ok(response);
    }

    let config: FeedConfig = *feed_config.get_ref();
    let user_session = registry::get_or_create(
        user_id,
        config,
        catalog.get_ref().clone(),
        credential_store,
        settings.broker_ws_url.clone(),
        settings.broker_bearer_token.clone(),
    );

    user_session
        .broadcaster
        .attach(ActixSink { session: session.clone() });

    actix_web::rt::spawn(async move {
        let mut last_pong = Instant::now();
        let mut heartbeat = tokio::time::interval(Duration::from_secs(config.heartbeat_interval_s));

        loop {
            tokio::select! {
                msg = msg_stream.next() => {
                    match msg {
                        Some(Ok(actix_ws::Message::Text(text))) => {
                            user_session.broadcaster.handle_inbound(&text).await;
                        }
                        Some(Ok(actix_ws::Message::Pong(_))) => {
                            last_pong = Instant::now();
                        }
                        Some(Ok(actix_ws::Message::Close(_))) | None => break,
                        Some(Err(e)) => {
                            log::debug!("ws read error for user {user_id}: {e}");
                            break;
                        }
                        _ => {}
                    }
                }
                _ = heartbeat.tick() => {
                    if last_pong.elapsed() > Duration::from_secs(config.heartbeat_timeout_s) {
                        log::info!("user {user_id} missed heartbeat, closing transport");
                        break;
                    }
                    if session.ping(b"").await.is_err() {
                        break;
                    }
                }
            }
        }

        let _ = session.close(None).await;
    });

    Ok(response)
}

pub fn ws_scope() -> actix_web::Scope {
    web::scope("").service(ws_route)
}
