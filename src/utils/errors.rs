// src/utils/errors.rs

use std::{error::Error, fmt};
use tungstenite::Error as WsError;

/// Errors coming from external I/O (JSON, WS transport, DB).
#[derive(Debug)]
pub enum ApiError {
    Json(serde_json::Error),
    WebSocket(WsError),
    Db(sqlx::Error),
    Other(String),
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ApiError::Json(e) => write!(f, "JSON error: {}", e),
            ApiError::WebSocket(e) => write!(f, "WebSocket error: {}", e),
            ApiError::Db(e) => write!(f, "database error: {}", e),
            ApiError::Other(msg) => write!(f, "{}", msg),
        }
    }
}

impl Error for ApiError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            ApiError::Json(e) => Some(e),
            ApiError::WebSocket(e) => Some(e),
            ApiError::Db(e) => Some(e),
            ApiError::Other(_) => None,
        }
    }
}

// Conversions from underlying errors into ApiError
impl From<sqlx::Error> for ApiError {
    fn from(err: sqlx::Error) -> Self {
        ApiError::Db(err)
    }
}
impl From<serde_json::Error> for ApiError {
    fn from(err: serde_json::Error) -> Self {
        ApiError::Json(err)
    }
}
impl From<WsError> for ApiError {
    fn from(err: WsError) -> Self {
        ApiError::WebSocket(err)
    }
}

/// Errors surfaced by the Broker Feed Client.
#[derive(thiserror::Error, Debug)]
pub enum BfcError {
    #[error("upstream frame parse error: {0}")]
    ParseError(String),
    #[error("broker rejected the bearer credential")]
    AuthInvalid,
    #[error("broker denied entitlement: {0}")]
    EntitlementDenied(String),
    #[error("upstream connection closed: {0}")]
    Closed(String),
    #[error(transparent)]
    Transport(#[from] ApiError),
}

/// Errors surfaced by the Instrument Catalog collaborator.
#[derive(thiserror::Error, Debug, Clone)]
pub enum CatalogError {
    #[error("unknown instrument: {0}")]
    UnknownInstrument(String),
    #[error("unknown expiry: {0}")]
    UnknownExpiry(String),
    #[error("catalog temporarily unavailable: {0}")]
    Unavailable(String),
}

/// Errors surfaced to the client-facing `ERROR` frame by the Feed Session.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum FeedError {
    #[error("switch timed out before the new subscription settled")]
    SwitchTimeout,
    #[error("expiry changed while a switch was pending")]
    ExpiryChanged,
    #[error("instrument catalog unavailable for this switch")]
    CatalogUnavailable,
    #[error("broker token invalid")]
    BrokerTokenInvalid,
    #[error("unknown client action: {0}")]
    UnknownAction(String),
    #[error("feed unavailable: {0}")]
    Unavailable(String),
}

impl FeedError {
    /// Stable `kind` string for the `ERROR{kind, msg}` wire frame.
    pub fn kind(&self) -> &'static str {
        match self {
            FeedError::SwitchTimeout => "SwitchTimeout",
            FeedError::ExpiryChanged => "ExpiryChanged",
            FeedError::CatalogUnavailable => "CatalogUnavailable",
            FeedError::BrokerTokenInvalid => "Broker Token Invalid",
            FeedError::UnknownAction(_) => "UnknownAction",
            FeedError::Unavailable(_) => "Unavailable",
        }
    }
}

impl From<CatalogError> for FeedError {
    fn from(e: CatalogError) -> Self {
        match e {
            CatalogError::UnknownInstrument(_) | CatalogError::UnknownExpiry(_) => {
                FeedError::CatalogUnavailable
            }
            CatalogError::Unavailable(_) => FeedError::CatalogUnavailable,
        }
    }
}
