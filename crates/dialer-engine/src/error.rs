//! Error taxonomy for the dialer engine.
//!
//! Mirrors `rvoip-call-engine`'s `database::DatabaseError` shape: one
//! `thiserror` enum per external concern, plus `From` impls so call sites
//! can use `?` across crate boundaries.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required environment variable: {0}")]
    MissingVar(String),
    #[error("invalid value for {var}: {value}")]
    InvalidValue { var: String, value: String },
}

#[derive(Debug, Error)]
pub enum TelephonyError {
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("pbx returned {status}: {body}")]
    Rest { status: u16, body: String },
    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("event stream closed")]
    StreamClosed,
}

impl TelephonyError {
    /// 404s on hangup/bridge-delete during cleanup are expected; callers
    /// match on this to decide whether to log at `debug!` instead of `warn!`.
    pub fn is_not_found(&self) -> bool {
        matches!(self, TelephonyError::Rest { status: 404, .. })
    }
}

#[derive(Debug, Error)]
pub enum PanelError {
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("panel returned {status}: {body}")]
    Rest { status: u16, body: String },
}

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("provider returned {status}: {body}")]
    Rest { status: u16, body: String },
    #[error("quota exhausted: {0}")]
    QuotaExhausted(String),
    #[error("credentials not configured")]
    Unauthorized,
}

impl ProviderError {
    /// Vira: 403, or a body containing "balanceError" / the threshold message.
    /// GapGPT: 403, or `error.code == "pre_consume_token_quota_failed"` /
    /// a message containing "token quota is not enough".
    pub fn classify_quota(status: u16, body: &str) -> Option<ProviderError> {
        if status == 403 {
            return Some(ProviderError::QuotaExhausted(body.to_string()));
        }
        const MARKERS: [&str; 4] = [
            "balanceError",
            "credit is below the set threshold",
            "pre_consume_token_quota_failed",
            "token quota is not enough",
        ];
        if MARKERS.iter().any(|m| body.contains(m)) {
            return Some(ProviderError::QuotaExhausted(body.to_string()));
        }
        None
    }
}

#[derive(Debug, Error)]
pub enum FlowError {
    #[error("step '{0}' not found in flow")]
    StepNotFound(String),
    #[error("no route for intent '{intent}' and no 'unknown' fallback in step '{step}'")]
    NoRouteForIntent { step: String, intent: String },
}

pub type Result<T, E> = std::result::Result<T, E>;
