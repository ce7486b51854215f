pub mod api;
pub mod auth;
pub mod config;
pub mod forwarder;
pub mod health;
pub mod ingest;
pub mod loki;
pub mod masking;
pub mod metrics_server;
pub mod validate;
pub mod wal;

use std::sync::Arc;

/// Shared state behind every request handler and background task.
pub struct App {
    pub config: config::Handle,
    pub limiter: auth::RateLimiter,
    pub wal: Arc<wal::WalManager>,
    pub dedupe: ingest::DedupeCache,
    pub health: Arc<health::Probes>,
    pub forwarder_status: forwarder::StatusBoard,
}

impl App {
    pub fn new(config: config::Handle) -> Self {
        Self {
            wal: Arc::new(wal::WalManager::new(config.clone())),
            config,
            limiter: auth::RateLimiter::new(),
            dedupe: ingest::new_dedupe_cache(),
            health: Arc::new(health::Probes::new()),
            forwarder_status: forwarder::new_status_board(),
        }
    }
}

/// Admission and pipeline errors, each mapped to a wire `code` and status.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("unknown, inactive, or missing bearer token")]
    Unauthenticated,
    #[error("per-token rate limit exceeded")]
    RateLimited,
    #[error("{0}")]
    SchemaInvalid(String),
    #[error("{0}")]
    TooLarge(String),
    #[error("tenant WAL quota is nearly exhausted; retry later")]
    QuotaSoft,
    #[error("gateway disk is under pressure; retry later")]
    QuotaHard,
    #[error("gateway is not ready")]
    NotReady,
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl Error {
    pub fn code(&self) -> &'static str {
        match self {
            Self::Unauthenticated => "UNAUTHENTICATED",
            Self::RateLimited => "RATE_LIMITED",
            Self::SchemaInvalid(_) => "SCHEMA_INVALID",
            Self::TooLarge(_) => "TOO_LARGE",
            Self::QuotaSoft => "QUOTA_SOFT",
            Self::QuotaHard => "QUOTA_HARD",
            Self::NotReady => "NOT_READY",
            Self::Internal(_) => "INTERNAL",
        }
    }

    pub fn status(&self) -> axum::http::StatusCode {
        use axum::http::StatusCode;
        match self {
            Self::Unauthenticated => StatusCode::UNAUTHORIZED,
            Self::RateLimited | Self::QuotaSoft | Self::QuotaHard => StatusCode::TOO_MANY_REQUESTS,
            Self::SchemaInvalid(_) => StatusCode::BAD_REQUEST,
            Self::TooLarge(_) => StatusCode::PAYLOAD_TOO_LARGE,
            Self::NotReady => StatusCode::SERVICE_UNAVAILABLE,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}
