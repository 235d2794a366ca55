//! At-least-once email ingestion pipeline.
//!
//! Two long-lived processes cooperate over a shared append-only log: a
//! [`producer`] performs incremental IMAP polling (UID/UIDVALIDITY
//! tracking) and appends normalized [`imap::record::MailRecord`]s to the
//! primary stream, and a [`worker`] consumes the stream through a
//! consumer group, deduplicates, applies business logic and routes
//! unrecoverable failures to a dead-letter stream.
//!
//! The supervision plane (circuit breakers, correlation scopes,
//! graceful shutdown, health and metrics surfaces) lives in the
//! top-level modules and is wired explicitly from the two binaries.

pub mod auth;
pub mod breaker;
pub mod config;
pub mod correlation;
pub mod health;
pub mod imap;
pub mod metrics;
pub mod producer;
pub mod shutdown;
pub mod store;
pub mod worker;

use thiserror::Error;

/// Initializes the global tracing subscriber. `RUST_LOG` overrides the
/// configured level; `LOG_FORMAT=json` switches to structured JSON
/// output.
pub fn init_tracing(settings: &config::LoggingSettings) {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Registry};

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(settings.level.clone()));

    if settings.json() {
        Registry::default()
            .with(filter)
            .with(fmt::layer().json().with_target(true))
            .init();
    } else {
        Registry::default()
            .with(filter)
            .with(fmt::layer().with_target(true))
            .init();
    }
}

/// The global error of the crate, aggregating every module error.
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    ConfigError(#[from] config::Error),
    #[error(transparent)]
    AuthError(#[from] auth::Error),
    #[error(transparent)]
    ImapError(#[from] imap::Error),
    #[error(transparent)]
    StoreError(#[from] store::Error),
    #[error(transparent)]
    MetricsError(#[from] metrics::Error),
    #[error(transparent)]
    HealthError(#[from] health::Error),
    #[error(transparent)]
    CircuitOpenError(#[from] breaker::CircuitOpen),
    #[error(transparent)]
    ProducerError(#[from] producer::Error),
    #[error(transparent)]
    WorkerError(#[from] worker::Error),
}

/// The global result alias of the crate.
pub type Result<T> = std::result::Result<T, Error>;
