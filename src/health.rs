//! Module dedicated to the health surface.
//!
//! Three paths per process: `GET /health` (liveness, always 200),
//! `GET /ready` (503 with the failing check names unless every
//! registered dependency check passes) and `GET /status` (uptime,
//! circuit breaker states, registered statistics snapshots). The
//! server runs on its own task and never keeps the process alive past
//! shutdown.

use std::{
    net::SocketAddr,
    sync::Arc,
    time::Instant,
};

use async_trait::async_trait;
use axum::{extract::State, http::StatusCode, routing::get, Json, Router};
use chrono::{SecondsFormat, Utc};
use serde_json::{json, Value};
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::{breaker::BreakerRegistry, correlation, shutdown::ShutdownCoordinator, store::StateStore};

/// Errors related to the health surface.
#[derive(Debug, Error)]
pub enum Error {
    #[error("cannot bind health listener")]
    BindError(#[source] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

/// A readiness probe for one dependency.
#[async_trait]
pub trait ReadinessCheck: Send + Sync {
    fn name(&self) -> &str;

    /// Ok when the dependency is reachable, the failure reason
    /// otherwise.
    async fn check(&self) -> std::result::Result<(), String>;
}

/// A component exposing an operational statistics snapshot on
/// `/status`.
pub trait StatsProvider: Send + Sync {
    fn name(&self) -> &str;
    fn stats(&self) -> Value;
}

/// Readiness probe pinging a state store.
pub struct StorePing {
    name: String,
    store: Arc<dyn StateStore>,
}

impl StorePing {
    pub fn new(name: impl ToString, store: Arc<dyn StateStore>) -> Self {
        Self {
            name: name.to_string(),
            store,
        }
    }
}

#[async_trait]
impl ReadinessCheck for StorePing {
    fn name(&self) -> &str {
        &self.name
    }

    async fn check(&self) -> std::result::Result<(), String> {
        self.store.ping().await.map_err(|err| err.to_string())
    }
}

/// Readiness probe backed by a shared boolean, flipped by whoever owns
/// the underlying dependency (e.g. the producer loop tracking token
/// refresh health).
pub struct FlagCheck {
    name: String,
    healthy: Arc<std::sync::atomic::AtomicBool>,
    failure: String,
}

impl FlagCheck {
    pub fn new(
        name: impl ToString,
        healthy: Arc<std::sync::atomic::AtomicBool>,
        failure: impl ToString,
    ) -> Self {
        Self {
            name: name.to_string(),
            healthy,
            failure: failure.to_string(),
        }
    }
}

#[async_trait]
impl ReadinessCheck for FlagCheck {
    fn name(&self) -> &str {
        &self.name
    }

    async fn check(&self) -> std::result::Result<(), String> {
        if self.healthy.load(std::sync::atomic::Ordering::Relaxed) {
            Ok(())
        } else {
            Err(self.failure.clone())
        }
    }
}

/// Aggregated health state, built in `main` and shared with the
/// router.
pub struct HealthState {
    component: String,
    started_at: Instant,
    checks: Vec<Arc<dyn ReadinessCheck>>,
    stats: Vec<Arc<dyn StatsProvider>>,
    breakers: Arc<BreakerRegistry>,
}

impl HealthState {
    pub fn new(component: impl ToString, breakers: Arc<BreakerRegistry>) -> Self {
        Self {
            component: component.to_string(),
            started_at: Instant::now(),
            checks: Vec::new(),
            stats: Vec::new(),
            breakers,
        }
    }

    pub fn with_check(mut self, check: Arc<dyn ReadinessCheck>) -> Self {
        self.checks.push(check);
        self
    }

    pub fn with_stats(mut self, provider: Arc<dyn StatsProvider>) -> Self {
        self.stats.push(provider);
        self
    }

    fn uptime_seconds(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }
}

fn timestamp() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

async fn health_handler(State(state): State<Arc<HealthState>>) -> Json<Value> {
    Json(json!({
        "status": "alive",
        "component": state.component,
        "uptime_seconds": state.uptime_seconds(),
        "timestamp": timestamp(),
    }))
}

async fn ready_handler(State(state): State<Arc<HealthState>>) -> (StatusCode, Json<Value>) {
    let mut results = Vec::with_capacity(state.checks.len());
    let mut failing = Vec::new();

    for check in &state.checks {
        match check.check().await {
            Ok(()) => results.push(json!({ "name": check.name(), "status": "healthy" })),
            Err(reason) => {
                failing.push(check.name().to_owned());
                results.push(json!({
                    "name": check.name(),
                    "status": "unhealthy",
                    "error": reason,
                }));
            }
        }
    }

    let ready = failing.is_empty();
    let body = json!({
        "status": if ready { "ready" } else { "not_ready" },
        "component": state.component,
        "checks": results,
        "failing": failing,
        "timestamp": timestamp(),
    });
    let status = if ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(body))
}

async fn status_handler(State(state): State<Arc<HealthState>>) -> Json<Value> {
    let stats: serde_json::Map<String, Value> = state
        .stats
        .iter()
        .map(|provider| (provider.name().to_owned(), provider.stats()))
        .collect();

    Json(json!({
        "component": state.component,
        "uptime_seconds": state.uptime_seconds(),
        "circuit_breakers": state.breakers.snapshots(),
        "stats": stats,
        "correlation": { "scopes_opened": correlation::scopes_opened() },
        "timestamp": timestamp(),
    }))
}

/// Serves the health surface on the given port until shutdown.
pub async fn serve(
    state: Arc<HealthState>,
    port: u16,
    shutdown: &Arc<ShutdownCoordinator>,
) -> Result<JoinHandle<()>> {
    let app = Router::new()
        .route("/health", get(health_handler))
        .route("/ready", get(ready_handler))
        .route("/status", get(status_handler))
        .with_state(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(Error::BindError)?;
    info!("health endpoint listening on {addr}");

    let shutdown = shutdown.clone();
    Ok(tokio::spawn(async move {
        let graceful = axum::serve(listener, app)
            .with_graceful_shutdown(async move { shutdown.cancelled().await });
        if let Err(err) = graceful.await {
            error!("health server error: {err}");
        }
    }))
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicBool;

    use super::*;
    use crate::config::BreakerSettings;

    #[tokio::test]
    async fn readiness_fails_with_the_failing_check_names() {
        let breakers = Arc::new(BreakerRegistry::new(BreakerSettings::default()));
        let healthy = Arc::new(AtomicBool::new(false));
        let state = Arc::new(
            HealthState::new("worker", breakers)
                .with_check(Arc::new(FlagCheck::new("auth", healthy.clone(), "token refresh failed"))),
        );

        let (status, Json(body)) = ready_handler(State(state.clone())).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["failing"][0], "auth");

        healthy.store(true, std::sync::atomic::Ordering::Relaxed);
        let (status, Json(body)) = ready_handler(State(state)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ready");
    }

    #[tokio::test]
    async fn status_reports_breaker_snapshots() {
        let breakers = Arc::new(BreakerRegistry::new(BreakerSettings::default()));
        breakers.get("redis").record_failure();
        let state = Arc::new(HealthState::new("producer", breakers));

        let Json(body) = status_handler(State(state)).await;
        assert_eq!(body["component"], "producer");
        assert_eq!(body["circuit_breakers"][0]["name"], "redis");
        assert_eq!(body["circuit_breakers"][0]["total_failures"], 1);
    }
}
