//! Module dedicated to metric emission.
//!
//! All collectors live on a [`Metrics`] value with its own registry,
//! created in `main` and shared by reference: no global state. The
//! registry is exposed in Prometheus text format on a dedicated port,
//! and a background [`MetricsUpdater`] task polls stream depths and
//! breaker states.

use std::{net::SocketAddr, sync::Arc, time::Instant};

use axum::{extract::State, routing::get, Router};
use prometheus::{
    Histogram, HistogramOpts, HistogramTimer, IntCounter, IntGauge, IntGaugeVec, Opts, Registry,
    TextEncoder,
};
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::{breaker::BreakerRegistry, shutdown::ShutdownCoordinator, store::LogStore};

/// Errors related to metric registration and serving.
#[derive(Debug, Error)]
pub enum Error {
    #[error("cannot register metric collector")]
    RegisterError(#[from] prometheus::Error),
    #[error("cannot bind metrics listener")]
    BindError(#[source] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

const NAMESPACE: &str = "email_ingestion";

fn counter(registry: &Registry, name: &str, help: &str) -> Result<IntCounter> {
    let counter = IntCounter::with_opts(Opts::new(name, help).namespace(NAMESPACE))?;
    registry.register(Box::new(counter.clone()))?;
    Ok(counter)
}

fn gauge(registry: &Registry, name: &str, help: &str) -> Result<IntGauge> {
    let gauge = IntGauge::with_opts(Opts::new(name, help).namespace(NAMESPACE))?;
    registry.register(Box::new(gauge.clone()))?;
    Ok(gauge)
}

fn histogram(
    registry: &Registry,
    name: &str,
    help: &str,
    buckets: Vec<f64>,
) -> Result<Histogram> {
    let histogram = Histogram::with_opts(
        HistogramOpts::new(name, help)
            .namespace(NAMESPACE)
            .buckets(buckets),
    )?;
    registry.register(Box::new(histogram.clone()))?;
    Ok(histogram)
}

/// The pipeline's collectors.
pub struct Metrics {
    registry: Registry,

    pub emails_produced_total: IntCounter,
    pub emails_processed_total: IntCounter,
    pub emails_failed_total: IntCounter,
    pub dlq_messages_total: IntCounter,
    pub backoff_retries_total: IntCounter,
    pub idempotency_duplicates_total: IntCounter,
    pub orphans_claimed_total: IntCounter,
    pub imap_polls_total: IntCounter,

    pub processing_latency_seconds: Histogram,
    pub imap_poll_duration_seconds: Histogram,

    pub stream_depth: IntGauge,
    pub dlq_depth: IntGauge,
    pub circuit_breaker_state: IntGaugeVec,
    pub uptime_seconds: IntGauge,
    pub active_workers: IntGauge,
}

impl Metrics {
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let circuit_breaker_state = IntGaugeVec::new(
            Opts::new(
                "circuit_breaker_state",
                "Circuit breaker state (0=closed, 1=open, 2=half_open)",
            )
            .namespace(NAMESPACE),
            &["breaker_name"],
        )?;
        registry.register(Box::new(circuit_breaker_state.clone()))?;

        Ok(Self {
            emails_produced_total: counter(
                &registry,
                "emails_produced_total",
                "Records appended to the primary stream",
            )?,
            emails_processed_total: counter(
                &registry,
                "emails_processed_total",
                "Records acknowledged after successful processing",
            )?,
            emails_failed_total: counter(
                &registry,
                "emails_failed_total",
                "Handler failures, counted before retry accounting",
            )?,
            dlq_messages_total: counter(
                &registry,
                "dlq_messages_total",
                "Records routed to the dead-letter stream",
            )?,
            backoff_retries_total: counter(
                &registry,
                "backoff_retries_total",
                "Backoff delays consumed by retried records",
            )?,
            idempotency_duplicates_total: counter(
                &registry,
                "idempotency_duplicates_total",
                "Duplicate records skipped by the idempotency filter",
            )?,
            orphans_claimed_total: counter(
                &registry,
                "orphans_claimed_total",
                "Pending entries reclaimed from dead consumers",
            )?,
            imap_polls_total: counter(
                &registry,
                "imap_polls_total",
                "IMAP polling cycles attempted",
            )?,
            processing_latency_seconds: histogram(
                &registry,
                "processing_latency_seconds",
                "Per-record processing wall clock in seconds",
                vec![0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0],
            )?,
            imap_poll_duration_seconds: histogram(
                &registry,
                "imap_poll_duration_seconds",
                "Duration of one IMAP poll cycle in seconds",
                vec![0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0],
            )?,
            stream_depth: gauge(
                &registry,
                "stream_depth",
                "Current length of the primary stream",
            )?,
            dlq_depth: gauge(&registry, "dlq_depth", "Current length of the DLQ stream")?,
            circuit_breaker_state,
            uptime_seconds: gauge(&registry, "uptime_seconds", "Seconds since process start")?,
            active_workers: gauge(
                &registry,
                "active_workers",
                "Registered worker instances",
            )?,
            registry,
        })
    }

    /// Starts a latency timer observed into the processing histogram on
    /// drop.
    pub fn processing_timer(&self) -> HistogramTimer {
        self.processing_latency_seconds.start_timer()
    }

    /// Renders the registry in Prometheus text exposition format.
    pub fn render(&self) -> String {
        let mut buffer = String::new();
        if let Err(err) = TextEncoder::new().encode_utf8(&self.registry.gather(), &mut buffer) {
            error!("cannot encode metrics: {err}");
        }
        buffer
    }
}

async fn metrics_handler(State(metrics): State<Arc<Metrics>>) -> String {
    metrics.render()
}

/// Serves `GET /metrics` on the given port until shutdown.
pub async fn serve(
    metrics: Arc<Metrics>,
    port: u16,
    shutdown: &Arc<ShutdownCoordinator>,
) -> Result<JoinHandle<()>> {
    let app = Router::new()
        .route("/metrics", get(metrics_handler))
        .with_state(metrics);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(Error::BindError)?;
    info!("metrics listening on {addr}");

    let shutdown = shutdown.clone();
    Ok(tokio::spawn(async move {
        let graceful = axum::serve(listener, app)
            .with_graceful_shutdown(async move { shutdown.cancelled().await });
        if let Err(err) = graceful.await {
            error!("metrics server error: {err}");
        }
    }))
}

/// Background task refreshing depth and state gauges every
/// `interval`.
pub struct MetricsUpdater {
    metrics: Arc<Metrics>,
    log: Arc<dyn LogStore>,
    stream: String,
    dlq_stream: String,
    breakers: Arc<BreakerRegistry>,
    interval: std::time::Duration,
    started_at: Instant,
}

impl MetricsUpdater {
    pub fn new(
        metrics: Arc<Metrics>,
        log: Arc<dyn LogStore>,
        stream: impl ToString,
        dlq_stream: impl ToString,
        breakers: Arc<BreakerRegistry>,
        interval: std::time::Duration,
    ) -> Self {
        Self {
            metrics,
            log,
            stream: stream.to_string(),
            dlq_stream: dlq_stream.to_string(),
            breakers,
            interval,
            started_at: Instant::now(),
        }
    }

    pub fn spawn(self, shutdown: &Arc<ShutdownCoordinator>) -> JoinHandle<()> {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            debug!("metrics updater started (interval={:?})", self.interval);
            loop {
                self.update_once().await;
                tokio::select! {
                    _ = tokio::time::sleep(self.interval) => (),
                    _ = shutdown.cancelled() => break,
                }
            }
            debug!("metrics updater stopped");
        })
    }

    async fn update_once(&self) {
        self.metrics
            .uptime_seconds
            .set(self.started_at.elapsed().as_secs() as i64);

        match self.log.len(&self.stream).await {
            Ok(depth) => self.metrics.stream_depth.set(depth as i64),
            Err(err) => warn!("cannot read stream depth: {err}"),
        }
        match self.log.len(&self.dlq_stream).await {
            Ok(depth) => self.metrics.dlq_depth.set(depth as i64),
            Err(err) => warn!("cannot read dlq depth: {err}"),
        }

        for snapshot in self.breakers.snapshots() {
            self.metrics
                .circuit_breaker_state
                .with_label_values(&[&snapshot.name])
                .set(snapshot.state.as_gauge());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_render_with_the_namespace() {
        let metrics = Metrics::new().unwrap();
        metrics.emails_produced_total.inc_by(3);
        metrics.stream_depth.set(7);

        let rendered = metrics.render();
        assert!(rendered.contains("email_ingestion_emails_produced_total 3"));
        assert!(rendered.contains("email_ingestion_stream_depth 7"));
    }

    #[test]
    fn breaker_gauge_is_labeled_by_name() {
        let metrics = Metrics::new().unwrap();
        metrics
            .circuit_breaker_state
            .with_label_values(&["redis"])
            .set(1);

        let rendered = metrics.render();
        assert!(rendered.contains("circuit_breaker_state{breaker_name=\"redis\"} 1"));
    }
}
