//! Module dedicated to the worker loop.
//!
//! One consumer of the shared group: read a batch, and for every entry
//! run the dispatch state machine. Duplicates are acked immediately;
//! successes are marked idempotent then acked; invariant violations go
//! straight to the DLQ; transient failures are counted against the
//! retry budget and, while within it, left unacknowledged so the entry
//! returns through the orphan reclaim after its idle delay.
//!
//! No entry is ever acknowledged unless the processor succeeded and the
//! idempotency marker was inserted, or the entry was routed to the DLQ.

pub mod backoff;
pub mod dlq;
pub mod idempotency;
pub mod processor;
pub mod recovery;

use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::{
    breaker::CircuitBreaker,
    correlation,
    health::StatsProvider,
    imap::record::PartialRecord,
    metrics::Metrics,
    shutdown::ShutdownCoordinator,
    store::{self, LogEntry, LogStore},
};

use self::{
    backoff::BackoffController, dlq::DlqRouter, idempotency::IdempotencyFilter,
    processor::Processor, recovery::OrphanRecovery,
};

/// Fatal worker errors. Per-entry failures never end the loop.
#[derive(Debug, Error)]
pub enum Error {
    #[error("cannot initialize consumer group")]
    EnsureGroupError(#[source] store::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

/// How long retry bookkeeping survives without being touched.
const BACKOFF_GC_IDLE: Duration = Duration::from_secs(24 * 3600);

/// Operational counters exposed on the status surface.
#[derive(Default)]
pub struct WorkerStats {
    pub processed: AtomicU64,
    pub skipped: AtomicU64,
    pub failed: AtomicU64,
    pub dlq: AtomicU64,
    pub recovered: AtomicU64,
}

impl StatsProvider for WorkerStats {
    fn name(&self) -> &str {
        "worker"
    }

    fn stats(&self) -> serde_json::Value {
        serde_json::json!({
            "processed": self.processed.load(Ordering::Relaxed),
            "skipped_duplicates": self.skipped.load(Ordering::Relaxed),
            "failed": self.failed.load(Ordering::Relaxed),
            "dlq": self.dlq.load(Ordering::Relaxed),
            "recovered": self.recovered.load(Ordering::Relaxed),
        })
    }
}

/// One consumer of the shared group.
pub struct Worker {
    stream: String,
    group: String,
    consumer: String,
    batch_size: usize,
    block_ms: u64,

    log: Arc<dyn LogStore>,
    idempotency: IdempotencyFilter,
    backoff: BackoffController,
    dlq: DlqRouter,
    processor: Processor,
    recovery: OrphanRecovery,
    recovery_interval: Duration,

    store_breaker: Arc<CircuitBreaker>,
    metrics: Arc<Metrics>,
    shutdown: Arc<ShutdownCoordinator>,
    stats: Arc<WorkerStats>,
}

impl Worker {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        stream: impl ToString,
        group: impl ToString,
        consumer: impl ToString,
        batch_size: usize,
        block_ms: u64,
        log: Arc<dyn LogStore>,
        idempotency: IdempotencyFilter,
        backoff: BackoffController,
        dlq: DlqRouter,
        processor: Processor,
        recovery: OrphanRecovery,
        recovery_interval: Duration,
        store_breaker: Arc<CircuitBreaker>,
        metrics: Arc<Metrics>,
        shutdown: Arc<ShutdownCoordinator>,
        stats: Arc<WorkerStats>,
    ) -> Self {
        Self {
            stream: stream.to_string(),
            group: group.to_string(),
            consumer: consumer.to_string(),
            batch_size,
            block_ms,
            log,
            idempotency,
            backoff,
            dlq,
            processor,
            recovery,
            recovery_interval,
            store_breaker,
            metrics,
            shutdown,
            stats,
        }
    }

    /// Runs the consumer loop until shutdown.
    pub async fn run(&self) -> Result<()> {
        info!(
            "worker starting: stream={}, group={}, consumer={}, batch_size={}",
            self.stream, self.group, self.consumer, self.batch_size
        );

        self.log
            .ensure_group(&self.stream, &self.group, "0")
            .await
            .map_err(Error::EnsureGroupError)?;

        self.metrics.active_workers.inc();

        // Recover whatever a previous incarnation left pending.
        self.run_sweep().await;
        let mut last_sweep = Instant::now();

        while self.shutdown.is_running() {
            if let Err(open) = self.store_breaker.check() {
                warn!("{open}, pausing reads");
                let pause = open.retry_after.clamp(Duration::from_secs(1), Duration::from_secs(5));
                tokio::select! {
                    _ = tokio::time::sleep(pause) => (),
                    _ = self.shutdown.cancelled() => break,
                }
                continue;
            }

            let read = tokio::select! {
                read = self.log.read_group(
                    &self.stream,
                    &self.group,
                    &self.consumer,
                    self.batch_size,
                    self.block_ms,
                ) => read,
                _ = self.shutdown.cancelled() => break,
            };

            match read {
                Ok(entries) => {
                    self.store_breaker.record_success();
                    for entry in entries {
                        if !self.shutdown.is_running() {
                            break;
                        }
                        self.dispatch_guarded(&entry).await;
                    }
                }
                Err(err) => {
                    error!("cannot read from consumer group: {err}");
                    self.store_breaker.record_failure();
                    tokio::select! {
                        _ = tokio::time::sleep(Duration::from_secs(1)) => (),
                        _ = self.shutdown.cancelled() => break,
                    }
                }
            }

            if last_sweep.elapsed() >= self.recovery_interval {
                self.run_sweep().await;
                last_sweep = Instant::now();
            }
        }

        self.metrics.active_workers.dec();
        info!(
            "worker stopped; stats: {}, processor: {}",
            StatsProvider::stats(self.stats.as_ref()),
            self.processor.stats()
        );
        Ok(())
    }

    /// Dispatches one entry inside a correlation scope, feeding store
    /// failures into the breaker instead of crashing the loop.
    async fn dispatch_guarded(&self, entry: &LogEntry) {
        match correlation::scope(self.dispatch(entry)).await {
            Ok(()) => (),
            Err(err) => {
                error!("store error while dispatching {}: {err}", entry.id);
                self.store_breaker.record_failure();
            }
        }
    }

    /// The per-entry state machine. Only store errors propagate.
    async fn dispatch(&self, entry: &LogEntry) -> store::Result<()> {
        debug!("dispatching entry {}", entry.id);

        let Some(payload) = entry.field("payload") else {
            self.route_to_dlq(entry, "", "InvariantViolation", "entry carries no payload field", 0)
                .await?;
            return Ok(());
        };

        let partial = match PartialRecord::decode(payload) {
            Ok(partial) => partial,
            Err(err) => {
                self.stats.failed.fetch_add(1, Ordering::Relaxed);
                self.metrics.emails_failed_total.inc();
                self.route_to_dlq(entry, payload, "InvariantViolation", &err.to_string(), 0)
                    .await?;
                return Ok(());
            }
        };

        let identity = partial.identity();
        if let Some(identity) = &identity {
            if self.idempotency.is_duplicate(identity).await? {
                info!("skipping duplicate record: {identity}");
                self.ack(entry).await?;
                self.metrics.idempotency_duplicates_total.inc();
                self.stats.skipped.fetch_add(1, Ordering::Relaxed);
                return Ok(());
            }
        }

        let timer = self.metrics.processing_timer();
        let outcome = self.processor.process(partial).await;
        drop(timer);

        match outcome {
            Ok(_) => {
                if let Some(identity) = &identity {
                    self.idempotency.mark_processed(identity).await?;
                }
                self.ack(entry).await?;
                self.backoff.record_success(&entry.id);
                self.metrics.emails_processed_total.inc();
                self.stats.processed.fetch_add(1, Ordering::Relaxed);
            }
            Err(err) if !err.is_retryable() => {
                self.stats.failed.fetch_add(1, Ordering::Relaxed);
                self.metrics.emails_failed_total.inc();
                self.route_to_dlq(entry, payload, err.kind(), &err.to_string(), 0)
                    .await?;
            }
            Err(err) => {
                self.stats.failed.fetch_add(1, Ordering::Relaxed);
                self.metrics.emails_failed_total.inc();

                let retry_count = self.backoff.record_failure(&entry.id);
                if self.backoff.should_retry(&entry.id) {
                    self.metrics.backoff_retries_total.inc();
                    warn!(
                        "processing failed for {} (attempt {retry_count}): {err}; left unacked, redelivery after {:?}",
                        entry.id,
                        self.backoff.delay(&entry.id)
                    );
                } else {
                    self.route_to_dlq(entry, payload, err.kind(), &err.to_string(), retry_count)
                        .await?;
                    self.backoff.record_success(&entry.id);
                }
            }
        }

        Ok(())
    }

    /// Wraps the entry in a DLQ envelope, then acknowledges it on the
    /// primary stream.
    async fn route_to_dlq(
        &self,
        entry: &LogEntry,
        payload: &str,
        error_kind: &str,
        error_message: &str,
        retry_count: u64,
    ) -> store::Result<()> {
        self.dlq
            .send_to_dlq(&entry.id, payload, error_kind, error_message, retry_count)
            .await?;
        self.ack(entry).await?;
        self.metrics.dlq_messages_total.inc();
        self.stats.dlq.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn ack(&self, entry: &LogEntry) -> store::Result<()> {
        self.log
            .ack(&self.stream, &self.group, &[entry.id.clone()])
            .await?;
        debug!("acknowledged entry {}", entry.id);
        Ok(())
    }

    /// One orphan sweep: reclaimed entries re-enter the dispatch state
    /// machine, expired ones are routed to the DLQ exactly once.
    pub async fn run_sweep(&self) {
        match self.recovery.sweep().await {
            Ok(outcome) => {
                self.metrics
                    .orphans_claimed_total
                    .inc_by(outcome.reclaimed.len() as u64);
                self.stats
                    .recovered
                    .fetch_add(outcome.reclaimed.len() as u64, Ordering::Relaxed);

                for entry in &outcome.reclaimed {
                    self.dispatch_guarded(entry).await;
                }

                for (entry, delivery_count) in &outcome.expired {
                    let payload = entry.field("payload").unwrap_or_default().to_owned();
                    let message =
                        format!("entry delivered {delivery_count} times without acknowledgment");
                    if let Err(err) = self
                        .route_to_dlq(entry, &payload, "ExcessiveRedelivery", &message, *delivery_count)
                        .await
                    {
                        error!("cannot route expired entry {} to dlq: {err}", entry.id);
                        self.store_breaker.record_failure();
                    }
                }
            }
            Err(err) => {
                warn!("orphan sweep failed: {err}");
                self.store_breaker.record_failure();
            }
        }

        self.backoff.gc(BACKOFF_GC_IDLE);
    }

    pub fn recovery_stats(&self) -> serde_json::Value {
        self.recovery.stats()
    }
}
