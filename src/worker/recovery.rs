//! Orphan recovery and connection watchdog.
//!
//! When a consumer dies before acknowledging, its entries sit in the
//! pending-entries list forever. The sweeper claims entries idle beyond
//! a threshold for this consumer; entries already delivered more than
//! `max_delivery_count` times are claimed once more only to be routed
//! to the DLQ. The watchdog runs periodic connectivity probes on a
//! daemon task and feeds the named circuit breakers.

use std::sync::{
    atomic::{AtomicU64, AtomicUsize, Ordering},
    Arc,
};

use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::{
    breaker::CircuitBreaker,
    config::RecoverySettings,
    health::ReadinessCheck,
    shutdown::ShutdownCoordinator,
    store::{LogEntry, LogStore, Result},
};

/// One sweep's outcome: entries reclaimed for processing, and entries
/// that exceeded the delivery ceiling together with their delivery
/// count.
#[derive(Debug, Default)]
pub struct SweepOutcome {
    pub reclaimed: Vec<LogEntry>,
    pub expired: Vec<(LogEntry, u64)>,
}

/// Claims orphaned entries from the pending-entries list.
pub struct OrphanRecovery {
    log: Arc<dyn LogStore>,
    stream: String,
    group: String,
    consumer: String,
    settings: RecoverySettings,
    total_claimed: AtomicU64,
    total_expired: AtomicU64,
}

impl OrphanRecovery {
    pub fn new(
        log: Arc<dyn LogStore>,
        stream: impl ToString,
        group: impl ToString,
        consumer: impl ToString,
        settings: RecoverySettings,
    ) -> Self {
        Self {
            log,
            stream: stream.to_string(),
            group: group.to_string(),
            consumer: consumer.to_string(),
            settings,
            total_claimed: AtomicU64::new(0),
            total_expired: AtomicU64::new(0),
        }
    }

    /// Scans the pending list and claims what this consumer should
    /// take over.
    pub async fn sweep(&self) -> Result<SweepOutcome> {
        let pending = self
            .log
            .pending(
                &self.stream,
                &self.group,
                self.settings.min_idle_ms,
                self.settings.max_claim_count,
            )
            .await?;

        if pending.is_empty() {
            return Ok(SweepOutcome::default());
        }

        let mut to_claim = Vec::new();
        let mut over_limit = Vec::new();
        for entry in pending {
            if entry.delivery_count > self.settings.max_delivery_count {
                warn!(
                    "entry {} exceeded max deliveries ({}/{}), routing to dlq",
                    entry.id, entry.delivery_count, self.settings.max_delivery_count
                );
                over_limit.push((entry.id, entry.delivery_count));
            } else {
                to_claim.push(entry.id);
            }
        }

        let reclaimed = self
            .log
            .claim(
                &self.stream,
                &self.group,
                &self.consumer,
                self.settings.min_idle_ms,
                &to_claim,
            )
            .await?;
        if !reclaimed.is_empty() {
            info!(
                "reclaimed {} orphaned entries for {}",
                reclaimed.len(),
                self.consumer
            );
        }
        self.total_claimed
            .fetch_add(reclaimed.len() as u64, Ordering::Relaxed);

        // Over-limit entries are claimed too: ownership is needed to
        // read the payload, route it to the DLQ and ack exactly once.
        let mut expired = Vec::with_capacity(over_limit.len());
        if !over_limit.is_empty() {
            let ids: Vec<String> = over_limit.iter().map(|(id, _)| id.clone()).collect();
            let claimed = self
                .log
                .claim(
                    &self.stream,
                    &self.group,
                    &self.consumer,
                    self.settings.min_idle_ms,
                    &ids,
                )
                .await?;
            for entry in claimed {
                let delivery_count = over_limit
                    .iter()
                    .find(|(id, _)| *id == entry.id)
                    .map(|(_, count)| *count)
                    .unwrap_or_default();
                expired.push((entry, delivery_count));
            }
            self.total_expired
                .fetch_add(expired.len() as u64, Ordering::Relaxed);
        }

        Ok(SweepOutcome { reclaimed, expired })
    }

    pub fn stats(&self) -> serde_json::Value {
        serde_json::json!({
            "total_claimed": self.total_claimed.load(Ordering::Relaxed),
            "total_expired": self.total_expired.load(Ordering::Relaxed),
        })
    }
}

struct WatchedCheck {
    probe: Arc<dyn ReadinessCheck>,
    breaker: Arc<CircuitBreaker>,
    consecutive_failures: AtomicUsize,
}

/// Periodic connectivity monitor feeding the circuit breakers.
pub struct ConnectionWatchdog {
    interval: std::time::Duration,
    max_consecutive_failures: usize,
    checks: Vec<WatchedCheck>,
}

impl ConnectionWatchdog {
    pub fn new(interval: std::time::Duration, max_consecutive_failures: usize) -> Self {
        Self {
            interval,
            max_consecutive_failures,
            checks: Vec::new(),
        }
    }

    pub fn add_check(
        mut self,
        probe: Arc<dyn ReadinessCheck>,
        breaker: Arc<CircuitBreaker>,
    ) -> Self {
        self.checks.push(WatchedCheck {
            probe,
            breaker,
            consecutive_failures: AtomicUsize::new(0),
        });
        self
    }

    pub fn spawn(self, shutdown: &Arc<ShutdownCoordinator>) -> JoinHandle<()> {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            debug!("connection watchdog started (interval={:?})", self.interval);
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(self.interval) => (),
                    _ = shutdown.cancelled() => break,
                }
                for check in &self.checks {
                    match check.probe.check().await {
                        Ok(()) => {
                            let was = check.consecutive_failures.swap(0, Ordering::Relaxed);
                            if was >= self.max_consecutive_failures {
                                info!("watchdog: {} connection restored", check.probe.name());
                            }
                            check.breaker.record_success();
                        }
                        Err(reason) => {
                            let failures =
                                check.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1;
                            warn!(
                                "watchdog: {} check failed ({failures}/{}): {reason}",
                                check.probe.name(),
                                self.max_consecutive_failures
                            );
                            check.breaker.record_failure();
                        }
                    }
                }
            }
            debug!("connection watchdog stopped");
        })
    }
}
