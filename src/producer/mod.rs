//! Module dedicated to the producer engine.
//!
//! The engine polls one `(account, mailbox)` incrementally: select the
//! folder, compare the server's UIDVALIDITY against the persisted
//! cursor (resetting before any fetch when the epoch changed), search
//! the UIDs past the cursor, fetch bounded previews and append them to
//! the primary stream in one batched round trip, then advance the
//! cursor. Append-then-advance: a crash between the two re-appends a
//! suffix of the batch next cycle, and the worker's idempotency filter
//! collapses the duplicates.

pub mod batch;
pub mod cursor;

use std::{
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use chrono::{SecondsFormat, Utc};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::{
    auth,
    breaker::{CircuitBreaker, CircuitOpen},
    config::Settings,
    correlation,
    health::StatsProvider,
    imap::{record, ErrorKind, MailConnector, MailSource},
    metrics::Metrics,
    shutdown::ShutdownCoordinator,
    store::{LogStore, StateStore},
    worker::idempotency,
};

use self::{batch::BatchAppender, cursor::CursorStore};

/// Fatal producer errors. Everything else is absorbed by the polling
/// loop and retried.
#[derive(Debug, Error)]
pub enum Error {
    #[error("authentication setup required")]
    AuthSetupRequiredError(#[source] auth::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Per-cycle failure, classified by the loop into breaker bookkeeping
/// and continuation policy.
#[derive(Debug, Error)]
pub enum PollError {
    #[error(transparent)]
    ImapError(#[from] crate::imap::Error),
    #[error(transparent)]
    StoreError(#[from] crate::store::Error),
    #[error(transparent)]
    CircuitOpenError(#[from] CircuitOpen),
    #[error("cannot serialize mail record")]
    SerializeRecordError(#[from] serde_json::Error),
}

/// Operational counters exposed on the status surface.
#[derive(Default)]
pub struct ProducerStats {
    pub polls: AtomicU64,
    pub produced: AtomicU64,
}

impl StatsProvider for ProducerStats {
    fn name(&self) -> &str {
        "producer"
    }

    fn stats(&self) -> serde_json::Value {
        serde_json::json!({
            "poll_count": self.polls.load(Ordering::Relaxed),
            "total_produced": self.produced.load(Ordering::Relaxed),
        })
    }
}

/// The producer engine for one `(account, mailbox)`.
pub struct Producer {
    account: String,
    mailbox: String,
    batch_size: usize,
    poll_interval: Duration,
    dry_run: bool,
    body_cap: usize,
    stream: String,
    max_stream_len: u64,

    connector: Box<dyn MailConnector>,
    session: Option<Box<dyn MailSource>>,
    log: Arc<dyn LogStore>,
    state: Arc<dyn StateStore>,
    cursors: CursorStore,

    imap_breaker: Arc<CircuitBreaker>,
    store_breaker: Arc<CircuitBreaker>,
    metrics: Arc<Metrics>,
    shutdown: Arc<ShutdownCoordinator>,
    stats: Arc<ProducerStats>,

    /// Cleared after the second consecutive token refresh failure; the
    /// readiness surface reports it.
    auth_healthy: Arc<AtomicBool>,
    auth_failures: u32,
}

impl Producer {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        settings: &Settings,
        account: impl ToString,
        mailbox: impl ToString,
        batch_size: usize,
        poll_interval: Duration,
        dry_run: bool,
        connector: Box<dyn MailConnector>,
        log: Arc<dyn LogStore>,
        state: Arc<dyn StateStore>,
        imap_breaker: Arc<CircuitBreaker>,
        store_breaker: Arc<CircuitBreaker>,
        metrics: Arc<Metrics>,
        shutdown: Arc<ShutdownCoordinator>,
        stats: Arc<ProducerStats>,
        auth_healthy: Arc<AtomicBool>,
    ) -> Self {
        let account = account.to_string();
        Self {
            cursors: CursorStore::new(state.clone(), &account),
            account,
            mailbox: mailbox.to_string(),
            batch_size,
            poll_interval,
            dry_run,
            body_cap: settings.imap.body_preview_bytes,
            stream: settings.redis.stream_name.clone(),
            max_stream_len: settings.redis.max_stream_length,
            connector,
            session: None,
            log,
            state,
            imap_breaker,
            store_breaker,
            metrics,
            shutdown,
            stats,
            auth_healthy,
            auth_failures: 0,
        }
    }

    /// Runs the polling loop until shutdown. Only unrecoverable
    /// authentication problems end it early.
    pub async fn run(&mut self) -> Result<()> {
        info!(
            "producer starting: account={}, mailbox={}, stream={}, batch_size={}, poll_interval={:?}, dry_run={}",
            self.account, self.mailbox, self.stream, self.batch_size, self.poll_interval, self.dry_run
        );

        match self.cursors.summary(&self.mailbox).await {
            Ok(summary) => info!("initial cursor state: {summary}"),
            Err(err) => warn!("cannot read initial cursor state: {err}"),
        }

        while self.shutdown.is_running() {
            self.stats.polls.fetch_add(1, Ordering::Relaxed);
            let started = Instant::now();

            let outcome = correlation::scope(self.poll_once()).await;

            self.metrics.imap_polls_total.inc();
            self.metrics
                .imap_poll_duration_seconds
                .observe(started.elapsed().as_secs_f64());

            match outcome {
                Ok(count) => {
                    self.imap_breaker.record_success();
                    self.store_breaker.record_success();
                    self.auth_failures = 0;
                    self.auth_healthy.store(true, Ordering::Relaxed);
                    if count > 0 {
                        info!(
                            "poll produced {count} records (total: {})",
                            self.stats.produced.load(Ordering::Relaxed)
                        );
                    }
                }
                Err(PollError::CircuitOpenError(err)) => {
                    warn!("{err}, skipping poll");
                }
                Err(PollError::ImapError(err)) => match err.kind() {
                    ErrorKind::Transport => {
                        error!("imap transport error: {err}, reconnecting on next poll");
                        self.imap_breaker.record_failure();
                        self.session = None;
                    }
                    ErrorKind::Auth => {
                        if let Some(fatal) = self.handle_auth_failure(err) {
                            return Err(fatal);
                        }
                        if self.auth_failures >= 2 {
                            self.stop_polling().await;
                            break;
                        }
                    }
                    ErrorKind::Protocol => {
                        // Batch aborted; state was not advanced, the
                        // next cycle reconsiders the same UIDs.
                        warn!("imap protocol error: {err}, retrying next cycle");
                    }
                },
                Err(PollError::StoreError(err)) => {
                    error!("log store error: {err}");
                    self.store_breaker.record_failure();
                }
                Err(PollError::SerializeRecordError(err)) => {
                    error!("cannot serialize record: {err}");
                }
            }

            tokio::select! {
                _ = tokio::time::sleep(self.poll_interval) => (),
                _ = self.shutdown.cancelled() => break,
            }
        }

        self.close_session().await;
        info!(
            "producer stopped, total records produced: {}",
            self.stats.produced.load(Ordering::Relaxed)
        );
        Ok(())
    }

    /// One breaker-guarded poll cycle. Returns the number of records
    /// appended.
    pub async fn poll_once(&mut self) -> std::result::Result<usize, PollError> {
        self.imap_breaker.check()?;
        self.store_breaker.check()?;

        let mut session = match self.session.take() {
            Some(session) => session,
            None => self.connector.connect().await?,
        };
        let outcome = self.poll_with(session.as_mut()).await;
        self.session = Some(session);
        outcome
    }

    async fn poll_with(
        &self,
        session: &mut dyn MailSource,
    ) -> std::result::Result<usize, PollError> {
        let status = session.select(&self.mailbox).await?;
        let cursor = self.cursors.load(&self.mailbox).await?;

        let last_uid = match cursor.uidvalidity {
            Some(stored) if stored != status.uidvalidity => {
                warn!(
                    "uidvalidity changed for {}: {stored} -> {}, mailbox was reset, starting from the beginning",
                    self.mailbox, status.uidvalidity
                );
                self.cursors.reset(&self.mailbox, status.uidvalidity).await?;
                self.clear_stale_idempotency(stored);
                0
            }
            Some(_) => cursor.last_uid,
            None => {
                self.cursors
                    .set_uidvalidity(&self.mailbox, status.uidvalidity)
                    .await?;
                cursor.last_uid
            }
        };

        debug!(
            "mailbox {}: uidvalidity={}, last_uid={last_uid}, exists={}",
            self.mailbox, status.uidvalidity, status.exists
        );

        let mut uids = session.search_since(last_uid).await?;
        uids.sort_unstable();
        uids.truncate(self.batch_size);

        if uids.is_empty() {
            debug!("no new messages");
            self.cursors.touch(&self.mailbox).await?;
            return Ok(0);
        }

        info!("fetching {} new messages (uids {}..{})", uids.len(), uids[0], uids[uids.len() - 1]);

        let correlation_id = correlation::current().unwrap_or_default();
        let mut batch = BatchAppender::new(self.log.as_ref(), &self.stream, self.max_stream_len);
        let mut fetched_uids = Vec::with_capacity(uids.len());

        for uid in uids {
            let mail = match session.fetch(uid).await {
                Ok(mail) => mail,
                Err(err) if err.kind() == ErrorKind::Protocol => {
                    warn!("skipping uid {uid}: {err}");
                    continue;
                }
                Err(err) => return Err(err.into()),
            };

            let mail_record = record::MailRecord {
                uid,
                uidvalidity: status.uidvalidity,
                mailbox: self.mailbox.clone(),
                account: self.account.clone(),
                from: mail.from,
                to: mail.to,
                subject: mail.subject,
                date: mail.date,
                message_id: mail.message_id,
                size: mail.size,
                headers: mail.headers,
                body_text: record::truncate_preview(&mail.body_text, self.body_cap),
                body_html_preview: record::truncate_preview(&mail.body_html, 512),
                fetched_at: Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true),
                correlation_id: correlation_id.clone(),
            };

            batch.add_payload(mail_record.to_json()?);
            fetched_uids.push(uid);
        }

        if self.dry_run {
            info!(
                "dry run: fetched {} records, skipping append and cursor advance",
                batch.len()
            );
            self.cursors.touch(&self.mailbox).await?;
            return Ok(0);
        }

        let ids = batch.flush().await?;
        let appended = ids.len().min(fetched_uids.len());
        if appended == 0 {
            self.cursors.touch(&self.mailbox).await?;
            return Ok(0);
        }

        // Advance only to the highest UID whose append was
        // acknowledged.
        let last_appended_uid = fetched_uids[appended - 1];
        self.cursors
            .advance(&self.mailbox, status.uidvalidity, last_appended_uid)
            .await?;
        self.cursors
            .add_emails(&self.mailbox, appended as u64)
            .await?;

        self.metrics.emails_produced_total.inc_by(appended as u64);
        self.stats.produced.fetch_add(appended as u64, Ordering::Relaxed);
        Ok(appended)
    }

    /// Clears the idempotency partition of a superseded epoch. The set
    /// is partitioned by uidvalidity, so this only frees memory;
    /// correctness does not depend on it.
    fn clear_stale_idempotency(&self, stale_uidvalidity: u64) {
        let key = idempotency::partition_key(&self.account, &self.mailbox, stale_uidvalidity);
        let state = self.state.clone();
        tokio::spawn(async move {
            match state.delete(&key).await {
                Ok(()) => debug!("cleared stale idempotency partition {key}"),
                Err(err) => warn!("cannot clear stale idempotency partition {key}: {err}"),
            }
        });
    }

    fn handle_auth_failure(&mut self, err: crate::imap::Error) -> Option<Error> {
        match err {
            crate::imap::Error::RefreshAccessTokenError(inner) => {
                if matches!(*inner, auth::Error::SetupRequiredError(_)) {
                    return Some(Error::AuthSetupRequiredError(*inner));
                }
                self.auth_failures += 1;
                error!(
                    "token refresh failed (attempt {}): {inner}",
                    self.auth_failures
                );
            }
            err => {
                self.auth_failures += 1;
                error!(
                    "imap authentication failed (attempt {}): {err}",
                    self.auth_failures
                );
            }
        }

        if self.auth_failures >= 2 {
            self.auth_healthy.store(false, Ordering::Relaxed);
        }
        None
    }

    /// Token refresh failed twice: stop polling and surface the
    /// failure on the readiness endpoint until an operator intervenes.
    async fn stop_polling(&mut self) {
        error!("token refresh failed twice, polling stopped; readiness now failing");
        self.close_session().await;
        self.shutdown.cancelled().await;
    }

    async fn close_session(&mut self) {
        if let Some(mut session) = self.session.take() {
            if let Err(err) = session.logout().await {
                warn!("error during imap logout: {err}");
            }
        }
    }
}
