//! End-to-end pipeline scenarios, driving the producer engine and the
//! worker loop against the in-memory store and a scripted mailbox.

use std::{
    collections::BTreeMap,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use async_trait::async_trait;
use serde_json::json;

use mail_ingest::{
    breaker::BreakerRegistry,
    config::{
        BreakerSettings, DlqSettings, GoogleSettings, IdempotencySettings, ImapSettings,
        LoggingSettings, MicrosoftSettings, MonitoringSettings, RecoverySettings, RedisSettings,
        Settings, WorkerSettings,
    },
    imap::{
        record::MailRecord, FetchedMail, MailConnector, MailSource, MailboxStatus,
        Result as ImapResult,
    },
    metrics::Metrics,
    producer::{cursor::CursorStore, Producer, ProducerStats},
    shutdown::ShutdownCoordinator,
    store::{memory::MemoryStore, LogStore, StateStore},
    worker::{
        backoff::BackoffController,
        dlq::DlqRouter,
        idempotency::{partition_key, IdempotencyFilter},
        processor::{ClassifyingHandler, Error as ProcessError, MailHandler, Processor},
        recovery::OrphanRecovery,
        Worker, WorkerStats,
    },
};

const STREAM: &str = "email_ingestion_stream";
const GROUP: &str = "email_processor_group";
const ACCOUNT: &str = "user@example.com";

fn settings() -> Settings {
    Settings {
        redis: RedisSettings {
            url: "redis://localhost:6379".into(),
            stream_name: STREAM.into(),
            max_stream_length: 10_000,
        },
        imap: ImapSettings {
            host: "imap.example.com".into(),
            port: 993,
            mailbox: "INBOX".into(),
            ssl: None,
            insecure: None,
            user: Some(ACCOUNT.into()),
            poll_interval_seconds: 60,
            body_preview_bytes: 2048,
        },
        google: GoogleSettings {
            client_id: None,
            client_secret: None,
            token_file: "tokens/gmail_token.json".into(),
            redirect_host: "localhost".into(),
            redirect_port: 8080,
        },
        microsoft: MicrosoftSettings {
            client_id: None,
            tenant_id: "common".into(),
            token_file: "tokens/outlook_token.json".into(),
        },
        worker: WorkerSettings {
            consumer_group_name: GROUP.into(),
            consumer_name: "worker_01".into(),
            batch_size: 10,
            block_timeout_ms: 50,
        },
        idempotency: IdempotencySettings { ttl_seconds: 0 },
        dlq: DlqSettings {
            stream_name: "email_ingestion_dlq".into(),
            max_retry_attempts: 5,
            initial_backoff_seconds: 1.0,
            max_backoff_seconds: 60.0,
            backoff_multiplier: 2.0,
        },
        monitoring: MonitoringSettings {
            producer_health_port: 8080,
            worker_health_port: 8081,
            producer_metrics_port: 9090,
            worker_metrics_port: 9091,
            update_interval_seconds: 15,
        },
        breaker: BreakerSettings::default(),
        recovery: RecoverySettings {
            min_idle_ms: 0,
            max_claim_count: 50,
            max_delivery_count: 10,
            check_interval_seconds: 0,
        },
        logging: LoggingSettings {
            level: "info".into(),
            format: "text".into(),
        },
        shutdown_timeout_seconds: 30,
        email_provider: "gmail".into(),
    }
}

async fn wait_until(what: &str, cond: impl Fn() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !cond() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for: {what}"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

// ---------------------------------------------------------------------
// Scripted mailbox
// ---------------------------------------------------------------------

#[derive(Clone, Default)]
struct MailServer {
    state: Arc<Mutex<(u64, Vec<u64>)>>,
}

impl MailServer {
    fn set(&self, uidvalidity: u64, uids: Vec<u64>) {
        *self.state.lock().unwrap() = (uidvalidity, uids);
    }
}

struct ScriptedSource {
    server: MailServer,
}

#[async_trait]
impl MailSource for ScriptedSource {
    async fn select(&mut self, _mailbox: &str) -> ImapResult<MailboxStatus> {
        let (uidvalidity, uids) = self.server.state.lock().unwrap().clone();
        Ok(MailboxStatus {
            uidvalidity,
            exists: uids.len() as u64,
        })
    }

    async fn search_since(&mut self, since_uid: u64) -> ImapResult<Vec<u64>> {
        let (_, uids) = self.server.state.lock().unwrap().clone();
        // Unspecified order per the protocol contract: return them
        // backwards so the caller's sort is exercised.
        Ok(uids
            .into_iter()
            .filter(|uid| *uid > since_uid)
            .rev()
            .collect())
    }

    async fn fetch(&mut self, uid: u64) -> ImapResult<FetchedMail> {
        Ok(FetchedMail {
            from: format!("Sender {uid} <sender{uid}@corp.example>"),
            to: vec![ACCOUNT.into()],
            subject: format!("message {uid}"),
            date: "2024-05-01T10:00:00Z".into(),
            message_id: format!("<m{uid}@corp.example>"),
            size: 100 + uid,
            headers: BTreeMap::from([("Subject".to_owned(), format!("message {uid}"))]),
            body_text: format!("body of message {uid}"),
            body_html: String::new(),
        })
    }

    async fn logout(&mut self) -> ImapResult<()> {
        Ok(())
    }
}

struct ScriptedConnector {
    server: MailServer,
}

#[async_trait]
impl MailConnector for ScriptedConnector {
    async fn connect(&self) -> ImapResult<Box<dyn MailSource>> {
        Ok(Box::new(ScriptedSource {
            server: self.server.clone(),
        }))
    }
}

// ---------------------------------------------------------------------
// Rigs
// ---------------------------------------------------------------------

struct ProducerRig {
    store: Arc<MemoryStore>,
    server: MailServer,
    producer: Producer,
    metrics: Arc<Metrics>,
}

fn producer_rig(batch_size: usize) -> ProducerRig {
    let settings = settings();
    let store = Arc::new(MemoryStore::new());
    let server = MailServer::default();
    let breakers = BreakerRegistry::new(settings.breaker.clone());
    let metrics = Arc::new(Metrics::new().unwrap());

    let producer = Producer::new(
        &settings,
        ACCOUNT,
        "INBOX",
        batch_size,
        Duration::from_millis(10),
        false,
        Box::new(ScriptedConnector {
            server: server.clone(),
        }),
        store.clone(),
        store.clone(),
        breakers.get("imap"),
        breakers.get("redis"),
        metrics.clone(),
        Arc::new(ShutdownCoordinator::new(Duration::from_secs(30))),
        Arc::new(ProducerStats::default()),
        Arc::new(AtomicBool::new(true)),
    );

    ProducerRig {
        store,
        server,
        producer,
        metrics,
    }
}

struct WorkerRig {
    store: Arc<MemoryStore>,
    worker: Arc<Worker>,
    metrics: Arc<Metrics>,
    stats: Arc<WorkerStats>,
    shutdown: Arc<ShutdownCoordinator>,
}

fn worker_rig(handler: Arc<dyn MailHandler>, max_retries: u64, max_delivery: u64) -> WorkerRig {
    let mut settings = settings();
    settings.dlq.max_retry_attempts = max_retries;
    settings.recovery.max_delivery_count = max_delivery;

    let store = Arc::new(MemoryStore::new());
    let log: Arc<dyn LogStore> = store.clone();
    let state: Arc<dyn StateStore> = store.clone();
    let breakers = BreakerRegistry::new(settings.breaker.clone());
    let metrics = Arc::new(Metrics::new().unwrap());
    let stats = Arc::new(WorkerStats::default());
    let shutdown = Arc::new(ShutdownCoordinator::new(Duration::from_secs(30)));

    let worker = Worker::new(
        STREAM,
        GROUP,
        "worker_01",
        settings.worker.batch_size,
        settings.worker.block_timeout_ms,
        log.clone(),
        IdempotencyFilter::new(state, settings.idempotency.ttl()),
        BackoffController::new(
            settings.dlq.initial_backoff_seconds,
            settings.dlq.max_backoff_seconds,
            settings.dlq.backoff_multiplier,
            settings.dlq.max_retry_attempts,
        ),
        DlqRouter::new(log.clone(), &settings.dlq.stream_name, 10_000),
        Processor::new(handler),
        OrphanRecovery::new(log, STREAM, GROUP, "worker_01", settings.recovery.clone()),
        settings.recovery.check_interval(),
        breakers.get("redis"),
        metrics.clone(),
        shutdown.clone(),
        stats.clone(),
    );

    WorkerRig {
        store,
        worker: Arc::new(worker),
        metrics,
        stats,
        shutdown,
    }
}

impl WorkerRig {
    fn spawn(&self) -> tokio::task::JoinHandle<()> {
        let worker = self.worker.clone();
        tokio::spawn(async move {
            worker.run().await.unwrap();
        })
    }

    async fn stop(self, handle: tokio::task::JoinHandle<()>) {
        self.shutdown.initiate().await;
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("worker did not stop in time")
            .unwrap();
    }
}

fn record_payload(uid: u64) -> String {
    json!({
        "uid": uid,
        "uidvalidity": 700,
        "mailbox": "INBOX",
        "account": ACCOUNT,
        "from": "alice@corp.example",
        "to": [ACCOUNT],
        "subject": format!("message {uid}"),
        "date": "2024-05-01T10:00:00Z",
        "message_id": format!("<m{uid}@corp.example>"),
        "size": 100,
        "headers": {},
        "body_text": "body",
        "body_html_preview": "",
        "fetched_at": "2024-05-01T10:00:01Z",
        "correlation_id": "test",
    })
    .to_string()
}

async fn append_payload(store: &MemoryStore, payload: String) -> String {
    store
        .append(STREAM, &[("payload".to_owned(), payload)], None)
        .await
        .unwrap()
}

// ---------------------------------------------------------------------
// Producer scenarios
// ---------------------------------------------------------------------

#[tokio::test]
async fn fresh_ingest_appends_in_uid_order_and_advances_the_cursor() {
    let mut rig = producer_rig(50);
    rig.server.set(700, vec![10, 11, 12]);

    let produced = rig.producer.poll_once().await.unwrap();
    assert_eq!(produced, 3);

    let entries = rig.store.range(STREAM, "-", "+", 10).await.unwrap();
    assert_eq!(entries.len(), 3);

    let records: Vec<MailRecord> = entries
        .iter()
        .map(|entry| serde_json::from_str(entry.field("payload").unwrap()).unwrap())
        .collect();
    assert_eq!(
        records.iter().map(|r| r.uid).collect::<Vec<_>>(),
        vec![10, 11, 12]
    );
    assert!(records.iter().all(|r| r.uidvalidity == 700));
    assert!(records.iter().all(|r| r.account == ACCOUNT));
    assert!(records.iter().all(|r| !r.correlation_id.is_empty()));

    let cursors = CursorStore::new(rig.store.clone(), ACCOUNT);
    let cursor = cursors.load("INBOX").await.unwrap();
    assert_eq!(cursor.last_uid, 12);
    assert_eq!(cursor.uidvalidity, Some(700));

    assert_eq!(rig.metrics.emails_produced_total.get(), 3);
}

#[tokio::test]
async fn repeated_polls_never_duplicate_within_an_epoch() {
    let mut rig = producer_rig(50);
    rig.server.set(700, vec![10, 11, 12]);

    assert_eq!(rig.producer.poll_once().await.unwrap(), 3);
    assert_eq!(rig.producer.poll_once().await.unwrap(), 0);
    assert_eq!(rig.producer.poll_once().await.unwrap(), 0);

    assert_eq!(rig.store.len(STREAM).await.unwrap(), 3);
}

#[tokio::test]
async fn batch_size_bounds_each_poll() {
    let mut rig = producer_rig(2);
    rig.server.set(700, vec![10, 11, 12]);

    assert_eq!(rig.producer.poll_once().await.unwrap(), 2);
    let cursors = CursorStore::new(rig.store.clone(), ACCOUNT);
    assert_eq!(cursors.load("INBOX").await.unwrap().last_uid, 11);

    assert_eq!(rig.producer.poll_once().await.unwrap(), 1);
    assert_eq!(cursors.load("INBOX").await.unwrap().last_uid, 12);
}

#[tokio::test]
async fn uidvalidity_change_resets_the_cursor_before_fetching_the_new_epoch() {
    let mut rig = producer_rig(50);
    rig.server.set(700, vec![10, 11, 12]);
    assert_eq!(rig.producer.poll_once().await.unwrap(), 3);

    // Seed the old epoch's idempotency partition, as the worker would.
    let state: Arc<dyn StateStore> = rig.store.clone();
    state
        .sadd(
            &partition_key(ACCOUNT, "INBOX", 700),
            "user@example.com|INBOX|700|10",
        )
        .await
        .unwrap();

    // The mailbox is rebuilt: new epoch, fresh UIDs.
    rig.server.set(701, vec![1, 2]);
    assert_eq!(rig.producer.poll_once().await.unwrap(), 2);

    let cursors = CursorStore::new(rig.store.clone(), ACCOUNT);
    let cursor = cursors.load("INBOX").await.unwrap();
    assert_eq!(cursor.uidvalidity, Some(701));
    assert_eq!(cursor.last_uid, 2);

    let entries = rig.store.range(STREAM, "-", "+", 10).await.unwrap();
    let new_epoch: Vec<MailRecord> = entries
        .iter()
        .skip(3)
        .map(|entry| serde_json::from_str(entry.field("payload").unwrap()).unwrap())
        .collect();
    assert_eq!(
        new_epoch.iter().map(|r| (r.uidvalidity, r.uid)).collect::<Vec<_>>(),
        vec![(701, 1), (701, 2)]
    );

    // The stale partition is cleared asynchronously.
    let stale_key = partition_key(ACCOUNT, "INBOX", 700);
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        if state.scard(&stale_key).await.unwrap() == 0 {
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "stale idempotency partition was not cleared"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

// ---------------------------------------------------------------------
// Worker scenarios
// ---------------------------------------------------------------------

#[tokio::test]
async fn worker_processes_marks_idempotent_and_acks() {
    let rig = worker_rig(Arc::new(ClassifyingHandler), 5, 10);
    let handle = rig.spawn();

    append_payload(&rig.store, record_payload(1)).await;

    let stats = rig.stats.clone();
    wait_until("one record processed", || {
        stats.processed.load(Ordering::Relaxed) == 1
    })
    .await;

    assert!(rig.store.pending(STREAM, GROUP, 0, 10).await.unwrap().is_empty());
    assert_eq!(rig.metrics.emails_processed_total.get(), 1);

    let state: Arc<dyn StateStore> = rig.store.clone();
    assert!(state
        .sismember(
            &partition_key(ACCOUNT, "INBOX", 700),
            "user@example.com|INBOX|700|1"
        )
        .await
        .unwrap());

    rig.stop(handle).await;
}

#[tokio::test]
async fn duplicate_delivery_is_skipped_and_acked() {
    let rig = worker_rig(Arc::new(ClassifyingHandler), 5, 10);
    let handle = rig.spawn();

    // The same natural identity arrives twice, as after a partial
    // batch replay or a claim racing an ack.
    append_payload(&rig.store, record_payload(7)).await;
    append_payload(&rig.store, record_payload(7)).await;

    let stats = rig.stats.clone();
    wait_until("duplicate skipped", || {
        stats.processed.load(Ordering::Relaxed) == 1 && stats.skipped.load(Ordering::Relaxed) == 1
    })
    .await;

    assert_eq!(rig.metrics.idempotency_duplicates_total.get(), 1);
    assert!(rig.store.pending(STREAM, GROUP, 0, 10).await.unwrap().is_empty());

    rig.stop(handle).await;
}

#[tokio::test]
async fn poison_record_goes_straight_to_the_dlq() {
    let rig = worker_rig(Arc::new(ClassifyingHandler), 5, 10);
    let handle = rig.spawn();

    append_payload(
        &rig.store,
        json!({ "mailbox": "INBOX", "uidvalidity": 700, "account": ACCOUNT }).to_string(),
    )
    .await;

    let stats = rig.stats.clone();
    wait_until("poison record routed", || {
        stats.dlq.load(Ordering::Relaxed) == 1
    })
    .await;

    let dlq = rig.store.range("email_ingestion_dlq", "-", "+", 10).await.unwrap();
    assert_eq!(dlq.len(), 1);
    assert_eq!(dlq[0].field("error_kind"), Some("InvariantViolation"));
    assert_eq!(dlq[0].field("retry_count"), Some("0"));

    assert_eq!(rig.metrics.dlq_messages_total.get(), 1);
    assert_eq!(rig.metrics.emails_processed_total.get(), 0);
    assert!(rig.store.pending(STREAM, GROUP, 0, 10).await.unwrap().is_empty());

    rig.stop(handle).await;
}

struct FlakyHandler {
    failures_left: AtomicU64,
}

#[async_trait]
impl MailHandler for FlakyHandler {
    async fn handle(
        &self,
        _record: &MailRecord,
    ) -> std::result::Result<serde_json::Value, ProcessError> {
        if self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| {
                left.checked_sub(1)
            })
            .is_ok()
        {
            Err(ProcessError::TransientError("downstream unavailable".into()))
        } else {
            Ok(json!({ "ok": true }))
        }
    }
}

#[tokio::test]
async fn transient_failures_retry_until_success() {
    let rig = worker_rig(
        Arc::new(FlakyHandler {
            failures_left: AtomicU64::new(3),
        }),
        5,
        10,
    );
    let handle = rig.spawn();

    append_payload(&rig.store, record_payload(3)).await;

    let stats = rig.stats.clone();
    wait_until("record eventually processed", || {
        stats.processed.load(Ordering::Relaxed) == 1
    })
    .await;

    assert_eq!(rig.metrics.emails_processed_total.get(), 1);
    assert_eq!(rig.metrics.emails_failed_total.get(), 3);
    assert_eq!(rig.metrics.backoff_retries_total.get(), 3);
    assert_eq!(rig.metrics.dlq_messages_total.get(), 0);
    assert!(rig.store.pending(STREAM, GROUP, 0, 10).await.unwrap().is_empty());

    rig.stop(handle).await;
}

#[tokio::test]
async fn exhausted_retries_route_to_the_dlq_with_the_final_count() {
    let rig = worker_rig(
        Arc::new(FlakyHandler {
            failures_left: AtomicU64::new(u64::MAX),
        }),
        2,
        10,
    );
    let handle = rig.spawn();

    append_payload(&rig.store, record_payload(4)).await;

    let stats = rig.stats.clone();
    wait_until("record exhausted into the dlq", || {
        stats.dlq.load(Ordering::Relaxed) == 1
    })
    .await;

    // max_retries + 1 failures total.
    assert_eq!(rig.metrics.emails_failed_total.get(), 3);
    assert_eq!(rig.metrics.backoff_retries_total.get(), 2);
    assert_eq!(rig.metrics.emails_processed_total.get(), 0);

    let dlq = rig.store.range("email_ingestion_dlq", "-", "+", 10).await.unwrap();
    assert_eq!(dlq[0].field("error_kind"), Some("ProcessingTransient"));
    assert_eq!(dlq[0].field("retry_count"), Some("3"));
    assert!(rig.store.pending(STREAM, GROUP, 0, 10).await.unwrap().is_empty());

    rig.stop(handle).await;
}

#[tokio::test]
async fn unacked_transient_failure_stays_pending_without_a_sweep() {
    // No periodic sweep in this rig: redelivery cannot happen during
    // the test, so the unacked entry must remain pending.
    let rig = {
        let mut settings = settings();
        settings.recovery.check_interval_seconds = 3600;
        settings.recovery.min_idle_ms = 300_000;

        let store = Arc::new(MemoryStore::new());
        let log: Arc<dyn LogStore> = store.clone();
        let state: Arc<dyn StateStore> = store.clone();
        let breakers = BreakerRegistry::new(settings.breaker.clone());
        let metrics = Arc::new(Metrics::new().unwrap());
        let stats = Arc::new(WorkerStats::default());
        let shutdown = Arc::new(ShutdownCoordinator::new(Duration::from_secs(30)));

        WorkerRig {
            worker: Arc::new(Worker::new(
                STREAM,
                GROUP,
                "worker_01",
                10,
                50,
                log.clone(),
                IdempotencyFilter::new(state, None),
                BackoffController::new(1.0, 60.0, 2.0, 5),
                DlqRouter::new(log.clone(), "email_ingestion_dlq", 10_000),
                Processor::new(Arc::new(FlakyHandler {
                    failures_left: AtomicU64::new(u64::MAX),
                })),
                OrphanRecovery::new(log, STREAM, GROUP, "worker_01", settings.recovery.clone()),
                settings.recovery.check_interval(),
                breakers.get("redis"),
                metrics.clone(),
                shutdown.clone(),
                stats.clone(),
            )),
            store,
            metrics,
            stats,
            shutdown,
        }
    };
    let handle = rig.spawn();

    append_payload(&rig.store, record_payload(5)).await;

    let stats = rig.stats.clone();
    wait_until("first failure recorded", || {
        stats.failed.load(Ordering::Relaxed) == 1
    })
    .await;

    // Ack-only-on-success: the failed entry is still pending.
    let pending = rig.store.pending(STREAM, GROUP, 0, 10).await.unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].delivery_count, 1);
    assert_eq!(rig.metrics.dlq_messages_total.get(), 0);

    rig.stop(handle).await;
}

#[tokio::test]
async fn orphaned_entries_are_reclaimed_and_processed() {
    let rig = worker_rig(Arc::new(ClassifyingHandler), 5, 10);

    // A consumer reads the entry and dies before acking.
    rig.store.ensure_group(STREAM, GROUP, "0").await.unwrap();
    append_payload(&rig.store, record_payload(9)).await;
    rig.store
        .read_group(STREAM, GROUP, "dead_worker", 10, 0)
        .await
        .unwrap();
    rig.store
        .age_pending(STREAM, GROUP, Duration::from_secs(600))
        .await;

    let handle = rig.spawn();

    let stats = rig.stats.clone();
    wait_until("orphan reclaimed and processed", || {
        stats.processed.load(Ordering::Relaxed) == 1
    })
    .await;

    assert_eq!(rig.metrics.orphans_claimed_total.get(), 1);
    assert_eq!(rig.stats.recovered.load(Ordering::Relaxed), 1);
    assert!(rig.store.pending(STREAM, GROUP, 0, 10).await.unwrap().is_empty());

    rig.stop(handle).await;
}

#[tokio::test]
async fn excessive_redelivery_is_routed_to_the_dlq_exactly_once() {
    let rig = worker_rig(Arc::new(ClassifyingHandler), 5, 2);

    rig.store.ensure_group(STREAM, GROUP, "0").await.unwrap();
    let id = append_payload(&rig.store, record_payload(11)).await;
    rig.store
        .read_group(STREAM, GROUP, "dead_worker", 10, 0)
        .await
        .unwrap();
    // Push the delivery count past the ceiling of 2.
    for _ in 0..3 {
        rig.store
            .claim(STREAM, GROUP, "dead_worker", 0, std::slice::from_ref(&id))
            .await
            .unwrap();
    }

    let handle = rig.spawn();

    let stats = rig.stats.clone();
    wait_until("expired entry routed", || {
        stats.dlq.load(Ordering::Relaxed) == 1
    })
    .await;

    let dlq = rig.store.range("email_ingestion_dlq", "-", "+", 10).await.unwrap();
    assert_eq!(dlq.len(), 1);
    assert_eq!(dlq[0].field("error_kind"), Some("ExcessiveRedelivery"));
    assert_eq!(dlq[0].field("original_entry_id"), Some(id.as_str()));

    // The entry was acked with its DLQ routing, so later sweeps find
    // nothing.
    assert!(rig.store.pending(STREAM, GROUP, 0, 10).await.unwrap().is_empty());
    assert_eq!(rig.metrics.emails_processed_total.get(), 0);

    rig.stop(handle).await;
}

// ---------------------------------------------------------------------
// Producer-to-worker round trip
// ---------------------------------------------------------------------

#[tokio::test]
async fn records_flow_from_mailbox_to_processed() {
    let mut ingest = producer_rig(50);
    ingest.server.set(700, vec![1, 2, 3]);
    assert_eq!(ingest.producer.poll_once().await.unwrap(), 3);

    // Hand the same store to a worker.
    let settings = settings();
    let store = ingest.store.clone();
    let log: Arc<dyn LogStore> = store.clone();
    let state: Arc<dyn StateStore> = store.clone();
    let breakers = BreakerRegistry::new(settings.breaker.clone());
    let metrics = Arc::new(Metrics::new().unwrap());
    let stats = Arc::new(WorkerStats::default());
    let shutdown = Arc::new(ShutdownCoordinator::new(Duration::from_secs(30)));

    let rig = WorkerRig {
        worker: Arc::new(Worker::new(
            STREAM,
            GROUP,
            "worker_01",
            10,
            50,
            log.clone(),
            IdempotencyFilter::new(state, None),
            BackoffController::new(1.0, 60.0, 2.0, 5),
            DlqRouter::new(log.clone(), "email_ingestion_dlq", 10_000),
            Processor::new(Arc::new(ClassifyingHandler)),
            OrphanRecovery::new(log, STREAM, GROUP, "worker_01", settings.recovery.clone()),
            settings.recovery.check_interval(),
            breakers.get("redis"),
            metrics.clone(),
            shutdown.clone(),
            stats.clone(),
        )),
        store,
        metrics,
        stats,
        shutdown,
    };
    let handle = rig.spawn();

    let stats = rig.stats.clone();
    wait_until("all three records processed", || {
        stats.processed.load(Ordering::Relaxed) == 3
    })
    .await;

    assert_eq!(rig.metrics.emails_processed_total.get(), 3);
    assert_eq!(rig.metrics.dlq_messages_total.get(), 0);
    assert!(rig.store.pending(STREAM, GROUP, 0, 10).await.unwrap().is_empty());

    rig.stop(handle).await;
}
