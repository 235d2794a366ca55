//! Email worker: consumes the primary stream through a consumer group,
//! deduplicates, processes and routes failures.
//!
//! Exit codes: 0 on clean shutdown, 1 on unrecoverable initialization
//! errors.

use std::{sync::Arc, time::Duration};

use clap::Parser;
use tokio::sync::watch;
use tracing::{error, info};

use mail_ingest::{
    breaker::BreakerRegistry,
    config::Settings,
    health::{self, HealthState, StorePing},
    init_tracing,
    metrics::{self, Metrics, MetricsUpdater},
    shutdown::ShutdownCoordinator,
    store::{redis::RedisStore, LogStore, StateStore},
    worker::{
        backoff::BackoffController,
        dlq::DlqRouter,
        idempotency::IdempotencyFilter,
        processor::{ClassifyingHandler, Processor},
        recovery::{ConnectionWatchdog, OrphanRecovery},
        Worker, WorkerStats,
    },
};

#[derive(Debug, Parser)]
#[command(name = "worker", about = "Email worker: stream consumer with idempotency and DLQ")]
struct Cli {
    /// Stream to consume (defaults to REDIS_STREAM_NAME).
    #[arg(long)]
    stream: Option<String>,

    /// Consumer group name (defaults to CONSUMER_GROUP_NAME).
    #[arg(long)]
    group: Option<String>,

    /// This consumer's name within the group (defaults to
    /// CONSUMER_NAME).
    #[arg(long)]
    consumer: Option<String>,

    /// Entries read per batch (defaults to WORKER_BATCH_SIZE).
    #[arg(long)]
    batch_size: Option<usize>,

    /// Blocking read timeout in milliseconds (defaults to
    /// BLOCK_TIMEOUT_MS).
    #[arg(long)]
    block_timeout: Option<u64>,
}

#[tokio::main]
async fn main() {
    std::process::exit(run().await);
}

async fn run() -> i32 {
    let cli = Cli::parse();

    let settings = match Settings::from_env() {
        Ok(settings) => settings,
        Err(err) => {
            eprintln!("configuration error: {err}");
            return 1;
        }
    };
    init_tracing(&settings.logging);

    let stream = cli
        .stream
        .clone()
        .unwrap_or_else(|| settings.redis.stream_name.clone());
    let group = cli
        .group
        .clone()
        .unwrap_or_else(|| settings.worker.consumer_group_name.clone());
    let consumer = cli
        .consumer
        .clone()
        .unwrap_or_else(|| settings.worker.consumer_name.clone());
    let batch_size = cli.batch_size.unwrap_or(settings.worker.batch_size);
    let block_ms = cli.block_timeout.unwrap_or(settings.worker.block_timeout_ms);

    let store = match RedisStore::connect(&settings.redis.url).await {
        Ok(store) => store,
        Err(err) => {
            error!("cannot connect to the log store: {err}");
            return 1;
        }
    };
    if let Err(err) = store.ping().await {
        error!("log store unreachable: {err}");
        return 1;
    }
    let log: Arc<dyn LogStore> = Arc::new(store.clone());
    let state: Arc<dyn StateStore> = Arc::new(store);

    let shutdown = Arc::new(ShutdownCoordinator::new(settings.shutdown_timeout()));
    shutdown.clone().install_signal_handlers();

    let breakers = Arc::new(BreakerRegistry::new(settings.breaker.clone()));
    let store_breaker = breakers.get("redis");

    let metrics = match Metrics::new() {
        Ok(metrics) => Arc::new(metrics),
        Err(err) => {
            error!("cannot initialize metrics: {err}");
            return 1;
        }
    };

    let stats = Arc::new(WorkerStats::default());

    let health_state = Arc::new(
        HealthState::new("worker", breakers.clone())
            .with_check(Arc::new(StorePing::new("redis", state.clone())))
            .with_stats(stats.clone()),
    );
    let health_handle = match health::serve(
        health_state,
        settings.monitoring.worker_health_port,
        &shutdown,
    )
    .await
    {
        Ok(handle) => handle,
        Err(err) => {
            error!("cannot start the health endpoint: {err}");
            return 1;
        }
    };

    let metrics_handle = match metrics::serve(
        metrics.clone(),
        settings.monitoring.worker_metrics_port,
        &shutdown,
    )
    .await
    {
        Ok(handle) => handle,
        Err(err) => {
            error!("cannot start the metrics endpoint: {err}");
            return 1;
        }
    };

    let updater_handle = MetricsUpdater::new(
        metrics.clone(),
        log.clone(),
        &stream,
        &settings.dlq.stream_name,
        breakers.clone(),
        Duration::from_secs(settings.monitoring.update_interval_seconds),
    )
    .spawn(&shutdown);

    let watchdog_handle = ConnectionWatchdog::new(Duration::from_secs(30), 3)
        .add_check(
            Arc::new(StorePing::new("redis", state.clone())),
            store_breaker.clone(),
        )
        .spawn(&shutdown);

    shutdown.register(5, "health-server", move || async move {
        let _ = health_handle.await;
    });
    shutdown.register(5, "metrics-server", move || async move {
        let _ = metrics_handle.await;
    });
    shutdown.register(7, "metrics-updater", move || async move {
        let _ = updater_handle.await;
    });
    shutdown.register(8, "connection-watchdog", move || async move {
        let _ = watchdog_handle.await;
    });

    let (drained_tx, drained_rx) = watch::channel(false);
    shutdown.register(10, "worker-drain", move || async move {
        let mut drained_rx = drained_rx;
        let _ = drained_rx.wait_for(|drained| *drained).await;
    });
    shutdown.register(30, "store-connections", || async {
        info!("releasing store connections");
    });

    let worker = Worker::new(
        &stream,
        &group,
        &consumer,
        batch_size,
        block_ms,
        log.clone(),
        IdempotencyFilter::new(state.clone(), settings.idempotency.ttl()),
        BackoffController::new(
            settings.dlq.initial_backoff_seconds,
            settings.dlq.max_backoff_seconds,
            settings.dlq.backoff_multiplier,
            settings.dlq.max_retry_attempts,
        ),
        DlqRouter::new(
            log.clone(),
            &settings.dlq.stream_name,
            settings.redis.max_stream_length,
        ),
        Processor::new(Arc::new(ClassifyingHandler)),
        OrphanRecovery::new(log, &stream, &group, &consumer, settings.recovery.clone()),
        settings.recovery.check_interval(),
        store_breaker,
        metrics,
        shutdown.clone(),
        stats,
    );

    let result = worker.run().await;
    let _ = drained_tx.send(true);

    let code = match result {
        Ok(()) => 0,
        Err(err) => {
            error!("worker failed: {err}");
            1
        }
    };

    if shutdown.is_running() {
        shutdown.initiate().await;
    } else {
        shutdown.stopped().await;
    }

    code
}
