//! Email producer: polls an IMAP mailbox and appends normalized
//! records to the primary stream.
//!
//! Exit codes: 0 on clean shutdown, 1 on unrecoverable initialization
//! errors, 2 when authentication setup is required.

use std::{
    sync::{atomic::AtomicBool, Arc},
    time::Duration,
};

use clap::Parser;
use tokio::sync::watch;
use tracing::{error, info};

use mail_ingest::{
    auth::{gmail::GmailAuthorizer, outlook::OutlookAuthorizer, Authorizer},
    breaker::BreakerRegistry,
    config::Settings,
    health::{self, FlagCheck, HealthState, StorePing},
    imap::ImapConnector,
    init_tracing,
    metrics::{self, Metrics, MetricsUpdater},
    producer::{Error as ProducerError, Producer, ProducerStats},
    shutdown::ShutdownCoordinator,
    store::{redis::RedisStore, LogStore, StateStore},
    worker::recovery::ConnectionWatchdog,
};

#[derive(Debug, Parser)]
#[command(name = "producer", about = "Email producer: IMAP to stream ingestion")]
struct Cli {
    /// Email address to poll (defaults to IMAP_USER).
    #[arg(long)]
    username: Option<String>,

    /// Mailbox to monitor.
    #[arg(long, default_value = "INBOX")]
    mailbox: String,

    /// Maximum messages fetched per poll.
    #[arg(long, default_value_t = 50)]
    batch_size: usize,

    /// Seconds between polls (defaults to IMAP_POLL_INTERVAL_SECONDS).
    #[arg(long)]
    poll_interval: Option<u64>,

    /// Fetch messages but do not append them to the stream.
    #[arg(long)]
    dry_run: bool,

    /// Run the interactive OAuth 2.0 setup flow and exit.
    #[arg(long)]
    auth_setup: bool,

    /// Email provider: gmail or outlook (defaults to EMAIL_PROVIDER).
    #[arg(long)]
    provider: Option<String>,
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

    let provider = cli
        .provider
        .clone()
        .unwrap_or_else(|| settings.email_provider.clone());
    let authorizer: Arc<dyn Authorizer> = match provider.as_str() {
        "gmail" => Arc::new(GmailAuthorizer::new(settings.google.clone())),
        "outlook" => Arc::new(OutlookAuthorizer::new(settings.microsoft.clone())),
        other => {
            error!("unsupported email provider '{other}', expected gmail or outlook");
            return 1;
        }
    };

    if cli.auth_setup {
        info!("running oauth2 setup for provider '{provider}'");
        return match authorizer.interactive_setup().await {
            Ok(_) => {
                info!("oauth2 setup complete");
                0
            }
            Err(err) => {
                error!("oauth2 setup failed: {err}");
                1
            }
        };
    }

    let Some(username) = cli.username.clone().or_else(|| settings.imap.user.clone()) else {
        error!("username required: pass --username or set IMAP_USER");
        return 1;
    };

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
    let imap_breaker = breakers.get("imap");
    let store_breaker = breakers.get("redis");

    let metrics = match Metrics::new() {
        Ok(metrics) => Arc::new(metrics),
        Err(err) => {
            error!("cannot initialize metrics: {err}");
            return 1;
        }
    };

    let stats = Arc::new(ProducerStats::default());
    let auth_healthy = Arc::new(AtomicBool::new(true));

    let health_state = Arc::new(
        HealthState::new("producer", breakers.clone())
            .with_check(Arc::new(StorePing::new("redis", state.clone())))
            .with_check(Arc::new(FlagCheck::new(
                "auth",
                auth_healthy.clone(),
                "token refresh failed",
            )))
            .with_stats(stats.clone()),
    );
    let health_handle = match health::serve(
        health_state,
        settings.monitoring.producer_health_port,
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
        settings.monitoring.producer_metrics_port,
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
        &settings.redis.stream_name,
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

    // Teardown order: servers and daemon tasks first, then wait for the
    // polling loop to drain (its exit performs the IMAP logout), and
    // only then release the store.
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
    shutdown.register(10, "producer-drain", move || async move {
        let mut drained_rx = drained_rx;
        let _ = drained_rx.wait_for(|drained| *drained).await;
    });
    shutdown.register(30, "store-connections", || async {
        info!("releasing store connections");
    });

    let poll_interval = cli
        .poll_interval
        .map(Duration::from_secs)
        .unwrap_or_else(|| settings.imap.poll_interval());

    let connector = Box::new(ImapConnector::new(
        settings.imap.clone(),
        &username,
        authorizer,
    ));

    let mut producer = Producer::new(
        &settings,
        &username,
        &cli.mailbox,
        cli.batch_size,
        poll_interval,
        cli.dry_run,
        connector,
        log,
        state,
        imap_breaker,
        store_breaker,
        metrics,
        shutdown.clone(),
        stats,
        auth_healthy,
    );

    let result = producer.run().await;
    let _ = drained_tx.send(true);

    let code = match result {
        Ok(()) => 0,
        Err(ProducerError::AuthSetupRequiredError(err)) => {
            error!("{err}; run with --auth-setup to authenticate");
            2
        }
    };

    if shutdown.is_running() {
        shutdown.initiate().await;
    } else {
        shutdown.stopped().await;
    }

    code
}
