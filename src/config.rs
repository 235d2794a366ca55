//! Module dedicated to the pipeline configuration.
//!
//! Every setting is loadable from the environment. Sections mirror the
//! deployment contract: one struct per concern, aggregated into
//! [`Settings`]. Values are validated with type coercion and range
//! checks at startup; an invalid or missing required variable is a
//! fatal boot error.

use std::{env, time::Duration};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors related to configuration loading.
#[derive(Debug, Error)]
pub enum Error {
    #[error("missing required environment variable {0}")]
    MissingVarError(&'static str),
    #[error("invalid value {1:?} for environment variable {0}")]
    InvalidVarError(&'static str, String),
    #[error("value {1} for environment variable {0} is out of range")]
    OutOfRangeError(&'static str, u64),
}

pub type Result<T> = std::result::Result<T, Error>;

fn var(name: &'static str) -> Result<String> {
    env::var(name).map_err(|_| Error::MissingVarError(name))
}

fn var_or(name: &'static str, default: &str) -> String {
    env::var(name).unwrap_or_else(|_| default.to_owned())
}

fn parse<T: std::str::FromStr>(name: &'static str, raw: String) -> Result<T> {
    raw.parse()
        .map_err(|_| Error::InvalidVarError(name, raw.clone()))
}

fn var_parsed_or<T: std::str::FromStr>(name: &'static str, default: T) -> Result<T> {
    match env::var(name) {
        Ok(raw) => parse(name, raw),
        Err(_) => Ok(default),
    }
}

/// Log store connection and stream configuration.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct RedisSettings {
    /// Connection URL, e.g. `redis://localhost:6379/0`.
    pub url: String,

    /// Name of the primary ingestion stream.
    pub stream_name: String,

    /// Approximate trimming bound applied on append.
    pub max_stream_length: u64,
}

impl RedisSettings {
    pub fn from_env() -> Result<Self> {
        let max_stream_length = var_parsed_or("REDIS_MAX_STREAM_LENGTH", 10_000)?;
        if max_stream_length == 0 {
            return Err(Error::OutOfRangeError("REDIS_MAX_STREAM_LENGTH", 0));
        }
        Ok(Self {
            url: var("REDIS_URL")?,
            stream_name: var_or("REDIS_STREAM_NAME", "email_ingestion_stream"),
            max_stream_length,
        })
    }
}

/// IMAP server configuration.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct ImapSettings {
    /// The IMAP server host name.
    pub host: String,

    /// The IMAP server host port.
    pub port: u16,

    /// The mailbox to monitor.
    pub mailbox: String,

    /// Enables TLS/SSL.
    ///
    /// Defaults to `true`.
    pub ssl: Option<bool>,

    /// Trusts any certificate.
    ///
    /// Defaults to `false`.
    pub insecure: Option<bool>,

    /// The authenticated user identity, when not given on the CLI.
    pub user: Option<String>,

    /// Seconds between polling cycles.
    pub poll_interval_seconds: u64,

    /// Byte cap applied to the plain-text body preview.
    pub body_preview_bytes: usize,
}

impl ImapSettings {
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            host: var("IMAP_HOST")?,
            port: parse("IMAP_PORT", var("IMAP_PORT")?)?,
            mailbox: var_or("IMAP_MAILBOX", "INBOX"),
            ssl: match env::var("IMAP_SSL") {
                Ok(raw) => Some(parse("IMAP_SSL", raw)?),
                Err(_) => None,
            },
            insecure: match env::var("IMAP_INSECURE") {
                Ok(raw) => Some(parse("IMAP_INSECURE", raw)?),
                Err(_) => None,
            },
            user: env::var("IMAP_USER").ok(),
            poll_interval_seconds: var_parsed_or("IMAP_POLL_INTERVAL_SECONDS", 60)?,
            body_preview_bytes: var_parsed_or("IMAP_BODY_PREVIEW_BYTES", 2048)?,
        })
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_seconds)
    }

    /// TLS/SSL option getter.
    pub fn ssl(&self) -> bool {
        self.ssl.unwrap_or(true)
    }

    /// Insecure option getter.
    pub fn insecure(&self) -> bool {
        self.insecure.unwrap_or_default()
    }
}

/// Google OAuth 2.0 configuration (authorization code grant with a
/// loopback redirect).
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct GoogleSettings {
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
    pub token_file: String,
    pub redirect_host: String,
    pub redirect_port: u16,
}

impl GoogleSettings {
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            client_id: env::var("GOOGLE_CLIENT_ID").ok(),
            client_secret: env::var("GOOGLE_CLIENT_SECRET").ok(),
            token_file: var_or("GOOGLE_TOKEN_FILE", "tokens/gmail_token.json"),
            redirect_host: var_or("GOOGLE_REDIRECT_HOST", "localhost"),
            redirect_port: var_parsed_or("GOOGLE_REDIRECT_PORT", 8080)?,
        })
    }
}

/// Microsoft OAuth 2.0 configuration (device code grant, public
/// client).
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct MicrosoftSettings {
    pub client_id: Option<String>,
    pub tenant_id: String,
    pub token_file: String,
}

impl MicrosoftSettings {
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            client_id: env::var("MICROSOFT_CLIENT_ID").ok(),
            tenant_id: var_or("MICROSOFT_TENANT_ID", "common"),
            token_file: var_or("MICROSOFT_TOKEN_FILE", "tokens/outlook_token.json"),
        })
    }
}

/// Worker and consumer group configuration.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct WorkerSettings {
    pub consumer_group_name: String,
    pub consumer_name: String,
    pub batch_size: usize,
    pub block_timeout_ms: u64,
}

impl WorkerSettings {
    pub fn from_env() -> Result<Self> {
        let batch_size = var_parsed_or("WORKER_BATCH_SIZE", 10)?;
        if batch_size == 0 {
            return Err(Error::OutOfRangeError("WORKER_BATCH_SIZE", 0));
        }
        Ok(Self {
            consumer_group_name: var_or("CONSUMER_GROUP_NAME", "email_processor_group"),
            consumer_name: var_or("CONSUMER_NAME", "worker_01"),
            batch_size,
            block_timeout_ms: var_parsed_or("BLOCK_TIMEOUT_MS", 5000)?,
        })
    }
}

/// Idempotency set configuration.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct IdempotencySettings {
    /// TTL applied to each processed-ids partition, in seconds. Zero
    /// disables expiry and the set grows without bound.
    pub ttl_seconds: u64,
}

impl IdempotencySettings {
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            ttl_seconds: var_parsed_or("IDEMPOTENCY_TTL_SECONDS", 86_400)?,
        })
    }

    pub fn ttl(&self) -> Option<Duration> {
        match self.ttl_seconds {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        }
    }
}

/// Dead-letter queue and retry configuration.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DlqSettings {
    pub stream_name: String,
    pub max_retry_attempts: u64,
    pub initial_backoff_seconds: f64,
    pub max_backoff_seconds: f64,
    pub backoff_multiplier: f64,
}

impl DlqSettings {
    pub fn from_env() -> Result<Self> {
        let initial_backoff_seconds: f64 = var_parsed_or("INITIAL_BACKOFF_SECONDS", 2.0)?;
        let max_backoff_seconds: f64 = var_parsed_or("MAX_BACKOFF_SECONDS", 3600.0)?;
        if max_backoff_seconds < initial_backoff_seconds {
            return Err(Error::OutOfRangeError(
                "MAX_BACKOFF_SECONDS",
                max_backoff_seconds as u64,
            ));
        }
        Ok(Self {
            stream_name: var_or("DLQ_STREAM_NAME", "email_ingestion_dlq"),
            max_retry_attempts: var_parsed_or("MAX_RETRY_ATTEMPTS", 3)?,
            initial_backoff_seconds,
            max_backoff_seconds,
            backoff_multiplier: var_parsed_or("BACKOFF_MULTIPLIER", 2.0)?,
        })
    }
}

/// Monitoring ports and cadence.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct MonitoringSettings {
    pub producer_health_port: u16,
    pub worker_health_port: u16,
    pub producer_metrics_port: u16,
    pub worker_metrics_port: u16,
    pub update_interval_seconds: u64,
}

impl MonitoringSettings {
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            producer_health_port: var_parsed_or("PRODUCER_HEALTH_PORT", 8080)?,
            worker_health_port: var_parsed_or("WORKER_HEALTH_PORT", 8081)?,
            producer_metrics_port: var_parsed_or("PRODUCER_METRICS_PORT", 9090)?,
            worker_metrics_port: var_parsed_or("WORKER_METRICS_PORT", 9091)?,
            update_interval_seconds: var_parsed_or("METRICS_UPDATE_INTERVAL_SECONDS", 15)?,
        })
    }
}

/// Circuit breaker thresholds, shared by every named breaker.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BreakerSettings {
    pub failure_threshold: u32,
    pub recovery_timeout_seconds: f64,
    pub success_threshold: u32,
}

impl BreakerSettings {
    pub fn from_env() -> Result<Self> {
        let failure_threshold = var_parsed_or("CB_FAILURE_THRESHOLD", 5)?;
        if failure_threshold == 0 {
            return Err(Error::OutOfRangeError("CB_FAILURE_THRESHOLD", 0));
        }
        Ok(Self {
            failure_threshold,
            recovery_timeout_seconds: var_parsed_or("CB_RECOVERY_TIMEOUT_SECONDS", 60.0)?,
            success_threshold: var_parsed_or("CB_SUCCESS_THRESHOLD", 3)?,
        })
    }

    pub fn recovery_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.recovery_timeout_seconds)
    }
}

impl Default for BreakerSettings {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout_seconds: 60.0,
            success_threshold: 3,
        }
    }
}

/// Orphaned entry recovery configuration.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct RecoverySettings {
    pub min_idle_ms: u64,
    pub max_claim_count: usize,
    pub max_delivery_count: u64,
    pub check_interval_seconds: u64,
}

impl RecoverySettings {
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            min_idle_ms: var_parsed_or("RECOVERY_MIN_IDLE_MS", 300_000)?,
            max_claim_count: var_parsed_or("RECOVERY_MAX_CLAIM_COUNT", 50)?,
            max_delivery_count: var_parsed_or("RECOVERY_MAX_DELIVERY_COUNT", 10)?,
            check_interval_seconds: var_parsed_or("RECOVERY_CHECK_INTERVAL_SECONDS", 60)?,
        })
    }

    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_interval_seconds)
    }
}

/// Logging configuration.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct LoggingSettings {
    pub level: String,
    pub format: String,
}

impl LoggingSettings {
    pub fn from_env() -> Result<Self> {
        let format = var_or("LOG_FORMAT", "text");
        match format.as_str() {
            "text" | "json" => (),
            _ => return Err(Error::InvalidVarError("LOG_FORMAT", format)),
        }
        Ok(Self {
            level: var_or("LOG_LEVEL", "info"),
            format,
        })
    }

    pub fn json(&self) -> bool {
        self.format == "json"
    }
}

/// The main settings, aggregating every section.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    pub redis: RedisSettings,
    pub imap: ImapSettings,
    pub google: GoogleSettings,
    pub microsoft: MicrosoftSettings,
    pub worker: WorkerSettings,
    pub idempotency: IdempotencySettings,
    pub dlq: DlqSettings,
    pub monitoring: MonitoringSettings,
    pub breaker: BreakerSettings,
    pub recovery: RecoverySettings,
    pub logging: LoggingSettings,
    pub shutdown_timeout_seconds: u64,
    pub email_provider: String,
}

impl Settings {
    pub fn from_env() -> Result<Self> {
        let email_provider = var_or("EMAIL_PROVIDER", "gmail");
        match email_provider.as_str() {
            "gmail" | "outlook" => (),
            _ => return Err(Error::InvalidVarError("EMAIL_PROVIDER", email_provider)),
        }
        Ok(Self {
            redis: RedisSettings::from_env()?,
            imap: ImapSettings::from_env()?,
            google: GoogleSettings::from_env()?,
            microsoft: MicrosoftSettings::from_env()?,
            worker: WorkerSettings::from_env()?,
            idempotency: IdempotencySettings::from_env()?,
            dlq: DlqSettings::from_env()?,
            monitoring: MonitoringSettings::from_env()?,
            breaker: BreakerSettings::from_env()?,
            recovery: RecoverySettings::from_env()?,
            logging: LoggingSettings::from_env()?,
            shutdown_timeout_seconds: var_parsed_or("SHUTDOWN_TIMEOUT_SECONDS", 30)?,
            email_provider,
        })
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_seconds)
    }
}
