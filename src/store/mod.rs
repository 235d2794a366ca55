//! Module dedicated to the log and state stores.
//!
//! The pipeline talks to its durable backends through two seams:
//! [`LogStore`] for the append-only streams with consumer-group
//! dispatch, and [`StateStore`] for scalar cursors and the idempotency
//! set. [`redis::RedisStore`] implements both against Redis;
//! [`memory::MemoryStore`] implements both in-process with full
//! consumer-group semantics for the test suite and dry runs.

pub mod memory;
pub mod redis;

use std::collections::HashMap;

use async_trait::async_trait;
use thiserror::Error;

/// Errors related to store operations.
#[derive(Debug, Error)]
pub enum Error {
    #[error("store unavailable")]
    UnavailableError(#[source] Box<dyn std::error::Error + Send + Sync + 'static>),
    #[error("stream or key not found: {0}")]
    NotFoundError(String),
    #[error("invalid store operation: {0}")]
    InvalidError(String),
}

pub type Result<T> = std::result::Result<T, Error>;

/// One entry read from a stream: the server-assigned id plus its
/// field map.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct LogEntry {
    pub id: String,
    pub fields: HashMap<String, String>,
}

impl LogEntry {
    pub fn field(&self, name: &str) -> Option<&str> {
        self.fields.get(name).map(String::as_str)
    }
}

/// One entry of a consumer group's pending-entries list.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct PendingEntry {
    pub id: String,
    pub consumer: String,
    pub idle_ms: u64,
    pub delivery_count: u64,
}

/// Append-only log with consumer-group dispatch.
///
/// Guarantees: `append` is durable per store configuration;
/// `read_group` never returns the same entry to two consumers of one
/// group without a reclaim; `ensure_group` succeeds when the group
/// already exists. Trimming is approximate so producers never block on
/// it.
#[async_trait]
pub trait LogStore: Send + Sync {
    /// Appends one entry, optionally trimming the stream to
    /// approximately `max_len`. Returns the server-assigned entry id.
    async fn append(
        &self,
        stream: &str,
        fields: &[(String, String)],
        max_len: Option<u64>,
    ) -> Result<String>;

    /// Appends several entries in one batched round trip.
    async fn append_batch(
        &self,
        stream: &str,
        entries: &[Vec<(String, String)>],
        max_len: Option<u64>,
    ) -> Result<Vec<String>>;

    /// Creates the consumer group if it does not exist yet. An already
    /// existing group is not an error.
    async fn ensure_group(&self, stream: &str, group: &str, start: &str) -> Result<()>;

    /// Reads up to `count` new entries for the given consumer, blocking
    /// up to `block_ms` when the stream is drained. Entries stay in the
    /// pending list until acknowledged.
    async fn read_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
        block_ms: u64,
    ) -> Result<Vec<LogEntry>>;

    /// Acknowledges entries. Idempotent. Returns the number of entries
    /// that were actually pending.
    async fn ack(&self, stream: &str, group: &str, ids: &[String]) -> Result<u64>;

    /// Lists pending entries of the group that have been idle for at
    /// least `min_idle_ms`.
    async fn pending(
        &self,
        stream: &str,
        group: &str,
        min_idle_ms: u64,
        count: usize,
    ) -> Result<Vec<PendingEntry>>;

    /// Transfers ownership of idle pending entries to `consumer`,
    /// incrementing their delivery count. Returns the claimed entries.
    async fn claim(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle_ms: u64,
        ids: &[String],
    ) -> Result<Vec<LogEntry>>;

    /// Reads a raw range of the stream, oldest first.
    async fn range(&self, stream: &str, start: &str, end: &str, count: usize)
        -> Result<Vec<LogEntry>>;

    /// Deletes entries by id. Returns the number removed.
    async fn delete(&self, stream: &str, ids: &[String]) -> Result<u64>;

    /// Current stream length.
    async fn len(&self, stream: &str) -> Result<u64>;

    /// Approximately trims the stream to `max_len`.
    async fn trim(&self, stream: &str, max_len: u64) -> Result<u64>;
}

/// Durable scalar and set storage. All operations are single-key
/// atomic.
#[async_trait]
pub trait StateStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>>;
    async fn set(&self, key: &str, value: &str) -> Result<()>;
    async fn delete(&self, key: &str) -> Result<()>;

    /// Adds a member to a set, returning whether it was newly added.
    async fn sadd(&self, set: &str, member: &str) -> Result<bool>;
    async fn sismember(&self, set: &str, member: &str) -> Result<bool>;
    async fn scard(&self, set: &str) -> Result<u64>;

    /// Sets a relative expiry on a key.
    async fn expire(&self, key: &str, ttl_seconds: u64) -> Result<()>;

    /// Connectivity probe used by readiness checks and the watchdog.
    async fn ping(&self) -> Result<()>;
}
