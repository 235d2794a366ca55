//! Dead-letter routing.
//!
//! Records that exhausted their retries or violated an invariant are
//! wrapped in an envelope carrying the failure metadata and appended to
//! a secondary stream for operator review. The router also exposes the
//! operator surface: peek, reprocess into a target stream, and clear.

use std::sync::Arc;

use chrono::{SecondsFormat, Utc};
use tracing::{error, info, warn};

use crate::store::{LogEntry, LogStore, Result};

/// Routes failed records to the dead-letter stream.
pub struct DlqRouter {
    log: Arc<dyn LogStore>,
    stream: String,
    max_len: u64,
}

impl DlqRouter {
    pub fn new(log: Arc<dyn LogStore>, stream: impl ToString, max_len: u64) -> Self {
        Self {
            log,
            stream: stream.to_string(),
            max_len,
        }
    }

    pub fn stream(&self) -> &str {
        &self.stream
    }

    /// Wraps the failed record in a DLQ envelope and appends it.
    /// Returns the DLQ entry id.
    pub async fn send_to_dlq(
        &self,
        original_entry_id: &str,
        payload: &str,
        error_kind: &str,
        error_message: &str,
        retry_count: u64,
    ) -> Result<String> {
        let fields = vec![
            ("original_entry_id".to_owned(), original_entry_id.to_owned()),
            ("payload".to_owned(), payload.to_owned()),
            ("error_kind".to_owned(), error_kind.to_owned()),
            ("error_message".to_owned(), error_message.to_owned()),
            ("retry_count".to_owned(), retry_count.to_string()),
            (
                "failed_at".to_owned(),
                Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true),
            ),
        ];

        let id = self
            .log
            .append(&self.stream, &fields, Some(self.max_len))
            .await?;

        error!(
            "entry {original_entry_id} routed to dlq as {id} (kind={error_kind}, retries={retry_count})"
        );
        Ok(id)
    }

    /// Oldest entries of the DLQ, without removing them.
    pub async fn peek(&self, count: usize) -> Result<Vec<LogEntry>> {
        self.log.range(&self.stream, "-", "+", count).await
    }

    pub async fn len(&self) -> Result<u64> {
        self.log.len(&self.stream).await
    }

    /// Re-appends the original payload of a DLQ entry to
    /// `target_stream` and deletes the DLQ entry. Returns the new entry
    /// id, or `None` when the DLQ entry does not exist.
    pub async fn reprocess(
        &self,
        dlq_entry_id: &str,
        target_stream: &str,
    ) -> Result<Option<String>> {
        let entries = self
            .log
            .range(&self.stream, dlq_entry_id, dlq_entry_id, 1)
            .await?;
        let Some(entry) = entries.first() else {
            warn!("dlq entry not found for reprocessing: {dlq_entry_id}");
            return Ok(None);
        };

        let payload = entry.field("payload").unwrap_or_default().to_owned();
        let new_id = self
            .log
            .append(
                target_stream,
                &[("payload".to_owned(), payload)],
                None,
            )
            .await?;

        self.log
            .delete(&self.stream, &[dlq_entry_id.to_owned()])
            .await?;

        info!("reprocessed dlq entry {dlq_entry_id} -> {new_id} on {target_stream}");
        Ok(Some(new_id))
    }

    /// Deletes every DLQ entry. Returns the number removed.
    pub async fn clear(&self) -> Result<u64> {
        let mut removed = 0;
        loop {
            let entries = self.log.range(&self.stream, "-", "+", 100).await?;
            if entries.is_empty() {
                break;
            }
            let ids: Vec<String> = entries.into_iter().map(|entry| entry.id).collect();
            removed += self.log.delete(&self.stream, &ids).await?;
        }
        warn!("cleared dlq: {removed} entries removed");
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::MemoryStore;

    fn router(store: Arc<MemoryStore>) -> DlqRouter {
        DlqRouter::new(store, "dlq", 1000)
    }

    #[tokio::test]
    async fn envelope_carries_the_failure_metadata() {
        let store = Arc::new(MemoryStore::new());
        let dlq = router(store);

        dlq.send_to_dlq("5-0", r#"{"uid":1}"#, "ProcessingTransient", "boom", 3)
            .await
            .unwrap();

        let entries = dlq.peek(10).await.unwrap();
        assert_eq!(entries.len(), 1);
        let entry = &entries[0];
        assert_eq!(entry.field("original_entry_id"), Some("5-0"));
        assert_eq!(entry.field("payload"), Some(r#"{"uid":1}"#));
        assert_eq!(entry.field("error_kind"), Some("ProcessingTransient"));
        assert_eq!(entry.field("error_message"), Some("boom"));
        assert_eq!(entry.field("retry_count"), Some("3"));
        assert!(entry.field("failed_at").is_some());
    }

    #[tokio::test]
    async fn reprocess_moves_the_payload_back_and_deletes_the_envelope() {
        let store = Arc::new(MemoryStore::new());
        let dlq = router(store.clone());

        let id = dlq
            .send_to_dlq("5-0", r#"{"uid":1}"#, "InvariantViolation", "bad", 0)
            .await
            .unwrap();

        let new_id = dlq.reprocess(&id, "primary").await.unwrap();
        assert!(new_id.is_some());
        assert_eq!(dlq.len().await.unwrap(), 0);

        let primary = store.range("primary", "-", "+", 10).await.unwrap();
        assert_eq!(primary.len(), 1);
        assert_eq!(primary[0].field("payload"), Some(r#"{"uid":1}"#));
    }

    #[tokio::test]
    async fn reprocess_of_a_missing_entry_is_none() {
        let store = Arc::new(MemoryStore::new());
        let dlq = router(store);
        assert_eq!(dlq.reprocess("99-0", "primary").await.unwrap(), None);
    }

    #[tokio::test]
    async fn clear_empties_the_stream() {
        let store = Arc::new(MemoryStore::new());
        let dlq = router(store);

        for n in 0..3 {
            dlq.send_to_dlq(&format!("{n}-0"), "{}", "X", "x", 0)
                .await
                .unwrap();
        }
        assert_eq!(dlq.clear().await.unwrap(), 3);
        assert_eq!(dlq.len().await.unwrap(), 0);
    }
}
