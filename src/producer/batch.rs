//! Batched stream appends.
//!
//! Collects record payloads and flushes them through one pipelined
//! round trip, applying the approximate trimming bound so the producer
//! never blocks on trim.

use crate::store::{LogStore, Result};

/// Accumulates entries destined for one stream.
pub struct BatchAppender<'a> {
    log: &'a dyn LogStore,
    stream: &'a str,
    max_len: u64,
    entries: Vec<Vec<(String, String)>>,
}

impl<'a> BatchAppender<'a> {
    pub fn new(log: &'a dyn LogStore, stream: &'a str, max_len: u64) -> Self {
        Self {
            log,
            stream,
            max_len,
            entries: Vec::new(),
        }
    }

    pub fn add_payload(&mut self, payload: String) {
        self.entries.push(vec![("payload".to_owned(), payload)]);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Appends every collected entry in one round trip, returning the
    /// assigned entry ids in order.
    pub async fn flush(&mut self) -> Result<Vec<String>> {
        if self.entries.is_empty() {
            return Ok(Vec::new());
        }
        let entries = std::mem::take(&mut self.entries);
        self.log
            .append_batch(self.stream, &entries, Some(self.max_len))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{memory::MemoryStore, LogStore};

    #[tokio::test]
    async fn flush_appends_in_order_and_drains_the_batch() {
        let store = MemoryStore::new();
        let mut batch = BatchAppender::new(&store, "s", 100);

        batch.add_payload("one".into());
        batch.add_payload("two".into());
        assert_eq!(batch.len(), 2);

        let ids = batch.flush().await.unwrap();
        assert_eq!(ids.len(), 2);
        assert!(batch.is_empty());

        let entries = store.range("s", "-", "+", 10).await.unwrap();
        assert_eq!(entries[0].field("payload"), Some("one"));
        assert_eq!(entries[1].field("payload"), Some("two"));
    }

    #[tokio::test]
    async fn empty_flush_is_a_no_op() {
        let store = MemoryStore::new();
        let mut batch = BatchAppender::new(&store, "s", 100);
        assert!(batch.flush().await.unwrap().is_empty());
        assert_eq!(store.len("s").await.unwrap(), 0);
    }
}
