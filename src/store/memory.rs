//! In-process implementation of the log and state stores.
//!
//! Implements the full consumer-group contract (pending-entries list,
//! delivery counts, idle-based claims) so producer and worker loops can
//! be exercised end to end without a Redis server. Used by the
//! integration suite and by dry runs.

use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
    time::{Duration, Instant},
};

use async_trait::async_trait;
use tokio::sync::{Mutex, Notify};

use super::{Error, LogEntry, LogStore, PendingEntry, Result, StateStore};

#[derive(Clone, Debug)]
struct StoredEntry {
    seq: u64,
    id: String,
    fields: HashMap<String, String>,
}

#[derive(Clone, Debug)]
struct Pending {
    consumer: String,
    delivered_at: Instant,
    delivery_count: u64,
}

#[derive(Debug, Default)]
struct Group {
    last_delivered_seq: u64,
    pending: HashMap<String, Pending>,
}

#[derive(Debug, Default)]
struct Stream {
    next_seq: u64,
    entries: Vec<StoredEntry>,
    groups: HashMap<String, Group>,
}

#[derive(Default)]
struct Inner {
    streams: HashMap<String, Stream>,
    values: HashMap<String, String>,
    sets: HashMap<String, HashSet<String>>,
    expiries: HashMap<String, Instant>,
}

impl Inner {
    fn purge_expired(&mut self, key: &str) {
        if let Some(deadline) = self.expiries.get(key) {
            if Instant::now() >= *deadline {
                self.expiries.remove(key);
                self.values.remove(key);
                self.sets.remove(key);
            }
        }
    }
}

/// In-memory store with Redis-stream semantics.
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<Inner>>,
    appended: Arc<Notify>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn append_locked(
        inner: &mut Inner,
        stream: &str,
        fields: &[(String, String)],
        max_len: Option<u64>,
    ) -> String {
        let stream = inner.streams.entry(stream.to_owned()).or_default();
        stream.next_seq += 1;
        let seq = stream.next_seq;
        let id = format!("{seq}-0");
        stream.entries.push(StoredEntry {
            seq,
            id: id.clone(),
            fields: fields.iter().cloned().collect(),
        });
        if let Some(max_len) = max_len {
            let excess = stream.entries.len().saturating_sub(max_len as usize);
            if excess > 0 {
                stream.entries.drain(..excess);
            }
        }
        id
    }

    /// Forces the pending entries of a group to look idle, so claim
    /// thresholds can be crossed deterministically in tests.
    pub async fn age_pending(&self, stream: &str, group: &str, idle: Duration) {
        let mut inner = self.inner.lock().await;
        if let Some(group) = inner
            .streams
            .get_mut(stream)
            .and_then(|s| s.groups.get_mut(group))
        {
            for pending in group.pending.values_mut() {
                pending.delivered_at = Instant::now() - idle;
            }
        }
    }
}

fn seq_of(id: &str) -> u64 {
    id.split('-')
        .next()
        .and_then(|part| part.parse().ok())
        .unwrap_or(0)
}

#[async_trait]
impl LogStore for MemoryStore {
    async fn append(
        &self,
        stream: &str,
        fields: &[(String, String)],
        max_len: Option<u64>,
    ) -> Result<String> {
        let mut inner = self.inner.lock().await;
        let id = Self::append_locked(&mut inner, stream, fields, max_len);
        drop(inner);
        self.appended.notify_waiters();
        Ok(id)
    }

    async fn append_batch(
        &self,
        stream: &str,
        entries: &[Vec<(String, String)>],
        max_len: Option<u64>,
    ) -> Result<Vec<String>> {
        let mut inner = self.inner.lock().await;
        let ids = entries
            .iter()
            .map(|fields| Self::append_locked(&mut inner, stream, fields, max_len))
            .collect();
        drop(inner);
        self.appended.notify_waiters();
        Ok(ids)
    }

    async fn ensure_group(&self, stream: &str, group: &str, _start: &str) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner
            .streams
            .entry(stream.to_owned())
            .or_default()
            .groups
            .entry(group.to_owned())
            .or_default();
        Ok(())
    }

    async fn read_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
        block_ms: u64,
    ) -> Result<Vec<LogEntry>> {
        let deadline = Instant::now() + Duration::from_millis(block_ms);
        loop {
            let notified = self.appended.notified();
            {
                let mut inner = self.inner.lock().await;
                let stream_data = inner
                    .streams
                    .entry(stream.to_owned())
                    .or_default();
                let group_data = stream_data
                    .groups
                    .get_mut(group)
                    .ok_or_else(|| Error::NotFoundError(format!("group {group}")))?;

                let cursor = group_data.last_delivered_seq;
                let fresh: Vec<StoredEntry> = stream_data
                    .entries
                    .iter()
                    .filter(|entry| entry.seq > cursor)
                    .take(count)
                    .cloned()
                    .collect();

                if !fresh.is_empty() {
                    let mut delivered = Vec::with_capacity(fresh.len());
                    for entry in fresh {
                        group_data.last_delivered_seq = entry.seq;
                        group_data.pending.insert(
                            entry.id.clone(),
                            Pending {
                                consumer: consumer.to_owned(),
                                delivered_at: Instant::now(),
                                delivery_count: 1,
                            },
                        );
                        delivered.push(LogEntry {
                            id: entry.id,
                            fields: entry.fields,
                        });
                    }
                    return Ok(delivered);
                }
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(Vec::new());
            }
            let _ = tokio::time::timeout(remaining, notified).await;
        }
    }

    async fn ack(&self, stream: &str, group: &str, ids: &[String]) -> Result<u64> {
        let mut inner = self.inner.lock().await;
        let Some(group) = inner
            .streams
            .get_mut(stream)
            .and_then(|s| s.groups.get_mut(group))
        else {
            return Ok(0);
        };
        let mut acked = 0;
        for id in ids {
            if group.pending.remove(id).is_some() {
                acked += 1;
            }
        }
        Ok(acked)
    }

    async fn pending(
        &self,
        stream: &str,
        group: &str,
        min_idle_ms: u64,
        count: usize,
    ) -> Result<Vec<PendingEntry>> {
        let inner = self.inner.lock().await;
        let Some(group) = inner.streams.get(stream).and_then(|s| s.groups.get(group)) else {
            return Ok(Vec::new());
        };
        let mut entries: Vec<PendingEntry> = group
            .pending
            .iter()
            .filter_map(|(id, pending)| {
                let idle_ms = pending.delivered_at.elapsed().as_millis() as u64;
                (idle_ms >= min_idle_ms).then(|| PendingEntry {
                    id: id.clone(),
                    consumer: pending.consumer.clone(),
                    idle_ms,
                    delivery_count: pending.delivery_count,
                })
            })
            .collect();
        entries.sort_by_key(|entry| seq_of(&entry.id));
        entries.truncate(count);
        Ok(entries)
    }

    async fn claim(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle_ms: u64,
        ids: &[String],
    ) -> Result<Vec<LogEntry>> {
        let mut inner = self.inner.lock().await;
        let Some(stream_data) = inner.streams.get_mut(stream) else {
            return Ok(Vec::new());
        };
        let Some(group_data) = stream_data.groups.get_mut(group) else {
            return Ok(Vec::new());
        };

        let mut claimed = Vec::new();
        for id in ids {
            let Some(pending) = group_data.pending.get_mut(id) else {
                continue;
            };
            if (pending.delivered_at.elapsed().as_millis() as u64) < min_idle_ms {
                continue;
            }
            // A claimed entry whose payload was deleted drops out of
            // the pending list, mirroring XCLAIM.
            let Some(entry) = stream_data.entries.iter().find(|entry| &entry.id == id) else {
                group_data.pending.remove(id);
                continue;
            };
            pending.consumer = consumer.to_owned();
            pending.delivered_at = Instant::now();
            pending.delivery_count += 1;
            claimed.push(LogEntry {
                id: entry.id.clone(),
                fields: entry.fields.clone(),
            });
        }
        Ok(claimed)
    }

    async fn range(
        &self,
        stream: &str,
        start: &str,
        end: &str,
        count: usize,
    ) -> Result<Vec<LogEntry>> {
        let inner = self.inner.lock().await;
        let Some(stream_data) = inner.streams.get(stream) else {
            return Ok(Vec::new());
        };
        let low = match start {
            "-" => 0,
            id => seq_of(id),
        };
        let high = match end {
            "+" => u64::MAX,
            id => seq_of(id),
        };
        Ok(stream_data
            .entries
            .iter()
            .filter(|entry| entry.seq >= low && entry.seq <= high)
            .take(count)
            .map(|entry| LogEntry {
                id: entry.id.clone(),
                fields: entry.fields.clone(),
            })
            .collect())
    }

    async fn delete(&self, stream: &str, ids: &[String]) -> Result<u64> {
        let mut inner = self.inner.lock().await;
        let Some(stream_data) = inner.streams.get_mut(stream) else {
            return Ok(0);
        };
        let before = stream_data.entries.len();
        stream_data.entries.retain(|entry| !ids.contains(&entry.id));
        Ok((before - stream_data.entries.len()) as u64)
    }

    async fn len(&self, stream: &str) -> Result<u64> {
        let inner = self.inner.lock().await;
        Ok(inner
            .streams
            .get(stream)
            .map(|s| s.entries.len() as u64)
            .unwrap_or(0))
    }

    async fn trim(&self, stream: &str, max_len: u64) -> Result<u64> {
        let mut inner = self.inner.lock().await;
        let Some(stream_data) = inner.streams.get_mut(stream) else {
            return Ok(0);
        };
        let excess = stream_data.entries.len().saturating_sub(max_len as usize);
        if excess > 0 {
            stream_data.entries.drain(..excess);
        }
        Ok(excess as u64)
    }
}

#[async_trait]
impl StateStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut inner = self.inner.lock().await;
        inner.purge_expired(key);
        Ok(inner.values.get(key).cloned())
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner.values.insert(key.to_owned(), value.to_owned());
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner.values.remove(key);
        inner.sets.remove(key);
        inner.expiries.remove(key);
        Ok(())
    }

    async fn sadd(&self, set: &str, member: &str) -> Result<bool> {
        let mut inner = self.inner.lock().await;
        inner.purge_expired(set);
        Ok(inner
            .sets
            .entry(set.to_owned())
            .or_default()
            .insert(member.to_owned()))
    }

    async fn sismember(&self, set: &str, member: &str) -> Result<bool> {
        let mut inner = self.inner.lock().await;
        inner.purge_expired(set);
        Ok(inner
            .sets
            .get(set)
            .map(|members| members.contains(member))
            .unwrap_or(false))
    }

    async fn scard(&self, set: &str) -> Result<u64> {
        let mut inner = self.inner.lock().await;
        inner.purge_expired(set);
        Ok(inner.sets.get(set).map(|members| members.len() as u64).unwrap_or(0))
    }

    async fn expire(&self, key: &str, ttl_seconds: u64) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner
            .expiries
            .insert(key.to_owned(), Instant::now() + Duration::from_secs(ttl_seconds));
        Ok(())
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn entries_are_delivered_to_exactly_one_consumer_per_group() {
        let store = MemoryStore::new();
        store.ensure_group("s", "g", "0").await.unwrap();
        store
            .append("s", &[("payload".into(), "a".into())], None)
            .await
            .unwrap();

        let first = store.read_group("s", "g", "c1", 10, 0).await.unwrap();
        let second = store.read_group("s", "g", "c2", 10, 0).await.unwrap();

        assert_eq!(first.len(), 1);
        assert!(second.is_empty());
    }

    #[tokio::test]
    async fn ack_removes_from_pending_and_is_idempotent() {
        let store = MemoryStore::new();
        store.ensure_group("s", "g", "0").await.unwrap();
        let id = store
            .append("s", &[("payload".into(), "a".into())], None)
            .await
            .unwrap();
        store.read_group("s", "g", "c1", 10, 0).await.unwrap();

        assert_eq!(store.ack("s", "g", &[id.clone()]).await.unwrap(), 1);
        assert_eq!(store.ack("s", "g", &[id]).await.unwrap(), 0);
        assert!(store.pending("s", "g", 0, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn claim_transfers_ownership_and_increments_delivery_count() {
        let store = MemoryStore::new();
        store.ensure_group("s", "g", "0").await.unwrap();
        let id = store
            .append("s", &[("payload".into(), "a".into())], None)
            .await
            .unwrap();
        store.read_group("s", "g", "c1", 10, 0).await.unwrap();

        let claimed = store.claim("s", "g", "c2", 0, &[id]).await.unwrap();
        assert_eq!(claimed.len(), 1);

        let pending = store.pending("s", "g", 0, 10).await.unwrap();
        assert_eq!(pending[0].consumer, "c2");
        assert_eq!(pending[0].delivery_count, 2);
    }

    #[tokio::test]
    async fn trim_drops_the_oldest_entries() {
        let store = MemoryStore::new();
        for n in 0..5 {
            store
                .append("s", &[("payload".into(), n.to_string())], Some(3))
                .await
                .unwrap();
        }
        assert_eq!(store.len("s").await.unwrap(), 3);
    }
}
