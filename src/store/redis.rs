//! Redis implementation of the log and state stores.
//!
//! Streams map onto `XADD`/`XREADGROUP`/`XACK`/`XPENDING`/`XCLAIM`,
//! scalars onto plain keys and the idempotency set onto a Redis set.
//! Batched appends go through one pipeline round trip.

use async_trait::async_trait;
use redis::{
    aio::ConnectionManager,
    streams::{
        StreamClaimReply, StreamMaxlen, StreamPendingCountReply, StreamRangeReply,
        StreamReadOptions, StreamReadReply,
    },
    AsyncCommands, RedisError,
};
use tracing::{debug, info};

use super::{Error, LogEntry, LogStore, PendingEntry, Result, StateStore};

/// Redis-backed store. Cloning is cheap: the connection manager
/// multiplexes one connection and reconnects on failure.
#[derive(Clone)]
pub struct RedisStore {
    connection: ConnectionManager,
}

impl RedisStore {
    /// Opens a connection manager against the given URL.
    pub async fn connect(url: &str) -> Result<Self> {
        let client = redis::Client::open(url).map_err(map_err)?;
        let connection = ConnectionManager::new(client).await.map_err(map_err)?;
        info!("redis store connected: {url}");
        Ok(Self { connection })
    }

    fn conn(&self) -> ConnectionManager {
        self.connection.clone()
    }
}

fn map_err(err: RedisError) -> Error {
    if err.is_io_error()
        || err.is_timeout()
        || err.is_connection_refusal()
        || err.is_connection_dropped()
    {
        Error::UnavailableError(Box::new(err))
    } else {
        Error::InvalidError(err.to_string())
    }
}

fn entry_from_stream_id(id: redis::streams::StreamId) -> Result<LogEntry> {
    let mut fields = std::collections::HashMap::with_capacity(id.map.len());
    for (name, value) in id.map {
        let value: String = redis::from_redis_value(&value)
            .map_err(|err| Error::InvalidError(format!("non-string stream field: {err}")))?;
        fields.insert(name, value);
    }
    Ok(LogEntry { id: id.id, fields })
}

#[async_trait]
impl LogStore for RedisStore {
    async fn append(
        &self,
        stream: &str,
        fields: &[(String, String)],
        max_len: Option<u64>,
    ) -> Result<String> {
        let mut conn = self.conn();
        let id: String = match max_len {
            Some(max_len) => conn
                .xadd_maxlen(stream, StreamMaxlen::Approx(max_len as usize), "*", fields)
                .await
                .map_err(map_err)?,
            None => conn.xadd(stream, "*", fields).await.map_err(map_err)?,
        };
        debug!("xadd to {stream}: {id}");
        Ok(id)
    }

    async fn append_batch(
        &self,
        stream: &str,
        entries: &[Vec<(String, String)>],
        max_len: Option<u64>,
    ) -> Result<Vec<String>> {
        if entries.is_empty() {
            return Ok(Vec::new());
        }

        let mut pipe = redis::pipe();
        for fields in entries {
            match max_len {
                Some(max_len) => {
                    pipe.xadd_maxlen(stream, StreamMaxlen::Approx(max_len as usize), "*", fields);
                }
                None => {
                    pipe.xadd(stream, "*", fields);
                }
            }
        }

        let mut conn = self.conn();
        let ids: Vec<String> = pipe.query_async(&mut conn).await.map_err(map_err)?;
        debug!("pipelined {} appends to {stream}", ids.len());
        Ok(ids)
    }

    async fn ensure_group(&self, stream: &str, group: &str, start: &str) -> Result<()> {
        let mut conn = self.conn();
        let created: std::result::Result<String, RedisError> =
            conn.xgroup_create_mkstream(stream, group, start).await;
        match created {
            Ok(_) => {
                info!("created consumer group {stream}/{group}");
                Ok(())
            }
            Err(err) if err.code() == Some("BUSYGROUP") => {
                debug!("consumer group already exists: {stream}/{group}");
                Ok(())
            }
            Err(err) => Err(map_err(err)),
        }
    }

    async fn read_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
        block_ms: u64,
    ) -> Result<Vec<LogEntry>> {
        let options = StreamReadOptions::default()
            .group(group, consumer)
            .count(count)
            .block(block_ms as usize);

        let mut conn = self.conn();
        let reply: StreamReadReply = conn
            .xread_options(&[stream], &[">"], &options)
            .await
            .map_err(map_err)?;

        let mut entries = Vec::new();
        for key in reply.keys {
            for id in key.ids {
                entries.push(entry_from_stream_id(id)?);
            }
        }
        Ok(entries)
    }

    async fn ack(&self, stream: &str, group: &str, ids: &[String]) -> Result<u64> {
        if ids.is_empty() {
            return Ok(0);
        }
        let mut conn = self.conn();
        let count: u64 = conn.xack(stream, group, ids).await.map_err(map_err)?;
        debug!("xack {stream}/{group}: {count} entries");
        Ok(count)
    }

    async fn pending(
        &self,
        stream: &str,
        group: &str,
        min_idle_ms: u64,
        count: usize,
    ) -> Result<Vec<PendingEntry>> {
        let mut conn = self.conn();
        let reply: StreamPendingCountReply = conn
            .xpending_count(stream, group, "-", "+", count)
            .await
            .map_err(map_err)?;

        Ok(reply
            .ids
            .into_iter()
            .filter(|id| id.last_delivered_ms as u64 >= min_idle_ms)
            .map(|id| PendingEntry {
                id: id.id,
                consumer: id.consumer,
                idle_ms: id.last_delivered_ms as u64,
                delivery_count: id.times_delivered as u64,
            })
            .collect())
    }

    async fn claim(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle_ms: u64,
        ids: &[String],
    ) -> Result<Vec<LogEntry>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let mut conn = self.conn();
        let reply: StreamClaimReply = conn
            .xclaim(stream, group, consumer, min_idle_ms as usize, ids)
            .await
            .map_err(map_err)?;

        let mut entries = Vec::with_capacity(reply.ids.len());
        for id in reply.ids {
            entries.push(entry_from_stream_id(id)?);
        }
        if !entries.is_empty() {
            info!("claimed {} entries for {consumer}", entries.len());
        }
        Ok(entries)
    }

    async fn range(
        &self,
        stream: &str,
        start: &str,
        end: &str,
        count: usize,
    ) -> Result<Vec<LogEntry>> {
        let mut conn = self.conn();
        let reply: StreamRangeReply = conn
            .xrange_count(stream, start, end, count)
            .await
            .map_err(map_err)?;

        let mut entries = Vec::with_capacity(reply.ids.len());
        for id in reply.ids {
            entries.push(entry_from_stream_id(id)?);
        }
        Ok(entries)
    }

    async fn delete(&self, stream: &str, ids: &[String]) -> Result<u64> {
        if ids.is_empty() {
            return Ok(0);
        }
        let mut conn = self.conn();
        conn.xdel(stream, ids).await.map_err(map_err)
    }

    async fn len(&self, stream: &str) -> Result<u64> {
        let mut conn = self.conn();
        conn.xlen(stream).await.map_err(map_err)
    }

    async fn trim(&self, stream: &str, max_len: u64) -> Result<u64> {
        let mut conn = self.conn();
        conn.xtrim(stream, StreamMaxlen::Approx(max_len as usize))
            .await
            .map_err(map_err)
    }
}

#[async_trait]
impl StateStore for RedisStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.conn();
        conn.get(key).await.map_err(map_err)
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        let mut conn = self.conn();
        conn.set(key, value).await.map_err(map_err)
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let mut conn = self.conn();
        let _: u64 = conn.del(key).await.map_err(map_err)?;
        Ok(())
    }

    async fn sadd(&self, set: &str, member: &str) -> Result<bool> {
        let mut conn = self.conn();
        let added: u64 = conn.sadd(set, member).await.map_err(map_err)?;
        Ok(added > 0)
    }

    async fn sismember(&self, set: &str, member: &str) -> Result<bool> {
        let mut conn = self.conn();
        conn.sismember(set, member).await.map_err(map_err)
    }

    async fn scard(&self, set: &str) -> Result<u64> {
        let mut conn = self.conn();
        conn.scard(set).await.map_err(map_err)
    }

    async fn expire(&self, key: &str, ttl_seconds: u64) -> Result<()> {
        let mut conn = self.conn();
        let _: bool = conn.expire(key, ttl_seconds as i64).await.map_err(map_err)?;
        Ok(())
    }

    async fn ping(&self) -> Result<()> {
        let mut conn = self.conn();
        let pong: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(map_err)?;
        if pong == "PONG" {
            Ok(())
        } else {
            Err(Error::InvalidError(format!("unexpected ping reply: {pong}")))
        }
    }
}
