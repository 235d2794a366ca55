//! Idempotency filter.
//!
//! Membership checks against a deduplication set keyed by the natural
//! identity `(account, mailbox, uidvalidity, uid)`. The set is
//! partitioned by epoch, which bounds cardinality and makes the reset
//! after a UIDVALIDITY change a single key deletion. Identities are
//! inserted only after the processor succeeded.

use std::{sync::Arc, time::Duration};

use tracing::debug;

use crate::store::{Result, StateStore};

/// Key of the processed-ids partition for one mailbox epoch.
pub fn partition_key(account: &str, mailbox: &str, uidvalidity: u64) -> String {
    format!("idempotency:processed_ids:{account}:{mailbox}:{uidvalidity}")
}

/// The deduplication filter of the worker.
pub struct IdempotencyFilter {
    state: Arc<dyn StateStore>,
    ttl: Option<Duration>,
}

impl IdempotencyFilter {
    pub fn new(state: Arc<dyn StateStore>, ttl: Option<Duration>) -> Self {
        Self { state, ttl }
    }

    fn key_for(identity: &str) -> String {
        // Identity shape: account|mailbox|uidvalidity|uid.
        let mut parts = identity.split('|');
        let account = parts.next().unwrap_or_default();
        let mailbox = parts.next().unwrap_or_default();
        let uidvalidity = parts
            .next()
            .and_then(|raw| raw.parse().ok())
            .unwrap_or_default();
        partition_key(account, mailbox, uidvalidity)
    }

    /// Whether the identity was already processed.
    pub async fn is_duplicate(&self, identity: &str) -> Result<bool> {
        let duplicate = self
            .state
            .sismember(&Self::key_for(identity), identity)
            .await?;
        if duplicate {
            debug!("identity already processed: {identity}");
        }
        Ok(duplicate)
    }

    /// Marks the identity as processed, returning whether it was newly
    /// inserted. Applies the configured TTL to the partition.
    pub async fn mark_processed(&self, identity: &str) -> Result<bool> {
        let key = Self::key_for(identity);
        let added = self.state.sadd(&key, identity).await?;
        if added {
            if let Some(ttl) = self.ttl {
                self.state.expire(&key, ttl.as_secs()).await?;
            }
            debug!("marked identity as processed: {identity}");
        }
        Ok(added)
    }

    /// Cardinality of one partition, for operator tooling.
    pub async fn partition_len(
        &self,
        account: &str,
        mailbox: &str,
        uidvalidity: u64,
    ) -> Result<u64> {
        self.state
            .scard(&partition_key(account, mailbox, uidvalidity))
            .await
    }
}
