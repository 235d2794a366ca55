//! Producer cursor persistence.
//!
//! One cursor per `(account, mailbox)` tracks the highest UID whose
//! append was acknowledged, the mailbox epoch it was observed under,
//! and operational counters. The cursor key is written only by the one
//! producer owning that mailbox.

use std::sync::Arc;

use chrono::{SecondsFormat, Utc};
use tracing::{debug, info, warn};

use crate::store::{Error, Result, StateStore};

/// The persisted cursor of one mailbox.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Cursor {
    /// Highest UID successfully appended. Zero means nothing was
    /// ingested under the current epoch yet.
    pub last_uid: u64,

    /// The mailbox epoch observed at the last poll, absent before the
    /// first successful cycle.
    pub uidvalidity: Option<u64>,

    pub last_poll_at: Option<String>,

    /// Monotonic counter, operational only.
    pub total_emails: u64,
}

/// Reads and writes cursors against the state store.
pub struct CursorStore {
    state: Arc<dyn StateStore>,
    account: String,
}

impl CursorStore {
    pub fn new(state: Arc<dyn StateStore>, account: impl ToString) -> Self {
        Self {
            state,
            account: account.to_string(),
        }
    }

    fn key(&self, mailbox: &str, kind: &str) -> String {
        format!("producer_state:{}:{mailbox}:{kind}", self.account)
    }

    async fn get_u64(&self, key: &str) -> Result<Option<u64>> {
        match self.state.get(key).await? {
            None => Ok(None),
            Some(raw) => raw
                .parse()
                .map(Some)
                .map_err(|_| Error::InvalidError(format!("non-numeric cursor value at {key}: {raw}"))),
        }
    }

    pub async fn load(&self, mailbox: &str) -> Result<Cursor> {
        let cursor = Cursor {
            last_uid: self
                .get_u64(&self.key(mailbox, "last_uid"))
                .await?
                .unwrap_or(0),
            uidvalidity: self.get_u64(&self.key(mailbox, "uidvalidity")).await?,
            last_poll_at: self.state.get(&self.key(mailbox, "last_poll")).await?,
            total_emails: self
                .get_u64(&self.key(mailbox, "total_emails"))
                .await?
                .unwrap_or(0),
        };
        debug!("loaded cursor for {mailbox}: {cursor:?}");
        Ok(cursor)
    }

    /// Records the first observed epoch of a mailbox.
    pub async fn set_uidvalidity(&self, mailbox: &str, uidvalidity: u64) -> Result<()> {
        self.state
            .set(&self.key(mailbox, "uidvalidity"), &uidvalidity.to_string())
            .await?;
        info!("stored uidvalidity for {mailbox}: {uidvalidity}");
        Ok(())
    }

    /// Resets the cursor for a new epoch: the new `uidvalidity` and
    /// `last_uid = 0` are written together, before any fetch is
    /// attempted against the new epoch.
    pub async fn reset(&self, mailbox: &str, uidvalidity: u64) -> Result<()> {
        warn!("resetting cursor for {mailbox} to uidvalidity {uidvalidity}");
        self.state
            .set(&self.key(mailbox, "uidvalidity"), &uidvalidity.to_string())
            .await?;
        self.state.set(&self.key(mailbox, "last_uid"), "0").await?;
        Ok(())
    }

    /// Advances the cursor after a successful batch.
    pub async fn advance(&self, mailbox: &str, uidvalidity: u64, last_uid: u64) -> Result<()> {
        self.state
            .set(&self.key(mailbox, "uidvalidity"), &uidvalidity.to_string())
            .await?;
        self.state
            .set(&self.key(mailbox, "last_uid"), &last_uid.to_string())
            .await?;
        self.touch(mailbox).await?;
        info!("cursor advanced for {mailbox}: uidvalidity={uidvalidity}, last_uid={last_uid}");
        Ok(())
    }

    /// Updates only the last poll timestamp.
    pub async fn touch(&self, mailbox: &str) -> Result<()> {
        let now = Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true);
        self.state.set(&self.key(mailbox, "last_poll"), &now).await
    }

    pub async fn add_emails(&self, mailbox: &str, count: u64) -> Result<()> {
        let key = self.key(mailbox, "total_emails");
        let total = self.get_u64(&key).await?.unwrap_or(0) + count;
        self.state.set(&key, &total.to_string()).await
    }

    /// Operational snapshot of the cursor, logged at startup.
    pub async fn summary(&self, mailbox: &str) -> Result<serde_json::Value> {
        let cursor = self.load(mailbox).await?;
        Ok(serde_json::json!({
            "mailbox": mailbox,
            "last_uid": cursor.last_uid,
            "uidvalidity": cursor.uidvalidity,
            "last_poll": cursor.last_poll_at,
            "total_emails": cursor.total_emails,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::MemoryStore;

    #[tokio::test]
    async fn fresh_cursor_starts_at_zero_with_no_epoch() {
        let store = Arc::new(MemoryStore::new());
        let cursors = CursorStore::new(store, "user@example.com");

        let cursor = cursors.load("INBOX").await.unwrap();
        assert_eq!(cursor.last_uid, 0);
        assert_eq!(cursor.uidvalidity, None);
    }

    #[tokio::test]
    async fn advance_and_reload_round_trips() {
        let store = Arc::new(MemoryStore::new());
        let cursors = CursorStore::new(store, "user@example.com");

        cursors.advance("INBOX", 700, 12).await.unwrap();
        cursors.add_emails("INBOX", 3).await.unwrap();

        let cursor = cursors.load("INBOX").await.unwrap();
        assert_eq!(cursor.last_uid, 12);
        assert_eq!(cursor.uidvalidity, Some(700));
        assert_eq!(cursor.total_emails, 3);
        assert!(cursor.last_poll_at.is_some());
    }

    #[tokio::test]
    async fn reset_zeroes_the_uid_and_moves_the_epoch() {
        let store = Arc::new(MemoryStore::new());
        let cursors = CursorStore::new(store, "user@example.com");

        cursors.advance("INBOX", 700, 12).await.unwrap();
        cursors.reset("INBOX", 701).await.unwrap();

        let cursor = cursors.load("INBOX").await.unwrap();
        assert_eq!(cursor.last_uid, 0);
        assert_eq!(cursor.uidvalidity, Some(701));
    }

    #[tokio::test]
    async fn cursor_keys_are_namespaced_per_account_and_mailbox() {
        let store = Arc::new(MemoryStore::new());
        let a = CursorStore::new(store.clone(), "a@example.com");
        let b = CursorStore::new(store, "b@example.com");

        a.advance("INBOX", 1, 5).await.unwrap();
        assert_eq!(b.load("INBOX").await.unwrap().last_uid, 0);
        assert_eq!(a.load("Archive").await.unwrap().last_uid, 0);
    }
}
