//! Mail record model.
//!
//! A [`MailRecord`] is the normalized unit carried by the primary
//! stream: envelope metadata plus a bounded body preview. Records are
//! immutable once appended. The worker decodes incoming payloads
//! through [`PartialRecord`], a permissive mirror whose validation
//! enforces the minimum schema.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors related to record decoding and validation.
#[derive(Debug, Error)]
pub enum Error {
    #[error("cannot decode mail record payload")]
    DecodePayloadError(#[source] serde_json::Error),
    #[error("mail record is missing required fields: {0}")]
    MissingFieldsError(String),
}

pub type Result<T> = std::result::Result<T, Error>;

/// A normalized mail record.
///
/// `(account, mailbox, uidvalidity, uid)` is the natural identity of
/// the record and the idempotency key of the worker.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct MailRecord {
    /// IMAP UID within the mailbox under the recorded UIDVALIDITY.
    pub uid: u64,

    /// Mailbox epoch assigned by the IMAP server. A change invalidates
    /// all previously observed UIDs.
    pub uidvalidity: u64,

    /// Folder name, e.g. `INBOX`.
    pub mailbox: String,

    /// The authenticated user identity.
    pub account: String,

    pub from: String,
    pub to: Vec<String>,
    pub subject: String,
    pub date: String,
    pub message_id: String,
    pub size: u64,
    pub headers: BTreeMap<String, String>,

    /// Plain-text body, truncated to the configured cap. Truncation is
    /// destructive and not signaled.
    pub body_text: String,
    pub body_html_preview: String,

    /// RFC 3339 timestamp (UTC) of the fetch.
    pub fetched_at: String,

    /// Trace id of the produce operation.
    pub correlation_id: String,
}

impl MailRecord {
    /// The natural identity string,
    /// `account|mailbox|uidvalidity|uid`.
    pub fn identity(&self) -> String {
        identity(&self.account, &self.mailbox, self.uidvalidity, self.uid)
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

/// Builds a natural identity string from its parts.
pub fn identity(account: &str, mailbox: &str, uidvalidity: u64, uid: u64) -> String {
    format!("{account}|{mailbox}|{uidvalidity}|{uid}")
}

/// Permissive mirror of [`MailRecord`] used on the consuming side:
/// every field is optional so malformed payloads surface as validation
/// failures instead of decode errors.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct PartialRecord {
    pub uid: Option<u64>,
    pub uidvalidity: Option<u64>,
    pub mailbox: Option<String>,
    pub account: Option<String>,
    #[serde(default)]
    pub from: Option<String>,
    #[serde(default)]
    pub to: Vec<String>,
    #[serde(default)]
    pub subject: Option<String>,
    #[serde(default)]
    pub date: Option<String>,
    #[serde(default)]
    pub message_id: Option<String>,
    #[serde(default)]
    pub size: Option<u64>,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub body_text: Option<String>,
    #[serde(default)]
    pub body_html_preview: Option<String>,
    #[serde(default)]
    pub fetched_at: Option<String>,
    #[serde(default)]
    pub correlation_id: Option<String>,
}

impl PartialRecord {
    pub fn decode(payload: &str) -> Result<Self> {
        serde_json::from_str(payload).map_err(Error::DecodePayloadError)
    }

    /// The natural identity, when every component is present.
    pub fn identity(&self) -> Option<String> {
        Some(identity(
            self.account.as_deref()?,
            self.mailbox.as_deref()?,
            self.uidvalidity?,
            self.uid?,
        ))
    }

    /// Enforces the minimum schema (`uid`, `mailbox`, `uidvalidity`)
    /// and converts into a full record.
    pub fn validate(self) -> Result<MailRecord> {
        let mut missing = Vec::new();
        if self.uid.is_none() {
            missing.push("uid");
        }
        if self.uidvalidity.is_none() {
            missing.push("uidvalidity");
        }
        if self.mailbox.is_none() {
            missing.push("mailbox");
        }
        if !missing.is_empty() {
            return Err(Error::MissingFieldsError(missing.join(", ")));
        }

        Ok(MailRecord {
            uid: self.uid.unwrap_or_default(),
            uidvalidity: self.uidvalidity.unwrap_or_default(),
            mailbox: self.mailbox.unwrap_or_default(),
            account: self.account.unwrap_or_default(),
            from: self.from.unwrap_or_default(),
            to: self.to,
            subject: self.subject.unwrap_or_default(),
            date: self.date.unwrap_or_default(),
            message_id: self.message_id.unwrap_or_default(),
            size: self.size.unwrap_or_default(),
            headers: self.headers,
            body_text: self.body_text.unwrap_or_default(),
            body_html_preview: self.body_html_preview.unwrap_or_default(),
            fetched_at: self.fetched_at.unwrap_or_default(),
            correlation_id: self.correlation_id.unwrap_or_default(),
        })
    }
}

/// Truncates a string to at most `cap` bytes on a character boundary.
pub fn truncate_preview(text: &str, cap: usize) -> String {
    if text.len() <= cap {
        return text.to_owned();
    }
    let mut end = cap;
    while end > 0 && !text.is_char_boundary(end) {
        end -= 1;
    }
    text[..end].to_owned()
}

/// Parses an RFC 5322 header block into a name to value map. Folded
/// continuation lines are unfolded; the last occurrence of a repeated
/// header wins.
pub fn parse_headers(raw: &[u8]) -> BTreeMap<String, String> {
    let text = String::from_utf8_lossy(raw);
    let mut headers = BTreeMap::new();
    let mut current: Option<(String, String)> = None;

    for line in text.lines() {
        if line.is_empty() {
            break;
        }
        if line.starts_with(' ') || line.starts_with('\t') {
            if let Some((_, value)) = current.as_mut() {
                value.push(' ');
                value.push_str(line.trim());
            }
            continue;
        }
        if let Some((name, value)) = current.take() {
            headers.insert(name, value);
        }
        if let Some((name, value)) = line.split_once(':') {
            current = Some((name.trim().to_owned(), value.trim().to_owned()));
        }
    }
    if let Some((name, value)) = current {
        headers.insert(name, value);
    }
    headers
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record() -> MailRecord {
        MailRecord {
            uid: 42,
            uidvalidity: 700,
            mailbox: "INBOX".into(),
            account: "user@example.com".into(),
            from: "Alice <alice@example.com>".into(),
            to: vec!["user@example.com".into()],
            subject: "hello".into(),
            date: "2024-05-01T10:00:00Z".into(),
            message_id: "<abc@example.com>".into(),
            size: 1234,
            headers: BTreeMap::from([("Subject".into(), "hello".into())]),
            body_text: "body".into(),
            body_html_preview: String::new(),
            fetched_at: "2024-05-01T10:00:01Z".into(),
            correlation_id: "cid".into(),
        }
    }

    #[test]
    fn record_round_trips_through_json() {
        let original = record();
        let json = original.to_json().unwrap();
        let decoded: MailRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(original, decoded);
    }

    #[test]
    fn identity_is_the_four_part_tuple() {
        assert_eq!(record().identity(), "user@example.com|INBOX|700|42");
    }

    #[test]
    fn validation_rejects_missing_minimum_fields() {
        let partial = PartialRecord::decode(r#"{"mailbox":"INBOX"}"#).unwrap();
        let err = partial.validate().unwrap_err();
        assert!(matches!(err, Error::MissingFieldsError(fields) if fields == "uid, uidvalidity"));
    }

    #[test]
    fn partial_identity_requires_all_components() {
        let partial =
            PartialRecord::decode(r#"{"uid":1,"uidvalidity":2,"mailbox":"INBOX"}"#).unwrap();
        assert_eq!(partial.identity(), None);

        let partial = PartialRecord::decode(
            r#"{"uid":1,"uidvalidity":2,"mailbox":"INBOX","account":"a@b.c"}"#,
        )
        .unwrap();
        assert_eq!(partial.identity().as_deref(), Some("a@b.c|INBOX|2|1"));
    }

    #[test]
    fn preview_truncation_respects_char_boundaries() {
        assert_eq!(truncate_preview("hello", 10), "hello");
        assert_eq!(truncate_preview("hello", 3), "hel");
        // Multi-byte character straddling the cap is dropped entirely.
        assert_eq!(truncate_preview("héllo", 2), "h");
    }

    #[test]
    fn header_block_unfolds_continuation_lines() {
        let raw = b"Subject: a very\r\n long subject\r\nFrom: alice@example.com\r\n\r\nbody";
        let headers = parse_headers(raw);
        assert_eq!(headers["Subject"], "a very long subject");
        assert_eq!(headers["From"], "alice@example.com");
        assert_eq!(headers.len(), 2);
    }
}
