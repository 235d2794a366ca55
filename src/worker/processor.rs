//! Record processing.
//!
//! Validates the minimum schema of an incoming record, then dispatches
//! to a pluggable [`MailHandler`]. Handlers must be deterministic with
//! respect to the natural identity so redeliveries are safe.

use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

use async_trait::async_trait;
use serde_json::{json, Value};
use thiserror::Error;
use tracing::{debug, info};

use crate::imap::record::{self, MailRecord, PartialRecord};

/// Errors related to record processing.
#[derive(Debug, Error)]
pub enum Error {
    #[error("record violates an invariant: {0}")]
    InvariantViolationError(String),
    #[error("handler failed: {0}")]
    TransientError(String),
}

impl Error {
    /// Non-retryable failures go straight to the DLQ.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::TransientError(_))
    }

    /// The `error_kind` recorded in DLQ envelopes.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::InvariantViolationError(_) => "InvariantViolation",
            Error::TransientError(_) => "ProcessingTransient",
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// Outcome of a successful processing.
#[derive(Clone, Debug)]
pub struct Outcome {
    pub processed: bool,
    pub result: Value,
}

/// Pluggable business handler.
#[async_trait]
pub trait MailHandler: Send + Sync {
    async fn handle(&self, record: &MailRecord) -> Result<Value>;
}

/// Default handler: attaches a deterministic classification (priority
/// from the subject, category from the sender domain).
#[derive(Default)]
pub struct ClassifyingHandler;

#[async_trait]
impl MailHandler for ClassifyingHandler {
    async fn handle(&self, record: &MailRecord) -> Result<Value> {
        let subject = record.subject.to_lowercase();
        let priority = if subject.contains("urgent") || subject.contains("critical") {
            "high"
        } else if subject.contains("important") {
            "medium"
        } else {
            "normal"
        };

        let category = record
            .from
            .rsplit('@')
            .next()
            .map(|domain| domain.trim_end_matches('>'))
            .filter(|domain| !domain.is_empty())
            .unwrap_or("unknown");

        debug!(
            "classified {}: priority={priority}, category={category}",
            record.message_id
        );

        Ok(json!({
            "message_id": record.message_id,
            "from": record.from,
            "subject": record.subject,
            "priority": priority,
            "category": category,
        }))
    }
}

/// Validates and transforms one record at a time.
pub struct Processor {
    handler: Arc<dyn MailHandler>,
    processed: AtomicU64,
    failed: AtomicU64,
}

impl Processor {
    pub fn new(handler: Arc<dyn MailHandler>) -> Self {
        Self {
            handler,
            processed: AtomicU64::new(0),
            failed: AtomicU64::new(0),
        }
    }

    /// Validates the minimum schema then runs the handler.
    pub async fn process(&self, partial: PartialRecord) -> Result<Outcome> {
        let mail_record = partial.validate().map_err(|err| match err {
            record::Error::MissingFieldsError(fields) => {
                Error::InvariantViolationError(format!("missing required fields: {fields}"))
            }
            err => Error::InvariantViolationError(err.to_string()),
        })?;

        let result = match self.handler.handle(&mail_record).await {
            Ok(result) => result,
            Err(err) => {
                self.failed.fetch_add(1, Ordering::Relaxed);
                return Err(err);
            }
        };

        self.processed.fetch_add(1, Ordering::Relaxed);
        info!(
            "processed {} (uid={}, mailbox={})",
            mail_record.message_id, mail_record.uid, mail_record.mailbox
        );

        Ok(Outcome {
            processed: true,
            result,
        })
    }

    pub fn stats(&self) -> Value {
        let processed = self.processed.load(Ordering::Relaxed);
        let failed = self.failed.load(Ordering::Relaxed);
        let total = processed + failed;
        let success_rate = if total == 0 {
            1.0
        } else {
            processed as f64 / total as f64
        };
        json!({
            "processed": processed,
            "failed": failed,
            "success_rate": success_rate,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn partial(json: &str) -> PartialRecord {
        PartialRecord::decode(json).unwrap()
    }

    fn processor() -> Processor {
        Processor::new(Arc::new(ClassifyingHandler))
    }

    #[tokio::test]
    async fn valid_record_is_processed_with_a_classification() {
        let outcome = processor()
            .process(partial(
                r#"{"uid":1,"uidvalidity":700,"mailbox":"INBOX","account":"a@b.c",
                   "from":"Boss <boss@corp.example>","subject":"URGENT: read me"}"#,
            ))
            .await
            .unwrap();

        assert!(outcome.processed);
        assert_eq!(outcome.result["priority"], "high");
        assert_eq!(outcome.result["category"], "corp.example");
    }

    #[tokio::test]
    async fn record_without_uid_is_an_invariant_violation() {
        let err = processor()
            .process(partial(r#"{"mailbox":"INBOX","uidvalidity":700}"#))
            .await
            .unwrap_err();

        assert!(matches!(err, Error::InvariantViolationError(_)));
        assert!(!err.is_retryable());
        assert_eq!(err.kind(), "InvariantViolation");
    }

    #[tokio::test]
    async fn handler_failures_are_transient() {
        struct FailingHandler;

        #[async_trait]
        impl MailHandler for FailingHandler {
            async fn handle(&self, _record: &MailRecord) -> Result<Value> {
                Err(Error::TransientError("downstream unavailable".into()))
            }
        }

        let processor = Processor::new(Arc::new(FailingHandler));
        let err = processor
            .process(partial(
                r#"{"uid":1,"uidvalidity":700,"mailbox":"INBOX"}"#,
            ))
            .await
            .unwrap_err();

        assert!(err.is_retryable());
        assert_eq!(err.kind(), "ProcessingTransient");
        assert_eq!(processor.stats()["failed"], 1);
    }

    #[tokio::test]
    async fn classification_is_deterministic_per_identity() {
        let processor = processor();
        let raw = r#"{"uid":9,"uidvalidity":700,"mailbox":"INBOX","account":"a@b.c",
                      "from":"x@y.z","subject":"hello"}"#;

        let first = processor.process(partial(raw)).await.unwrap();
        let second = processor.process(partial(raw)).await.unwrap();
        assert_eq!(first.result, second.result);
    }
}
