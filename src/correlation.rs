//! Module dedicated to correlation scopes.
//!
//! A correlation id is an ambient string identifying one logical
//! operation (a poll cycle, the processing of a single entry). It is
//! propagated across asynchronous boundaries with a task-local and
//! attached to every log event through a tracing span, so callers never
//! thread it explicitly. Scopes nest: leaving a scope restores the
//! outer id.

use std::sync::atomic::{AtomicU64, Ordering};

use tracing::{info_span, Instrument};
use uuid::Uuid;

tokio::task_local! {
    static CORRELATION_ID: String;
}

static SCOPES_OPENED: AtomicU64 = AtomicU64::new(0);

/// Generates a new random 128-bit correlation id, hex encoded.
pub fn generate() -> String {
    Uuid::new_v4().simple().to_string()
}

/// Returns the correlation id of the current scope, if any.
pub fn current() -> Option<String> {
    CORRELATION_ID.try_with(Clone::clone).ok()
}

/// Number of scopes opened since process start. Exposed on the status
/// surface.
pub fn scopes_opened() -> u64 {
    SCOPES_OPENED.load(Ordering::Relaxed)
}

/// Runs the given future inside a fresh correlation scope.
pub async fn scope<F: std::future::Future>(fut: F) -> F::Output {
    scope_with(generate(), fut).await
}

/// Runs the given future inside a correlation scope with an explicit
/// id. Log events emitted inside the future carry the id as a span
/// field.
pub async fn scope_with<F: std::future::Future>(id: String, fut: F) -> F::Output {
    SCOPES_OPENED.fetch_add(1, Ordering::Relaxed);
    let span = info_span!("operation", correlation_id = %id);
    CORRELATION_ID.scope(id, fut.instrument(span)).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn scope_sets_and_clears_the_ambient_id() {
        assert_eq!(current(), None);

        scope_with("abc".into(), async {
            assert_eq!(current().as_deref(), Some("abc"));
        })
        .await;

        assert_eq!(current(), None);
    }

    #[tokio::test]
    async fn scopes_nest_and_restore_the_outer_id() {
        scope_with("outer".into(), async {
            scope_with("inner".into(), async {
                assert_eq!(current().as_deref(), Some("inner"));
            })
            .await;

            assert_eq!(current().as_deref(), Some("outer"));
        })
        .await;
    }

    #[test]
    fn generated_ids_are_128_bit_hex() {
        let id = generate();
        assert_eq!(id.len(), 32);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(generate(), generate());
    }
}
