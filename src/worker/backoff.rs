//! Exponential backoff controller.
//!
//! Tracks per-entry retry counts in memory and computes capped
//! exponential delays. The map is a hint: the durable "needs retry"
//! fact lives in the pending-entries list of the log, and the orphan
//! sweep enforces the delivery ceiling independently, so losing this
//! state on restart cannot cause unbounded retries.

use std::{
    collections::HashMap,
    sync::Mutex,
    time::{Duration, Instant},
};

use tracing::{debug, info};

#[derive(Clone, Copy, Debug)]
struct RetryState {
    retry_count: u64,
    next_retry_at: Instant,
    last_touched: Instant,
}

/// Retry bookkeeping for in-flight entries.
pub struct BackoffController {
    initial: f64,
    max_delay: f64,
    multiplier: f64,
    max_retries: u64,
    entries: Mutex<HashMap<String, RetryState>>,
}

impl BackoffController {
    pub fn new(initial: f64, max_delay: f64, multiplier: f64, max_retries: u64) -> Self {
        Self {
            initial,
            max_delay,
            multiplier,
            max_retries,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Delay before the given attempt (0-indexed):
    /// `min(initial * multiplier^attempt, max_delay)`.
    pub fn calculate_delay(&self, attempt: u64) -> Duration {
        let delay = self.initial * self.multiplier.powf(attempt as f64);
        Duration::from_secs_f64(delay.min(self.max_delay))
    }

    /// Records a failure, returning the updated retry count. The next
    /// retry time advances by the exponential delay.
    pub fn record_failure(&self, entry_id: &str) -> u64 {
        let mut entries = self.entries.lock().unwrap();
        let now = Instant::now();
        let state = entries.entry(entry_id.to_owned()).or_insert(RetryState {
            retry_count: 0,
            next_retry_at: now,
            last_touched: now,
        });
        state.retry_count += 1;
        let delay = self.calculate_delay(state.retry_count - 1);
        state.next_retry_at = now + delay;
        state.last_touched = now;

        info!(
            "recorded failure for {entry_id}: attempt {}/{}, next retry in {delay:?}",
            state.retry_count, self.max_retries
        );
        state.retry_count
    }

    /// Clears the tracking after a success.
    pub fn record_success(&self, entry_id: &str) {
        let mut entries = self.entries.lock().unwrap();
        if let Some(state) = entries.remove(entry_id) {
            debug!(
                "entry {entry_id} succeeded after {} failed attempts",
                state.retry_count
            );
        }
    }

    /// Whether the entry is still within its retry budget.
    pub fn should_retry(&self, entry_id: &str) -> bool {
        self.retry_count(entry_id) <= self.max_retries
    }

    pub fn retry_count(&self, entry_id: &str) -> u64 {
        self.entries
            .lock()
            .unwrap()
            .get(entry_id)
            .map(|state| state.retry_count)
            .unwrap_or(0)
    }

    /// Remaining delay before the entry should be retried.
    pub fn delay(&self, entry_id: &str) -> Duration {
        self.entries
            .lock()
            .unwrap()
            .get(entry_id)
            .map(|state| state.next_retry_at.saturating_duration_since(Instant::now()))
            .unwrap_or(Duration::ZERO)
    }

    /// Drops entries untouched for longer than `idle`. Called
    /// opportunistically by the worker.
    pub fn gc(&self, idle: Duration) -> usize {
        let mut entries = self.entries.lock().unwrap();
        let before = entries.len();
        entries.retain(|_, state| state.last_touched.elapsed() < idle);
        let removed = before - entries.len();
        if removed > 0 {
            debug!("garbage-collected {removed} stale retry entries");
        }
        removed
    }

    pub fn tracked(&self) -> usize {
        self.entries.lock().unwrap().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn controller() -> BackoffController {
        BackoffController::new(1.0, 60.0, 2.0, 5)
    }

    #[test]
    fn delays_grow_exponentially_and_cap() {
        let backoff = controller();
        assert_eq!(backoff.calculate_delay(0), Duration::from_secs(1));
        assert_eq!(backoff.calculate_delay(1), Duration::from_secs(2));
        assert_eq!(backoff.calculate_delay(2), Duration::from_secs(4));
        assert_eq!(backoff.calculate_delay(10), Duration::from_secs(60));
    }

    #[test]
    fn entry_exhausts_after_max_retries_plus_one_failures() {
        let backoff = controller();

        // Five failures stay within the budget.
        for _ in 0..5 {
            backoff.record_failure("1-0");
            assert!(backoff.should_retry("1-0"));
        }

        // The sixth failure exceeds it.
        backoff.record_failure("1-0");
        assert!(!backoff.should_retry("1-0"));
        assert_eq!(backoff.retry_count("1-0"), 6);
    }

    #[test]
    fn success_clears_the_tracking() {
        let backoff = controller();
        backoff.record_failure("1-0");
        backoff.record_success("1-0");
        assert_eq!(backoff.retry_count("1-0"), 0);
        assert_eq!(backoff.tracked(), 0);
    }

    #[test]
    fn observed_delay_sequence_matches_the_formula() {
        let backoff = controller();
        backoff.record_failure("1-0");
        let first = backoff.delay("1-0");
        assert!(first <= Duration::from_secs(1));
        assert!(first > Duration::from_millis(900));

        backoff.record_failure("1-0");
        assert!(backoff.delay("1-0") > Duration::from_millis(1900));

        backoff.record_failure("1-0");
        assert!(backoff.delay("1-0") > Duration::from_millis(3900));
    }

    #[test]
    fn gc_drops_only_stale_entries() {
        let backoff = controller();
        backoff.record_failure("old");
        assert_eq!(backoff.gc(Duration::ZERO), 1);
        assert_eq!(backoff.tracked(), 0);

        backoff.record_failure("fresh");
        assert_eq!(backoff.gc(Duration::from_secs(3600)), 0);
        assert_eq!(backoff.tracked(), 1);
    }
}
