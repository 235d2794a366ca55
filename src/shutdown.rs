//! Module dedicated to graceful shutdown.
//!
//! The coordinator owns the process lifecycle: `Running` until a
//! SIGINT/SIGTERM (or a programmatic [`ShutdownCoordinator::initiate`])
//! moves it to `ShuttingDown`, then registered teardown callbacks run
//! sequentially in priority order (lower first) within one bounded
//! total timeout, and the state settles to `Stopped`. Callbacks that
//! exceed the remaining budget are abandoned.
//!
//! Long-running loops observe the lifecycle through
//! [`ShutdownCoordinator::cancelled`] inside `select!` so every
//! blocking call returns promptly on teardown.

use std::{
    future::Future,
    pin::Pin,
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};

use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Lifecycle states of the coordinator.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ShutdownState {
    Running,
    ShuttingDown,
    Stopped,
}

type Callback = Box<dyn FnOnce() -> Pin<Box<dyn Future<Output = ()> + Send>> + Send>;

struct Registered {
    priority: i32,
    name: String,
    callback: Callback,
}

/// Coordinates signal handling and ordered resource teardown for one
/// process.
pub struct ShutdownCoordinator {
    timeout: Duration,
    state: watch::Sender<ShutdownState>,
    callbacks: Mutex<Vec<Registered>>,
}

impl ShutdownCoordinator {
    pub fn new(timeout: Duration) -> Self {
        let (state, _) = watch::channel(ShutdownState::Running);
        Self {
            timeout,
            state,
            callbacks: Mutex::new(Vec::new()),
        }
    }

    /// Registers a teardown callback. Lower priorities run first, so
    /// work producers (IMAP, loops) should stop before the clients they
    /// depend on are released.
    pub fn register<F, Fut>(&self, priority: i32, name: impl ToString, callback: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let name = name.to_string();
        debug!("registered shutdown callback {name} (priority={priority})");
        self.callbacks.lock().unwrap().push(Registered {
            priority,
            name,
            callback: Box::new(move || Box::pin(callback())),
        });
    }

    pub fn state(&self) -> ShutdownState {
        *self.state.borrow()
    }

    pub fn is_running(&self) -> bool {
        self.state() == ShutdownState::Running
    }

    pub fn subscribe(&self) -> watch::Receiver<ShutdownState> {
        self.state.subscribe()
    }

    /// Completes once the coordinator leaves the `Running` state. Meant
    /// for `select!` arms guarding blocking calls.
    pub async fn cancelled(&self) {
        let mut rx = self.subscribe();
        while *rx.borrow() == ShutdownState::Running {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// Completes once every teardown callback has run.
    pub async fn stopped(&self) {
        let mut rx = self.subscribe();
        while *rx.borrow() != ShutdownState::Stopped {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// Begins the shutdown: flips the state, then runs callbacks in
    /// priority order under the total timeout.
    pub async fn initiate(&self) {
        let started = self.state.send_if_modified(|state| {
            if *state == ShutdownState::Running {
                *state = ShutdownState::ShuttingDown;
                true
            } else {
                false
            }
        });
        if !started {
            warn!("shutdown already in progress, ignoring");
            return;
        }

        let mut callbacks = std::mem::take(&mut *self.callbacks.lock().unwrap());
        callbacks.sort_by_key(|registered| registered.priority);
        info!(
            "shutdown initiated, executing {} callbacks within {:?}",
            callbacks.len(),
            self.timeout
        );

        let deadline = Instant::now() + self.timeout;
        for registered in callbacks {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                error!(
                    "shutdown timeout ({:?}) exceeded, skipping remaining callbacks",
                    self.timeout
                );
                break;
            }

            debug!(
                "executing shutdown callback {} (priority={})",
                registered.name, registered.priority
            );
            let fut = (registered.callback)();
            if tokio::time::timeout(remaining, fut).await.is_err() {
                warn!("shutdown callback {} abandoned after deadline", registered.name);
            }
        }

        let _ = self.state.send(ShutdownState::Stopped);
        info!("shutdown complete");
    }

    /// Installs SIGINT and SIGTERM handlers on a background task. The
    /// first signal triggers [`Self::initiate`].
    pub fn install_signal_handlers(self: Arc<Self>) {
        let this = self;
        tokio::spawn(async move {
            let ctrl_c = tokio::signal::ctrl_c();

            #[cfg(unix)]
            {
                let mut sigterm = match tokio::signal::unix::signal(
                    tokio::signal::unix::SignalKind::terminate(),
                ) {
                    Ok(sigterm) => sigterm,
                    Err(err) => {
                        error!("cannot install SIGTERM handler: {err}");
                        return;
                    }
                };
                tokio::select! {
                    _ = ctrl_c => info!("received SIGINT, initiating shutdown"),
                    _ = sigterm.recv() => info!("received SIGTERM, initiating shutdown"),
                }
            }

            #[cfg(not(unix))]
            {
                let _ = ctrl_c.await;
                info!("received interrupt, initiating shutdown");
            }

            this.initiate().await;
        });
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    };

    use super::*;

    #[tokio::test]
    async fn callbacks_run_in_priority_order() {
        let coordinator = ShutdownCoordinator::new(Duration::from_secs(5));
        let order = Arc::new(Mutex::new(Vec::new()));

        for (priority, name) in [(30, "store"), (5, "health"), (10, "imap")] {
            let order = order.clone();
            coordinator.register(priority, name, move || async move {
                order.lock().unwrap().push(name);
            });
        }

        coordinator.initiate().await;

        assert_eq!(*order.lock().unwrap(), vec!["health", "imap", "store"]);
        assert_eq!(coordinator.state(), ShutdownState::Stopped);
    }

    #[tokio::test]
    async fn slow_callbacks_are_abandoned_within_the_deadline() {
        let coordinator = ShutdownCoordinator::new(Duration::from_millis(50));
        let ran = Arc::new(AtomicUsize::new(0));

        let counter = ran.clone();
        coordinator.register(0, "slow", move || async move {
            tokio::time::sleep(Duration::from_secs(60)).await;
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let started = Instant::now();
        coordinator.initiate().await;

        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(ran.load(Ordering::SeqCst), 0);
        assert_eq!(coordinator.state(), ShutdownState::Stopped);
    }

    #[tokio::test]
    async fn cancelled_resolves_after_initiate() {
        let coordinator = Arc::new(ShutdownCoordinator::new(Duration::from_secs(1)));

        let waiter = {
            let coordinator = coordinator.clone();
            tokio::spawn(async move { coordinator.cancelled().await })
        };

        assert!(coordinator.is_running());
        coordinator.initiate().await;
        waiter.await.unwrap();
        assert!(!coordinator.is_running());
    }

    #[tokio::test]
    async fn double_initiate_is_ignored() {
        let coordinator = ShutdownCoordinator::new(Duration::from_secs(1));
        let count = Arc::new(AtomicUsize::new(0));

        let counter = count.clone();
        coordinator.register(0, "once", move || async move {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        coordinator.initiate().await;
        coordinator.initiate().await;

        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
