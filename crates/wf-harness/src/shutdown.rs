use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, watch};
use tracing::{info, warn};

// ---------------------------------------------------------------------------
// ShutdownSignal
// ---------------------------------------------------------------------------

/// Broadcast-based shutdown coordinator.
///
/// Long-lived components (the deployment manager's child processes, the
/// daemon's run loop) hold a clone and `select!` on
/// [`ShutdownSignal::cancelled`] alongside their work.
///
/// The daemon triggers shutdown by calling `trigger()`, which:
/// 1. Sets the `is_shutting_down` flag (atomically)
/// 2. Broadcasts a signal to all subscribers
///
/// It then waits on [`ShutdownSignal::wait_for_drain`] until every holder of
/// a [`ShutdownGuard`] has stopped its services.
///
/// ```ignore
/// let shutdown = ShutdownSignal::new();
/// let guard = ShutdownGuard::new(shutdown.clone());
/// tokio::spawn(async move {
///     shutdown.cancelled().await;
///     services.cleanup_all().await;
///     drop(guard);
/// });
/// ```
#[derive(Debug, Clone)]
pub struct ShutdownSignal {
    /// Broadcast sender; fires once for all subscribers.
    trigger: broadcast::Sender<()>,
    /// Flag for polling without a receiver.
    shutting_down: Arc<AtomicBool>,
    /// Count of components that confirmed drain.
    drain_tx: Arc<watch::Sender<usize>>,
    drain_rx: watch::Receiver<usize>,
}

impl ShutdownSignal {
    pub fn new() -> Self {
        let (trigger, _) = broadcast::channel(1);
        let (drain_tx, drain_rx) = watch::channel(0);
        Self {
            trigger,
            shutting_down: Arc::new(AtomicBool::new(false)),
            drain_tx: Arc::new(drain_tx),
            drain_rx,
        }
    }

    /// Subscribe to the shutdown signal. Receivers created after the trigger
    /// never see it; use [`ShutdownSignal::cancelled`] for that case.
    pub fn subscribe(&self) -> broadcast::Receiver<()> {
        self.trigger.subscribe()
    }

    /// Check if shutdown has been triggered (non-blocking).
    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::Relaxed)
    }

    /// Trigger shutdown for all subscribers. Later calls are ignored.
    pub fn trigger(&self) {
        if self
            .shutting_down
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::Relaxed)
            .is_ok()
        {
            info!("shutdown signal triggered");
            let _ = self.trigger.send(());
        } else {
            warn!("shutdown already triggered");
        }
    }

    /// Resolves once shutdown has been triggered, including triggers that
    /// happened before the call.
    pub async fn cancelled(&self) {
        let mut rx = self.subscribe();
        if self.is_shutting_down() {
            return;
        }
        // Lagged or closed both mean the trigger already fired.
        let _ = rx.recv().await;
    }

    /// Notify that a component has finished draining.
    pub fn confirm_drained(&self) {
        self.drain_tx.send_modify(|count| *count += 1);
    }

    /// Wait for `expected` components to confirm drain, with a timeout.
    pub async fn wait_for_drain(&mut self, expected: usize, timeout: Duration) -> DrainResult {
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            let current = *self.drain_rx.borrow();
            if current >= expected {
                info!(count = current, "all components drained");
                return DrainResult::Complete(current);
            }

            match tokio::time::timeout_at(deadline, self.drain_rx.changed()).await {
                Ok(Ok(())) => continue,
                Ok(Err(_)) => return DrainResult::Complete(*self.drain_rx.borrow()),
                Err(_) => {
                    let confirmed = *self.drain_rx.borrow();
                    warn!(confirmed, expected, "drain timed out");
                    return DrainResult::Timeout {
                        confirmed,
                        expected,
                    };
                }
            }
        }
    }

    /// Number of subscribers currently listening.
    pub fn subscriber_count(&self) -> usize {
        self.trigger.receiver_count()
    }
}

impl Default for ShutdownSignal {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// DrainResult
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DrainResult {
    /// All expected components confirmed drain.
    Complete(usize),
    /// Timeout expired before all components confirmed.
    Timeout { confirmed: usize, expected: usize },
}

impl DrainResult {
    pub fn is_complete(&self) -> bool {
        matches!(self, DrainResult::Complete(_))
    }
}

// ---------------------------------------------------------------------------
// ShutdownGuard
// ---------------------------------------------------------------------------

/// RAII guard that calls `confirm_drained()` when dropped.
///
/// The deployment manager's shutdown hook holds one and drops it once every
/// service is stopped, which lets `wait_for_drain` return.
pub struct ShutdownGuard {
    signal: ShutdownSignal,
}

impl ShutdownGuard {
    pub fn new(signal: ShutdownSignal) -> Self {
        Self { signal }
    }
}

impl Drop for ShutdownGuard {
    fn drop(&mut self) {
        self.signal.confirm_drained();
    }
}

// ---------------------------------------------------------------------------
// OS signals
// ---------------------------------------------------------------------------

/// Trigger `signal` on ctrl-c, or SIGTERM on unix.
pub fn listen_for_os_signals(signal: ShutdownSignal) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let ctrl_c = async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!(error = %e, "failed to listen for ctrl-c");
                std::future::pending::<()>().await;
            }
        };

        #[cfg(unix)]
        let terminate = async {
            use tokio::signal::unix::{signal as unix_signal, SignalKind};
            match unix_signal(SignalKind::terminate()) {
                Ok(mut stream) => {
                    stream.recv().await;
                }
                Err(e) => {
                    warn!(error = %e, "failed to install SIGTERM handler");
                    std::future::pending::<()>().await;
                }
            }
        };
        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => info!(signal = "ctrl_c", "received shutdown signal"),
            _ = terminate => info!(signal = "sigterm", "received shutdown signal"),
            _ = signal.cancelled() => return,
        }
        signal.trigger();
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trigger_is_idempotent() {
        let signal = ShutdownSignal::new();
        assert!(!signal.is_shutting_down());
        signal.trigger();
        signal.trigger();
        assert!(signal.is_shutting_down());
    }

    #[test]
    fn clone_shares_state() {
        let signal = ShutdownSignal::default();
        let clone = signal.clone();
        signal.trigger();
        assert!(clone.is_shutting_down());
    }

    #[test]
    fn subscriber_count_tracks_receivers() {
        let signal = ShutdownSignal::new();
        let rx1 = signal.subscribe();
        let _rx2 = signal.subscribe();
        assert_eq!(signal.subscriber_count(), 2);
        drop(rx1);
        assert_eq!(signal.subscriber_count(), 1);
    }

    #[tokio::test]
    async fn cancelled_resolves_after_trigger() {
        let signal = ShutdownSignal::new();
        let waiter = signal.clone();
        let handle = tokio::spawn(async move { waiter.cancelled().await });
        tokio::time::sleep(Duration::from_millis(10)).await;
        signal.trigger();
        let joined = tokio::time::timeout(Duration::from_millis(200), handle).await;
        assert!(joined.is_ok());
    }

    #[tokio::test]
    async fn cancelled_resolves_when_already_triggered() {
        let signal = ShutdownSignal::new();
        signal.trigger();
        let done = tokio::time::timeout(Duration::from_millis(50), signal.cancelled()).await;
        assert!(done.is_ok());
    }

    #[tokio::test]
    async fn drain_completes_when_guards_drop() {
        let mut signal = ShutdownSignal::new();
        let guard1 = ShutdownGuard::new(signal.clone());
        let guard2 = ShutdownGuard::new(signal.clone());
        signal.trigger();

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            drop(guard1);
            drop(guard2);
        });

        let result = signal.wait_for_drain(2, Duration::from_secs(1)).await;
        assert!(result.is_complete());
    }

    #[tokio::test]
    async fn drain_times_out_with_held_guard() {
        let mut signal = ShutdownSignal::new();
        let _guard = ShutdownGuard::new(signal.clone());
        signal.trigger();

        let result = signal.wait_for_drain(1, Duration::from_millis(30)).await;
        assert_eq!(
            result,
            DrainResult::Timeout {
                confirmed: 0,
                expected: 1
            }
        );
    }

    #[tokio::test]
    async fn late_subscriber_misses_trigger_but_cancelled_does_not() {
        let signal = ShutdownSignal::new();
        signal.trigger();
        let mut late = signal.subscribe();
        assert!(matches!(late.try_recv(), Err(broadcast::error::TryRecvError::Empty)));
        let done = tokio::time::timeout(Duration::from_millis(50), signal.cancelled()).await;
        assert!(done.is_ok());
    }

    #[tokio::test]
    async fn timeout_reports_partial_confirmations() {
        let mut signal = ShutdownSignal::new();
        let done = ShutdownGuard::new(signal.clone());
        let _held = ShutdownGuard::new(signal.clone());
        drop(done);

        let result = signal.wait_for_drain(2, Duration::from_millis(30)).await;
        assert_eq!(
            result,
            DrainResult::Timeout {
                confirmed: 1,
                expected: 2
            }
        );
        assert!(!result.is_complete());
    }

    #[tokio::test]
    async fn os_listener_exits_on_manual_trigger() {
        let signal = ShutdownSignal::new();
        let handle = listen_for_os_signals(signal.clone());
        tokio::time::sleep(Duration::from_millis(10)).await;
        signal.trigger();
        let joined = tokio::time::timeout(Duration::from_millis(200), handle).await;
        assert!(joined.is_ok());
    }
}
