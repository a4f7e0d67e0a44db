//! Process-wide cancellation and resource accounting.
//!
//! A single [`ShutdownSignal`] is created at startup and handed to the engine.
//! Sessions hold child tokens of it, so cancelling the signal closes every
//! session, which in turn unblocks every pending accept or read on them.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Default time to wait for resources to drain on shutdown.
pub const DEFAULT_SHUTDOWN_TIMEOUT_SECS: u64 = 10;

/// Shutdown signal that can be shared across tasks.
#[derive(Clone)]
pub struct ShutdownSignal {
    token: CancellationToken,
    /// Counter for live tunnels / workers.
    active_connections: Arc<AtomicUsize>,
    /// Timeout for draining.
    timeout: Duration,
}

impl ShutdownSignal {
    /// Create a new shutdown signal.
    pub fn new(timeout_secs: u64) -> Self {
        Self {
            token: CancellationToken::new(),
            active_connections: Arc::new(AtomicUsize::new(0)),
            timeout: Duration::from_secs(timeout_secs),
        }
    }

    /// The root cancellation token.
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// A token cancelled together with this signal but closable on its own.
    pub fn child_token(&self) -> CancellationToken {
        self.token.child_token()
    }

    /// Check if shutdown has been initiated.
    pub fn is_shutting_down(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Initiate shutdown.
    pub fn initiate_shutdown(&self) {
        if !self.token.is_cancelled() {
            info!("Shutdown initiated");
        }
        self.token.cancel();
    }

    /// Resolves once shutdown has been initiated.
    pub async fn cancelled(&self) {
        self.token.cancelled().await
    }

    /// Register a live resource; the count drops when the guard does.
    pub fn register_connection(&self) -> ConnectionGuard {
        let active = self.active_connections.fetch_add(1, Ordering::SeqCst) + 1;
        debug!(active, "resource registered");
        ConnectionGuard {
            counter: self.active_connections.clone(),
        }
    }

    /// Get the number of live resources.
    pub fn active_connection_count(&self) -> usize {
        self.active_connections.load(Ordering::SeqCst)
    }

    /// Wait for all resources to drain with timeout.
    pub async fn wait_for_drain(&self) -> bool {
        debug!(
            active = self.active_connection_count(),
            timeout = ?self.timeout,
            "waiting for resources to drain"
        );

        let drain_future = async {
            loop {
                if self.active_connection_count() == 0 {
                    return true;
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        };

        match timeout(self.timeout, drain_future).await {
            Ok(result) => result,
            Err(_) => {
                warn!(
                    active = self.active_connection_count(),
                    "shutdown timeout reached with resources still open"
                );
                false
            }
        }
    }

    /// Wait for Ctrl+C or SIGTERM, then initiate shutdown.
    pub async fn wait_for_signal(&self) {
        let ctrl_c = async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!(error = %e, "failed to install Ctrl+C handler");
                std::future::pending::<()>().await;
            }
        };

        #[cfg(unix)]
        let terminate = async {
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(mut sig) => {
                    sig.recv().await;
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
            _ = ctrl_c => info!("Received Ctrl+C"),
            _ = terminate => info!("Received SIGTERM"),
            _ = self.token.cancelled() => return,
        }

        self.initiate_shutdown();
    }
}

impl Default for ShutdownSignal {
    fn default() -> Self {
        Self::new(DEFAULT_SHUTDOWN_TIMEOUT_SECS)
    }
}

/// Guard that decrements the resource counter when dropped.
pub struct ConnectionGuard {
    counter: Arc<AtomicUsize>,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        let prev = self.counter.fetch_sub(1, Ordering::SeqCst);
        debug!(active = prev.saturating_sub(1), "resource released");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_shutdown_signal() {
        let signal = ShutdownSignal::new(5);
        assert!(!signal.is_shutting_down());

        let guard = signal.register_connection();
        assert_eq!(signal.active_connection_count(), 1);

        signal.initiate_shutdown();
        signal.initiate_shutdown();
        assert!(signal.is_shutting_down());

        drop(guard);
        assert_eq!(signal.active_connection_count(), 0);
        assert!(signal.wait_for_drain().await);
    }

    #[tokio::test]
    async fn test_child_token_follows_parent() {
        let signal = ShutdownSignal::new(5);
        let child = signal.child_token();
        let sibling = signal.child_token();

        child.cancel();
        assert!(!signal.is_shutting_down());
        assert!(!sibling.is_cancelled());

        signal.initiate_shutdown();
        assert!(sibling.is_cancelled());
    }

    #[tokio::test(start_paused = true)]
    async fn test_drain_times_out() {
        let signal = ShutdownSignal::new(1);
        let _guard = signal.register_connection();
        assert!(!signal.wait_for_drain().await);
    }

    #[tokio::test]
    async fn test_wait_for_signal_returns_when_already_cancelled() {
        let signal = ShutdownSignal::new(1);
        signal.initiate_shutdown();
        tokio::time::timeout(Duration::from_secs(1), signal.wait_for_signal())
            .await
            .unwrap();
    }
}
