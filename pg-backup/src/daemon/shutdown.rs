//! Graceful shutdown handling for SIGTERM and SIGINT.
//!
//! On a signal no new scheduled run starts, and a run already in progress gets a grace
//! period to finish before the process exits.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::restore::wait::{poll_until, WaitOutcome};

const DRAIN_CHECK: Duration = Duration::from_secs(1);

/// Shutdown coordinator
pub struct ShutdownCoordinator {
    token: CancellationToken,
}

impl ShutdownCoordinator {
    pub fn new() -> Self {
        Self {
            token: CancellationToken::new(),
        }
    }

    /// Cancelled once shutdown has begun
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Wait for shutdown signal (SIGTERM or SIGINT)
    pub async fn wait_for_signal(&self) -> io::Result<()> {
        #[cfg(unix)]
        let mut terminate = signal::unix::signal(signal::unix::SignalKind::terminate())?;

        #[cfg(unix)]
        let terminate = async move {
            terminate.recv().await;
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            res = signal::ctrl_c() => {
                res?;
                info!("Received SIGINT (Ctrl+C), initiating graceful shutdown...");
            }
            _ = terminate => {
                info!("Received SIGTERM, initiating graceful shutdown...");
            }
        }

        self.token.cancel();
        Ok(())
    }

    /// Wait up to `grace` for `busy` to clear. Returns whether it did.
    pub async fn drain(&self, busy: &AtomicBool, grace: Duration) -> bool {
        if !busy.load(Ordering::Acquire) {
            info!("Graceful shutdown complete");
            return true;
        }

        info!(grace_secs = grace.as_secs(), "Waiting for the running backup to finish");
        match poll_until(DRAIN_CHECK, grace, || async move { !busy.load(Ordering::Acquire) }).await {
            WaitOutcome::Ready => {
                info!("Graceful shutdown complete");
                true
            }
            WaitOutcome::TimedOut => {
                warn!("Backup still running after {}s, exiting anyway", grace.as_secs());
                false
            }
        }
    }
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}
