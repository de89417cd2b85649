//! Stop signalling for agent tasks and the process
//!
//! `StopSignal` is a level-triggered flag: once triggered it stays triggered,
//! and tasks that start waiting afterwards return immediately.

use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Why the process is shutting down
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownSignal {
    /// SIGTERM / SIGINT / Ctrl+C
    Graceful,
    /// SIGQUIT
    Urgent,
}

impl std::fmt::Display for ShutdownSignal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ShutdownSignal::Graceful => write!(f, "graceful"),
            ShutdownSignal::Urgent => write!(f, "urgent"),
        }
    }
}

/// Cloneable one-shot stop flag
#[derive(Clone)]
pub struct StopSignal {
    tx: Arc<watch::Sender<bool>>,
    rx: watch::Receiver<bool>,
}

impl Default for StopSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl StopSignal {
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(false);
        Self {
            tx: Arc::new(tx),
            rx,
        }
    }

    /// Request stop. Idempotent.
    pub fn trigger(&self) {
        let already = self.tx.send_replace(true);
        if !already {
            debug!("stop signal triggered");
        }
    }

    pub fn is_triggered(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolve once the signal has been triggered.
    pub async fn triggered(&self) {
        let mut rx = self.rx.clone();
        // The sender lives inside `self`, so the channel cannot close here.
        let _ = rx.wait_for(|stopped| *stopped).await;
    }
}

impl std::fmt::Debug for StopSignal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StopSignal")
            .field("triggered", &self.is_triggered())
            .finish()
    }
}

/// Wait for the first OS shutdown signal.
pub async fn wait_for_os_signal() -> std::io::Result<ShutdownSignal> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sigint = signal(SignalKind::interrupt())?;
        let mut sigquit = signal(SignalKind::quit())?;

        let received = tokio::select! {
            _ = sigterm.recv() => {
                info!("Received SIGTERM");
                ShutdownSignal::Graceful
            }
            _ = sigint.recv() => {
                info!("Received SIGINT");
                ShutdownSignal::Graceful
            }
            _ = sigquit.recv() => {
                warn!("Received SIGQUIT - urgent shutdown");
                ShutdownSignal::Urgent
            }
        };
        Ok(received)
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
        info!("Received Ctrl+C");
        Ok(ShutdownSignal::Graceful)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn triggered_resolves_for_late_waiters() {
        let stop = StopSignal::new();
        assert!(!stop.is_triggered());

        stop.trigger();
        stop.trigger();
        assert!(stop.is_triggered());

        let waited = tokio::time::timeout(Duration::from_millis(50), stop.triggered()).await;
        assert!(waited.is_ok());
    }

    #[tokio::test]
    async fn clones_observe_the_same_flag() {
        let stop = StopSignal::new();
        let observer = stop.clone();

        let waiter = tokio::spawn(async move {
            observer.triggered().await;
            observer.is_triggered()
        });

        tokio::task::yield_now().await;
        stop.trigger();
        assert!(waiter.await.unwrap());
    }
}
