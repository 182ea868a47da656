//! Shutdown coordination: stop leasing, drain in-flight work, give up after a grace period.

use futures::future::join_all;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::signal;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{error, info, warn};

/// Result of draining workers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainOutcome {
    /// Every in-flight execution finished within the grace period.
    Drained,
    /// The grace period elapsed; `remaining` executions were aborted and
    /// their jobs will be redelivered once their leases expire.
    Abandoned { remaining: usize },
    /// Shutdown had already been requested.
    AlreadyStopped,
}

/// Tracks whether the subsystem is still accepting work.
#[derive(Debug)]
pub struct ShutdownCoordinator {
    stopped: AtomicBool,
    grace: Duration,
}

impl ShutdownCoordinator {
    pub fn new(grace: Duration) -> Self {
        Self {
            stopped: AtomicBool::new(false),
            grace,
        }
    }

    /// Returns true once shutdown has been requested.
    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Marks the subsystem stopped. Returns true only for the first caller.
    pub fn begin(&self) -> bool {
        !self.stopped.swap(true, Ordering::SeqCst)
    }

    /// Grace period for in-flight executions.
    pub fn grace(&self) -> Duration {
        self.grace
    }
}

/// Waits up to `grace` for the tasks to finish, then aborts the rest.
///
/// Tasks must already have been signalled to stop.
pub async fn drain_tasks(mut handles: Vec<JoinHandle<()>>, grace: Duration) -> DrainOutcome {
    if timeout(grace, join_all(handles.iter_mut())).await.is_ok() {
        return DrainOutcome::Drained;
    }

    let remaining = handles.iter().filter(|handle| !handle.is_finished()).count();
    for handle in &handles {
        handle.abort();
    }

    if remaining == 0 {
        DrainOutcome::Drained
    } else {
        warn!(remaining, grace_secs = grace.as_secs_f64(), "Grace period elapsed, abandoning in-flight jobs");
        DrainOutcome::Abandoned { remaining }
    }
}

/// Completes on Ctrl+C or, on Unix, SIGTERM.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating graceful shutdown...");
        }
        _ = terminate => {
            info!("Received terminate signal, initiating graceful shutdown...");
        }
    }
}
