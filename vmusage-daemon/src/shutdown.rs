//! Graceful shutdown handling for vmusaged.
//!
//! On SIGTERM or SIGINT no new ticks are started; the usage cycle and the
//! compaction pass that are already in flight are allowed to finish so a
//! write cycle is never cut off between its records and its fsync.

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use vmusage_core::{CompactionService, UsageService};

/// Manages graceful shutdown of the daemon.
pub struct ShutdownManager {
    stop_scheduler: broadcast::Sender<()>,
    scheduler: JoinHandle<()>,
    usage: UsageService,
    compaction: CompactionService,
}

impl ShutdownManager {
    pub fn new(
        stop_scheduler: broadcast::Sender<()>,
        scheduler: JoinHandle<()>,
        usage: UsageService,
        compaction: CompactionService,
    ) -> Self {
        Self { stop_scheduler, scheduler, usage, compaction }
    }

    /// Stop ticking, then wait for in-flight work.
    ///
    /// This method:
    /// 1. Stops the scheduler so no task fires again
    /// 2. Waits for a running usage cycle (and a queued follow-up) to be durable
    /// 3. Waits for a running compaction pass
    pub async fn shutdown(self) {
        info!("Starting graceful shutdown...");

        if self.stop_scheduler.send(()).is_err() {
            warn!("scheduler already stopped");
        }
        if let Err(e) = self.scheduler.await {
            error!("Scheduler task failed: {}", e);
        }

        if self.usage.is_running() {
            info!("Waiting for the running usage cycle...");
        }
        self.usage.idle().await;
        self.compaction.idle().await;

        info!("Graceful shutdown complete");
    }
}

/// Create a shutdown signal receiver.
///
/// Returns a broadcast receiver that will receive a signal when
/// SIGTERM or SIGINT is received.
pub fn shutdown_signal() -> broadcast::Receiver<()> {
    let (tx, rx) = broadcast::channel(1);

    tokio::spawn(async move {
        let ctrl_c = async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("Failed to install Ctrl+C handler: {}", e);
                std::future::pending::<()>().await;
            }
        };

        #[cfg(unix)]
        let terminate = async {
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(mut sigterm) => {
                    sigterm.recv().await;
                }
                Err(e) => {
                    error!("Failed to install SIGTERM handler: {}", e);
                    std::future::pending::<()>().await;
                }
            }
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => {
                info!("Received SIGINT (Ctrl+C)");
            }
            _ = terminate => {
                info!("Received SIGTERM");
            }
        }

        let _ = tx.send(());
    });

    rx
}
