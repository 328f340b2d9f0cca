//! Watches the reconcile loop alongside the shutdown signal

use exporter_lib::health::{components, HealthRegistry};
use std::future::Future;
use tokio::task::JoinHandle;
use tracing::{error, warn};

/// Why the process is stopping
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopReason {
    /// Shutdown was requested; the loop is still running
    Signal,
    /// The reconcile loop ended on its own
    LoopExited(String),
}

/// Wait for the shutdown signal or for the reconcile loop to end
///
/// A loop that ends first marks the publisher unhealthy and clears
/// readiness, since nothing will refresh the published topology anymore.
/// The handle is left untouched on [`StopReason::Signal`] so the caller can
/// still await it after broadcasting shutdown.
pub async fn wait_for_stop<F>(
    reconciler: &mut JoinHandle<()>,
    signal: F,
    health: &HealthRegistry,
) -> StopReason
where
    F: Future<Output = std::io::Result<()>>,
{
    tokio::select! {
        result = signal => {
            if let Err(e) = result {
                warn!(error = %e, "Failed to listen for shutdown signal, stopping");
            }
            StopReason::Signal
        }
        result = reconciler => {
            let reason = match result {
                Ok(()) => "Reconcile loop exited".to_string(),
                Err(e) => format!("Reconcile loop terminated abnormally: {}", e),
            };
            error!(reason = %reason, "Reconcile loop stopped before shutdown");
            health.set_unhealthy(components::PUBLISHER, reason.as_str()).await;
            health.set_ready(false).await;
            StopReason::LoopExited(reason)
        }
    }
}
