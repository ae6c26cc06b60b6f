//! Periodic sweep that stops services whose cooldown has elapsed.

use crate::controller::ServiceController;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{info, warn};

/// Sweep cadence.
const REAP_INTERVAL: Duration = Duration::from_secs(1);

/// Run until the shutdown signal flips. Each tick snapshots the due services
/// under the controller's reader lock, then stops them one by one with no
/// controller lock held across the driver calls.
pub async fn run(controller: Arc<ServiceController>, mut shutdown_rx: watch::Receiver<bool>) {
    loop {
        tokio::select! {
            _ = tokio::time::sleep(REAP_INTERVAL) => {
                for name in controller.due_services(Instant::now()) {
                    info!(service = name, "Cooldown elapsed, stopping container");
                    if let Err(e) = controller.stop(&name).await {
                        warn!(service = name, error = %e, "Failed to stop idle service");
                    }
                }
            }
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    break;
                }
            }
        }
    }
}
