//! Timed triggers for the controller
//!
//! Two perpetual loops run beside the event-driven entry point:
//! the drift resync loop rebuilds the registry from provider inventory every
//! sync interval, and the watchdog forces a convergence pass whenever none
//! has completed within [`WATCHDOG_THRESHOLD`]. Both serialize with every
//! other pass through the controller's state lock.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};

use super::alb::AlbController;

/// How often the watchdog wakes up
pub const WATCHDOG_TICK: Duration = Duration::from_secs(10);

/// Maximum quiet period before the watchdog forces a pass
pub const WATCHDOG_THRESHOLD: Duration = Duration::from_secs(60);

/// True when no convergence pass has completed within the threshold
pub fn watchdog_due(last_update: Option<Instant>, now: Instant) -> bool {
    match last_update {
        Some(last) => last + WATCHDOG_THRESHOLD < now,
        None => true,
    }
}

pub async fn run_drift_loop(controller: Arc<AlbController>) {
    let interval = controller.config().sync_interval;
    loop {
        sleep(interval).await;
        debug!(
            "ALB sync interval {:?} elapsed; resync will run once the lock is available",
            interval
        );
        if let Err(e) = controller.sync_with_provider().await {
            warn!("Drift resync failed, keeping current registry: {}", e);
        }
    }
}

pub async fn run_watchdog(controller: Arc<AlbController>) {
    loop {
        sleep(WATCHDOG_TICK).await;
        if watchdog_due(controller.last_update().await, Instant::now()) {
            info!(
                "Ingress update being attempted (forced, no event seen in {}s)",
                WATCHDOG_THRESHOLD.as_secs()
            );
            controller.on_update().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_watchdog_due() {
        let now = Instant::now();
        assert!(watchdog_due(None, now));
        assert!(!watchdog_due(Some(now), now));

        let later = now + Duration::from_secs(60);
        assert!(!watchdog_due(Some(now), later));
        assert!(watchdog_due(Some(now), later + Duration::from_millis(1)));
    }
}
