//! Periodic health supervision.

use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

use crate::gateway::Gateway;

pub const HEALTH_CHECK_INTERVAL: Duration = Duration::from_secs(30);

/// Runs [`Gateway::run_health_checks`] every `interval` until the gateway's
/// shutdown token fires. The first tick happens one interval after start.
pub fn spawn_health_supervisor(gateway: Arc<Gateway>, interval: Duration) -> JoinHandle<()> {
    let cancel = gateway.shutdown_token();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    gateway.run_health_checks().await;
                    let pruned = gateway.sessions().prune_idle();
                    if pruned > 0 {
                        tracing::debug!(pruned, "pruned idle sessions");
                    }
                }
            }
        }
        tracing::debug!("health supervisor stopped");
    })
}
