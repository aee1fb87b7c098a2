//! Periodic liveness probe

use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, trace};

use super::BroadcastHub;

/// Probe every subscriber each `interval`, pruning dead ones
///
/// Runs until the returned task is aborted.
pub fn spawn_keepalive(hub: Arc<BroadcastHub>, interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // First tick fires immediately
        ticker.tick().await;

        debug!("Keepalive probing every {}ms", interval.as_millis());
        loop {
            ticker.tick().await;
            if hub.is_empty() {
                continue;
            }
            let alive = hub.probe();
            trace!("Keepalive probe reached {} subscribers", alive);
        }
    })
}
