use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};

use crate::control_system::arbiter::IntersectionArbiter;

/// Re-evaluates FIFO <-> ROTATE every `period`, independently of request
/// traffic, until `shutdown` flips to true or its sender goes away.
pub fn spawn_congestion_monitor(
    arbiter: Arc<IntersectionArbiter>,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick of an interval completes immediately.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    arbiter.evaluate_congestion();
                    log::debug!("Congestion monitor: {}", arbiter.stats().summary());
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        log::info!("Congestion monitor stopped");
    })
}
