//! Reaper loop: ages instances every period and triggers the health sweep
//! every `health_interval` worth of ticks.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info};

use crate::manager::Manager;

/// Number of reaper ticks between two health sweeps (at least one).
pub fn sweep_cadence(health_interval: Duration, reaper_interval: Duration) -> u64 {
    let period = reaper_interval.as_millis().max(1);
    (health_interval.as_millis() / period).max(1) as u64
}

/// Run until `shutdown` flips.
///
/// Elapsed time is measured, not assumed, so a delayed tick ages
/// instances by the time that actually passed.
pub async fn run_reaper(manager: Arc<Manager>, mut shutdown: watch::Receiver<bool>) {
    let period = manager.config().reaper_interval.max(Duration::from_millis(1));
    let cadence = sweep_cadence(manager.config().health_interval, period);
    info!(
        period_ms = period.as_millis() as u64,
        sweep_every = cadence,
        "reaper started"
    );

    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await;
    let mut last = Instant::now();
    let mut ticks: u64 = 0;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let now = Instant::now();
                let elapsed = now.duration_since(last);
                last = now;

                manager.reap(elapsed);
                ticks += 1;
                if ticks % cadence == 0 {
                    manager.spawn_health_sweep();
                }
            }
            _ = shutdown.changed() => {
                debug!(ticks, "reaper shutting down");
                break;
            }
        }
    }
}
