//! Periodic keep-alive while the link is connected.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tether_core::Outbound;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, warn};

use crate::outbox::Outbox;

/// Emit a heartbeat every `period` until the task is aborted. Sends are lossy:
/// a full buffer drops the beat and the next tick tries again.
pub async fn run(outbox: Outbox, period: Duration) {
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        let ts = unix_now();
        match outbox.try_send(&Outbound::heartbeat(ts)) {
            Ok(()) => debug!(timestamp = ts, "heartbeat"),
            Err(e) => warn!(error = %e, "heartbeat dropped"),
        }
    }
}

pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
