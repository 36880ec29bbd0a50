//! Background maintenance loop for long-running hosts.

use chrono::Utc;
use tokio::task::JoinHandle;
use tokio::time::{self, Duration, MissedTickBehavior};

use crate::service::KeyService;

/// Run [`KeyService::run_rotation_pass`] every `interval` until the handle
/// is aborted. A failed pass is logged and the loop keeps going.
pub fn spawn_rotation_task(service: KeyService, interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            if let Err(err) = service.run_rotation_pass(Utc::now()).await {
                tracing::warn!(error = %err, "rotation pass failed");
            }
        }
    })
}
