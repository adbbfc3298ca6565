use std::sync::Arc;

use chrono::{DateTime, Duration, NaiveTime, TimeZone, Utc};
use chrono_tz::Tz;
use tokio::sync::broadcast;
use tracing::{error, info};

use crate::services::reconciler::SubscriptionReconciler;

/// Next `hour:00` in `tz` at or after `now`. A wall-clock hour skipped by a
/// DST jump resolves to the following day's occurrence.
pub fn next_run_after(now: DateTime<Utc>, hour: u32, tz: Tz) -> DateTime<Utc> {
    let Some(at) = NaiveTime::from_hms_opt(hour, 0, 0) else {
        return now + Duration::days(1);
    };
    let today = now.with_timezone(&tz).date_naive();

    (0..=2)
        .filter_map(|offset| today.checked_add_signed(Duration::days(offset)))
        .filter_map(|day| tz.from_local_datetime(&day.and_time(at)).earliest())
        .map(|local| local.with_timezone(&Utc))
        .find(|candidate| *candidate >= now)
        .unwrap_or_else(|| now + Duration::days(1))
}

pub struct SweepScheduler {
    reconciler: Arc<SubscriptionReconciler>,
    hour: u32,
    tz: Tz,
}

impl SweepScheduler {
    pub fn new(reconciler: Arc<SubscriptionReconciler>, hour: u32, tz: Tz) -> Self {
        Self {
            reconciler,
            hour,
            tz,
        }
    }

    /// Sleeps until each daily slot and runs a sweep. Shutdown interrupts the
    /// wait; a sweep already running is left to finish.
    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) {
        info!(hour = self.hour, tz = %self.tz, "Sweep scheduler started");
        loop {
            let now = Utc::now();
            let next = next_run_after(now, self.hour, self.tz);
            let wait = (next - now).to_std().unwrap_or_default();
            info!(next_run = %next.with_timezone(&self.tz), "Next subscription sweep scheduled");

            tokio::select! {
                _ = tokio::time::sleep(wait) => {
                    if let Err(e) = self.reconciler.run().await {
                        error!("Scheduled sweep failed: {}", e);
                    }
                }
                _ = shutdown.recv() => {
                    info!("Sweep scheduler received shutdown signal, stopping...");
                    break;
                }
            }
        }
    }
}
