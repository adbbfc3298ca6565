use boovpn_db::{StoreError, Subscriber, SubscriberRepository};
use chrono::{DateTime, NaiveDate, Utc};
use chrono_tz::Tz;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::api_client::ProvisioningError;
use crate::services::device_service::DeviceService;
use crate::services::notification_service::NotificationService;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub checked: u32,
    pub deleted: u32,
    pub failed: u32,
}

impl SweepReport {
    pub fn summary(&self) -> String {
        let mut text = format!(
            "Subscription check finished.\nChecked: {}, Deleted: {}",
            self.checked, self.deleted
        );
        if self.failed > 0 {
            text.push_str(&format!("\nFailed: {}", self.failed));
        }
        text
    }
}

#[derive(Debug, Error)]
enum ExpireError {
    #[error("revoking slot {slot} failed: {source}")]
    Revoke {
        slot: usize,
        #[source]
        source: ProvisioningError,
    },

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Daily pass over every subscriber: expiry reminders, then deactivation of
/// whoever ran out. One pass at a time per process.
pub struct SubscriptionReconciler {
    repo: SubscriberRepository,
    devices: DeviceService,
    notifications: NotificationService,
    tz: Tz,
    running: Mutex<()>,
}

impl SubscriptionReconciler {
    pub fn new(
        repo: SubscriberRepository,
        devices: DeviceService,
        notifications: NotificationService,
        tz: Tz,
    ) -> Self {
        Self {
            repo,
            devices,
            notifications,
            tz,
            running: Mutex::new(()),
        }
    }

    pub async fn run(&self) -> Result<SweepReport, StoreError> {
        self.run_at(Utc::now()).await
    }

    pub async fn run_at(&self, now: DateTime<Utc>) -> Result<SweepReport, StoreError> {
        let _running = self.running.lock().await;
        let today = now.with_timezone(&self.tz).date_naive();

        let subscribers = self.repo.list_all().await?;
        info!(total = subscribers.len(), %today, "Subscription sweep started");

        let mut report = SweepReport::default();
        for sub in subscribers.iter().filter(|s| !s.is_friend) {
            self.send_reminder(sub, now, today).await;

            if sub.is_active && sub.is_expired(now) {
                match self.expire(sub.id, now).await {
                    Ok(true) => report.deleted += 1,
                    Ok(false) => {}
                    Err(e) => {
                        report.failed += 1;
                        error!(subscriber = sub.id, "Expiry aborted: {}", e);
                    }
                }
            }
            report.checked += 1;
        }

        info!(
            checked = report.checked,
            deleted = report.deleted,
            failed = report.failed,
            "Subscription sweep finished"
        );
        self.notifications
            .notify_operations_channel(&report.summary())
            .await;

        Ok(report)
    }

    async fn send_reminder(&self, sub: &Subscriber, now: DateTime<Utc>, today: NaiveDate) {
        let text = match sub.days_left(now) {
            Some(3) => "⏳ Your subscription ends in 3 days. Top up to keep your VPN running.",
            Some(1) => "⚠️ Your subscription ends tomorrow. Top up to keep your VPN running.",
            _ => return,
        };
        if sub.last_notice_on == Some(today) {
            debug!(subscriber = sub.id, "Reminder already sent today");
            return;
        }

        if self.notifications.notify_subscriber(sub.id, text).await {
            if let Err(e) = self.repo.mark_notice_sent(sub.id, today).await {
                warn!(subscriber = sub.id, "Failed to record reminder: {}", e);
            }
        }
    }

    /// Re-reads the subscriber, revokes every populated slot, then flips it
    /// inactive. The first slot that cannot be revoked stops the subscriber
    /// and leaves its flags alone. Returns false when a payment, a new device
    /// or the friend flag got in first.
    async fn expire(&self, id: i64, now: DateTime<Utc>) -> Result<bool, ExpireError> {
        let Some(sub) = self.repo.get_by_id(id).await? else {
            return Ok(false);
        };
        if sub.is_friend || !sub.is_active || !sub.is_expired(now) {
            debug!(subscriber = id, "Subscriber changed since the sweep started, skipping");
            return Ok(false);
        }

        for (slot, _) in sub.device_slots.populated() {
            self.devices
                .revoke(id, slot)
                .await
                .map_err(|source| ExpireError::Revoke { slot, source })?;
            self.repo.set_device_slot(id, slot, None).await?;
        }

        if !self.repo.deactivate_if_expired(id, now).await? {
            warn!(subscriber = id, "Subscriber changed during expiry, left for the next sweep");
            return Ok(false);
        }
        info!(subscriber = id, "Subscription expired, access revoked");
        Ok(true)
    }
}
