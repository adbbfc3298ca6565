use std::sync::Arc;

use boovpn_db::SubscriberRepository;
use chrono::{DateTime, Utc};

use crate::config::BotConfig;
use crate::services::device_service::DeviceService;
use crate::services::notification_service::NotificationService;
use crate::services::reconciler::SubscriptionReconciler;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<BotConfig>,
    pub repo: SubscriberRepository,
    pub devices: DeviceService,
    pub reconciler: Arc<SubscriptionReconciler>,
    pub notifications: NotificationService,
    /// Updates older than this were sent to a previous process.
    pub started_at: DateTime<Utc>,
}

impl AppState {
    pub fn support_url(&self) -> Option<&str> {
        self.config.bot.support_url.as_deref()
    }
}
