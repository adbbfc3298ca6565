use std::sync::Arc;

use async_trait::async_trait;
use teloxide::prelude::*;
use teloxide::types::{ParseMode, Recipient};
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("telegram refused the message: {0}")]
    Telegram(#[from] teloxide::RequestError),
}

/// Raw delivery. Callers go through [`NotificationService`] which never
/// propagates a failure.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send_to_subscriber(&self, subscriber_id: i64, text: &str) -> Result<(), DeliveryError>;

    async fn send_to_operations(&self, text: &str) -> Result<(), DeliveryError>;
}

pub struct TelegramNotifier {
    bot: Bot,
    operations: Recipient,
}

impl TelegramNotifier {
    pub fn new(bot: Bot, ops_channel: &str) -> Self {
        Self {
            bot,
            operations: parse_recipient(ops_channel),
        }
    }
}

/// `-100123` style ids become chat ids, anything else is taken as a channel username.
pub fn parse_recipient(raw: &str) -> Recipient {
    let raw = raw.trim();
    match raw.parse::<i64>() {
        Ok(id) => Recipient::Id(ChatId(id)),
        Err(_) if raw.starts_with('@') => Recipient::ChannelUsername(raw.to_string()),
        Err(_) => Recipient::ChannelUsername(format!("@{}", raw)),
    }
}

#[async_trait]
impl Notifier for TelegramNotifier {
    async fn send_to_subscriber(&self, subscriber_id: i64, text: &str) -> Result<(), DeliveryError> {
        self.bot
            .send_message(ChatId(subscriber_id), text)
            .parse_mode(ParseMode::Html)
            .await?;
        Ok(())
    }

    async fn send_to_operations(&self, text: &str) -> Result<(), DeliveryError> {
        self.bot
            .send_message(self.operations.clone(), text)
            .parse_mode(ParseMode::Html)
            .await?;
        Ok(())
    }
}

/// Fire-and-forget front for a [`Notifier`]. The returned flag only tells
/// whether the message went out.
#[derive(Clone)]
pub struct NotificationService {
    notifier: Arc<dyn Notifier>,
}

impl NotificationService {
    pub fn new(notifier: Arc<dyn Notifier>) -> Self {
        Self { notifier }
    }

    pub async fn notify_subscriber(&self, subscriber_id: i64, text: &str) -> bool {
        match self.notifier.send_to_subscriber(subscriber_id, text).await {
            Ok(()) => {
                debug!(subscriber = subscriber_id, "Notification delivered");
                true
            }
            Err(e) => {
                warn!(subscriber = subscriber_id, "Failed to notify subscriber: {}", e);
                false
            }
        }
    }

    pub async fn notify_operations_channel(&self, text: &str) -> bool {
        match self.notifier.send_to_operations(text).await {
            Ok(()) => true,
            Err(e) => {
                warn!("Failed to post to operations channel: {}", e);
                false
            }
        }
    }
}

#[cfg(test)]
pub mod testing {
    use super::*;
    use std::sync::Mutex;

    /// Records every message; subscribers listed in `unreachable` fail
    /// delivery, as does the operations channel when `operations_down` is set.
    #[derive(Default)]
    pub struct RecordingNotifier {
        pub direct: Mutex<Vec<(i64, String)>>,
        pub operations: Mutex<Vec<String>>,
        pub unreachable: Vec<i64>,
        pub operations_down: bool,
    }

    impl RecordingNotifier {
        pub fn direct_to(&self, subscriber_id: i64) -> Vec<String> {
            self.direct
                .lock()
                .unwrap()
                .iter()
                .filter(|(id, _)| *id == subscriber_id)
                .map(|(_, text)| text.clone())
                .collect()
        }

        pub fn operations(&self) -> Vec<String> {
            self.operations.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Notifier for RecordingNotifier {
        async fn send_to_subscriber(
            &self,
            subscriber_id: i64,
            text: &str,
        ) -> Result<(), DeliveryError> {
            if self.unreachable.contains(&subscriber_id) {
                return Err(DeliveryError::Telegram(teloxide::RequestError::Api(
                    teloxide::ApiError::BotBlocked,
                )));
            }
            self.direct.lock().unwrap().push((subscriber_id, text.to_string()));
            Ok(())
        }

        async fn send_to_operations(&self, text: &str) -> Result<(), DeliveryError> {
            if self.operations_down {
                return Err(DeliveryError::Telegram(teloxide::RequestError::Api(
                    teloxide::ApiError::ChatNotFound,
                )));
            }
            self.operations.lock().unwrap().push(text.to_string());
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::RecordingNotifier;
    use super::*;

    #[test]
    fn recipients_from_config() {
        assert_eq!(
            parse_recipient("-1002233445566"),
            Recipient::Id(ChatId(-1002233445566))
        );
        assert_eq!(
            parse_recipient("@boovpn_ops"),
            Recipient::ChannelUsername("@boovpn_ops".into())
        );
        assert_eq!(
            parse_recipient("boovpn_ops"),
            Recipient::ChannelUsername("@boovpn_ops".into())
        );
    }

    #[tokio::test]
    async fn delivery_failures_are_swallowed() {
        let notifier = Arc::new(RecordingNotifier {
            unreachable: vec![7],
            ..Default::default()
        });
        let service = NotificationService::new(notifier.clone());

        assert!(!service.notify_subscriber(7, "hello").await);
        assert!(service.notify_subscriber(8, "hello").await);
        assert!(service.notify_operations_channel("summary").await);

        assert_eq!(notifier.direct_to(8), vec!["hello".to_string()]);
        assert_eq!(notifier.operations(), vec!["summary".to_string()]);
    }
}
