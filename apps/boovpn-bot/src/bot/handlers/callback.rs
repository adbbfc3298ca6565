use boovpn_db::Subscriber;
use chrono::Utc;
use teloxide::prelude::*;
use teloxide::types::{CallbackQuery, InlineKeyboardMarkup, MessageId, ParseMode};
use teloxide::{ApiError, RequestError};
use tracing::{error, info, warn};

use crate::AppState;
use crate::bot::keyboards::{
    CallbackAction, device_keyboard, devices_keyboard, guide_keyboard, main_menu, pay_keyboard,
    platform_guide_keyboard, support_keyboard,
};
use crate::bot::utils::{
    device_text, devices_text, guide_text, pay_text, platform_guide_text, status_text,
};
use crate::services::device_service::DeviceError;

/// What to tell the user in the callback answer popup.
struct Answer {
    text: Option<String>,
    alert: bool,
}

impl Answer {
    fn silent() -> Self {
        Self { text: None, alert: false }
    }

    fn toast(text: impl Into<String>) -> Self {
        Self { text: Some(text.into()), alert: false }
    }

    fn alert(text: impl Into<String>) -> Self {
        Self { text: Some(text.into()), alert: true }
    }
}

pub async fn callback_handler(
    bot: Bot,
    q: CallbackQuery,
    state: AppState,
) -> Result<(), RequestError> {
    info!("Received callback: {:?}", q.data);

    let answer = match q.message.as_ref().and_then(|m| m.regular_message()) {
        Some(message) if message.date >= state.started_at => {
            let target = (message.chat.id, message.id);
            match q.data.as_deref().and_then(CallbackAction::parse) {
                Some(action) => dispatch(&bot, &state, target, action).await?,
                None => Answer::toast("Unknown action"),
            }
        }
        _ => Answer::alert("The bot was restarted, please send /start"),
    };

    let mut request = bot.answer_callback_query(q.id.clone());
    if let Some(text) = answer.text {
        request = request.text(text).show_alert(answer.alert);
    }
    request.await?;
    Ok(())
}

async fn dispatch(
    bot: &Bot,
    state: &AppState,
    (chat_id, message_id): (ChatId, MessageId),
    action: CallbackAction,
) -> Result<Answer, RequestError> {
    let sub = match state.repo.get_by_id(chat_id.0).await {
        Ok(Some(sub)) => sub,
        Ok(None) => return Ok(Answer::alert("Please send /start first")),
        Err(e) => {
            error!(subscriber = chat_id.0, "Failed to load subscriber: {}", e);
            return Ok(Answer::alert("Something went wrong, please try again later"));
        }
    };
    let support = state.support_url();
    let menu = Menu { bot, chat_id, message_id };

    match action {
        CallbackAction::GetStarted => {
            let credential = match sub.device_slots.get(1) {
                Some(existing) => Some(existing.to_string()),
                None if sub.is_active => match state.devices.add_device(&sub, 1).await {
                    Ok(uri) => Some(uri),
                    Err(e) => {
                        error!(subscriber = sub.id, "First device provisioning failed: {}", e);
                        return Ok(Answer::alert("Could not create a VPN key, please try again later"));
                    }
                },
                None => None,
            };
            menu.show(guide_text(credential.as_deref()), guide_keyboard()).await?;
            Ok(Answer::toast("You are all set!"))
        }

        CallbackAction::MainMenu => {
            menu.show(status_text(&sub, Utc::now()), main_menu(support)).await?;
            Ok(Answer::silent())
        }

        CallbackAction::Devices => {
            menu.show_devices(&sub, support).await?;
            Ok(Answer::silent())
        }

        CallbackAction::Device(slot) => match sub.device_slots.get(slot) {
            Some(credential) => {
                menu.show(device_text(slot, credential), device_keyboard(slot)).await?;
                Ok(Answer::silent())
            }
            None => {
                menu.show_devices(&sub, support).await?;
                Ok(Answer::toast("This slot is empty"))
            }
        },

        CallbackAction::NewDevice(slot) => match state.devices.add_device(&sub, slot).await {
            Ok(uri) => {
                menu.show(device_text(slot, &uri), device_keyboard(slot)).await?;
                Ok(Answer::toast("Device added"))
            }
            Err(DeviceError::Inactive) => {
                menu.show(status_text(&sub, Utc::now()), pay_keyboard(support)).await?;
                Ok(Answer::silent())
            }
            Err(DeviceError::SlotTaken(_)) => {
                menu.show_devices(&sub, support).await?;
                Ok(Answer::toast("This slot is already in use"))
            }
            Err(DeviceError::NoSuchSlot(_)) => Ok(Answer::toast("No such device slot")),
            Err(e) => {
                error!(subscriber = sub.id, slot, "Device provisioning failed: {}", e);
                Ok(Answer::alert("Could not create a VPN key, please try again later"))
            }
        },

        CallbackAction::DeleteDevice(slot) => match state.devices.remove_device(&sub, slot).await {
            Ok(()) => {
                let mut updated = sub.clone();
                updated.device_slots.set(slot, None);
                menu.show_devices(&updated, support).await?;
                Ok(Answer::toast("Device deleted"))
            }
            Err(e) => {
                warn!(subscriber = sub.id, slot, "Device removal failed: {}", e);
                Ok(Answer::alert("Could not delete the device, please try again later"))
            }
        },

        CallbackAction::Guide => {
            menu.show(guide_text(None), guide_keyboard()).await?;
            Ok(Answer::silent())
        }

        CallbackAction::PlatformGuide(platform) => {
            menu.show(platform_guide_text(platform), platform_guide_keyboard(platform)).await?;
            Ok(Answer::silent())
        }

        CallbackAction::Pay => {
            menu.show(pay_text(sub.id), support_keyboard(support)).await?;
            Ok(Answer::silent())
        }

        CallbackAction::Support => Ok(Answer::alert("Support contact is not configured yet")),
    }
}

/// The message the pressed button belongs to, edited in place.
struct Menu<'a> {
    bot: &'a Bot,
    chat_id: ChatId,
    message_id: MessageId,
}

impl Menu<'_> {
    async fn show(&self, text: String, keyboard: InlineKeyboardMarkup) -> Result<(), RequestError> {
        match self
            .bot
            .edit_message_text(self.chat_id, self.message_id, text)
            .parse_mode(ParseMode::Html)
            .reply_markup(keyboard)
            .await
        {
            Ok(_) | Err(RequestError::Api(ApiError::MessageNotModified)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Device list for active subscribers, a payment prompt otherwise.
    async fn show_devices(&self, sub: &Subscriber, support: Option<&str>) -> Result<(), RequestError> {
        if sub.is_active {
            self.show(devices_text(), devices_keyboard(&sub.device_slots)).await
        } else {
            self.show(status_text(sub, Utc::now()), pay_keyboard(support)).await
        }
    }
}
