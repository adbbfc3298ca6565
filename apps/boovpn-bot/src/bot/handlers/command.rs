use boovpn_db::{StoreError, Subscriber, SubscriberRepository};
use chrono::{DateTime, Utc};
use teloxide::prelude::*;
use teloxide::types::ParseMode;
use tracing::{debug, error, info, warn};

use crate::AppState;
use crate::bot::keyboards::{main_menu, welcome_keyboard};
use crate::bot::utils::{status_text, welcome_text};

const TRY_AGAIN: &str = "❌ Something went wrong, please try again later.";
const REGISTRATION_FAILED: &str = "❌ Registration failed, please try /start again later.";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Start,
    Check,
    /// `/friend <id>` or `/unfriend <id>`; `None` when the id is missing or malformed.
    Friend { id: Option<i64>, enable: bool },
    Unknown,
}

impl Command {
    pub fn parse(text: &str) -> Self {
        let mut parts = text.split_whitespace();
        let head = parts.next().unwrap_or_default();
        // Group chats append the bot name: /check@boovpn_bot
        let head = head.split('@').next().unwrap_or(head);

        match head {
            "/start" => Self::Start,
            "/check" => Self::Check,
            "/friend" | "/unfriend" => Self::Friend {
                id: parts.next().and_then(|id| id.parse().ok()),
                enable: head == "/friend",
            },
            _ => Self::Unknown,
        }
    }
}

pub async fn message_handler(
    bot: Bot,
    msg: Message,
    state: AppState,
) -> Result<(), teloxide::RequestError> {
    if msg.date < state.started_at {
        debug!(chat = msg.chat.id.0, "Skipping message sent before startup");
        return Ok(());
    }
    let Some(text) = msg.text() else {
        return Ok(());
    };
    info!(chat = msg.chat.id.0, "Received message: {:?}", text);

    let sender = msg.from.as_ref().map(|u| u.id.0 as i64);
    let is_admin = sender.is_some_and(|id| state.config.is_admin(id));

    match Command::parse(text) {
        Command::Start => handle_start(&bot, &msg, &state).await,
        Command::Check if is_admin => handle_check(&bot, &msg, &state).await,
        Command::Friend { id, enable } if is_admin => {
            handle_friend(&bot, &msg, &state, id, enable).await
        }
        Command::Check | Command::Friend { .. } => {
            warn!(sender = ?sender, "Operator command from non-admin ignored");
            Ok(())
        }
        Command::Unknown => {
            bot.send_message(msg.chat.id, "Use /start to open the menu.")
                .await?;
            Ok(())
        }
    }
}

/// What `/start` did for a chat; `Failed` carries the reply to send.
#[derive(Debug, PartialEq)]
enum Registration {
    Created,
    Existing(Subscriber),
    Failed(&'static str),
}

async fn register(
    repo: &SubscriberRepository,
    id: i64,
    trial_days: i64,
    now: DateTime<Utc>,
) -> Registration {
    match repo.get_by_id(id).await {
        Ok(None) => {}
        found => return loaded(id, found),
    }

    match repo.create(id, trial_days, now).await {
        Ok(_) => Registration::Created,
        // A second /start from the same chat won the insert.
        Err(StoreError::AlreadyExists(_)) => loaded(id, repo.get_by_id(id).await),
        Err(e) => {
            error!(subscriber = id, "Failed to register subscriber: {}", e);
            Registration::Failed(REGISTRATION_FAILED)
        }
    }
}

fn loaded(id: i64, read: Result<Option<Subscriber>, StoreError>) -> Registration {
    match read {
        Ok(Some(sub)) => Registration::Existing(sub),
        Ok(None) => {
            error!(subscriber = id, "Subscriber missing after a duplicate registration");
            Registration::Failed(TRY_AGAIN)
        }
        Err(e) => {
            error!(subscriber = id, "Failed to load subscriber: {}", e);
            Registration::Failed(TRY_AGAIN)
        }
    }
}

async fn handle_start(bot: &Bot, msg: &Message, state: &AppState) -> Result<(), teloxide::RequestError> {
    let id = msg.chat.id.0;

    let sub = match register(&state.repo, id, state.config.app.trial_days, Utc::now()).await {
        Registration::Existing(sub) => sub,
        Registration::Created => {
            info!(subscriber = id, "New subscriber started a trial");
            state
                .notifications
                .notify_operations_channel(&format!("🎁 User {} started a trial", id))
                .await;
            bot.send_message(msg.chat.id, welcome_text())
                .parse_mode(ParseMode::Html)
                .reply_markup(welcome_keyboard())
                .await?;
            return Ok(());
        }
        Registration::Failed(reply) => {
            bot.send_message(msg.chat.id, reply).await?;
            return Ok(());
        }
    };

    bot.send_message(msg.chat.id, status_text(&sub, Utc::now()))
        .parse_mode(ParseMode::Html)
        .reply_markup(main_menu(state.support_url()))
        .await?;
    Ok(())
}

async fn handle_check(bot: &Bot, msg: &Message, state: &AppState) -> Result<(), teloxide::RequestError> {
    bot.send_message(msg.chat.id, "⏳ Running subscription check...")
        .await?;

    let reply = match state.reconciler.run().await {
        Ok(report) => report.summary(),
        Err(e) => {
            error!("Manual sweep failed: {}", e);
            format!("❌ Subscription check failed: {}", e)
        }
    };
    bot.send_message(msg.chat.id, reply).await?;
    Ok(())
}

async fn handle_friend(
    bot: &Bot,
    msg: &Message,
    state: &AppState,
    id: Option<i64>,
    enable: bool,
) -> Result<(), teloxide::RequestError> {
    let Some(id) = id else {
        bot.send_message(msg.chat.id, "Usage: /friend <user id> or /unfriend <user id>")
            .await?;
        return Ok(());
    };

    let reply = match state.repo.set_friend(id, enable).await {
        Ok(()) => {
            info!(subscriber = id, friend = enable, "Friend flag updated");
            if enable {
                format!("✅ User {} now uses the service for free", id)
            } else {
                format!("✅ User {} is a regular subscriber again", id)
            }
        }
        Err(StoreError::NotFound(_)) => format!("User {} has not started the bot yet", id),
        Err(e) => {
            error!(subscriber = id, "Failed to update friend flag: {}", e);
            "❌ Failed to update the user".to_string()
        }
    };
    bot.send_message(msg.chat.id, reply).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_commands() {
        assert_eq!(Command::parse("/start"), Command::Start);
        assert_eq!(Command::parse("/start ref123"), Command::Start);
        assert_eq!(Command::parse("/check@boovpn_bot"), Command::Check);
        assert_eq!(
            Command::parse("/friend 42"),
            Command::Friend { id: Some(42), enable: true }
        );
        assert_eq!(
            Command::parse("/unfriend abc"),
            Command::Friend { id: None, enable: false }
        );
        assert_eq!(Command::parse("hello"), Command::Unknown);
    }

    #[tokio::test]
    async fn start_registers_once_then_loads() {
        let repo = SubscriberRepository::new(boovpn_db::db::init_in_memory().await.unwrap(), 3);
        let now = Utc::now();

        assert_eq!(register(&repo, 42, 7, now).await, Registration::Created);
        match register(&repo, 42, 7, now).await {
            Registration::Existing(sub) => assert!(sub.is_trial),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn start_replies_when_the_store_is_down() {
        let pool = boovpn_db::db::init_in_memory().await.unwrap();
        let repo = SubscriberRepository::new(pool.clone(), 3);
        pool.close().await;

        assert_eq!(
            register(&repo, 42, 7, Utc::now()).await,
            Registration::Failed(TRY_AGAIN)
        );
    }

    #[test]
    fn failed_reread_after_duplicate_still_replies() {
        assert_eq!(
            loaded(42, Err(StoreError::Connection("pool closed".into()))),
            Registration::Failed(TRY_AGAIN)
        );
        assert_eq!(loaded(42, Ok(None)), Registration::Failed(TRY_AGAIN));
    }
}
