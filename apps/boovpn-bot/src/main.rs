use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use boovpn_db::SubscriberRepository;
use boovpn_db::db::init_db;
use chrono::{SubsecRound, Utc};
use clap::{Parser, Subcommand};
use teloxide::prelude::*;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod api_client;
mod bot;
mod config;
mod services;
mod state;
mod webhook;

use crate::api_client::{AuthSession, MarzbanClient};
use crate::config::{BotConfig, FileTokenStore};
use crate::services::device_service::DeviceService;
use crate::services::notification_service::{NotificationService, TelegramNotifier};
use crate::services::reconciler::SubscriptionReconciler;
use crate::services::scheduler::SweepScheduler;
use crate::state::AppState;
use crate::webhook::WebhookState;

#[derive(Parser)]
#[command(name = "boovpn-bot", version, about = "Telegram bot selling and managing VPN access")]
struct Cli {
    /// Path to the TOML config file
    #[arg(long, default_value = "config.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the bot, the daily sweep and the payment webhook
    Serve,
    /// Run one subscription sweep and exit
    Check,
}

#[tokio::main]
async fn main() -> Result<()> {
    if let Err(e) = dotenvy::dotenv() {
        println!("⚠️  Warning: Failed to load .env file: {}", e);
    }

    let cli = Cli::parse();

    let file_appender = tracing_appender::rolling::never(".", "bot.log");
    let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "boovpn_bot=debug,boovpn_db=info,sqlx=warn,teloxide=info".into()
            }),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(io::stdout))
        .with(tracing_subscriber::fmt::layer().with_writer(non_blocking).with_ansi(false))
        .init();

    info!("Starting Boo VPN bot v{}", env!("CARGO_PKG_VERSION"));

    let config = Arc::new(BotConfig::load(&cli.config)?);
    let tz = config.timezone()?;

    let pool = init_db(&config.database.url)
        .await
        .context("Failed to open subscriber database")?;
    let repo = SubscriberRepository::new(pool, config.app.max_devices);

    let panel = Arc::new(MarzbanClient::new(&config.marzban).context("Failed to build panel client")?);
    let session = AuthSession::new(
        config.marzban.api_key.clone(),
        Arc::new(FileTokenStore::new(&cli.config)),
    );
    let devices = DeviceService::new(panel, session, repo.clone());

    let bot = Bot::new(&config.bot.token);
    let me = bot
        .get_me()
        .await
        .context("Bot failed to connect to Telegram")?;
    info!(
        "Bot connected as: @{}",
        me.user.username.clone().unwrap_or_else(|| "unknown".into())
    );

    let notifications = NotificationService::new(Arc::new(TelegramNotifier::new(
        bot.clone(),
        &config.bot.ops_channel,
    )));
    let reconciler = Arc::new(SubscriptionReconciler::new(
        repo.clone(),
        devices.clone(),
        notifications.clone(),
        tz,
    ));

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Check => {
            let report = reconciler.run().await?;
            info!("{}", report.summary());
        }
        Commands::Serve => {
            let state = AppState {
                config: config.clone(),
                repo: repo.clone(),
                devices,
                reconciler: reconciler.clone(),
                notifications: notifications.clone(),
                started_at: Utc::now().trunc_subsecs(0),
            };
            let webhook_state = WebhookState {
                repo,
                notifications,
                secret: Arc::from(config.payments.webhook_secret.as_str()),
            };
            run_server(bot, state, webhook_state, reconciler, &config, tz).await?;
        }
    }

    Ok(())
}

async fn run_server(
    bot: Bot,
    state: AppState,
    webhook_state: WebhookState,
    reconciler: Arc<SubscriptionReconciler>,
    config: &BotConfig,
    tz: chrono_tz::Tz,
) -> Result<()> {
    let (shutdown_tx, _) = tokio::sync::broadcast::channel::<()>(1);

    let scheduler = SweepScheduler::new(reconciler, config.app.check_hour, tz);
    let scheduler_task = tokio::spawn(scheduler.run(shutdown_tx.subscribe()));

    if config.payments.webhook_secret.is_empty() {
        warn!("payments.webhook_secret is empty, every payment event will be rejected");
    }
    let listen_addr = config.payments.listen_addr.clone();
    let webhook_rx = shutdown_tx.subscribe();
    let webhook_task = tokio::spawn(async move {
        if let Err(e) = webhook::serve(&listen_addr, webhook_state, webhook_rx).await {
            error!("Payment webhook stopped: {:#}", e);
        }
    });

    let bot_task = tokio::spawn(bot::run_bot(bot, shutdown_tx.subscribe(), state));

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    info!("Shutdown signal received, stopping...");
    let _ = shutdown_tx.send(());

    let _ = tokio::join!(bot_task, scheduler_task, webhook_task);
    info!("Boo VPN bot stopped");
    Ok(())
}
