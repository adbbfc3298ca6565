use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use boovpn_db::MAX_DEVICE_SLOTS;
use chrono_tz::Tz;
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct BotConfig {
    pub bot: TelegramSection,
    pub database: DatabaseSection,
    pub marzban: MarzbanSection,
    #[serde(default)]
    pub payments: PaymentsSection,
    #[serde(default)]
    pub app: AppSection,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TelegramSection {
    #[serde(default)]
    pub token: String,
    #[serde(default)]
    pub admin_ids: Vec<i64>,
    /// Numeric chat id or `@channel` username.
    pub ops_channel: String,
    #[serde(default)]
    pub support_url: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseSection {
    #[serde(default = "default_database_url")]
    pub url: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MarzbanSection {
    pub api_url: String,
    pub username: String,
    #[serde(default)]
    pub password: String,
    /// Last bearer token handed out by the panel.
    #[serde(default)]
    pub api_key: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_proxy_protocol")]
    pub proxy_protocol: String,
    #[serde(default = "default_inbounds")]
    pub inbounds: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PaymentsSection {
    #[serde(default)]
    pub webhook_secret: String,
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AppSection {
    #[serde(default = "default_trial_days")]
    pub trial_days: i64,
    #[serde(default = "default_check_hour")]
    pub check_hour: u32,
    #[serde(default = "default_timezone")]
    pub timezone: String,
    #[serde(default = "default_max_devices")]
    pub max_devices: usize,
}

fn default_database_url() -> String {
    "sqlite:boovpn.db".to_string()
}

fn default_timeout_secs() -> u64 {
    10
}

fn default_proxy_protocol() -> String {
    "shadowsocks".to_string()
}

fn default_inbounds() -> Vec<String> {
    vec!["Shadowsocks TCP".to_string()]
}

fn default_listen_addr() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_trial_days() -> i64 {
    7
}

fn default_check_hour() -> u32 {
    19
}

fn default_timezone() -> String {
    "Europe/Moscow".to_string()
}

fn default_max_devices() -> usize {
    MAX_DEVICE_SLOTS
}

impl Default for PaymentsSection {
    fn default() -> Self {
        Self {
            webhook_secret: String::new(),
            listen_addr: default_listen_addr(),
        }
    }
}

impl Default for AppSection {
    fn default() -> Self {
        Self {
            trial_days: default_trial_days(),
            check_hour: default_check_hour(),
            timezone: default_timezone(),
            max_devices: default_max_devices(),
        }
    }
}

impl BotConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        tracing::info!("Loading config from {}", path.display());

        let mut config = Self::from_toml(&contents)?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml(contents: &str) -> Result<Self> {
        toml::from_str(contents).context("Failed to parse config")
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(token) = std::env::var("BOT_TOKEN") {
            self.bot.token = token;
        }
        if let Ok(url) = std::env::var("DATABASE_URL") {
            self.database.url = url;
        }
        if let Ok(password) = std::env::var("MARZBAN_PASSWORD") {
            self.marzban.password = password;
        }
        if let Ok(secret) = std::env::var("PAYMENTS_WEBHOOK_SECRET") {
            self.payments.webhook_secret = secret;
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.bot.token.is_empty() {
            bail!("bot.token is not set (config or BOT_TOKEN)");
        }
        if self.app.check_hour >= 24 {
            bail!("app.check_hour must be below 24, got {}", self.app.check_hour);
        }
        if self.app.max_devices == 0 || self.app.max_devices > MAX_DEVICE_SLOTS {
            bail!(
                "app.max_devices must be between 1 and {}, got {}",
                MAX_DEVICE_SLOTS,
                self.app.max_devices
            );
        }
        if self.app.trial_days < 0 {
            bail!("app.trial_days must not be negative");
        }
        if self.marzban.timeout_secs == 0 {
            bail!("marzban.timeout_secs must be positive");
        }
        self.timezone()?;
        Ok(())
    }

    pub fn timezone(&self) -> Result<Tz> {
        self.app
            .timezone
            .parse::<Tz>()
            .map_err(|e| anyhow::anyhow!("Invalid app.timezone {:?}: {}", self.app.timezone, e))
    }

    pub fn is_admin(&self, user_id: i64) -> bool {
        self.bot.admin_ids.contains(&user_id)
    }
}

/// Where a refreshed panel token is written so it survives restarts.
#[async_trait]
pub trait TokenStore: Send + Sync {
    async fn persist_token(&self, token: &str) -> Result<()>;
}

/// Rewrites `marzban.api_key` inside the config file. Everything else,
/// comments and layout included, is kept as written.
pub struct FileTokenStore {
    path: PathBuf,
    writing: tokio::sync::Mutex<()>,
}

static TMP_SEQ: AtomicU64 = AtomicU64::new(0);

impl FileTokenStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            writing: tokio::sync::Mutex::new(()),
        }
    }

    fn tmp_path(&self) -> PathBuf {
        let seq = TMP_SEQ.fetch_add(1, Ordering::Relaxed);
        let mut name = self.path.file_name().unwrap_or_default().to_os_string();
        name.push(format!(".{}.{}.tmp", std::process::id(), seq));
        self.path.with_file_name(name)
    }
}

#[async_trait]
impl TokenStore for FileTokenStore {
    async fn persist_token(&self, token: &str) -> Result<()> {
        let _writing = self.writing.lock().await;

        let contents = tokio::fs::read_to_string(&self.path)
            .await
            .with_context(|| format!("Failed to read {}", self.path.display()))?;
        let mut doc: toml_edit::DocumentMut = contents.parse().context("Failed to parse config")?;

        let marzban = doc.entry("marzban").or_insert(toml_edit::table());
        let Some(marzban) = marzban.as_table_like_mut() else {
            bail!("[marzban] in {} is not a table", self.path.display());
        };
        marzban.insert("api_key", toml_edit::value(token));

        let tmp = self.tmp_path();
        tokio::fs::write(&tmp, doc.to_string())
            .await
            .with_context(|| format!("Failed to write {}", tmp.display()))?;
        if let Err(e) = tokio::fs::rename(&tmp, &self.path).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(e).with_context(|| format!("Failed to replace {}", self.path.display()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
[bot]
token = "123:abc"
admin_ids = [1001]
ops_channel = "-1002233445566"

[database]
url = "sqlite:test.db"

[marzban]
api_url = "https://panel.example.com"
username = "admin"
password = "secret"
api_key = "old-token"
"#;

    #[test]
    fn parses_with_defaults() {
        let config = BotConfig::from_toml(SAMPLE).unwrap();
        config.validate().unwrap();

        assert_eq!(config.app.trial_days, 7);
        assert_eq!(config.app.check_hour, 19);
        assert_eq!(config.app.max_devices, 3);
        assert_eq!(config.marzban.timeout_secs, 10);
        assert_eq!(config.marzban.inbounds, vec!["Shadowsocks TCP".to_string()]);
        assert_eq!(config.timezone().unwrap(), chrono_tz::Europe::Moscow);
        assert!(config.is_admin(1001));
        assert!(!config.is_admin(42));
    }

    #[test]
    fn rejects_out_of_range_values() {
        let mut config = BotConfig::from_toml(SAMPLE).unwrap();
        config.app.check_hour = 24;
        assert!(config.validate().is_err());

        let mut config = BotConfig::from_toml(SAMPLE).unwrap();
        config.app.max_devices = 4;
        assert!(config.validate().is_err());

        let mut config = BotConfig::from_toml(SAMPLE).unwrap();
        config.app.timezone = "Mars/Olympus".into();
        assert!(config.validate().is_err());
    }

    #[tokio::test]
    async fn token_store_rewrites_only_the_api_key() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, SAMPLE).unwrap();

        FileTokenStore::new(&path).persist_token("fresh-token").await.unwrap();

        let reloaded = BotConfig::from_toml(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(reloaded.marzban.api_key, "fresh-token");
        assert_eq!(reloaded.marzban.password, "secret");
        assert_eq!(reloaded.bot.admin_ids, vec![1001]);
        assert_eq!(reloaded.database.url, "sqlite:test.db");
    }

    #[tokio::test]
    async fn token_store_fails_on_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileTokenStore::new(dir.path().join("absent.toml"));
        assert!(store.persist_token("x").await.is_err());
    }

    #[tokio::test]
    async fn token_store_keeps_comments_and_survives_concurrent_refreshes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        let commented = SAMPLE.replace(
            "[marzban]",
            "# panel credentials\n[marzban]\n# Rewritten by the bot after every token refresh",
        );
        std::fs::write(&path, &commented).unwrap();

        let store = FileTokenStore::new(&path);
        let (a, b) = tokio::join!(store.persist_token("first"), store.persist_token("second"));
        a.unwrap();
        b.unwrap();

        let written = std::fs::read_to_string(&path).unwrap();
        assert!(written.contains("# panel credentials"));
        assert!(written.contains("# Rewritten by the bot after every token refresh"));
        let reloaded = BotConfig::from_toml(&written).unwrap();
        assert!(["first", "second"].contains(&reloaded.marzban.api_key.as_str()));

        let leftovers: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }
}
