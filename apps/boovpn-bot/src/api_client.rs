use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::config::{MarzbanSection, TokenStore};

#[derive(Debug, Error)]
pub enum ProvisioningError {
    #[error("panel authentication failed: {0}")]
    Auth(String),

    #[error("panel returned {status}: {body}")]
    Remote { status: u16, body: String },

    #[error("unexpected panel response: {0}")]
    Protocol(String),

    #[error("panel request failed: {0}")]
    Transport(#[from] reqwest::Error),
}

impl ProvisioningError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::Remote { status: 404, .. })
    }
}

/// Calls against the VPN panel. Implementations never retry.
#[async_trait]
pub trait PanelApi: Send + Sync {
    async fn authenticate(&self) -> Result<String, ProvisioningError>;

    /// Returns the subscription link of the new panel user.
    async fn create_credential(&self, token: &str, name: &str) -> Result<String, ProvisioningError>;

    async fn delete_credential(&self, token: &str, name: &str) -> Result<(), ProvisioningError>;
}

#[derive(Clone)]
pub struct MarzbanClient {
    client: Client,
    base_url: String,
    username: String,
    password: String,
    proxy_protocol: String,
    inbounds: Vec<String>,
}

#[derive(Serialize)]
struct CreateUserReq<'a> {
    username: &'a str,
    proxies: serde_json::Value,
    inbounds: serde_json::Value,
    expire: i64,
    data_limit: i64,
}

#[derive(Deserialize)]
struct TokenResp {
    #[serde(default)]
    access_token: String,
}

#[derive(Deserialize)]
struct CreateUserResp {
    #[serde(default)]
    links: Vec<String>,
}

impl MarzbanClient {
    pub fn new(cfg: &MarzbanSection) -> Result<Self, ProvisioningError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(cfg.timeout_secs))
            .connect_timeout(Duration::from_secs(cfg.timeout_secs.min(5)))
            .build()?;

        Ok(Self {
            client,
            base_url: cfg.api_url.trim_end_matches('/').to_string(),
            username: cfg.username.clone(),
            password: cfg.password.clone(),
            proxy_protocol: cfg.proxy_protocol.clone(),
            inbounds: cfg.inbounds.clone(),
        })
    }

    async fn remote_error(resp: reqwest::Response) -> ProvisioningError {
        let status = resp.status().as_u16();
        let body = resp.text().await.unwrap_or_default();
        ProvisioningError::Remote { status, body }
    }
}

#[async_trait]
impl PanelApi for MarzbanClient {
    async fn authenticate(&self) -> Result<String, ProvisioningError> {
        let url = format!("{}/api/admin/token", self.base_url);
        let form = [
            ("grant_type", ""),
            ("username", self.username.as_str()),
            ("password", self.password.as_str()),
            ("scope", ""),
            ("client_id", ""),
            ("client_secret", ""),
        ];

        let resp = self
            .client
            .post(&url)
            .header("accept", "application/json")
            .form(&form)
            .send()
            .await
            .map_err(|e| ProvisioningError::Auth(e.to_string()))?;

        if resp.status() != StatusCode::OK {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(ProvisioningError::Auth(format!("{}: {}", status, body)));
        }

        let token: TokenResp = resp
            .json()
            .await
            .map_err(|e| ProvisioningError::Protocol(e.to_string()))?;
        if token.access_token.is_empty() {
            return Err(ProvisioningError::Auth("no access_token in response".into()));
        }
        Ok(token.access_token)
    }

    async fn create_credential(&self, token: &str, name: &str) -> Result<String, ProvisioningError> {
        let url = format!("{}/api/user", self.base_url);
        let mut proxies = serde_json::Map::new();
        proxies.insert(self.proxy_protocol.clone(), json!({}));
        let mut inbounds = serde_json::Map::new();
        inbounds.insert(self.proxy_protocol.clone(), json!(self.inbounds));

        let body = CreateUserReq {
            username: name,
            proxies: serde_json::Value::Object(proxies),
            inbounds: serde_json::Value::Object(inbounds),
            expire: 0,
            data_limit: 0,
        };

        let resp = self
            .client
            .post(&url)
            .bearer_auth(token)
            .json(&body)
            .send()
            .await?;

        if !resp.status().is_success() {
            return Err(Self::remote_error(resp).await);
        }

        let created: CreateUserResp = resp
            .json()
            .await
            .map_err(|e| ProvisioningError::Protocol(e.to_string()))?;
        created
            .links
            .into_iter()
            .next()
            .ok_or_else(|| ProvisioningError::Protocol(format!("no links returned for {}", name)))
    }

    async fn delete_credential(&self, token: &str, name: &str) -> Result<(), ProvisioningError> {
        let url = format!("{}/api/user/{}", self.base_url, urlencoding::encode(name));
        let resp = self.client.delete(&url).bearer_auth(token).send().await?;

        if !resp.status().is_success() {
            return Err(Self::remote_error(resp).await);
        }
        Ok(())
    }
}

/// Current panel bearer token. A refresh is written back through the
/// [`TokenStore`] so the next process start reuses it.
#[derive(Clone)]
pub struct AuthSession {
    token: Arc<RwLock<String>>,
    store: Arc<dyn TokenStore>,
}

impl AuthSession {
    pub fn new(initial_token: String, store: Arc<dyn TokenStore>) -> Self {
        Self {
            token: Arc::new(RwLock::new(initial_token)),
            store,
        }
    }

    pub async fn token(&self) -> String {
        self.token.read().await.clone()
    }

    pub async fn refresh(&self, api: &dyn PanelApi) -> Result<String, ProvisioningError> {
        let fresh = api.authenticate().await?;
        *self.token.write().await = fresh.clone();
        info!("Panel token refreshed");

        if let Err(e) = self.store.persist_token(&fresh).await {
            warn!("Failed to persist refreshed panel token: {:#}", e);
        }
        Ok(fresh)
    }
}
