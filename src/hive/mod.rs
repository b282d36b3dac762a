//! Hive (satellite gateway) REST client
//!
//! Bearer token obtained via `POST /login`, refreshed once older than the
//! configured validity window. Refresh is not serialised: concurrent
//! callers may each log in and the last successful login wins.

pub mod types;

use std::time::{Duration, Instant};

use async_trait::async_trait;
use base64::Engine;
use reqwest::Client;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::config::HiveConfig;
use crate::error::{ConnectorError, Result};

pub use types::{DeviceSummary, SendReceipt, UserMessage};
use types::{LoginRequest, LoginResponse};

/// Operations the connector needs from the hive
#[async_trait]
pub trait HiveApi: Send + Sync {
    async fn login(&self) -> Result<()>;

    async fn device_list(&self) -> Result<Vec<DeviceSummary>>;

    /// Queue `payload` for delivery to a device
    async fn send(
        &self,
        organisation_id: u32,
        device_type: u8,
        device_id: u32,
        application_id: u16,
        payload: &[u8],
    ) -> Result<SendReceipt>;
}

struct Token {
    value: String,
    issued_at: Instant,
}

pub struct HiveClient {
    config: HiveConfig,
    http: Client,
    token: RwLock<Option<Token>>,
}

impl HiveClient {
    pub fn new(config: HiveConfig, http: Client) -> Self {
        info!("Hive client created for {}", config.base_url);
        Self {
            config,
            http,
            token: RwLock::new(None),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.config.base_url.trim_end_matches('/'), path)
    }

    fn token_valid_for(&self) -> Duration {
        Duration::from_secs(self.config.token_valid_for_secs)
    }

    /// Current bearer token, logging in first if it is missing or stale
    async fn bearer(&self) -> Result<String> {
        {
            let token = self.token.read().await;
            if let Some(token) = token.as_ref() {
                if token.issued_at.elapsed() < self.token_valid_for() {
                    return Ok(token.value.clone());
                }
                debug!("Hive token older than {:?}, refreshing", self.token_valid_for());
            }
        }

        self.login().await?;
        self.token
            .read()
            .await
            .as_ref()
            .map(|token| token.value.clone())
            .ok_or_else(|| ConnectorError::Hive("no token after login".to_string()))
    }
}

#[async_trait]
impl HiveApi for HiveClient {
    async fn login(&self) -> Result<()> {
        let response = self
            .http
            .post(self.url("/login"))
            .json(&LoginRequest {
                username: &self.config.username,
                password: &self.config.password,
            })
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ConnectorError::Hive(format!(
                "login failed with status {}: {}",
                status, body
            )));
        }

        let login: LoginResponse = response.json().await?;
        info!("Hive login succeeded, token {}", mask_token(&login.token));

        *self.token.write().await = Some(Token {
            value: login.token,
            issued_at: Instant::now(),
        });
        Ok(())
    }

    async fn device_list(&self) -> Result<Vec<DeviceSummary>> {
        let bearer = self.bearer().await?;
        let response = self
            .http
            .get(self.url("/api/v1/devices"))
            .bearer_auth(bearer)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(ConnectorError::Hive(format!(
                "device list failed with status {}",
                status
            )));
        }

        Ok(response.json().await?)
    }

    async fn send(
        &self,
        organisation_id: u32,
        device_type: u8,
        device_id: u32,
        application_id: u16,
        payload: &[u8],
    ) -> Result<SendReceipt> {
        let message = UserMessage {
            organization_id: organisation_id,
            device_type,
            device_id,
            user_application_id: application_id,
            data: base64::engine::general_purpose::STANDARD.encode(payload),
        };

        if !self.config.downlink_enabled {
            warn!(
                device_id,
                application_id,
                "Downlink disabled, not sending {}",
                hex::encode(payload)
            );
            return Ok(SendReceipt {
                packet_id: None,
                status: "DISABLED".to_string(),
            });
        }

        let bearer = self.bearer().await?;
        let response = self
            .http
            .post(self.url("/api/v1/messages"))
            .bearer_auth(bearer)
            .json(&message)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ConnectorError::Send(format!(
                "hive send to device {} failed with status {}: {}",
                device_id, status, body
            )));
        }

        let receipt: SendReceipt = response.json().await?;
        debug!(
            device_id,
            packet_id = ?receipt.packet_id,
            "Hive accepted message, status {}",
            receipt.status
        );
        Ok(receipt)
    }
}

/// First and last five characters of a token, for logs
pub fn mask_token(token: &str) -> String {
    let chars: Vec<char> = token.chars().collect();
    if chars.len() <= 10 {
        return "*".repeat(chars.len());
    }
    let head: String = chars[..5].iter().collect();
    let tail: String = chars[chars.len() - 5..].iter().collect();
    format!("{}...{}", head, tail)
}
