//! Where formatter source text comes from

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use reqwest::StatusCode;
use tracing::debug;

use crate::config::{BlobStoreConfig, FormatterConfig};
use crate::error::{ConnectorError, Result};

use super::{Direction, FormatterKey};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceText {
    /// File or blob name, used in logs and compile errors
    pub name: String,
    pub text: String,
}

#[async_trait]
pub trait FormatterSource: Send + Sync {
    /// Application specific source, `None` when there isn't one.
    async fn load(&self, key: FormatterKey) -> Result<Option<SourceText>>;

    /// Configured default source for the direction, `None` when absent.
    async fn load_default(&self, direction: Direction) -> Result<Option<SourceText>>;
}

/// Formatter files on local disk, one directory per direction
pub struct FileSystemSource {
    uplink_path: PathBuf,
    uplink_default: PathBuf,
    downlink_path: PathBuf,
    downlink_default: PathBuf,
    extension: String,
}

impl FileSystemSource {
    pub fn new(config: &FormatterConfig) -> Self {
        Self {
            uplink_path: config.uplink_path.clone(),
            uplink_default: config.uplink_default.clone(),
            downlink_path: config.downlink_path.clone(),
            downlink_default: config.downlink_default.clone(),
            extension: config.extension.clone(),
        }
    }

    fn directory(&self, direction: Direction) -> &Path {
        match direction {
            Direction::Uplink => &self.uplink_path,
            Direction::Downlink => &self.downlink_path,
        }
    }

    async fn read(path: &Path) -> Result<Option<SourceText>> {
        match tokio::fs::read_to_string(path).await {
            Ok(text) => Ok(Some(SourceText {
                name: path.display().to_string(),
                text,
            })),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("Formatter {} not found", path.display());
                Ok(None)
            }
            Err(e) => Err(ConnectorError::Io(e)),
        }
    }
}

#[async_trait]
impl FormatterSource for FileSystemSource {
    async fn load(&self, key: FormatterKey) -> Result<Option<SourceText>> {
        let path = self
            .directory(key.direction)
            .join(key.file_name(&self.extension));
        Self::read(&path).await
    }

    async fn load_default(&self, direction: Direction) -> Result<Option<SourceText>> {
        let path = match direction {
            Direction::Uplink => &self.uplink_default,
            Direction::Downlink => &self.downlink_default,
        };
        Self::read(path).await
    }
}

/// Formatter blobs in an HTTP blob container, `{container}/{direction}/{name}`
pub struct BlobStoreSource {
    client: reqwest::Client,
    container_url: String,
    sas_token: Option<String>,
    uplink_default: String,
    downlink_default: String,
    extension: String,
}

impl BlobStoreSource {
    pub fn new(client: reqwest::Client, blob: &BlobStoreConfig, extension: &str) -> Self {
        Self {
            client,
            container_url: blob.container_url.trim_end_matches('/').to_string(),
            sas_token: blob
                .sas_token
                .as_ref()
                .map(|sas| sas.trim_start_matches('?').to_string()),
            uplink_default: blob.uplink_default.clone(),
            downlink_default: blob.downlink_default.clone(),
            extension: extension.to_string(),
        }
    }

    fn blob_url(&self, direction: Direction, name: &str) -> String {
        match &self.sas_token {
            Some(sas) => format!("{}/{}/{}?{}", self.container_url, direction, name, sas),
            None => format!("{}/{}/{}", self.container_url, direction, name),
        }
    }

    async fn fetch(&self, direction: Direction, name: &str) -> Result<Option<SourceText>> {
        let response = self.client.get(self.blob_url(direction, name)).send().await?;

        match response.status() {
            StatusCode::NOT_FOUND => {
                debug!("Formatter blob {}/{} not found", direction, name);
                Ok(None)
            }
            status if status.is_success() => Ok(Some(SourceText {
                name: format!("{}/{}", direction, name),
                text: response.text().await?,
            })),
            status => Err(ConnectorError::Transport(format!(
                "blob store returned {} for {}/{}",
                status, direction, name
            ))),
        }
    }
}

#[async_trait]
impl FormatterSource for BlobStoreSource {
    async fn load(&self, key: FormatterKey) -> Result<Option<SourceText>> {
        self.fetch(key.direction, &key.file_name(&self.extension))
            .await
    }

    async fn load_default(&self, direction: Direction) -> Result<Option<SourceText>> {
        let name = match direction {
            Direction::Uplink => &self.uplink_default,
            Direction::Downlink => &self.downlink_default,
        };
        self.fetch(direction, name).await
    }
}
