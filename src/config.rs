use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub webhook: WebhookConfig,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub application: ApplicationConfig,
    #[serde(default)]
    pub formatters: FormatterConfig,
    pub hive: HiveConfig,
    pub iot: IotConfig,
    #[serde(default)]
    pub startup: StartupConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WebhookConfig {
    pub bind: String,
    /// x-api-key value → client name
    #[serde(default)]
    pub api_keys: HashMap<String, String>,
    pub queue_name: String,
    pub queue_capacity: usize,
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:8080".to_string(),
            api_keys: HashMap::new(),
            queue_name: "uplink".to_string(),
            queue_capacity: 1024,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    pub max_attempts: u32,
    pub concurrency: usize,
    /// Delay before the first redelivery, doubled on each further attempt
    pub retry_delay_ms: u64,
    pub retry_delay_max_ms: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            concurrency: 16,
            retry_delay_ms: 2_000,
            retry_delay_max_ms: 60_000,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ApplicationConfig {
    pub organisation_id: u32,
    pub application_id_minimum: u16,
    pub application_id_maximum: u16,
    pub payload_length_maximum: u16,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            organisation_id: 0,
            application_id_minimum: 0,
            // The hive reserves 65000 - 65535
            application_id_maximum: 65000,
            payload_length_maximum: 192,
        }
    }
}

impl ApplicationConfig {
    pub fn application_id_in_range(&self, application_id: u16) -> bool {
        (self.application_id_minimum..=self.application_id_maximum).contains(&application_id)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FormatterConfig {
    pub uplink_path: PathBuf,
    pub uplink_default: PathBuf,
    pub downlink_path: PathBuf,
    pub downlink_default: PathBuf,
    pub extension: String,
    pub blob: Option<BlobStoreConfig>,
}

impl Default for FormatterConfig {
    fn default() -> Self {
        Self {
            uplink_path: PathBuf::from("formatters/uplink"),
            uplink_default: PathBuf::from("formatters/uplink/default.cel"),
            downlink_path: PathBuf::from("formatters/downlink"),
            downlink_default: PathBuf::from("formatters/downlink/default.cel"),
            extension: "cel".to_string(),
            blob: None,
        }
    }
}

/// Formatter sources fetched over HTTP from a blob container instead of disk
#[derive(Debug, Clone, Deserialize)]
pub struct BlobStoreConfig {
    pub container_url: String,
    pub sas_token: Option<String>,
    pub uplink_default: String,
    pub downlink_default: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HiveConfig {
    pub base_url: String,
    pub username: String,
    pub password: String,
    #[serde(default = "HiveConfig::default_token_valid_for_secs")]
    pub token_valid_for_secs: u64,
    #[serde(default = "HiveConfig::default_downlink_enabled")]
    pub downlink_enabled: bool,
}

impl HiveConfig {
    fn default_token_valid_for_secs() -> u64 {
        3600
    }

    fn default_downlink_enabled() -> bool {
        true
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApplicationType {
    Hub,
    Central,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HubConnectionType {
    ConnectionString,
    Provisioning,
}

#[derive(Debug, Clone, Deserialize)]
pub struct IotConfig {
    pub application_type: ApplicationType,
    #[serde(default = "IotConfig::default_transport_timeout_secs")]
    pub transport_timeout_secs: u64,
    pub hub: Option<HubConfig>,
    pub central: Option<CentralConfig>,
}

impl IotConfig {
    fn default_transport_timeout_secs() -> u64 {
        30
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct HubConfig {
    pub connection_type: HubConnectionType,
    pub connection_string: Option<String>,
    pub model_id: Option<String>,
    pub provisioning: Option<ProvisioningConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CentralConfig {
    pub provisioning: ProvisioningConfig,
    #[serde(default)]
    pub methods: HashMap<String, MethodSetting>,
}

/// Per-command settings for the central flavour
#[derive(Debug, Clone, Deserialize)]
pub struct MethodSetting {
    pub application_id: u16,
    #[serde(default)]
    pub payload: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProvisioningConfig {
    #[serde(default = "ProvisioningConfig::default_global_device_endpoint")]
    pub global_device_endpoint: String,
    pub id_scope: String,
    /// Base64 group enrollment key
    pub group_enrollment_key: String,
    pub model_id: Option<String>,
}

impl ProvisioningConfig {
    fn default_global_device_endpoint() -> String {
        "global.azure-devices-provisioning.net".to_string()
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct StartupConfig {
    pub prewarm_connections: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Failed to read config file {:?}: {}", path, e))?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> anyhow::Result<Self> {
        let config: Config = toml::from_str(content)
            .map_err(|e| anyhow::anyhow!("Failed to parse config file: {}", e))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> anyhow::Result<()> {
        if self.application.application_id_minimum > self.application.application_id_maximum {
            anyhow::bail!(
                "application_id_minimum {} exceeds application_id_maximum {}",
                self.application.application_id_minimum,
                self.application.application_id_maximum
            );
        }

        match self.iot.application_type {
            ApplicationType::Hub => {
                let hub = self
                    .iot
                    .hub
                    .as_ref()
                    .ok_or_else(|| anyhow::anyhow!("[iot.hub] required for application_type hub"))?;
                match hub.connection_type {
                    HubConnectionType::ConnectionString if hub.connection_string.is_none() => {
                        anyhow::bail!("[iot.hub] connection_string required")
                    }
                    HubConnectionType::Provisioning if hub.provisioning.is_none() => {
                        anyhow::bail!("[iot.hub.provisioning] required")
                    }
                    _ => {}
                }
            }
            ApplicationType::Central => {
                if self.iot.central.is_none() {
                    anyhow::bail!("[iot.central] required for application_type central");
                }
            }
        }

        if self.queue.concurrency == 0 {
            anyhow::bail!("[queue] concurrency must be at least 1");
        }

        Ok(())
    }
}
