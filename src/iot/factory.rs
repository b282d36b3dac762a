use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use tracing::info;

use crate::config::{ApplicationType, HubConnectionType, IotConfig, ProvisioningConfig};
use crate::error::{ConnectorError, Result};

use super::mqtt::{MqttCredentials, MqttDeviceConnection};
use super::sas::derive_device_key;
use super::{
    ConnectionFactory, ConnectionString, DeviceConnection, DeviceContext, InboundMessageHandler,
    ProvisioningClient,
};

/// How a device's transport credential is obtained
#[derive(Clone)]
pub enum ConnectionStrategy {
    /// Pre-shared hub connection string
    ConnectionString(ConnectionString),
    /// Group enrollment: derive the device key, register, connect to the assigned hub
    Provisioning {
        client: ProvisioningClient,
        group_key: String,
    },
}

impl ConnectionStrategy {
    pub fn from_config(iot: &IotConfig, http: Client) -> Result<(Self, Option<String>)> {
        match iot.application_type {
            ApplicationType::Hub => {
                let hub = iot
                    .hub
                    .as_ref()
                    .ok_or_else(|| ConnectorError::Config("[iot.hub] missing".into()))?;
                match hub.connection_type {
                    HubConnectionType::ConnectionString => {
                        let connection_string = hub
                            .connection_string
                            .as_deref()
                            .ok_or_else(|| {
                                ConnectorError::Config("connection_string missing".into())
                            })?
                            .parse::<ConnectionString>()?;
                        if let Some(device_id) = &connection_string.device_id {
                            return Err(ConnectorError::Config(format!(
                                "connection_string is scoped to device {}, \
                                 a shared access policy is required",
                                device_id
                            )));
                        }
                        Ok((Self::ConnectionString(connection_string), hub.model_id.clone()))
                    }
                    HubConnectionType::Provisioning => {
                        let provisioning = hub.provisioning.as_ref().ok_or_else(|| {
                            ConnectorError::Config("[iot.hub.provisioning] missing".into())
                        })?;
                        let model_id =
                            provisioning.model_id.clone().or_else(|| hub.model_id.clone());
                        Ok((Self::provisioning(provisioning, http), model_id))
                    }
                }
            }
            ApplicationType::Central => {
                let central = iot
                    .central
                    .as_ref()
                    .ok_or_else(|| ConnectorError::Config("[iot.central] missing".into()))?;
                Ok((
                    Self::provisioning(&central.provisioning, http),
                    central.provisioning.model_id.clone(),
                ))
            }
        }
    }

    fn provisioning(config: &ProvisioningConfig, http: Client) -> Self {
        Self::Provisioning {
            client: ProvisioningClient::new(http, &config.global_device_endpoint, &config.id_scope),
            group_key: config.group_enrollment_key.clone(),
        }
    }
}

/// Opens MQTT device connections with the configured strategy
pub struct MqttConnectionFactory {
    strategy: ConnectionStrategy,
    model_id: Option<String>,
    handler: Arc<dyn InboundMessageHandler>,
    timeout: Duration,
}

impl MqttConnectionFactory {
    pub fn new(
        strategy: ConnectionStrategy,
        model_id: Option<String>,
        handler: Arc<dyn InboundMessageHandler>,
        timeout: Duration,
    ) -> Self {
        Self {
            strategy,
            model_id,
            handler,
            timeout,
        }
    }

    pub(crate) async fn credentials(&self, device_id: u32) -> Result<MqttCredentials> {
        let registration_id = device_id.to_string();
        match &self.strategy {
            ConnectionStrategy::ConnectionString(cs) => Ok(MqttCredentials {
                host: cs.host_name.clone(),
                device_id: registration_id,
                key: cs.shared_access_key.clone(),
                key_name: cs.shared_access_key_name.clone(),
                model_id: self.model_id.clone(),
            }),
            ConnectionStrategy::Provisioning { client, group_key } => {
                let device_key = derive_device_key(group_key, &registration_id)?;
                let registration = client
                    .register(&registration_id, &device_key, self.model_id.as_deref())
                    .await?;
                Ok(MqttCredentials {
                    host: registration.assigned_hub,
                    device_id: registration.device_id,
                    key: device_key,
                    key_name: None,
                    model_id: self.model_id.clone(),
                })
            }
        }
    }
}

#[async_trait]
impl ConnectionFactory for MqttConnectionFactory {
    async fn connect(&self, context: &DeviceContext) -> Result<Arc<dyn DeviceConnection>> {
        let credentials = self.credentials(context.device_id).await?;
        info!(
            device_id = context.device_id,
            organisation_id = context.organisation_id,
            "Opening device connection to {}",
            credentials.host
        );
        let connection = MqttDeviceConnection::open(
            credentials,
            *context,
            Arc::clone(&self.handler),
            self.timeout,
        )
        .await?;
        Ok(connection)
    }
}
