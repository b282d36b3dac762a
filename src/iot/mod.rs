//! Cloud-side device connections
//!
//! One live connection per device id, created by a [`ConnectionFactory`] and
//! shared through the [`DeviceConnectionCache`]. Inbound cloud-to-device
//! messages are handed to the [`InboundMessageHandler`] registered when the
//! connection was opened.

pub mod connection_cache;
pub mod connection_string;
pub mod factory;
pub mod mqtt;
pub mod provisioning;
pub mod sas;

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::Result;

pub use connection_cache::DeviceConnectionCache;
pub use connection_string::ConnectionString;
pub use factory::{ConnectionStrategy, MqttConnectionFactory};
pub use mqtt::MqttDeviceConnection;
pub use provisioning::{DeviceRegistration, ProvisioningClient};

/// Correlation fields carried by every message for a device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceContext {
    pub organisation_id: u32,
    pub device_id: u32,
    pub device_type: u8,
}

/// Device-to-cloud event: serialised body plus message properties
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TelemetryMessage {
    pub body: Vec<u8>,
    pub properties: BTreeMap<String, String>,
}

impl TelemetryMessage {
    /// Insert unless the property is already set
    pub fn try_add_property(&mut self, key: &str, value: impl Into<String>) -> bool {
        if self.properties.contains_key(key) {
            return false;
        }
        self.properties.insert(key.to_string(), value.into());
        true
    }
}

/// Cloud-to-device message awaiting exactly one `complete` or `reject`
#[derive(Debug, Clone, PartialEq)]
pub struct InboundMessage {
    pub lock_token: String,
    pub payload: Vec<u8>,
    pub properties: HashMap<String, String>,
}

#[async_trait]
pub trait DeviceConnection: Send + Sync {
    fn device_id(&self) -> u32;

    async fn send_event(&self, message: TelemetryMessage) -> Result<()>;

    /// Settle an inbound message as processed.
    async fn complete(&self, lock_token: &str) -> Result<()>;

    /// Settle an inbound message as unprocessable.
    async fn reject(&self, lock_token: &str) -> Result<()>;

    async fn close(&self);
}

#[async_trait]
pub trait InboundMessageHandler: Send + Sync {
    /// Process one inbound message; implementations settle it on `connection`.
    async fn handle(
        &self,
        connection: &dyn DeviceConnection,
        context: &DeviceContext,
        message: InboundMessage,
    );
}

#[async_trait]
pub trait ConnectionFactory: Send + Sync {
    /// Establish, register handlers on and open a connection for the device.
    async fn connect(&self, context: &DeviceContext) -> Result<Arc<dyn DeviceConnection>>;
}
