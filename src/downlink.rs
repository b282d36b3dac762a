//! Cloud-to-device message processing
//!
//! Each inbound message is validated, run through the downlink formatter for
//! its application id and forwarded to the hive. It is completed only after
//! the hive accepted it; every other outcome rejects it.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, error, info, warn};

use crate::config::{ApplicationConfig, MethodSetting};
use crate::error::{ConnectorError, Result};
use crate::formatter::{FormatterCache, FormatterInput};
use crate::hive::HiveApi;
use crate::iot::{DeviceConnection, DeviceContext, InboundMessage, InboundMessageHandler};
use crate::payload::{is_json_document, try_parse_json, DecodedPayload};

pub const APPLICATION_ID_PROPERTY: &str = "UserApplicationId";
pub const METHOD_NAME_PROPERTY: &str = "method-name";

/// Marker an IoT Central command sends for "no request payload"
const EMPTY_PAYLOAD_MARKER: &str = "@";

/// Where the application id of a downlink comes from
#[derive(Debug, Clone)]
pub enum DownlinkFlavor {
    /// `UserApplicationId` message property
    Hub,
    /// `method-name` property looked up in the configured command table
    Central {
        methods: HashMap<String, MethodSetting>,
    },
}

/// A validated downlink, ready for its formatter
#[derive(Debug, Clone, PartialEq)]
struct Validated {
    application_id: u16,
    payload: DecodedPayload,
}

pub struct DownlinkProcessor {
    flavor: DownlinkFlavor,
    application: ApplicationConfig,
    formatters: Arc<FormatterCache>,
    hive: Arc<dyn HiveApi>,
}

impl DownlinkProcessor {
    pub fn new(
        flavor: DownlinkFlavor,
        application: ApplicationConfig,
        formatters: Arc<FormatterCache>,
        hive: Arc<dyn HiveApi>,
    ) -> Self {
        Self {
            flavor,
            application,
            formatters,
            hive,
        }
    }

    fn validate(&self, message: &InboundMessage) -> Result<Validated> {
        match &self.flavor {
            DownlinkFlavor::Hub => {
                let application_id = message
                    .properties
                    .get(APPLICATION_ID_PROPERTY)
                    .ok_or_else(|| {
                        ConnectorError::Validation(format!(
                            "{} property missing",
                            APPLICATION_ID_PROPERTY
                        ))
                    })?
                    .trim()
                    .parse::<u16>()
                    .map_err(|_| {
                        ConnectorError::Validation(format!(
                            "{} property invalid",
                            APPLICATION_ID_PROPERTY
                        ))
                    })?;
                self.check_range(application_id)?;

                Ok(Validated {
                    application_id,
                    payload: DecodedPayload::from_bytes(message.payload.clone()),
                })
            }
            DownlinkFlavor::Central { methods } => {
                let method_name = message
                    .properties
                    .get(METHOD_NAME_PROPERTY)
                    .map(|name| name.trim())
                    .filter(|name| !name.is_empty())
                    .ok_or_else(|| {
                        ConnectorError::Validation(format!(
                            "{} property missing or empty",
                            METHOD_NAME_PROPERTY
                        ))
                    })?;
                let setting = methods.get(method_name).ok_or_else(|| {
                    ConnectorError::Validation(format!("method {} has no settings", method_name))
                })?;
                self.check_range(setting.application_id)?;

                let mut payload = DecodedPayload::from_bytes(message.payload.clone());
                payload.json = Some(command_json(method_name, setting, &payload.text)?);

                Ok(Validated {
                    application_id: setting.application_id,
                    payload,
                })
            }
        }
    }

    fn check_range(&self, application_id: u16) -> Result<()> {
        if !self.application.application_id_in_range(application_id) {
            return Err(ConnectorError::Validation(format!(
                "{} {} outside {} to {}",
                APPLICATION_ID_PROPERTY,
                application_id,
                self.application.application_id_minimum,
                self.application.application_id_maximum
            )));
        }
        Ok(())
    }

    /// Everything up to and including the hive send. `Ok` means the message
    /// should be completed.
    async fn process(&self, context: &DeviceContext, message: &InboundMessage) -> Result<()> {
        let validated = self.validate(message)?;
        let formatter = self.formatters.downlink(validated.application_id).await?;

        let input = FormatterInput {
            organisation_id: context.organisation_id,
            device_id: context.device_id,
            device_type: context.device_type,
            application_id: validated.application_id,
            payload_bytes: &validated.payload.bytes,
            payload_text: &validated.payload.text,
            payload_json: validated.payload.json.as_ref(),
        };
        let bytes = formatter.evaluate_downlink(&input, &message.properties)?;

        if bytes.is_empty() {
            info!(
                device_id = context.device_id,
                application_id = validated.application_id,
                lock_token = %message.lock_token,
                "Formatter produced no payload, nothing to send"
            );
            return Ok(());
        }

        let receipt = self
            .hive
            .send(
                context.organisation_id,
                context.device_type,
                context.device_id,
                validated.application_id,
                &bytes,
            )
            .await?;

        info!(
            device_id = context.device_id,
            application_id = validated.application_id,
            lock_token = %message.lock_token,
            packet_id = ?receipt.packet_id,
            "Downlink sent: {}",
            hex::encode(&bytes)
        );
        Ok(())
    }
}

/// JSON handed to a central command's formatter.
///
/// An empty request uses the command's configured payload. A request that
/// is not a JSON document is wrapped as `{method: value}`, where value is
/// the request parsed as a JSON scalar if possible, else the raw text.
fn command_json(method_name: &str, setting: &MethodSetting, text: &str) -> Result<Value> {
    let text = text.trim();
    if text.is_empty() || text == EMPTY_PAYLOAD_MARKER {
        if !is_json_document(&setting.payload) {
            return Err(ConnectorError::Validation(format!(
                "method {} default payload is not JSON",
                method_name
            )));
        }
        return Ok(serde_json::from_str(&setting.payload)?);
    }

    if is_json_document(text) {
        return Ok(serde_json::from_str(text)?);
    }

    let value = try_parse_json(text).unwrap_or_else(|| Value::String(text.to_string()));
    let mut wrapped = serde_json::Map::new();
    wrapped.insert(method_name.to_string(), value);
    Ok(Value::Object(wrapped))
}

#[async_trait]
impl InboundMessageHandler for DownlinkProcessor {
    async fn handle(
        &self,
        connection: &dyn DeviceConnection,
        context: &DeviceContext,
        message: InboundMessage,
    ) {
        debug!(
            device_id = context.device_id,
            organisation_id = context.organisation_id,
            lock_token = %message.lock_token,
            "Downlink received"
        );

        let settled = match self.process(context, &message).await {
            Ok(()) => connection.complete(&message.lock_token).await,
            Err(e) => {
                if e.is_rejection() {
                    warn!(
                        device_id = context.device_id,
                        lock_token = %message.lock_token,
                        "Downlink rejected: {}", e
                    );
                } else {
                    error!(
                        device_id = context.device_id,
                        lock_token = %message.lock_token,
                        "Downlink failed: {}", e
                    );
                }
                connection.reject(&message.lock_token).await
            }
        };

        if let Err(e) = settled {
            error!(
                device_id = context.device_id,
                lock_token = %message.lock_token,
                "Settling downlink failed: {}", e
            );
        }
    }
}
