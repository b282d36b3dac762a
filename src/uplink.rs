//! Gateway-to-cloud telemetry processing

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::formatter::{FormatterCache, FormatterInput};
use crate::iot::{DeviceConnectionCache, DeviceContext, TelemetryMessage};
use crate::payload::DecodedPayload;

/// Uplink packet as stored on the queue by the webhook
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct UplinkPayload {
    pub packet_id: u64,
    pub device_type: u8,
    pub device_id: u32,
    pub user_application_id: u16,
    pub organization_id: u32,
    /// Base64 device bytes
    pub data: String,
    pub length: u16,
    pub status: i32,
    pub swarm_hive_received_at_utc: DateTime<Utc>,
    pub uplink_web_hook_received_at_utc: DateTime<Utc>,
    pub client: String,
}

impl UplinkPayload {
    pub fn context(&self) -> DeviceContext {
        DeviceContext {
            organisation_id: self.organization_id,
            device_id: self.device_id,
            device_type: self.device_type,
        }
    }
}

fn sortable(timestamp: &DateTime<Utc>) -> String {
    timestamp.format("%Y-%m-%dT%H:%M:%S").to_string()
}

/// Add the standard envelope fields the formatter did not set itself.
pub fn merge_envelope(telemetry: &mut Map<String, Value>, payload: &UplinkPayload) {
    let fields = [
        ("packetId", Value::from(payload.packet_id)),
        ("deviceType", Value::from(payload.device_type)),
        ("DeviceID", Value::from(payload.device_id)),
        ("OrganizationId", Value::from(payload.organization_id)),
        ("UserApplicationId", Value::from(payload.user_application_id)),
        (
            "SwarmHiveReceivedAtUtc",
            Value::from(sortable(&payload.swarm_hive_received_at_utc)),
        ),
        (
            "UplinkWebHookReceivedAtUtc",
            Value::from(sortable(&payload.uplink_web_hook_received_at_utc)),
        ),
        ("DataLength", Value::from(payload.length)),
        ("Data", Value::from(payload.data.clone())),
        ("Status", Value::from(payload.status)),
        ("Client", Value::from(payload.client.clone())),
    ];

    for (key, value) in fields {
        telemetry.entry(key).or_insert(value);
    }
}

fn add_standard_properties(message: &mut TelemetryMessage, payload: &UplinkPayload) {
    message.try_add_property("PacketId", payload.packet_id.to_string());
    message.try_add_property("DeviceType", payload.device_type.to_string());
    message.try_add_property("DeviceId", payload.device_id.to_string());
    message.try_add_property("UserApplicationId", payload.user_application_id.to_string());
    message.try_add_property("OrganizationId", payload.organization_id.to_string());
    message.try_add_property("Client", payload.client.clone());
}

pub struct UplinkProcessor {
    formatters: Arc<FormatterCache>,
    connections: Arc<DeviceConnectionCache>,
}

impl UplinkProcessor {
    pub fn new(formatters: Arc<FormatterCache>, connections: Arc<DeviceConnectionCache>) -> Self {
        Self {
            formatters,
            connections,
        }
    }

    /// Decode, format and send one uplink. Errors are for the queue's retry.
    pub async fn process(&self, payload: &UplinkPayload) -> Result<()> {
        let context = payload.context();
        let connection = self.connections.get_or_add(&context).await?;
        let formatter = self.formatters.uplink(payload.user_application_id).await?;

        let decoded = DecodedPayload::from_base64(&payload.data);
        if decoded.json.is_none() && !decoded.text.is_empty() {
            debug!(
                device_id = payload.device_id,
                packet_id = payload.packet_id,
                "Uplink payload is not JSON"
            );
        }

        let input = FormatterInput {
            organisation_id: payload.organization_id,
            device_id: payload.device_id,
            device_type: payload.device_type,
            application_id: payload.user_application_id,
            payload_bytes: &decoded.bytes,
            payload_text: &decoded.text,
            payload_json: decoded.json.as_ref(),
        };
        let output = formatter.evaluate_uplink(&input)?;

        let mut telemetry = output.telemetry;
        merge_envelope(&mut telemetry, payload);

        let mut message = TelemetryMessage {
            body: serde_json::to_vec(&Value::Object(telemetry))?,
            properties: output.properties,
        };
        add_standard_properties(&mut message, payload);

        if let Err(e) = connection.send_event(message).await {
            warn!(
                device_id = payload.device_id,
                packet_id = payload.packet_id,
                "Uplink send failed: {}", e
            );
            self.connections.invalidate_connection(&connection).await;
            return Err(e);
        }

        info!(
            device_id = payload.device_id,
            packet_id = payload.packet_id,
            application_id = payload.user_application_id,
            "Uplink sent"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ConnectorError;
    use crate::formatter::{Direction, FormatterKey, FormatterResolver, FormatterSource, SourceText};
    use crate::iot::connection_cache::tests::FakeFactory;
    use crate::iot::ConnectionFactory;
    use async_trait::async_trait;
    use chrono::TimeZone;
    use serde_json::json;
    use std::collections::HashMap;
    use std::sync::atomic::Ordering;

    struct Formatters(HashMap<u16, &'static str>);

    #[async_trait]
    impl FormatterSource for Formatters {
        async fn load(&self, key: FormatterKey) -> Result<Option<SourceText>> {
            Ok(self.0.get(&key.application_id).map(|text| SourceText {
                name: key.file_name("cel"),
                text: text.to_string(),
            }))
        }

        async fn load_default(&self, _direction: Direction) -> Result<Option<SourceText>> {
            Ok(Some(SourceText {
                name: "uplink/default.cel".to_string(),
                text: "null".to_string(),
            }))
        }
    }

    fn payload(data: &str, application_id: u16) -> UplinkPayload {
        UplinkPayload {
            packet_id: 123456,
            device_type: 1,
            device_id: 42,
            user_application_id: application_id,
            organization_id: 65432,
            data: data.to_string(),
            length: 0,
            status: 0,
            swarm_hive_received_at_utc: Utc.with_ymd_and_hms(2024, 3, 1, 10, 0, 0).unwrap(),
            uplink_web_hook_received_at_utc: Utc.with_ymd_and_hms(2024, 3, 1, 10, 0, 5).unwrap(),
            client: "field-client".to_string(),
        }
    }

    fn processor(sources: &[(u16, &'static str)]) -> (UplinkProcessor, Arc<FakeFactory>) {
        let formatters = Arc::new(FormatterCache::new(FormatterResolver::new(Arc::new(
            Formatters(sources.iter().copied().collect()),
        ))));
        let factory = Arc::new(FakeFactory::default());
        let connections = Arc::new(DeviceConnectionCache::new(
            Arc::clone(&factory) as Arc<dyn ConnectionFactory>
        ));
        (UplinkProcessor::new(formatters, connections), factory)
    }

    fn sent_body(factory: &FakeFactory, connection: usize) -> (Value, TelemetryMessage) {
        let opened = factory.opened.lock().unwrap();
        let sent = opened[connection].sent.lock().unwrap();
        let message = sent.last().unwrap().clone();
        (serde_json::from_slice(&message.body).unwrap(), message)
    }

    #[test]
    fn test_queue_record_field_names() {
        let json = serde_json::to_value(payload("AQ==", 1)).unwrap();
        assert_eq!(json["PacketId"], 123456);
        assert_eq!(json["UserApplicationId"], 1);
        assert!(json.get("SwarmHiveReceivedAtUtc").is_some());
        assert!(json.get("UplinkWebHookReceivedAtUtc").is_some());
    }

    #[test]
    fn test_merge_envelope_does_not_overwrite() {
        let mut telemetry = Map::new();
        telemetry.insert("DeviceID".to_string(), json!("custom"));

        merge_envelope(&mut telemetry, &payload("AQ==", 7));
        assert_eq!(telemetry["DeviceID"], json!("custom"));
        assert_eq!(telemetry["packetId"], json!(123456));
        assert_eq!(telemetry["SwarmHiveReceivedAtUtc"], json!("2024-03-01T10:00:00"));
        assert_eq!(telemetry["Client"], json!("field-client"));

        let once = telemetry.clone();
        merge_envelope(&mut telemetry, &payload("AQ==", 7));
        assert_eq!(telemetry, once);
    }

    #[tokio::test]
    async fn test_json_uplink_is_formatted_and_sent() {
        let (processor, factory) = processor(&[(
            5,
            "{'telemetry': {'temperature': payload_json.t}, 'properties': {'iothub-creation-time-utc': '2024-03-01T09:59:00Z'}}",
        )]);

        // {"t":21}
        processor.process(&payload("eyJ0IjoyMX0=", 5)).await.unwrap();

        let (body, message) = sent_body(&factory, 0);
        assert_eq!(body["temperature"], json!(21));
        assert_eq!(body["DeviceID"], json!(42));
        assert_eq!(body["Data"], json!("eyJ0IjoyMX0="));
        assert_eq!(
            message.properties.get("iothub-creation-time-utc").map(String::as_str),
            Some("2024-03-01T09:59:00Z")
        );
        assert_eq!(message.properties.get("DeviceId").map(String::as_str), Some("42"));
        assert_eq!(message.properties.get("Client").map(String::as_str), Some("field-client"));
    }

    #[tokio::test]
    async fn test_formatter_properties_win_over_standard_ones() {
        let (processor, factory) = processor(&[(
            5,
            "{'telemetry': {}, 'properties': {'DeviceType': 'sparrow'}}",
        )]);
        processor.process(&payload("", 5)).await.unwrap();

        let (_, message) = sent_body(&factory, 0);
        assert_eq!(message.properties.get("DeviceType").map(String::as_str), Some("sparrow"));
    }

    #[tokio::test]
    async fn test_empty_payload_still_produces_event() {
        let (processor, factory) = processor(&[(
            6,
            "{'sawText': payload_text, 'sawJson': payload_json == null}",
        )]);
        processor.process(&payload("", 6)).await.unwrap();

        let (body, _) = sent_body(&factory, 0);
        assert_eq!(body["sawText"], json!(""));
        assert_eq!(body["sawJson"], json!(true));
        assert_eq!(body["packetId"], json!(123456));
        assert!(body.get("latitude").is_none());
    }

    #[tokio::test]
    async fn test_binary_payload_uses_default_formatter() {
        let (processor, factory) = processor(&[]);
        processor.process(&payload("//4B", 99)).await.unwrap();

        let (body, _) = sent_body(&factory, 0);
        assert_eq!(body["UserApplicationId"], json!(99));
        assert_eq!(body["Data"], json!("//4B"));
    }

    #[tokio::test]
    async fn test_send_failure_invalidates_connection() {
        let (processor, factory) = processor(&[]);
        processor.process(&payload("", 1)).await.unwrap();

        factory.opened.lock().unwrap()[0]
            .fail_sends
            .store(true, Ordering::SeqCst);
        let err = processor.process(&payload("", 1)).await.unwrap_err();
        assert!(matches!(err, ConnectorError::Transport(_)));
        assert!(factory.opened.lock().unwrap()[0].closed.load(Ordering::SeqCst));

        processor.process(&payload("", 1)).await.unwrap();
        assert_eq!(factory.connects.load(Ordering::SeqCst), 2);
        assert_eq!(factory.opened.lock().unwrap()[1].sent.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_broken_formatter_fails_uplink() {
        let (processor, _) = processor(&[(8, "{'a': ")]);
        let err = processor.process(&payload("", 8)).await.unwrap_err();
        assert!(matches!(err, ConnectorError::FormatterCompile { .. }));
    }
}
