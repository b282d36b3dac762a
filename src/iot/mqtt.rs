//! Device connection over the hub's MQTT surface

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use async_trait::async_trait;
use rumqttc::{
    AsyncClient, ConnectReturnCode, Event, EventLoop, MqttOptions, Outgoing, Packet, Publish, QoS,
    Transport,
};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::form_urlencoded;
use uuid::Uuid;

use crate::error::{ConnectorError, Result};

use super::sas::{generate_sas_token, url_encode};
use super::{
    DeviceConnection, DeviceContext, InboundMessage, InboundMessageHandler, TelemetryMessage,
};

const API_VERSION: &str = "2021-04-12";
const MQTT_PORT: u16 = 8883;
const TOKEN_LIFETIME_SECS: i64 = 24 * 60 * 60;
const METHOD_NOT_SUPPORTED: &str =
    r#"{"message":"The connector does not support Direct Methods."}"#;

/// Everything needed to authenticate one device against a hub
#[derive(Debug, Clone)]
pub struct MqttCredentials {
    pub host: String,
    pub device_id: String,
    pub key: String,
    /// Set when `key` belongs to an access policy rather than the device
    pub key_name: Option<String>,
    pub model_id: Option<String>,
}

impl MqttCredentials {
    pub fn username(&self) -> String {
        let mut username = format!(
            "{}/{}/?api-version={}",
            self.host, self.device_id, API_VERSION
        );
        if let Some(model_id) = &self.model_id {
            username.push_str("&model-id=");
            username.push_str(&url_encode(model_id));
        }
        username
    }

    pub fn password(&self, expiry: i64) -> Result<String> {
        generate_sas_token(
            &format!("{}/devices/{}", self.host, self.device_id),
            &self.key,
            self.key_name.as_deref(),
            expiry,
        )
    }
}

pub fn telemetry_topic(device_id: &str, properties: &BTreeMap<String, String>) -> String {
    let mut topic = format!(
        "devices/{}/messages/events/$.ct=application%2Fjson&$.ce=utf-8",
        device_id
    );
    for (key, value) in properties {
        topic.push('&');
        topic.push_str(&url_encode(key));
        topic.push('=');
        topic.push_str(&url_encode(value));
    }
    topic
}

fn cloud_to_device_prefix(device_id: &str) -> String {
    format!("devices/{}/messages/devicebound/", device_id)
}

/// Message properties carried in the tail of a cloud-to-device topic
pub fn cloud_to_device_properties(topic_tail: &str) -> HashMap<String, String> {
    form_urlencoded::parse(topic_tail.as_bytes())
        .into_owned()
        .collect()
}

/// Request id of a direct method call topic, `$iothub/methods/POST/{name}/?$rid={rid}`
pub fn method_request_id(topic: &str) -> Option<(String, String)> {
    let rest = topic.strip_prefix("$iothub/methods/POST/")?;
    let (name, query) = rest.split_once("/?")?;
    let rid = form_urlencoded::parse(query.as_bytes())
        .find(|(k, _)| k == "$rid")
        .map(|(_, v)| v.into_owned())?;
    Some((name.to_string(), rid))
}

type AckSender = oneshot::Sender<Result<()>>;

/// QoS 1 publishes waiting for their PUBACK.
///
/// A send is queued before its publish reaches the client, picks up its
/// packet id when the event loop writes it and resolves on the matching
/// PUBACK. Packet id 0 belongs to QoS 0 publishes and is skipped.
#[derive(Default)]
struct PublishAcks {
    unassigned: VecDeque<AckSender>,
    in_flight: HashMap<u16, AckSender>,
}

impl PublishAcks {
    fn queue(&mut self) -> oneshot::Receiver<Result<()>> {
        let (sender, receiver) = oneshot::channel();
        self.unassigned.push_back(sender);
        receiver
    }

    fn assigned(&mut self, pkid: u16) {
        if pkid == 0 {
            return;
        }
        if let Some(sender) = self.unassigned.pop_front() {
            self.in_flight.insert(pkid, sender);
        }
    }

    fn acknowledged(&mut self, pkid: u16) {
        if let Some(sender) = self.in_flight.remove(&pkid) {
            let _ = sender.send(Ok(()));
        }
    }

    fn fail_all(&mut self, reason: &str) {
        let waiting = self.unassigned.drain(..);
        let in_flight = self.in_flight.drain().map(|(_, sender)| sender);
        for sender in waiting.chain(in_flight) {
            let _ = sender.send(Err(ConnectorError::Transport(reason.to_string())));
        }
    }
}

pub struct MqttDeviceConnection {
    device_id: u32,
    device_name: String,
    client: AsyncClient,
    send_lock: tokio::sync::Mutex<()>,
    ack_timeout: Duration,
    acks: Mutex<PublishAcks>,
    pending: Mutex<HashMap<String, Publish>>,
    broken: AtomicBool,
    cancel: CancellationToken,
}

impl MqttDeviceConnection {
    /// Connect, subscribe and start dispatching inbound messages to `handler`.
    pub async fn open(
        credentials: MqttCredentials,
        context: DeviceContext,
        handler: Arc<dyn InboundMessageHandler>,
        timeout: Duration,
    ) -> Result<Arc<Self>> {
        let expiry = chrono::Utc::now().timestamp() + TOKEN_LIFETIME_SECS;
        let mut options = MqttOptions::new(
            credentials.device_id.clone(),
            credentials.host.clone(),
            MQTT_PORT,
        );
        options.set_credentials(credentials.username(), credentials.password(expiry)?);
        options.set_transport(Transport::tls_with_default_config());
        options.set_keep_alive(Duration::from_secs(60));
        options.set_clean_session(false);
        options.set_manual_acks(true);

        let (client, mut event_loop) = AsyncClient::new(options, 64);

        info!(device_id = context.device_id, "Connecting to {}", credentials.host);
        tokio::time::timeout(timeout, Self::wait_for_connack(&mut event_loop))
            .await
            .map_err(|_| {
                ConnectorError::Transport(format!(
                    "no CONNACK from {} within {:?}",
                    credentials.host, timeout
                ))
            })??;

        let device_name = credentials.device_id.clone();
        for topic in [
            format!("{}#", cloud_to_device_prefix(&device_name)),
            "$iothub/methods/POST/#".to_string(),
        ] {
            client
                .subscribe(topic.as_str(), QoS::AtLeastOnce)
                .await
                .map_err(|e| {
                    ConnectorError::Transport(format!("subscribe {} failed: {}", topic, e))
                })?;
        }

        let connection = Arc::new(Self::new(context.device_id, device_name, client, timeout));

        tokio::spawn(Self::run_event_loop(
            Arc::downgrade(&connection),
            event_loop,
            context,
            handler,
            connection.cancel.clone(),
        ));

        info!(device_id = context.device_id, "Device connection open");
        Ok(connection)
    }

    fn new(
        device_id: u32,
        device_name: String,
        client: AsyncClient,
        ack_timeout: Duration,
    ) -> Self {
        Self {
            device_id,
            device_name,
            client,
            send_lock: tokio::sync::Mutex::new(()),
            ack_timeout,
            acks: Mutex::new(PublishAcks::default()),
            pending: Mutex::new(HashMap::new()),
            broken: AtomicBool::new(false),
            cancel: CancellationToken::new(),
        }
    }

    async fn wait_for_connack(event_loop: &mut EventLoop) -> Result<()> {
        loop {
            match event_loop.poll().await {
                Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                    if ack.code == ConnectReturnCode::Success {
                        return Ok(());
                    }
                    return Err(ConnectorError::Transport(format!(
                        "connection refused: {:?}",
                        ack.code
                    )));
                }
                Ok(_) => {}
                Err(e) => return Err(ConnectorError::Transport(e.to_string())),
            }
        }
    }

    async fn run_event_loop(
        connection: Weak<Self>,
        mut event_loop: EventLoop,
        context: DeviceContext,
        handler: Arc<dyn InboundMessageHandler>,
        cancel: CancellationToken,
    ) {
        let reason = loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!(device_id = context.device_id, "Event loop cancelled");
                    break "connection closed".to_string();
                }
                result = event_loop.poll() => {
                    let Some(connection) = connection.upgrade() else {
                        return;
                    };
                    match result {
                        Ok(Event::Incoming(Packet::Publish(publish))) => {
                            connection.dispatch(publish, context, Arc::clone(&handler));
                        }
                        Ok(Event::Outgoing(Outgoing::Publish(pkid))) => {
                            connection.lock_acks().assigned(pkid);
                        }
                        Ok(Event::Incoming(Packet::PubAck(ack))) => {
                            connection.lock_acks().acknowledged(ack.pkid);
                        }
                        Ok(Event::Incoming(Packet::Disconnect)) => {
                            warn!(device_id = context.device_id, "Hub sent disconnect");
                            break "hub sent disconnect".to_string();
                        }
                        Ok(event) => {
                            debug!(device_id = context.device_id, "MQTT event: {:?}", event);
                        }
                        Err(e) => {
                            warn!(
                                device_id = context.device_id,
                                error = %e,
                                "MQTT event loop error"
                            );
                            break format!("link lost: {}", e);
                        }
                    }
                }
            }
        };

        if let Some(connection) = connection.upgrade() {
            connection.mark_broken(&reason);
        }
    }

    /// Refuse further sends and fail every send still waiting for a PUBACK.
    fn mark_broken(&self, reason: &str) {
        self.broken.store(true, Ordering::Release);
        self.lock_acks().fail_all(reason);
    }

    fn broken_error(&self) -> ConnectorError {
        ConnectorError::Transport(format!("connection for device {} is broken", self.device_id))
    }

    /// Runs on the event loop task, so it must not await the client.
    fn dispatch(
        self: Arc<Self>,
        publish: Publish,
        context: DeviceContext,
        handler: Arc<dyn InboundMessageHandler>,
    ) {
        if let Some((method, rid)) = method_request_id(&publish.topic) {
            warn!(device_id = self.device_id, method = %method, "Direct method not supported");
            let _ = self.client.try_ack(&publish);
            let topic = format!("$iothub/methods/res/400/?$rid={}", rid);
            if let Err(e) = self.client.try_publish(
                topic,
                QoS::AtMostOnce,
                false,
                METHOD_NOT_SUPPORTED.as_bytes().to_vec(),
            ) {
                warn!(device_id = self.device_id, "Method response failed: {}", e);
            }
            return;
        }

        let Some(tail) = publish
            .topic
            .strip_prefix(cloud_to_device_prefix(&self.device_name).as_str())
            .map(str::to_string)
        else {
            debug!(device_id = self.device_id, topic = %publish.topic, "Ignoring publish");
            let _ = self.client.try_ack(&publish);
            return;
        };

        let lock_token = Uuid::new_v4().to_string();
        let message = InboundMessage {
            lock_token: lock_token.clone(),
            payload: publish.payload.to_vec(),
            properties: cloud_to_device_properties(&tail),
        };
        self.lock_pending().insert(lock_token, publish);

        tokio::spawn(async move {
            handler.handle(&*self, &context, message).await;
        });
    }

    fn lock_acks(&self) -> std::sync::MutexGuard<'_, PublishAcks> {
        self.acks
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn lock_pending(&self) -> std::sync::MutexGuard<'_, HashMap<String, Publish>> {
        self.pending
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    async fn settle(&self, lock_token: &str) -> Result<()> {
        let publish = self.lock_pending().remove(lock_token).ok_or_else(|| {
            ConnectorError::Transport(format!("unknown lock token {}", lock_token))
        })?;
        self.client
            .ack(&publish)
            .await
            .map_err(|e| ConnectorError::Transport(e.to_string()))
    }
}

#[async_trait]
impl DeviceConnection for MqttDeviceConnection {
    fn device_id(&self) -> u32 {
        self.device_id
    }

    /// Publish at QoS 1 and wait for the hub's PUBACK.
    async fn send_event(&self, message: TelemetryMessage) -> Result<()> {
        let _guard = self.send_lock.lock().await;

        let acked = {
            let mut acks = self.lock_acks();
            if self.broken.load(Ordering::Acquire) {
                return Err(self.broken_error());
            }
            acks.queue()
        };

        let published = self
            .client
            .publish(
                telemetry_topic(&self.device_name, &message.properties),
                QoS::AtLeastOnce,
                false,
                message.body,
            )
            .await;
        if let Err(e) = published {
            self.lock_acks().unassigned.pop_back();
            return Err(ConnectorError::Transport(e.to_string()));
        }

        match tokio::time::timeout(self.ack_timeout, acked).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(self.broken_error()),
            Err(_) => {
                self.mark_broken("PUBACK timed out");
                Err(ConnectorError::Transport(format!(
                    "no PUBACK for device {} within {:?}",
                    self.device_id, self.ack_timeout
                )))
            }
        }
    }

    async fn complete(&self, lock_token: &str) -> Result<()> {
        self.settle(lock_token).await
    }

    async fn reject(&self, lock_token: &str) -> Result<()> {
        // MQTT has no reject, the message is settled and dropped
        warn!(device_id = self.device_id, lock_token, "Rejecting cloud-to-device message");
        self.settle(lock_token).await
    }

    async fn close(&self) {
        let _ = self.client.try_disconnect();
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn credentials(model_id: Option<&str>, key_name: Option<&str>) -> MqttCredentials {
        MqttCredentials {
            host: "hub.example.net".to_string(),
            device_id: "42".to_string(),
            key: "cG9saWN5LWtleQ==".to_string(),
            key_name: key_name.map(str::to_string),
            model_id: model_id.map(str::to_string),
        }
    }

    #[test]
    fn test_username() {
        assert_eq!(
            credentials(None, None).username(),
            "hub.example.net/42/?api-version=2021-04-12"
        );
        assert_eq!(
            credentials(Some("dtmi:example:light;1"), None).username(),
            "hub.example.net/42/?api-version=2021-04-12&model-id=dtmi%3Aexample%3Alight%3B1"
        );
    }

    #[test]
    fn test_password_is_device_scoped_sas() {
        let password = credentials(None, Some("device")).password(1_700_000_000).unwrap();
        assert!(password
            .starts_with("SharedAccessSignature sr=hub.example.net%2Fdevices%2F42&sig="));
        assert!(password.ends_with("&se=1700000000&skn=device"));
    }

    #[test]
    fn test_telemetry_topic_carries_properties() {
        let mut properties = BTreeMap::new();
        properties.insert("DeviceId".to_string(), "42".to_string());
        properties.insert(
            "iothub-creation-time-utc".to_string(),
            "2024-01-01T00:00:00Z".to_string(),
        );

        assert_eq!(
            telemetry_topic("42", &properties),
            "devices/42/messages/events/$.ct=application%2Fjson&$.ce=utf-8\
             &DeviceId=42&iothub-creation-time-utc=2024-01-01T00%3A00%3A00Z"
        );
    }

    #[test]
    fn test_cloud_to_device_properties() {
        let properties = cloud_to_device_properties(
            "%24.mid=abc&%24.to=%2Fdevices%2F42%2Fmessages%2FdeviceBound&UserApplicationId=10",
        );
        assert_eq!(properties.get("UserApplicationId").map(String::as_str), Some("10"));
        assert_eq!(properties.get("$.mid").map(String::as_str), Some("abc"));
        assert!(cloud_to_device_properties("").is_empty());
    }

    /// Connection whose client is not driven by an event loop, so the test
    /// plays the loop's part.
    fn unpolled_connection(ack_timeout: Duration) -> (Arc<MqttDeviceConnection>, EventLoop) {
        let (client, event_loop) = AsyncClient::new(MqttOptions::new("42", "localhost", 1883), 8);
        let connection = MqttDeviceConnection::new(42, "42".to_string(), client, ack_timeout);
        (Arc::new(connection), event_loop)
    }

    async fn send_in_background(
        connection: &Arc<MqttDeviceConnection>,
    ) -> tokio::task::JoinHandle<Result<()>> {
        let sending = {
            let connection = Arc::clone(connection);
            tokio::spawn(async move { connection.send_event(TelemetryMessage::default()).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        sending
    }

    #[tokio::test]
    async fn test_send_waits_for_puback() {
        let (connection, _event_loop) = unpolled_connection(Duration::from_secs(5));
        let sending = send_in_background(&connection).await;
        assert!(!sending.is_finished());

        connection.lock_acks().assigned(0);
        connection.lock_acks().assigned(7);
        connection.lock_acks().acknowledged(3);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!sending.is_finished());

        connection.lock_acks().acknowledged(7);
        tokio_test::assert_ok!(sending.await.unwrap());
    }

    #[tokio::test]
    async fn test_lost_link_fails_pending_send() {
        let (connection, _event_loop) = unpolled_connection(Duration::from_secs(5));
        let sending = send_in_background(&connection).await;
        connection.lock_acks().assigned(1);

        connection.mark_broken("link lost");
        assert!(matches!(sending.await.unwrap(), Err(ConnectorError::Transport(_))));

        let again = connection.send_event(TelemetryMessage::default()).await;
        assert!(matches!(again, Err(ConnectorError::Transport(_))));
        assert!(connection.lock_acks().unassigned.is_empty());
    }

    #[tokio::test]
    async fn test_missing_puback_times_out() {
        let (connection, _event_loop) = unpolled_connection(Duration::from_millis(50));

        let result = connection.send_event(TelemetryMessage::default()).await;
        assert!(matches!(result, Err(ConnectorError::Transport(_))));
        assert!(connection.broken.load(Ordering::Acquire));
    }

    #[tokio::test]
    async fn test_send_after_event_loop_gone_fails() {
        let (connection, event_loop) = unpolled_connection(Duration::from_secs(5));
        drop(event_loop);

        let result = connection.send_event(TelemetryMessage::default()).await;
        assert!(matches!(result, Err(ConnectorError::Transport(_))));
        assert!(connection.lock_acks().unassigned.is_empty());
    }

    #[tokio::test]
    async fn test_close_does_not_wait_on_full_request_channel() {
        let (connection, _event_loop) = unpolled_connection(Duration::from_secs(5));
        for _ in 0..8 {
            connection
                .client
                .try_publish("devices/42/events", QoS::AtMostOnce, false, Vec::<u8>::new())
                .unwrap();
        }

        tokio::time::timeout(Duration::from_secs(1), connection.close())
            .await
            .unwrap();
        assert!(connection.cancel.is_cancelled());
    }

    #[test]
    fn test_method_request_id() {
        assert_eq!(
            method_request_id("$iothub/methods/POST/setLight/?$rid=7"),
            Some(("setLight".to_string(), "7".to_string()))
        );
        assert_eq!(method_request_id("devices/42/messages/devicebound/"), None);
    }
}
