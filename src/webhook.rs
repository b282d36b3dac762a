//! Hive uplink webhook: `POST /Uplink`

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Context;
use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::routing::post;
use axum::Router;
use chrono::{DateTime, NaiveDateTime, Utc};
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::error::ConnectorError;
use crate::queue::UplinkQueue;
use crate::uplink::UplinkPayload;

pub const API_KEY_HEADER: &str = "x-api-key";

/// Body the hive posts for each uplink
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UplinkWebPayload {
    pub packet_id: u64,
    pub device_type: u8,
    pub device_id: u32,
    pub user_application_id: u16,
    pub organization_id: u32,
    #[serde(default)]
    pub data: String,
    pub len: i32,
    pub status: i32,
    pub hive_rx_time: String,
}

#[derive(Clone)]
pub struct WebhookState {
    pub api_keys: Arc<HashMap<String, String>>,
    pub queue: UplinkQueue,
    pub payload_length_maximum: u16,
}

impl WebhookState {
    pub fn new(config: &Config, queue: UplinkQueue) -> Self {
        Self {
            api_keys: Arc::new(config.webhook.api_keys.clone()),
            queue,
            payload_length_maximum: config.application.payload_length_maximum,
        }
    }
}

pub fn build_router(state: WebhookState) -> Router {
    Router::new()
        .route("/Uplink", post(uplink))
        .with_state(state)
}

/// Accepts RFC 3339, or a zone-less timestamp taken as UTC.
fn parse_receipt_time(value: &str) -> Option<DateTime<Utc>> {
    if let Ok(timestamp) = DateTime::parse_from_rfc3339(value) {
        return Some(timestamp.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(value, "%Y-%m-%dT%H:%M:%S%.f")
        .ok()
        .map(|naive| naive.and_utc())
}

async fn uplink(
    State(state): State<WebhookState>,
    headers: HeaderMap,
    body: Bytes,
) -> (StatusCode, &'static str) {
    let client = headers
        .get(API_KEY_HEADER)
        .and_then(|v| v.to_str().ok())
        .and_then(|key| state.api_keys.get(key));
    let Some(client) = client else {
        warn!("Uplink rejected: missing or unknown {}", API_KEY_HEADER);
        return (StatusCode::UNAUTHORIZED, "Unauthorized client");
    };
    debug!("Uplink authenticated as {}", client);

    let web: UplinkWebPayload = match serde_json::from_slice(&body) {
        Ok(web) => web,
        Err(e) => {
            warn!(client = %client, "Uplink body unreadable: {}", e);
            return (StatusCode::BAD_REQUEST, "Invalid payload");
        }
    };

    let length = match u16::try_from(web.len) {
        Ok(length) if length <= state.payload_length_maximum => length,
        _ => {
            warn!(
                packet_id = web.packet_id,
                device_id = web.device_id,
                "Uplink length {} outside 0..={}",
                web.len,
                state.payload_length_maximum
            );
            return (StatusCode::BAD_REQUEST, "Invalid len");
        }
    };

    let Some(hive_received) = parse_receipt_time(&web.hive_rx_time) else {
        warn!(
            packet_id = web.packet_id,
            device_id = web.device_id,
            "Uplink hiveRxTime {:?} invalid",
            web.hive_rx_time
        );
        return (StatusCode::BAD_REQUEST, "Invalid hiveRxTime");
    };

    let payload = UplinkPayload {
        packet_id: web.packet_id,
        device_type: web.device_type,
        device_id: web.device_id,
        user_application_id: web.user_application_id,
        organization_id: web.organization_id,
        data: web.data,
        length,
        status: web.status,
        swarm_hive_received_at_utc: hive_received,
        uplink_web_hook_received_at_utc: Utc::now(),
        client: client.clone(),
    };

    let enqueued = serde_json::to_vec(&payload)
        .map_err(ConnectorError::from)
        .and_then(|body| state.queue.enqueue(body));
    match enqueued {
        Ok(()) => {
            info!(
                packet_id = payload.packet_id,
                device_id = payload.device_id,
                client = %payload.client,
                "Uplink queued on {}",
                state.queue.name()
            );
            (StatusCode::OK, "")
        }
        Err(e) => {
            error!(packet_id = payload.packet_id, "Uplink enqueue failed: {}", e);
            (StatusCode::INTERNAL_SERVER_ERROR, "Enqueue failed")
        }
    }
}

/// Serve the webhook until `cancel` fires.
pub async fn serve(
    bind: &str,
    state: WebhookState,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(bind)
        .await
        .with_context(|| format!("Failed to bind webhook on {}", bind))?;
    info!("Uplink webhook listening on {}", listener.local_addr()?);

    axum::serve(listener, build_router(state))
        .with_graceful_shutdown(cancel.cancelled_owned())
        .await
        .context("Webhook server failed")?;
    info!("Uplink webhook stopped");
    Ok(())
}
