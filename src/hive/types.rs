//! Hive REST API payloads

use serde::{Deserialize, Serialize};

#[derive(Debug, Serialize)]
pub struct LoginRequest<'a> {
    pub username: &'a str,
    pub password: &'a str,
}

#[derive(Debug, Deserialize)]
pub struct LoginResponse {
    pub token: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceSummary {
    pub device_type: u8,
    pub device_id: u32,
    #[serde(default)]
    pub device_name: Option<String>,
}

/// Message queued at the hive for delivery to a device
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserMessage {
    pub organization_id: u32,
    pub device_type: u8,
    pub device_id: u32,
    pub user_application_id: u16,
    /// Base64 encoded device bytes
    pub data: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendReceipt {
    #[serde(default)]
    pub packet_id: Option<u64>,
    pub status: String,
}
