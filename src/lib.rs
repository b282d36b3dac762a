//! Relay between a satellite hive and an IoT Hub / IoT Central application.
//!
//! Uplinks arrive on the webhook, are queued, formatted and sent as device
//! telemetry. Cloud-to-device messages are formatted and forwarded to the
//! hive's send API.

pub mod cache;
pub mod config;
pub mod downlink;
pub mod error;
pub mod formatter;
pub mod hive;
pub mod iot;
pub mod payload;
pub mod queue;
pub mod startup;
pub mod uplink;
pub mod webhook;

pub use error::{ConnectorError, Result};
