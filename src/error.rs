//! Connector error taxonomy
//!
//! Each variant maps to one disposition: validation and formatter failures
//! reject the in-flight message, transport and send failures propagate to
//! the caller's retry path.

use thiserror::Error;

use crate::formatter::Direction;

#[derive(Debug, Error)]
pub enum ConnectorError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("no {direction} formatter for application {application_id} and no default configured")]
    FormatterNotFound {
        direction: Direction,
        application_id: u16,
    },

    #[error("{direction} formatter {source_name} failed to compile: {message}")]
    FormatterCompile {
        direction: Direction,
        source_name: String,
        message: String,
    },

    #[error("{direction} formatter evaluation failed: {message}")]
    FormatterEvaluation { direction: Direction, message: String },

    #[error("device {device_id} provisioning failed: {status}")]
    ProvisioningFailed { device_id: u32, status: String },

    #[error("transport error: {0}")]
    Transport(String),

    #[error("send failed: {0}")]
    Send(String),

    #[error("hive API error: {0}")]
    Hive(String),

    #[error("queue error: {0}")]
    Queue(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
}

impl ConnectorError {
    /// True for failures that leave the inbound message unprocessable,
    /// as opposed to infrastructure failures worth retrying.
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            ConnectorError::Validation(_)
                | ConnectorError::FormatterNotFound { .. }
                | ConnectorError::FormatterCompile { .. }
                | ConnectorError::FormatterEvaluation { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, ConnectorError>;
