//! Payload formatters
//!
//! A formatter is a CEL expression selected by application id. Uplink
//! formatters turn device bytes into a telemetry document; downlink
//! formatters turn a cloud command into device bytes.

mod cache;
mod cel;
mod resolver;
mod source;

use std::fmt;

pub use cache::FormatterCache;
pub use cel::{CompiledFormatter, UplinkOutput};
pub use resolver::FormatterResolver;
pub use source::{BlobStoreSource, FileSystemSource, FormatterSource, SourceText};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    Uplink,
    Downlink,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Uplink => "uplink",
            Direction::Downlink => "downlink",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FormatterKey {
    pub direction: Direction,
    pub application_id: u16,
}

impl FormatterKey {
    pub fn new(direction: Direction, application_id: u16) -> Self {
        Self {
            direction,
            application_id,
        }
    }

    /// Storage name of the application specific source, e.g. `42.cel`
    pub fn file_name(&self, extension: &str) -> String {
        format!("{}.{}", self.application_id, extension)
    }
}

/// Identifying fields and the decoded payload handed to a formatter
#[derive(Debug, Clone, Copy)]
pub struct FormatterInput<'a> {
    pub organisation_id: u32,
    pub device_id: u32,
    pub device_type: u8,
    pub application_id: u16,
    pub payload_bytes: &'a [u8],
    pub payload_text: &'a str,
    pub payload_json: Option<&'a serde_json::Value>,
}
