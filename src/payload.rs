//! Best-effort payload decoding shared by both pipelines

use base64::Engine;
use serde_json::Value;

/// Raw payload plus whatever text and JSON could be recovered from it
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DecodedPayload {
    pub bytes: Vec<u8>,
    /// Empty when the bytes are not UTF-8
    pub text: String,
    /// `None` when the text is not JSON
    pub json: Option<Value>,
}

impl DecodedPayload {
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        let text = try_utf8(&bytes).unwrap_or_default();
        let json = try_parse_json(&text);
        Self { bytes, text, json }
    }

    /// Decode a base64 payload; undecodable input yields an empty payload.
    pub fn from_base64(data: &str) -> Self {
        Self::from_bytes(try_base64(data).unwrap_or_default())
    }
}

pub fn try_base64(data: &str) -> Option<Vec<u8>> {
    base64::engine::general_purpose::STANDARD.decode(data.trim()).ok()
}

pub fn try_utf8(bytes: &[u8]) -> Option<String> {
    std::str::from_utf8(bytes).ok().map(str::to_string)
}

pub fn try_parse_json(text: &str) -> Option<Value> {
    if text.trim().is_empty() {
        return None;
    }
    serde_json::from_str(text).ok()
}

/// True for text that is a JSON object or array.
///
/// Bare JSON scalars such as `42` or `"on"` do not count; those are wrapped
/// by the command handler before reaching a formatter.
pub fn is_json_document(text: &str) -> bool {
    let text = text.trim();
    let bracketed = (text.starts_with('{') && text.ends_with('}'))
        || (text.starts_with('[') && text.ends_with(']'));
    bracketed && serde_json::from_str::<Value>(text).is_ok()
}
