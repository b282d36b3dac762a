//! CEL formatter programs
//!
//! Variables bound for every evaluation:
//!
//! | name              | type              |
//! |-------------------|-------------------|
//! | `organisation_id` | int               |
//! | `device_id`       | int               |
//! | `device_type`     | int               |
//! | `application_id`  | int               |
//! | `payload_text`    | string            |
//! | `payload_json`    | map, list or null |
//! | `payload_bytes`   | bytes             |
//!
//! Downlink formatters also see `properties`, the inbound message properties.
//!
//! A downlink result is bytes, a list of ints in `0..=255`, a string or null
//! (nothing to send). An uplink result is null or a map; a map with a
//! `telemetry` entry may carry a sibling `properties` map of message
//! properties, any other map is the telemetry document itself.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use base64::Engine;
use cel_interpreter::objects::{Key, Map};
use cel_interpreter::{Context, Program, Value as CelValue};
use serde_json::{Map as JsonMap, Value as JsonValue};

use crate::error::{ConnectorError, Result};

use super::{Direction, FormatterInput};

/// A parsed formatter, shared read-only between callers
pub struct CompiledFormatter {
    direction: Direction,
    name: String,
    program: Program,
}

impl std::fmt::Debug for CompiledFormatter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompiledFormatter")
            .field("direction", &self.direction)
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

/// Telemetry document and message properties produced by an uplink formatter
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UplinkOutput {
    pub telemetry: JsonMap<String, JsonValue>,
    pub properties: BTreeMap<String, String>,
}

impl CompiledFormatter {
    pub fn compile(direction: Direction, name: impl Into<String>, source: &str) -> Result<Self> {
        let name = name.into();
        let program =
            Program::compile(source).map_err(|e| ConnectorError::FormatterCompile {
                direction,
                source_name: name.clone(),
                message: e.to_string(),
            })?;

        Ok(Self {
            direction,
            name,
            program,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn evaluate_downlink(
        &self,
        input: &FormatterInput<'_>,
        properties: &HashMap<String, String>,
    ) -> Result<Vec<u8>> {
        let value = self.execute(input, Some(properties))?;
        downlink_bytes(value).map_err(|message| self.evaluation_error(message))
    }

    pub fn evaluate_uplink(&self, input: &FormatterInput<'_>) -> Result<UplinkOutput> {
        let value = self.execute(input, None)?;
        let json = cel_value_to_json(value).map_err(|message| self.evaluation_error(message))?;
        uplink_output(json).map_err(|message| self.evaluation_error(message))
    }

    fn execute(
        &self,
        input: &FormatterInput<'_>,
        properties: Option<&HashMap<String, String>>,
    ) -> Result<CelValue> {
        let mut context = Context::default();
        let ids = [
            ("organisation_id", i64::from(input.organisation_id)),
            ("device_id", i64::from(input.device_id)),
            ("device_type", i64::from(input.device_type)),
            ("application_id", i64::from(input.application_id)),
        ];
        for (name, id) in ids {
            context.add_variable_from_value(name, CelValue::Int(id));
        }
        context.add_variable_from_value(
            "payload_text",
            CelValue::String(Arc::new(input.payload_text.to_string())),
        );
        context.add_variable_from_value(
            "payload_json",
            input
                .payload_json
                .map(|json| json_to_cel_value(json.clone()))
                .unwrap_or(CelValue::Null),
        );
        context.add_variable_from_value(
            "payload_bytes",
            CelValue::Bytes(Arc::new(input.payload_bytes.to_vec())),
        );
        if let Some(properties) = properties {
            let map: HashMap<Key, CelValue> = properties
                .iter()
                .map(|(k, v)| {
                    (
                        Key::String(Arc::new(k.clone())),
                        CelValue::String(Arc::new(v.clone())),
                    )
                })
                .collect();
            let properties = CelValue::Map(Map { map: Arc::new(map) });
            context.add_variable_from_value("properties", properties);
        }

        self.program
            .execute(&context)
            .map_err(|e| self.evaluation_error(e.to_string()))
    }

    fn evaluation_error(&self, message: String) -> ConnectorError {
        ConnectorError::FormatterEvaluation {
            direction: self.direction,
            message: format!("{}: {}", self.name, message),
        }
    }
}

fn downlink_bytes(value: CelValue) -> std::result::Result<Vec<u8>, String> {
    match value {
        CelValue::Null => Ok(Vec::new()),
        CelValue::Bytes(bytes) => Ok(bytes.to_vec()),
        CelValue::String(text) => Ok(text.as_bytes().to_vec()),
        CelValue::List(items) => items
            .iter()
            .map(|item| match item {
                CelValue::Int(i) => u8::try_from(*i).map_err(|_| format!("{} is not a byte", i)),
                CelValue::UInt(u) => u8::try_from(*u).map_err(|_| format!("{} is not a byte", u)),
                other => Err(format!("list element {:?} is not a byte", other)),
            })
            .collect(),
        other => Err(format!("unsupported downlink result {:?}", other)),
    }
}

fn uplink_output(json: JsonValue) -> std::result::Result<UplinkOutput, String> {
    let mut document = match json {
        JsonValue::Null => return Ok(UplinkOutput::default()),
        JsonValue::Object(document) => document,
        other => return Err(format!("uplink result must be a map, got {}", other)),
    };

    if !document.contains_key("telemetry") {
        return Ok(UplinkOutput {
            telemetry: document,
            properties: BTreeMap::new(),
        });
    }

    let telemetry = match document.remove("telemetry") {
        Some(JsonValue::Object(telemetry)) => telemetry,
        Some(JsonValue::Null) | None => JsonMap::new(),
        Some(other) => return Err(format!("telemetry must be a map, got {}", other)),
    };

    let properties = match document.remove("properties") {
        Some(JsonValue::Object(properties)) => properties
            .into_iter()
            .map(|(k, v)| match v {
                JsonValue::String(s) => (k, s),
                other => (k, other.to_string()),
            })
            .collect(),
        Some(JsonValue::Null) | None => BTreeMap::new(),
        Some(other) => return Err(format!("properties must be a map, got {}", other)),
    };

    Ok(UplinkOutput {
        telemetry,
        properties,
    })
}

fn cel_value_to_json(value: CelValue) -> std::result::Result<JsonValue, String> {
    match value {
        CelValue::Null => Ok(JsonValue::Null),
        CelValue::Bool(b) => Ok(JsonValue::Bool(b)),
        CelValue::Int(i) => Ok(JsonValue::Number(i.into())),
        CelValue::UInt(u) => Ok(JsonValue::Number(u.into())),
        CelValue::Float(f) => serde_json::Number::from_f64(f)
            .map(JsonValue::Number)
            .ok_or_else(|| format!("{} has no JSON representation", f)),
        CelValue::String(s) => Ok(JsonValue::String(s.to_string())),
        CelValue::Bytes(b) => Ok(JsonValue::String(
            base64::engine::general_purpose::STANDARD.encode(b.as_slice()),
        )),
        CelValue::List(items) => items
            .iter()
            .cloned()
            .map(cel_value_to_json)
            .collect::<std::result::Result<Vec<_>, _>>()
            .map(JsonValue::Array),
        CelValue::Map(map) => {
            let mut object = JsonMap::new();
            for (key, value) in map.map.iter() {
                let key = match key {
                    Key::String(s) => s.to_string(),
                    Key::Int(i) => i.to_string(),
                    Key::Uint(u) => u.to_string(),
                    Key::Bool(b) => b.to_string(),
                };
                object.insert(key, cel_value_to_json(value.clone())?);
            }
            Ok(JsonValue::Object(object))
        }
        other => Err(format!("{:?} has no JSON representation", other)),
    }
}

fn json_to_cel_value(json: JsonValue) -> CelValue {
    match json {
        JsonValue::Null => CelValue::Null,
        JsonValue::Bool(b) => CelValue::Bool(b),
        JsonValue::Number(n) => {
            if let Some(i) = n.as_i64() {
                CelValue::Int(i)
            } else if let Some(u) = n.as_u64() {
                CelValue::UInt(u)
            } else {
                CelValue::Float(n.as_f64().unwrap_or(f64::NAN))
            }
        }
        JsonValue::String(s) => CelValue::String(Arc::new(s)),
        JsonValue::Array(items) => {
            CelValue::List(Arc::new(items.into_iter().map(json_to_cel_value).collect()))
        }
        JsonValue::Object(object) => {
            let map: HashMap<Key, CelValue> = object
                .into_iter()
                .map(|(k, v)| (Key::String(Arc::new(k)), json_to_cel_value(v)))
                .collect();
            CelValue::Map(Map { map: Arc::new(map) })
        }
    }
}
