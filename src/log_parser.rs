//! Normalization of raw container log lines into structured records

use crate::container::ContainerDescriptor;
use crate::telemetry::{LogLevel, TelemetryRecord};
use serde_json::{Map, Value};

/// Field holding the engine-supplied timestamp prefix
pub const TIMESTAMP_FIELD: &str = "docker_timestamp";

/// Field recording why a line could not be decoded
pub const PARSE_ERROR_FIELD: &str = "parse_error";

/// Result of normalizing one raw line
#[derive(Clone, Debug, PartialEq)]
pub struct ParsedLine {
    pub message: String,
    pub fields: Map<String, Value>,
}

impl ParsedLine {
    pub fn timestamp(&self) -> Option<&str> {
        self.fields.get(TIMESTAMP_FIELD).and_then(Value::as_str)
    }

    /// Severity declared by a structured body, Info otherwise
    pub fn level(&self) -> LogLevel {
        ["level", "severity", "log_level"]
            .iter()
            .find_map(|key| self.fields.get(*key).and_then(Value::as_str))
            .map(LogLevel::from)
            .unwrap_or(LogLevel::Info)
    }
}

/// Parse one line of engine output. Never fails.
pub fn parse_docker_log(raw: &[u8]) -> ParsedLine {
    let text = match std::str::from_utf8(raw) {
        Ok(text) => text.trim_end(),
        Err(e) => {
            let mut fields = Map::new();
            fields.insert(PARSE_ERROR_FIELD.to_string(), Value::String(e.to_string()));
            return ParsedLine {
                message: String::from_utf8_lossy(raw).trim_end().to_string(),
                fields,
            };
        }
    };

    let (timestamp, body) = split_timestamp(text);
    parse_body(body, timestamp)
}

/// Split `2025-05-23T20:03:59.691483928Z body` into its two halves
fn split_timestamp(text: &str) -> (Option<&str>, &str) {
    let bytes = text.as_bytes();
    let looks_like_timestamp = bytes.len() > 30
        && bytes[4] == b'-'
        && (bytes[10] == b'T' || bytes[19] == b'T');

    if !looks_like_timestamp {
        return (None, text);
    }

    match text.split_once(' ') {
        Some((timestamp, body)) => (Some(timestamp), body),
        None => (None, text),
    }
}

fn parse_body(body: &str, timestamp: Option<&str>) -> ParsedLine {
    let mut fields = match serde_json::from_str::<Value>(body) {
        Ok(Value::Object(map)) => map,
        _ => {
            return ParsedLine {
                message: body.to_string(),
                fields: timestamp_fields(timestamp),
            };
        }
    };

    let message = match fields.remove("message") {
        Some(Value::String(message)) => message,
        Some(other) => other.to_string(),
        None => body.to_string(),
    };

    fields.extend(timestamp_fields(timestamp));
    ParsedLine { message, fields }
}

fn timestamp_fields(timestamp: Option<&str>) -> Map<String, Value> {
    let mut fields = Map::new();
    if let Some(ts) = timestamp {
        fields.insert(TIMESTAMP_FIELD.to_string(), Value::String(ts.to_string()));
    }
    fields
}

/// One container log line ready to be forwarded
#[derive(Clone, Debug, PartialEq)]
pub struct LogRecord {
    pub message: String,
    pub fields: Map<String, Value>,
    pub level: LogLevel,
    pub container_id: String,
    pub container_name: String,
    pub container_image: String,
    pub timestamp: Option<String>,
}

impl LogRecord {
    pub fn from_line(raw: &[u8], container: &ContainerDescriptor) -> Self {
        let parsed = parse_docker_log(raw);
        let level = parsed.level();
        let timestamp = parsed.timestamp().map(String::from);

        Self {
            message: parsed.message,
            fields: parsed.fields,
            level,
            container_id: container.short_id().to_string(),
            container_name: container.name.clone(),
            container_image: container.image_or_unknown().to_string(),
            timestamp,
        }
    }

    /// Container metadata first, parsed fields layered on top
    pub fn into_telemetry(self) -> TelemetryRecord {
        TelemetryRecord::new(self.level, self.message)
            .with_attribute("container_id", self.container_id)
            .with_attribute("container_name", self.container_name)
            .with_attribute("container_image", self.container_image)
            .with_attributes(self.fields)
    }
}
