//! Telemetry records, batches and the sink abstraction

use crate::errors::Result;
use async_trait::async_trait;
use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// Destination for structured records.
///
/// Implementations must be safe to call from many workers at once.
#[async_trait]
pub trait TelemetrySink: Send + Sync {
    async fn emit(&self, record: TelemetryRecord) -> Result<()>;

    /// Push anything held locally to the remote end
    async fn flush(&self) -> Result<()> {
        Ok(())
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct TelemetryRecord {
    pub timestamp: String,
    pub level: LogLevel,
    pub message: String,
    pub attributes: Map<String, Value>,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
    Fatal,
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LogLevel::Trace => write!(f, "TRACE"),
            LogLevel::Debug => write!(f, "DEBUG"),
            LogLevel::Info => write!(f, "INFO"),
            LogLevel::Warn => write!(f, "WARN"),
            LogLevel::Error => write!(f, "ERROR"),
            LogLevel::Fatal => write!(f, "FATAL"),
        }
    }
}

impl From<&str> for LogLevel {
    fn from(s: &str) -> Self {
        match s.to_uppercase().as_str() {
            "TRACE" | "VERBOSE" => LogLevel::Trace,
            "DEBUG" => LogLevel::Debug,
            "INFO" | "INFORMATION" => LogLevel::Info,
            "WARN" | "WARNING" => LogLevel::Warn,
            "ERROR" | "ERR" => LogLevel::Error,
            "FATAL" | "CRITICAL" => LogLevel::Fatal,
            _ => LogLevel::Info,
        }
    }
}

impl TelemetryRecord {
    pub fn new(level: LogLevel, message: impl Into<String>) -> Self {
        Self {
            timestamp: current_timestamp(),
            level,
            message: message.into(),
            attributes: Map::new(),
        }
    }

    pub fn info(message: impl Into<String>) -> Self {
        Self::new(LogLevel::Info, message)
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::new(LogLevel::Error, message)
    }

    pub fn with_attribute(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.attributes.insert(key.to_string(), value.into());
        self
    }

    pub fn with_attributes(mut self, attributes: Map<String, Value>) -> Self {
        self.attributes.extend(attributes);
        self
    }

    pub fn attribute_str(&self, key: &str) -> Option<&str> {
        self.attributes.get(key).and_then(Value::as_str)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RecordBatch {
    pub records: Vec<TelemetryRecord>,
    pub metadata: BatchMetadata,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BatchMetadata {
    pub forwarder_id: String,
    pub batch_id: String,
    pub service_name: String,
    pub timestamp: String,
    pub version: String,
}

impl RecordBatch {
    pub fn new(records: Vec<TelemetryRecord>, forwarder_id: String, service_name: String) -> Self {
        Self {
            records,
            metadata: BatchMetadata {
                forwarder_id,
                batch_id: Uuid::new_v4().to_string(),
                service_name,
                timestamp: current_timestamp(),
                version: env!("CARGO_PKG_VERSION").to_string(),
            },
        }
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }
}

/// Current time as an RFC3339 string
pub fn current_timestamp() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_level_from_str() {
        assert_eq!(LogLevel::from("INFO"), LogLevel::Info);
        assert_eq!(LogLevel::from("error"), LogLevel::Error);
        assert_eq!(LogLevel::from("warning"), LogLevel::Warn);
        assert_eq!(LogLevel::from("unknown"), LogLevel::Info);
    }

    #[test]
    fn test_record_attributes() {
        let record = TelemetryRecord::info("Container start: web")
            .with_attribute("event_type", "container_lifecycle")
            .with_attribute("container_name", "web");

        assert_eq!(record.level, LogLevel::Info);
        assert_eq!(record.attribute_str("container_name"), Some("web"));
        assert!(record.timestamp.ends_with('Z'));
    }

    #[test]
    fn test_batch_creation() {
        let batch = RecordBatch::new(
            vec![TelemetryRecord::info("hello")],
            "forwarder-1".to_string(),
            "docker-log-forwarder".to_string(),
        );

        assert_eq!(batch.len(), 1);
        assert!(!batch.is_empty());
        assert_eq!(batch.metadata.service_name, "docker-log-forwarder");
        assert_eq!(batch.metadata.version, env!("CARGO_PKG_VERSION"));
    }
}
