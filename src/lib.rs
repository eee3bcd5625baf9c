//! Docker Log Forwarder Library
//!
//! Discovers containers on a Docker engine, streams their logs, normalizes
//! each line into a structured record and forwards it to a telemetry gateway.

pub mod buffer;
pub mod config;
pub mod container;
pub mod discovery;
pub mod engine;
pub mod errors;
pub mod events;
pub mod forwarder;
pub mod log_parser;
pub mod registry;
pub mod supervisor;
pub mod telemetry;
pub mod transport;
pub mod worker;

#[cfg(test)]
mod testing;

pub use config::Config;
pub use container::{ContainerDescriptor, ContainerStatus, EventKind, FilterPolicy, LifecycleEvent};
pub use engine::{ContainerEngine, DockerEngine};
pub use errors::{ForwarderError, Result};
pub use forwarder::{LogForwarder, ShutdownHandle};
pub use telemetry::{RecordBatch, TelemetryRecord, TelemetrySink};
