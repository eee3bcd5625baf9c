//! Error types for the log forwarder

use std::fmt;
use std::time::Duration;

pub type Result<T> = std::result::Result<T, ForwarderError>;

#[derive(Debug)]
pub enum ForwarderError {
    /// Container engine request failed
    Engine(bollard::errors::Error),

    /// HTTP request failed
    Http(reqwest::Error),

    /// JSON serialization/deserialization failed
    Json(serde_json::Error),

    /// Configuration error
    Config(String),

    /// Lifecycle event subscription failed or closed
    Subscription(String),

    /// Container log stream failed or closed unexpectedly
    Stream(String),

    /// Telemetry transport error
    Transport(String),

    /// Event handler did not finish in time
    DispatchTimeout(Duration),

    /// Generic error with message
    Other(String),
}

impl fmt::Display for ForwarderError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ForwarderError::Engine(err) => write!(f, "Container engine error: {}", err),
            ForwarderError::Http(err) => write!(f, "HTTP error: {}", err),
            ForwarderError::Json(err) => write!(f, "JSON error: {}", err),
            ForwarderError::Config(msg) => write!(f, "Configuration error: {}", msg),
            ForwarderError::Subscription(msg) => write!(f, "Event subscription error: {}", msg),
            ForwarderError::Stream(msg) => write!(f, "Log stream error: {}", msg),
            ForwarderError::Transport(msg) => write!(f, "Transport error: {}", msg),
            ForwarderError::DispatchTimeout(limit) => {
                write!(f, "Event dispatch timed out after {}s", limit.as_secs())
            }
            ForwarderError::Other(msg) => write!(f, "Error: {}", msg),
        }
    }
}

impl std::error::Error for ForwarderError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ForwarderError::Engine(err) => Some(err),
            ForwarderError::Http(err) => Some(err),
            ForwarderError::Json(err) => Some(err),
            _ => None,
        }
    }
}

impl From<bollard::errors::Error> for ForwarderError {
    fn from(err: bollard::errors::Error) -> Self {
        ForwarderError::Engine(err)
    }
}

impl From<reqwest::Error> for ForwarderError {
    fn from(err: reqwest::Error) -> Self {
        ForwarderError::Http(err)
    }
}

impl From<serde_json::Error> for ForwarderError {
    fn from(err: serde_json::Error) -> Self {
        ForwarderError::Json(err)
    }
}
