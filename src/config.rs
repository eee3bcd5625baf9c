//! Configuration management for the log forwarder

use crate::container::FilterPolicy;
use clap::Parser;
use std::time::Duration;

pub const DEFAULT_GATEWAY_URL: &str = "http://telemetry-gateway:9090";
pub const DEFAULT_SERVICE_NAME: &str = "docker-log-forwarder";
pub const DEFAULT_DOCKER_HOST: &str = "/var/run/docker.sock";
pub const DEFAULT_EXCLUDE_CONTAINERS: &str = "docker-log-forwarder";

#[derive(Debug, Clone, Parser)]
#[command(name = "docker_log_forwarder", version, about = "Forward container logs to a telemetry gateway")]
pub struct Config {
    /// URL of the telemetry gateway
    #[arg(long, env = "GATEWAY_URL", default_value = DEFAULT_GATEWAY_URL)]
    pub gateway_url: String,

    /// Bearer token presented to the telemetry gateway
    #[arg(long, env = "GATEWAY_TOKEN", hide_env_values = true)]
    pub gateway_token: String,

    /// Service name attached to every forwarded batch
    #[arg(long, env = "SERVICE_NAME", default_value = DEFAULT_SERVICE_NAME)]
    pub service_name: String,

    /// Docker socket path, or an http:// / tcp:// address
    #[arg(long, env = "DOCKER_HOST_ADDR", default_value = DEFAULT_DOCKER_HOST)]
    pub docker_host: String,

    /// Comma-separated container names to exclude from log collection
    #[arg(long, env = "EXCLUDE_CONTAINERS", default_value = DEFAULT_EXCLUDE_CONTAINERS)]
    pub exclude_containers: String,

    /// Include logs from stopped containers
    #[arg(long, env = "INCLUDE_STOPPED", default_value_t = false, action = clap::ArgAction::Set)]
    pub include_stopped: bool,

    /// Log filter used when RUST_LOG is not set
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Records per batch sent to the gateway
    #[arg(long, env = "BATCH_SIZE", default_value_t = 100)]
    pub batch_size: usize,

    /// Seconds between buffer flushes
    #[arg(long = "flush-interval", env = "FLUSH_INTERVAL_SECONDS", default_value_t = 5)]
    pub flush_interval_secs: u64,

    /// Maximum records held in memory before the oldest are dropped
    #[arg(long, env = "MAX_BUFFER_SIZE", default_value_t = 10000)]
    pub max_buffer_size: usize,

    /// HTTP timeout for gateway requests, in seconds
    #[arg(long = "http-timeout", env = "HTTP_TIMEOUT_SECONDS", default_value_t = 10)]
    pub http_timeout_secs: u64,

    /// Maximum retry attempts for failed batch transmissions
    #[arg(long, env = "MAX_RETRIES", default_value_t = 3)]
    pub max_retries: u32,

    /// Base backoff between batch transmission retries
    #[arg(long, env = "RETRY_BACKOFF_MS", default_value_t = 1000)]
    pub retry_backoff_ms: u64,

    /// Lines of history replayed when a log stream is opened
    #[arg(long, env = "TAIL_LINES", default_value_t = 100)]
    pub tail_lines: usize,

    /// Consecutive stream failures before a container is abandoned
    #[arg(long, env = "STREAM_MAX_RETRIES", default_value_t = 3)]
    pub stream_max_retries: u32,

    /// Base delay of the per-container exponential backoff
    #[arg(long, env = "STREAM_BACKOFF_MS", default_value_t = 1000)]
    pub stream_backoff_ms: u64,

    /// Fixed delay before re-opening the lifecycle event subscription
    #[arg(long = "event-reconnect", env = "EVENT_RECONNECT_SECONDS", default_value_t = 5)]
    pub event_reconnect_secs: u64,

    /// Upper bound on handling a single lifecycle event
    #[arg(long = "event-dispatch-timeout", env = "EVENT_DISPATCH_TIMEOUT_SECONDS", default_value_t = 10)]
    pub event_dispatch_timeout_secs: u64,

    /// Bound on the shutdown drain; unbounded when unset
    #[arg(long = "drain-timeout", env = "DRAIN_TIMEOUT_SECONDS")]
    pub drain_timeout_secs: Option<u64>,
}

impl Config {
    /// Names excluded from monitoring, trimmed, empties removed
    pub fn excluded_names(&self) -> Vec<String> {
        self.exclude_containers
            .split(',')
            .map(|s| s.trim())
            .filter(|s| !s.is_empty())
            .map(String::from)
            .collect()
    }

    pub fn filter_policy(&self) -> FilterPolicy {
        FilterPolicy::new(self.excluded_names(), self.include_stopped)
    }

    pub fn flush_interval(&self) -> Duration {
        Duration::from_secs(self.flush_interval_secs)
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs)
    }

    pub fn stream_backoff(&self) -> Duration {
        Duration::from_millis(self.stream_backoff_ms)
    }

    pub fn event_reconnect_delay(&self) -> Duration {
        Duration::from_secs(self.event_reconnect_secs)
    }

    pub fn event_dispatch_timeout(&self) -> Duration {
        Duration::from_secs(self.event_dispatch_timeout_secs)
    }

    pub fn drain_timeout(&self) -> Option<Duration> {
        self.drain_timeout_secs.map(Duration::from_secs)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.gateway_url.is_empty() {
            return Err("gateway_url cannot be empty".to_string());
        }

        if self.gateway_token.is_empty() {
            return Err("gateway_token cannot be empty".to_string());
        }

        if self.service_name.is_empty() {
            return Err("service_name cannot be empty".to_string());
        }

        if self.docker_host.is_empty() {
            return Err("docker_host cannot be empty".to_string());
        }

        if self.batch_size == 0 {
            return Err("batch_size must be greater than 0".to_string());
        }

        if self.max_buffer_size == 0 {
            return Err("max_buffer_size must be greater than 0".to_string());
        }

        if self.flush_interval_secs == 0 {
            return Err("flush_interval must be greater than 0".to_string());
        }

        if self.event_reconnect_secs == 0 {
            return Err("event_reconnect must be greater than 0".to_string());
        }

        if self.event_dispatch_timeout_secs == 0 {
            return Err("event_dispatch_timeout must be greater than 0".to_string());
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Config {
        let mut argv = vec!["docker_log_forwarder", "--gateway-token", "secret"];
        argv.extend_from_slice(args);
        Config::try_parse_from(argv).unwrap()
    }

    #[test]
    fn test_defaults() {
        let config = parse(&[]);

        assert_eq!(config.tail_lines, 100);
        assert_eq!(config.stream_max_retries, 3);
        assert_eq!(config.stream_backoff(), Duration::from_secs(1));
        assert_eq!(config.event_reconnect_delay(), Duration::from_secs(5));
        assert_eq!(config.event_dispatch_timeout(), Duration::from_secs(10));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_exclusion_list_parsing() {
        let config = parse(&["--exclude-containers", " web , ,cache,"]);
        assert_eq!(config.excluded_names(), vec!["web", "cache"]);

        let config = parse(&["--exclude-containers", ""]);
        assert!(config.excluded_names().is_empty());
    }

    #[test]
    fn test_include_stopped_flag() {
        let config = parse(&["--include-stopped", "true"]);
        assert!(config.filter_policy().include_stopped());
    }

    #[test]
    fn test_drain_timeout_is_optional() {
        assert!(parse(&["--drain-timeout", "30"]).drain_timeout().is_some());
    }

    #[test]
    fn test_validation_rejects_zero_reconnect_delay() {
        let config = parse(&["--event-reconnect", "0"]);
        assert_eq!(
            config.validate(),
            Err("event_reconnect must be greater than 0".to_string())
        );
    }

    #[test]
    fn test_validation_rejects_zero_batch() {
        let config = parse(&["--batch-size", "0"]);
        assert!(config.validate().is_err());

        let config =
            Config::try_parse_from(["docker_log_forwarder", "--gateway-token", ""]).unwrap();
        assert!(config.validate().is_err());
    }
}
