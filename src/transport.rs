//! HTTP transport for shipping record batches to the telemetry gateway,
//! and the buffered sink the workers write into.

use crate::buffer::RecordBuffer;
use crate::errors::{ForwarderError, Result};
use crate::telemetry::{RecordBatch, TelemetryRecord, TelemetrySink};
use async_trait::async_trait;
use reqwest::{Client, Response};
use serde_json::Value;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, RwLock};
use tokio::time::{sleep, timeout};
use tracing::{debug, error, info, warn};

/// HTTP transport for record batches
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: Client,
    gateway_url: String,
    token: String,
    timeout: Duration,
    max_retries: u32,
    retry_backoff_ms: u64,
}

impl HttpTransport {
    pub fn new(
        gateway_url: String,
        token: String,
        http_timeout: Duration,
        max_retries: u32,
        retry_backoff_ms: u64,
    ) -> Result<Self> {
        let client = Client::builder()
            .timeout(http_timeout)
            .user_agent(format!("docker_log_forwarder/{}", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(ForwarderError::Http)?;

        Ok(Self {
            client,
            gateway_url: gateway_url.trim_end_matches('/').to_string(),
            token,
            timeout: http_timeout,
            max_retries,
            retry_backoff_ms,
        })
    }

    /// Send a batch, retrying with exponential backoff
    pub async fn send_batch(&self, batch: &RecordBatch) -> Result<()> {
        let url = format!("{}/v1/logs", self.gateway_url);

        debug!(
            "Sending batch {} with {} records to {}",
            batch.metadata.batch_id,
            batch.len(),
            url
        );

        let mut attempt = 0;

        loop {
            let err = match self.send_batch_attempt(&url, batch).await {
                Ok(()) => {
                    debug!(
                        "Sent batch {} (attempt {})",
                        batch.metadata.batch_id,
                        attempt + 1
                    );
                    return Ok(());
                }
                Err(e) => e,
            };

            attempt += 1;
            if attempt > self.max_retries {
                error!(
                    "Failed to send batch {} after {} attempts: {}",
                    batch.metadata.batch_id, attempt, err
                );
                return Err(err);
            }

            let backoff = self.backoff(attempt);
            warn!(
                "Failed to send batch {} (attempt {}), retrying in {:?}: {}",
                batch.metadata.batch_id, attempt, backoff, err
            );
            sleep(backoff).await;
        }
    }

    fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2_u64.saturating_pow(attempt.saturating_sub(1));
        Duration::from_millis(self.retry_backoff_ms.saturating_mul(factor))
    }

    async fn send_batch_attempt(&self, url: &str, batch: &RecordBatch) -> Result<()> {
        let response = timeout(
            self.timeout,
            self.client.post(url).bearer_auth(&self.token).json(batch).send(),
        )
        .await
        .map_err(|_| ForwarderError::Transport("Request timeout".to_string()))?
        .map_err(ForwarderError::Http)?;

        self.handle_response(response, &batch.metadata.batch_id).await
    }

    async fn handle_response(&self, response: Response, batch_id: &str) -> Result<()> {
        let status = response.status();

        if status.is_success() {
            return Ok(());
        }

        let error_body = response
            .text()
            .await
            .unwrap_or_else(|_| "Unknown error".to_string());

        let error_message = match status.as_u16() {
            400 => format!("Bad request for batch {}: {}", batch_id, error_body),
            401 => format!("Unauthorized for batch {}: {}", batch_id, error_body),
            403 => format!("Forbidden for batch {}: {}", batch_id, error_body),
            404 => format!("Gateway endpoint not found for batch {}: {}", batch_id, error_body),
            413 => format!("Batch {} too large: {}", batch_id, error_body),
            429 => format!("Rate limited for batch {}: {}", batch_id, error_body),
            500..=599 => format!("Gateway server error for batch {}: {}", batch_id, error_body),
            _ => format!("Unexpected response {} for batch {}: {}", status, batch_id, error_body),
        };

        Err(ForwarderError::Transport(error_message))
    }

    /// Health check the gateway endpoint
    pub async fn health_check(&self) -> Result<GatewayHealth> {
        let url = format!("{}/health", self.gateway_url);

        let response = timeout(self.timeout, self.client.get(&url).send())
            .await
            .map_err(|_| ForwarderError::Transport("Health check timeout".to_string()))?
            .map_err(ForwarderError::Http)?;

        if !response.status().is_success() {
            return Err(ForwarderError::Transport(format!(
                "Health check failed with status: {}",
                response.status()
            )));
        }

        let health_data: Value = response.json().await.map_err(ForwarderError::Http)?;

        Ok(GatewayHealth {
            status: health_data["status"].as_str().unwrap_or("unknown").to_string(),
            service: health_data["service"].as_str().unwrap_or("unknown").to_string(),
            version: health_data["version"].as_str().unwrap_or("unknown").to_string(),
        })
    }
}

/// Gateway health information
#[derive(Debug, Clone)]
pub struct GatewayHealth {
    pub status: String,
    pub service: String,
    pub version: String,
}

/// Transport metrics tracking
#[derive(Debug, Default)]
struct TransportMetrics {
    attempts: RwLock<u64>,
    successes: RwLock<u64>,
    failures: RwLock<u64>,
    total_duration: RwLock<Duration>,
}

impl TransportMetrics {
    async fn record(&self, success: bool, duration: Duration) {
        *self.attempts.write().await += 1;
        if success {
            *self.successes.write().await += 1;
        } else {
            *self.failures.write().await += 1;
        }
        *self.total_duration.write().await += duration;
    }

    async fn snapshot(&self) -> TransportMetricsSnapshot {
        let attempts = *self.attempts.read().await;
        let successes = *self.successes.read().await;
        let failures = *self.failures.read().await;
        let total_duration = *self.total_duration.read().await;

        let success_rate = if attempts > 0 {
            (successes as f64 / attempts as f64) * 100.0
        } else {
            0.0
        };

        let avg_duration = if attempts > 0 {
            total_duration / attempts as u32
        } else {
            Duration::ZERO
        };

        TransportMetricsSnapshot {
            attempts,
            successes,
            failures,
            success_rate,
            avg_duration_ms: avg_duration.as_millis() as u64,
        }
    }
}

/// Snapshot of transport metrics
#[derive(Debug, Clone)]
pub struct TransportMetricsSnapshot {
    pub attempts: u64,
    pub successes: u64,
    pub failures: u64,
    pub success_rate: f64,
    pub avg_duration_ms: u64,
}

/// Sink that buffers records in memory and ships them in batches on `flush`
#[derive(Debug)]
pub struct BufferedSink {
    buffer: RecordBuffer,
    transport: HttpTransport,
    metrics: TransportMetrics,
    forwarder_id: String,
    service_name: String,
    flush_lock: Mutex<()>,
}

impl BufferedSink {
    pub fn new(
        transport: HttpTransport,
        buffer: RecordBuffer,
        forwarder_id: String,
        service_name: String,
    ) -> Self {
        Self {
            buffer,
            transport,
            metrics: TransportMetrics::default(),
            forwarder_id,
            service_name,
            flush_lock: Mutex::new(()),
        }
    }

    pub fn transport(&self) -> &HttpTransport {
        &self.transport
    }

    /// Test connectivity to the gateway
    pub async fn test_connectivity(&self) -> bool {
        match self.transport.health_check().await {
            Ok(health) => {
                info!(
                    "Gateway connectivity test successful: {} v{} - {}",
                    health.service, health.version, health.status
                );
                true
            }
            Err(e) => {
                warn!("Gateway connectivity test failed: {}", e);
                false
            }
        }
    }

    pub async fn stats(&self) -> SinkStats {
        SinkStats {
            buffered: self.buffer.len().await,
            utilization: self.buffer.utilization().await,
            dropped: self.buffer.dropped(),
            transport: self.metrics.snapshot().await,
        }
    }
}

#[async_trait]
impl TelemetrySink for BufferedSink {
    async fn emit(&self, record: TelemetryRecord) -> Result<()> {
        self.buffer.push(record).await;
        Ok(())
    }

    async fn flush(&self) -> Result<()> {
        let _guard = self.flush_lock.lock().await;

        while let Some(records) = self.buffer.drain_batch().await {
            let batch = RecordBatch::new(
                records,
                self.forwarder_id.clone(),
                self.service_name.clone(),
            );

            let started = Instant::now();
            let result = self.transport.send_batch(&batch).await;
            self.metrics.record(result.is_ok(), started.elapsed()).await;

            if let Err(e) = result {
                self.buffer.requeue(batch.records).await;
                return Err(e);
            }
        }

        Ok(())
    }
}

/// Buffered sink statistics
#[derive(Debug, Clone)]
pub struct SinkStats {
    pub buffered: usize,
    pub utilization: f64,
    pub dropped: u64,
    pub transport: TransportMetricsSnapshot,
}
