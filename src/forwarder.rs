//! Top-level forwarder: wires the engine, sink, supervisor and event
//! subscriber together and runs the shutdown sequence.

use crate::buffer::RecordBuffer;
use crate::config::Config;
use crate::engine::{ContainerEngine, DockerEngine};
use crate::errors::{ForwarderError, Result};
use crate::events::{EventHandler, EventSubscriber};
use crate::supervisor::TaskSupervisor;
use crate::telemetry::{TelemetryRecord, TelemetrySink};
use crate::transport::{BufferedSink, HttpTransport};
use crate::worker::{RetryPolicy, StreamingWorker};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::time::{Instant, interval};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

const SHUTDOWN_POLL: Duration = Duration::from_secs(1);
const STATUS_INTERVAL: Duration = Duration::from_secs(60);

/// Clears the run flag; safe to call from signal handlers any number of times
#[derive(Debug, Clone)]
pub struct ShutdownHandle {
    running: Arc<AtomicBool>,
}

impl ShutdownHandle {
    pub fn shutdown(&self, signal: &str) {
        if self.running.swap(false, Ordering::SeqCst) {
            info!("Received {}, shutting down gracefully", signal);
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

pub struct LogForwarder {
    config: Config,
    forwarder_id: String,
    engine: Arc<dyn ContainerEngine>,
    sink: Arc<dyn TelemetrySink>,
    gateway: Option<Arc<BufferedSink>>,
    supervisor: Arc<TaskSupervisor>,
    running: Arc<AtomicBool>,
}

impl LogForwarder {
    pub fn new(config: Config, engine: Arc<dyn ContainerEngine>, sink: Arc<dyn TelemetrySink>) -> Self {
        Self::assemble(config, Uuid::new_v4().to_string(), engine, sink)
    }

    fn assemble(
        config: Config,
        forwarder_id: String,
        engine: Arc<dyn ContainerEngine>,
        sink: Arc<dyn TelemetrySink>,
    ) -> Self {
        let retry = RetryPolicy {
            max_retries: config.stream_max_retries,
            base_delay: config.stream_backoff(),
        };
        let worker = StreamingWorker::new(Arc::clone(&engine), Arc::clone(&sink))
            .with_retry(retry)
            .with_tail_lines(config.tail_lines);
        let supervisor = TaskSupervisor::new(
            Arc::clone(&engine),
            Arc::clone(&sink),
            config.filter_policy(),
            worker,
        );

        Self {
            config,
            forwarder_id,
            engine,
            sink,
            gateway: None,
            supervisor: Arc::new(supervisor),
            running: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Connect to the configured engine and gateway
    pub fn from_config(config: Config) -> Result<Self> {
        config.validate().map_err(ForwarderError::Config)?;

        let engine = Arc::new(DockerEngine::connect(&config.docker_host)?);

        let transport = HttpTransport::new(
            config.gateway_url.clone(),
            config.gateway_token.clone(),
            config.http_timeout(),
            config.max_retries,
            config.retry_backoff_ms,
        )?;
        let buffer = RecordBuffer::new(config.max_buffer_size, config.batch_size);
        let forwarder_id = Uuid::new_v4().to_string();
        let gateway = Arc::new(BufferedSink::new(
            transport,
            buffer,
            forwarder_id.clone(),
            config.service_name.clone(),
        ));

        let mut forwarder = Self::assemble(config, forwarder_id, engine, gateway.clone());
        forwarder.gateway = Some(gateway);
        Ok(forwarder)
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            running: Arc::clone(&self.running),
        }
    }

    pub fn supervisor(&self) -> &Arc<TaskSupervisor> {
        &self.supervisor
    }

    /// Run until the shutdown handle fires, then drain and flush
    #[instrument(skip(self), fields(forwarder_id = %self.forwarder_id))]
    pub async fn run(&self) -> Result<()> {
        info!(
            "Starting docker log forwarder {} for service: {}",
            self.forwarder_id, self.config.service_name
        );

        self.annotate("Docker log forwarder started").await;

        if let Some(gateway) = &self.gateway {
            if !gateway.test_connectivity().await {
                warn!("Gateway connectivity test failed, but continuing anyway");
            }
        }

        let flusher_cancel = CancellationToken::new();
        let flusher = tokio::spawn(periodic_flush(
            Arc::clone(&self.sink),
            self.config.flush_interval(),
            flusher_cancel.clone(),
        ));

        let started = self.supervisor.on_startup().await;
        info!("Started {} log streams", started);

        let events_cancel = CancellationToken::new();
        let subscriber = EventSubscriber::new(Arc::clone(&self.engine))
            .with_reconnect_delay(self.config.event_reconnect_delay())
            .with_dispatch_timeout(self.config.event_dispatch_timeout());
        let handler: Arc<dyn EventHandler> = self.supervisor.clone();
        let events = tokio::spawn({
            let cancel = events_cancel.clone();
            async move { subscriber.run(handler, cancel).await }
        });

        self.wait_for_shutdown().await;

        info!("Shutting down docker log forwarder");
        events_cancel.cancel();
        if let Err(e) = events.await {
            error!("Event monitor task failed: {}", e);
        }

        self.supervisor.drain(self.config.drain_timeout()).await;

        flusher_cancel.cancel();
        if let Err(e) = flusher.await {
            error!("Flush task failed: {}", e);
        }

        self.annotate("Docker log forwarder stopped").await;
        if let Err(e) = self.sink.flush().await {
            error!("Final flush failed: {}", e);
        }

        self.log_final_stats().await;
        info!("Docker log forwarder shutdown complete");
        Ok(())
    }

    async fn wait_for_shutdown(&self) {
        let mut poll = interval(SHUTDOWN_POLL);
        let mut last_status = Instant::now();

        while self.running.load(Ordering::SeqCst) {
            poll.tick().await;

            if last_status.elapsed() >= STATUS_INTERVAL {
                self.log_status().await;
                last_status = Instant::now();
            }
        }
    }

    async fn annotate(&self, message: &str) {
        let record = TelemetryRecord::info(message)
            .with_attribute("event_type", "forwarder_lifecycle")
            .with_attribute("forwarder_id", self.forwarder_id.as_str())
            .with_attribute("service_name", self.config.service_name.as_str());

        if let Err(e) = self.sink.emit(record).await {
            warn!("Failed to record '{}': {}", message, e);
        }
    }

    async fn log_status(&self) {
        let tasks = self.supervisor.snapshot();
        let retrying = tasks.iter().filter(|task| task.attempts > 0).count();
        info!("Forwarder status - {} active streams, {} retrying", tasks.len(), retrying);

        if let Some(gateway) = &self.gateway {
            let stats = gateway.stats().await;
            info!(
                "Sink status - Buffered: {} records ({:.1}% utilization, {} dropped), Transport: {:.1}% success rate, {} attempts",
                stats.buffered,
                stats.utilization,
                stats.dropped,
                stats.transport.success_rate,
                stats.transport.attempts
            );
        }
    }

    async fn log_final_stats(&self) {
        if let Some(gateway) = &self.gateway {
            let stats = gateway.stats().await;
            info!(
                "Final transport metrics - Success rate: {:.1}%, Total attempts: {}, Avg duration: {}ms, Unsent: {}",
                stats.transport.success_rate,
                stats.transport.attempts,
                stats.transport.avg_duration_ms,
                stats.buffered
            );
        }
    }
}

async fn periodic_flush(sink: Arc<dyn TelemetrySink>, period: Duration, cancel: CancellationToken) {
    let mut ticker = interval(period);
    ticker.tick().await;

    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        if let Err(e) = sink.flush().await {
            error!("Failed to flush records: {}", e);
        }
    }
}
