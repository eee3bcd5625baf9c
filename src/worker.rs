//! Per-container log streaming with bounded exponential-backoff retry

use crate::container::ContainerDescriptor;
use crate::engine::{ContainerEngine, LogStreamOptions};
use crate::errors::Result;
use crate::log_parser::LogRecord;
use crate::registry::TaskContext;
use crate::telemetry::{TelemetryRecord, TelemetrySink};
use futures::StreamExt;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

pub const DEFAULT_TAIL_LINES: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    /// Delay before the next attempt once `attempt` failures have happened
    pub fn backoff(&self, attempt: u32) -> Duration {
        self.base_delay.saturating_mul(2_u32.saturating_pow(attempt))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerOutcome {
    /// The engine closed the stream, normally because the container stopped
    StreamEnded,
    Cancelled,
    RetriesExhausted { attempts: u32 },
}

impl fmt::Display for WorkerOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkerOutcome::StreamEnded => write!(f, "stream_ended"),
            WorkerOutcome::Cancelled => write!(f, "cancelled"),
            WorkerOutcome::RetriesExhausted { .. } => write!(f, "retries_exhausted"),
        }
    }
}

enum StreamEnd {
    Closed,
    Cancelled,
}

pub struct StreamingWorker {
    engine: Arc<dyn ContainerEngine>,
    sink: Arc<dyn TelemetrySink>,
    retry: RetryPolicy,
    tail_lines: usize,
}

impl StreamingWorker {
    pub fn new(engine: Arc<dyn ContainerEngine>, sink: Arc<dyn TelemetrySink>) -> Self {
        Self {
            engine,
            sink,
            retry: RetryPolicy::default(),
            tail_lines: DEFAULT_TAIL_LINES,
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_tail_lines(mut self, tail_lines: usize) -> Self {
        self.tail_lines = tail_lines;
        self
    }

    #[instrument(skip_all, fields(container = %container.name, id = %container.short_id()))]
    pub async fn run(&self, container: ContainerDescriptor, ctx: TaskContext) -> WorkerOutcome {
        info!("Starting log stream for container: {}", container.name);

        let outcome = self.stream_with_retry(&container, &ctx).await;

        let message = format!("Log stream ended for container: {}", container.name);
        let record = match outcome {
            WorkerOutcome::RetriesExhausted { .. } => TelemetryRecord::error(message),
            _ => TelemetryRecord::info(message),
        }
        .with_attribute("container_id", container.short_id())
        .with_attribute("container_name", container.name.as_str())
        .with_attribute("outcome", outcome.to_string());

        if let Err(e) = self.sink.emit(record).await {
            warn!("Failed to record stream end for {}: {}", container.name, e);
        }

        info!("Log stream for {} finished: {}", container.name, outcome);
        outcome
    }

    async fn stream_with_retry(&self, container: &ContainerDescriptor, ctx: &TaskContext) -> WorkerOutcome {
        let mut attempt = 0;

        loop {
            let err = match self.stream_once(container, &ctx.cancel).await {
                Ok(StreamEnd::Closed) => return WorkerOutcome::StreamEnded,
                Ok(StreamEnd::Cancelled) => return WorkerOutcome::Cancelled,
                Err(e) => e,
            };

            // Reopening replays the tail window, so progress never refunds the budget
            attempt += 1;

            if attempt >= self.retry.max_retries {
                ctx.progress.record_failure(attempt, Duration::ZERO);
                error!(
                    "Giving up on container {} after {} failed attempts: {}",
                    container.name, attempt, err
                );
                return WorkerOutcome::RetriesExhausted { attempts: attempt };
            }

            let delay = self.retry.backoff(attempt);
            ctx.progress.record_failure(attempt, delay);
            warn!(
                "Error streaming logs for container {} (attempt {}), retrying in {:?}: {}",
                container.name, attempt, delay, err
            );

            tokio::select! {
                biased;
                () = ctx.cancel.cancelled() => return WorkerOutcome::Cancelled,
                () = sleep(delay) => {}
            }
        }
    }

    async fn stream_once(
        &self,
        container: &ContainerDescriptor,
        cancel: &CancellationToken,
    ) -> Result<StreamEnd> {
        let options = LogStreamOptions::tail(self.tail_lines);

        let mut stream = tokio::select! {
            biased;
            () = cancel.cancelled() => return Ok(StreamEnd::Cancelled),
            stream = self.engine.stream_logs(&container.id, options) => stream?,
        };

        loop {
            let chunk = tokio::select! {
                biased;
                () = cancel.cancelled() => return Ok(StreamEnd::Cancelled),
                chunk = stream.next() => chunk,
            };

            let Some(chunk) = chunk else {
                debug!("Log stream closed for {}", container.name);
                return Ok(StreamEnd::Closed);
            };

            for line in chunk?.split(|b| *b == b'\n').filter(|line| !line.is_empty()) {
                self.forward_line(container, line).await;
            }
        }
    }

    /// Failures here are per line and never end the stream
    async fn forward_line(&self, container: &ContainerDescriptor, line: &[u8]) {
        let record = LogRecord::from_line(line, container).into_telemetry();

        if let Err(e) = self.sink.emit(record).await {
            warn!("Error processing log line for {}: {}", container.name, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::container::ContainerStatus;
    use crate::registry::TaskProgress;
    use crate::telemetry::LogLevel;
    use crate::testing::{LogScript, MockEngine, RecordingSink};
    use tokio::time::Instant;

    fn container() -> ContainerDescriptor {
        ContainerDescriptor::new("abc123456789", "/web", ContainerStatus::Running).with_image("nginx:1.27")
    }

    fn context() -> TaskContext {
        TaskContext {
            cancel: CancellationToken::new(),
            progress: Arc::new(TaskProgress::default()),
        }
    }

    fn setup() -> (Arc<MockEngine>, Arc<RecordingSink>, StreamingWorker) {
        let engine = Arc::new(MockEngine::new());
        let sink = Arc::new(RecordingSink::new());
        let worker = StreamingWorker::new(engine.clone(), sink.clone());
        (engine, sink, worker)
    }

    #[test]
    fn test_backoff_doubles() {
        let retry = RetryPolicy::default();
        assert_eq!(retry.backoff(0), Duration::from_secs(1));
        assert_eq!(retry.backoff(1), Duration::from_secs(2));
        assert_eq!(retry.backoff(2), Duration::from_secs(4));
        assert_eq!(retry.backoff(3), Duration::from_secs(8));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stream_end_is_normal_termination() {
        let (engine, sink, worker) = setup();
        engine.script_logs(
            "abc123456789",
            LogScript::Complete(vec![
                "2025-05-23T20:03:59.691483928Z {\"message\": \"ready\", \"port\": 8080}\n",
                "plain line\nsecond line\n",
            ]),
        );

        let outcome = worker.run(container(), context()).await;

        assert_eq!(outcome, WorkerOutcome::StreamEnded);
        assert_eq!(engine.log_opens("abc123456789"), 1);
        assert_eq!(engine.last_log_options(), Some(LogStreamOptions::tail(100)));

        let records = sink.records();
        assert_eq!(records.len(), 4);
        assert_eq!(records[0].message, "ready");
        assert_eq!(records[0].attributes["port"], 8080);
        assert_eq!(records[0].attribute_str("container_image"), Some("nginx:1.27"));
        assert_eq!(records[1].message, "plain line");
        assert_eq!(records[2].message, "second line");
        assert_eq!(records[3].message, "Log stream ended for container: web");
        assert_eq!(records[3].attribute_str("outcome"), Some("stream_ended"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_gives_up_after_three_failures() {
        let (engine, sink, worker) = setup();
        engine.script_logs("abc123456789", LogScript::Fail(vec![]));
        engine.script_logs("abc123456789", LogScript::OpenError);
        engine.script_logs("abc123456789", LogScript::Fail(vec![]));
        engine.script_logs("abc123456789", LogScript::Complete(vec!["never read"]));

        let ctx = context();
        let started = Instant::now();
        let outcome = worker.run(container(), ctx.clone()).await;

        assert_eq!(outcome, WorkerOutcome::RetriesExhausted { attempts: 3 });
        assert_eq!(engine.log_opens("abc123456789"), 3);
        // backoff after the first and second failure: 2s + 4s
        assert_eq!(started.elapsed(), Duration::from_secs(6));
        assert_eq!(ctx.progress.attempts(), 3);
        let records = sink.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].message, "Log stream ended for container: web");
        assert_eq!(records[0].level, LogLevel::Error);
    }

    #[tokio::test(start_paused = true)]
    async fn test_forwarded_lines_do_not_refund_attempts() {
        let (engine, sink, worker) = setup();
        engine.script_logs("abc123456789", LogScript::Fail(vec![]));
        engine.script_logs("abc123456789", LogScript::Fail(vec!["one"]));
        engine.script_logs("abc123456789", LogScript::Fail(vec![]));
        engine.script_logs("abc123456789", LogScript::Complete(vec!["two"]));

        let outcome = worker.run(container(), context()).await;

        assert_eq!(outcome, WorkerOutcome::RetriesExhausted { attempts: 3 });
        assert_eq!(engine.log_opens("abc123456789"), 3);
        assert_eq!(sink.messages()[0], "one");
    }

    #[tokio::test(start_paused = true)]
    async fn test_replayed_tail_still_exhausts_retries() {
        let (engine, sink, worker) = setup();
        for _ in 0..4 {
            engine.script_logs("abc123456789", LogScript::Fail(vec!["replayed tail line"]));
        }

        let started = Instant::now();
        let outcome = worker.run(container(), context()).await;

        assert_eq!(outcome, WorkerOutcome::RetriesExhausted { attempts: 3 });
        assert_eq!(engine.log_opens("abc123456789"), 3);
        assert_eq!(started.elapsed(), Duration::from_secs(6));
        let replayed = sink
            .messages()
            .into_iter()
            .filter(|m| m == "replayed tail line")
            .count();
        assert_eq!(replayed, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_forward_failures_do_not_trigger_retry() {
        let (engine, sink, worker) = setup();
        engine.script_logs("abc123456789", LogScript::Complete(vec!["a", "b", "c"]));
        sink.set_failing(true);

        let outcome = worker.run(container(), context()).await;

        assert_eq!(outcome, WorkerOutcome::StreamEnded);
        assert_eq!(engine.log_opens("abc123456789"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_during_backoff() {
        let (engine, _sink, worker) = setup();
        engine.script_logs("abc123456789", LogScript::OpenError);

        let ctx = context();
        let cancel = ctx.cancel.clone();
        let run = worker.run(container(), ctx.clone());
        let check = async {
            while ctx.progress.attempts() == 0 {
                tokio::task::yield_now().await;
            }
            cancel.cancel();
        };

        let (outcome, ()) = tokio::join!(run, check);
        assert_eq!(outcome, WorkerOutcome::Cancelled);
        assert_eq!(engine.log_opens("abc123456789"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_while_streaming() {
        let (engine, sink, worker) = setup();
        let lines = engine.log_channel("abc123456789");
        lines.unbounded_send(Ok(b"hello".to_vec())).unwrap();

        let ctx = context();
        let cancel = ctx.cancel.clone();
        let run = worker.run(container(), ctx);
        let check = async {
            while sink.records().is_empty() {
                tokio::task::yield_now().await;
            }
            cancel.cancel();
        };

        let (outcome, ()) = tokio::join!(run, check);
        assert_eq!(outcome, WorkerOutcome::Cancelled);
        assert_eq!(sink.messages()[0], "hello");
    }
}
