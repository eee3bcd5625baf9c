//! Scriptable engine and sink doubles shared by the unit tests

use crate::container::{ContainerDescriptor, LifecycleEvent};
use crate::engine::{ContainerEngine, EventStream, LogStream, LogStreamOptions};
use crate::errors::{ForwarderError, Result};
use crate::telemetry::{TelemetryRecord, TelemetrySink};
use async_trait::async_trait;
use futures::channel::mpsc;
use futures::stream::{self, StreamExt};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

pub type LineSender = mpsc::UnboundedSender<Result<Vec<u8>>>;

/// What the next `stream_logs` call for a container produces
pub enum LogScript {
    OpenError,
    /// Yields the lines, then a read error
    Fail(Vec<&'static str>),
    /// Yields the lines, then ends
    Complete(Vec<&'static str>),
    Channel(mpsc::UnboundedReceiver<Result<Vec<u8>>>),
}

/// What the next `subscribe_events` call produces
pub enum EventScript {
    OpenError,
    /// Yields the events, then ends
    Close(Vec<LifecycleEvent>),
    /// Yields the events, then stays open
    Hold(Vec<LifecycleEvent>),
}

#[derive(Default)]
pub struct MockEngine {
    containers: Mutex<Vec<ContainerDescriptor>>,
    fail_listing: AtomicBool,
    last_list_all: Mutex<Option<bool>>,
    event_scripts: Mutex<VecDeque<EventScript>>,
    subscriptions: AtomicUsize,
    held_streams_dropped: Arc<AtomicUsize>,
    log_scripts: Mutex<HashMap<String, VecDeque<LogScript>>>,
    log_opens: Mutex<HashMap<String, usize>>,
    last_log_options: Mutex<Option<LogStreamOptions>>,
}

impl MockEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_container(&self, container: ContainerDescriptor) {
        self.containers.lock().unwrap().push(container);
    }

    pub fn fail_listing(&self, fail: bool) {
        self.fail_listing.store(fail, Ordering::SeqCst);
    }

    pub fn last_list_all(&self) -> Option<bool> {
        *self.last_list_all.lock().unwrap()
    }

    pub fn script_events(&self, script: EventScript) {
        self.event_scripts.lock().unwrap().push_back(script);
    }

    pub fn subscriptions(&self) -> usize {
        self.subscriptions.load(Ordering::SeqCst)
    }

    /// Number of held-open event streams that have been dropped
    pub fn held_streams_dropped(&self) -> usize {
        self.held_streams_dropped.load(Ordering::SeqCst)
    }

    pub fn script_logs(&self, container_id: &str, script: LogScript) {
        self.log_scripts
            .lock()
            .unwrap()
            .entry(container_id.to_string())
            .or_default()
            .push_back(script);
    }

    /// Next stream for the container is fed by the returned sender and ends when it is dropped
    pub fn log_channel(&self, container_id: &str) -> LineSender {
        let (tx, rx) = mpsc::unbounded();
        self.script_logs(container_id, LogScript::Channel(rx));
        tx
    }

    pub fn log_opens(&self, container_id: &str) -> usize {
        self.log_opens
            .lock()
            .unwrap()
            .get(container_id)
            .copied()
            .unwrap_or(0)
    }

    pub fn last_log_options(&self) -> Option<LogStreamOptions> {
        self.last_log_options.lock().unwrap().clone()
    }

    fn held_stream(&self, events: Vec<LifecycleEvent>) -> EventStream {
        let flag = DropFlag(Arc::clone(&self.held_streams_dropped));
        let held = stream::unfold(flag, |flag| async move {
            futures::future::pending::<()>().await;
            Some((Err(ForwarderError::Other("unreachable".to_string())), flag))
        });

        stream::iter(events.into_iter().map(Ok)).chain(held).boxed()
    }
}

struct DropFlag(Arc<AtomicUsize>);

impl Drop for DropFlag {
    fn drop(&mut self) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }
}

fn lines(lines: Vec<&'static str>) -> impl futures::Stream<Item = Result<Vec<u8>>> {
    stream::iter(lines.into_iter().map(|line| Ok(line.as_bytes().to_vec())))
}

#[async_trait]
impl ContainerEngine for MockEngine {
    async fn list_containers(&self, all: bool) -> Result<Vec<ContainerDescriptor>> {
        *self.last_list_all.lock().unwrap() = Some(all);
        if self.fail_listing.load(Ordering::SeqCst) {
            return Err(ForwarderError::Other("engine unavailable".to_string()));
        }
        Ok(self.containers.lock().unwrap().clone())
    }

    async fn get_container(&self, id: &str) -> Result<ContainerDescriptor> {
        self.containers
            .lock()
            .unwrap()
            .iter()
            .find(|c| c.id == id || c.id.starts_with(id))
            .cloned()
            .ok_or_else(|| ForwarderError::Other(format!("no such container: {}", id)))
    }

    async fn subscribe_events(&self) -> Result<EventStream> {
        self.subscriptions.fetch_add(1, Ordering::SeqCst);
        let script = self.event_scripts.lock().unwrap().pop_front();

        match script {
            Some(EventScript::OpenError) => {
                Err(ForwarderError::Subscription("connection refused".to_string()))
            }
            Some(EventScript::Close(events)) => Ok(stream::iter(events.into_iter().map(Ok)).boxed()),
            Some(EventScript::Hold(events)) => Ok(self.held_stream(events)),
            None => Ok(self.held_stream(Vec::new())),
        }
    }

    async fn stream_logs(&self, id: &str, options: LogStreamOptions) -> Result<LogStream> {
        *self.log_opens.lock().unwrap().entry(id.to_string()).or_default() += 1;
        *self.last_log_options.lock().unwrap() = Some(options);

        let script = self
            .log_scripts
            .lock()
            .unwrap()
            .get_mut(id)
            .and_then(VecDeque::pop_front);

        match script {
            Some(LogScript::OpenError) => Err(ForwarderError::Stream("no such container".to_string())),
            Some(LogScript::Fail(script)) => Ok(lines(script)
                .chain(stream::once(async {
                    Err(ForwarderError::Stream("connection reset".to_string()))
                }))
                .boxed()),
            Some(LogScript::Complete(script)) => Ok(lines(script).boxed()),
            Some(LogScript::Channel(rx)) => Ok(rx.boxed()),
            None => Ok(stream::pending().boxed()),
        }
    }
}

/// Sink that keeps every record in memory
#[derive(Default)]
pub struct RecordingSink {
    records: Mutex<Vec<TelemetryRecord>>,
    failing: AtomicBool,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn records(&self) -> Vec<TelemetryRecord> {
        self.records.lock().unwrap().clone()
    }

    pub fn messages(&self) -> Vec<String> {
        self.records().into_iter().map(|r| r.message).collect()
    }
}

#[async_trait]
impl TelemetrySink for RecordingSink {
    async fn emit(&self, record: TelemetryRecord) -> Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(ForwarderError::Transport("sink unavailable".to_string()));
        }
        self.records.lock().unwrap().push(record);
        Ok(())
    }
}
