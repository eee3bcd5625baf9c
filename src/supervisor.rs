//! Keeps at most one streaming worker per container and drains them on shutdown

use crate::container::{ContainerDescriptor, EventKind, FilterPolicy, LifecycleEvent};
use crate::discovery::Discovery;
use crate::engine::ContainerEngine;
use crate::events::EventHandler;
use crate::registry::{TaskRegistry, TaskSnapshot};
use crate::telemetry::{TelemetryRecord, TelemetrySink};
use crate::worker::StreamingWorker;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

/// How long cancelled stragglers get before they are aborted
pub const DRAIN_GRACE: Duration = Duration::from_secs(5);

pub struct TaskSupervisor {
    engine: Arc<dyn ContainerEngine>,
    sink: Arc<dyn TelemetrySink>,
    discovery: Discovery,
    policy: FilterPolicy,
    worker: Arc<StreamingWorker>,
    registry: Arc<TaskRegistry>,
    root: CancellationToken,
}

impl TaskSupervisor {
    pub fn new(
        engine: Arc<dyn ContainerEngine>,
        sink: Arc<dyn TelemetrySink>,
        policy: FilterPolicy,
        worker: StreamingWorker,
    ) -> Self {
        Self {
            discovery: Discovery::new(Arc::clone(&engine), policy.clone()),
            engine,
            sink,
            policy,
            worker: Arc::new(worker),
            registry: TaskRegistry::new(),
            root: CancellationToken::new(),
        }
    }

    pub fn registry(&self) -> &Arc<TaskRegistry> {
        &self.registry
    }

    pub fn active_count(&self) -> usize {
        self.registry.len()
    }

    pub fn snapshot(&self) -> Vec<TaskSnapshot> {
        self.registry.snapshot()
    }

    /// Start a worker for every container that passes the filter
    pub async fn on_startup(&self) -> usize {
        let mut started = 0;
        for container in self.discovery.list_monitored().await {
            if self.spawn_worker(container) {
                started += 1;
            }
        }
        started
    }

    #[instrument(skip_all, fields(container = %event.container_name, kind = %event.kind))]
    pub async fn on_event(&self, event: LifecycleEvent) {
        let record = TelemetryRecord::info(format!(
            "Container {}: {}",
            event.kind, event.container_name
        ))
        .with_attribute("event_type", "container_lifecycle")
        .with_attribute("container_name", event.container_name.as_str())
        .with_attribute("status", event.kind.to_string())
        .with_attribute("container_id", event.container_id.as_str());

        if let Err(e) = self.sink.emit(record).await {
            warn!("Failed to record lifecycle event for {}: {}", event.container_name, e);
        }

        match event.kind {
            EventKind::Start => self.start_from_event(&event).await,
            // Workers notice a stopped container through the end of their stream
            EventKind::Stop | EventKind::Die => {}
            EventKind::Other(_) => debug!("Ignoring container event: {}", event.kind),
        }
    }

    async fn start_from_event(&self, event: &LifecycleEvent) {
        if self.registry.contains(&event.container_id) {
            debug!("Already streaming logs for {}", event.container_name);
            return;
        }

        let container = match self.engine.get_container(&event.container_id).await {
            Ok(container) => container,
            Err(e) => {
                error!("Error handling container event for {}: {}", event.container_name, e);
                return;
            }
        };

        if !self.policy.should_monitor(&container) {
            debug!(
                "Not monitoring started container {} (status: {})",
                container.name, container.status
            );
            return;
        }

        if self.spawn_worker(container) {
            info!("Started monitoring new container: {}", event.container_name);
        }
    }

    /// Spawn a worker unless one is already registered for the container
    pub fn spawn_worker(&self, container: ContainerDescriptor) -> bool {
        let id = container.short_id().to_string();
        let name = container.name.clone();
        let worker = Arc::clone(&self.worker);

        let spawned = self
            .registry
            .try_spawn(&id, &name, self.root.child_token(), move |ctx| async move {
                worker.run(container, ctx).await;
            });

        if !spawned {
            debug!("Worker for {} ({}) already running", name, id);
        }
        spawned
    }

    /// Wait for every worker to finish.
    ///
    /// With a limit, stragglers are cancelled when it expires and aborted
    /// if they outlive the grace period.
    pub async fn drain(&self, limit: Option<Duration>) {
        let active = self.registry.len();
        if active > 0 {
            info!("Waiting for {} streaming tasks to finish", active);
        }

        let Some(limit) = limit else {
            self.registry.wait_empty().await;
            return;
        };

        if timeout(limit, self.registry.wait_empty()).await.is_ok() {
            return;
        }

        let stragglers = self.registry.cancel_all();
        warn!(
            "Drain timed out after {:?}, cancelling {} streams: {}",
            limit,
            stragglers.len(),
            stragglers.join(", ")
        );

        if timeout(DRAIN_GRACE, self.registry.wait_empty()).await.is_err() {
            warn!("Streams still running after cancellation, aborting them");
            self.registry.abort_all();
            self.registry.wait_empty().await;
        }
    }
}

#[async_trait]
impl EventHandler for TaskSupervisor {
    async fn handle(&self, event: LifecycleEvent) {
        self.on_event(event).await;
    }
}
