//! Container engine access: the trait the orchestration layer depends on
//! and its Docker implementation.

use crate::container::{ContainerDescriptor, ContainerStatus, EventKind, LifecycleEvent};
use crate::errors::{ForwarderError, Result};
use async_trait::async_trait;
use bollard::container::{InspectContainerOptions, ListContainersOptions, LogsOptions};
use bollard::models::{
    ContainerInspectResponse, ContainerStateStatusEnum, ContainerSummary, EventMessage, ImageInspect,
};
use bollard::system::EventsOptions;
use bollard::Docker;
use futures::stream::{BoxStream, StreamExt};
use std::collections::HashMap;
use tracing::{debug, info};

pub type EventStream = BoxStream<'static, Result<LifecycleEvent>>;
pub type LogStream = BoxStream<'static, Result<Vec<u8>>>;

/// Options for opening a container log stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogStreamOptions {
    pub follow: bool,
    pub timestamps: bool,
    pub tail: usize,
}

impl LogStreamOptions {
    /// Follow from a recent window with per-line timestamps
    pub fn tail(lines: usize) -> Self {
        Self {
            follow: true,
            timestamps: true,
            tail: lines,
        }
    }
}

/// Operations the forwarder needs from a container engine.
///
/// Implementations are shared by every worker and must tolerate concurrent use.
#[async_trait]
pub trait ContainerEngine: Send + Sync {
    /// List containers; `all` includes the ones that are not running
    async fn list_containers(&self, all: bool) -> Result<Vec<ContainerDescriptor>>;

    async fn get_container(&self, id: &str) -> Result<ContainerDescriptor>;

    /// Subscribe to container-scoped lifecycle events
    async fn subscribe_events(&self) -> Result<EventStream>;

    async fn stream_logs(&self, id: &str, options: LogStreamOptions) -> Result<LogStream>;
}

/// Docker engine reached through bollard
pub struct DockerEngine {
    client: Docker,
}

const CONNECT_TIMEOUT_SECS: u64 = 120;

impl DockerEngine {
    /// Connect to a unix socket path, or to an http:// / tcp:// address
    pub fn connect(address: &str) -> Result<Self> {
        let client = if address.starts_with("http://") || address.starts_with("tcp://") {
            Docker::connect_with_http(address, CONNECT_TIMEOUT_SECS, bollard::API_DEFAULT_VERSION)?
        } else {
            let socket = address.trim_start_matches("unix://");
            Docker::connect_with_unix(socket, CONNECT_TIMEOUT_SECS, bollard::API_DEFAULT_VERSION)?
        };

        info!("Connected to container engine at {}", address);
        Ok(Self { client })
    }

    /// Replace an id-only image reference with the image's first repo tag
    async fn resolve_image(
        &self,
        mut container: ContainerDescriptor,
        image_id: Option<String>,
    ) -> ContainerDescriptor {
        if !is_untagged_reference(container.image.as_deref()) {
            return container;
        }
        let Some(reference) = container.image.clone().or(image_id) else {
            return container;
        };

        match self.client.inspect_image(&reference).await {
            Ok(image) => {
                if let Some(tag) = first_repo_tag(image) {
                    container.image = Some(tag);
                }
            }
            Err(e) => debug!("Could not resolve image {} for {}: {}", reference, container.name, e),
        }
        container
    }
}

#[async_trait]
impl ContainerEngine for DockerEngine {
    async fn list_containers(&self, all: bool) -> Result<Vec<ContainerDescriptor>> {
        let options = ListContainersOptions::<String> {
            all,
            ..Default::default()
        };

        let containers = self.client.list_containers(Some(options)).await?;
        debug!("Engine reported {} containers", containers.len());

        let mut descriptors = Vec::with_capacity(containers.len());
        for summary in containers {
            let image_id = summary.image_id.clone();
            let descriptor = descriptor_from_summary(summary);
            descriptors.push(self.resolve_image(descriptor, image_id).await);
        }
        Ok(descriptors)
    }

    async fn get_container(&self, id: &str) -> Result<ContainerDescriptor> {
        let inspect = self
            .client
            .inspect_container(id, None::<InspectContainerOptions>)
            .await?;

        let image_id = inspect.image.clone();
        let descriptor = descriptor_from_inspect(id, inspect);
        Ok(self.resolve_image(descriptor, image_id).await)
    }

    async fn subscribe_events(&self) -> Result<EventStream> {
        let mut filters = HashMap::new();
        filters.insert("type".to_string(), vec!["container".to_string()]);

        let options = EventsOptions::<String> {
            filters,
            ..Default::default()
        };

        let stream = self
            .client
            .events(Some(options))
            .map(|item| item.map(event_from_message).map_err(ForwarderError::from));

        Ok(stream.boxed())
    }

    async fn stream_logs(&self, id: &str, options: LogStreamOptions) -> Result<LogStream> {
        let options = LogsOptions::<String> {
            follow: options.follow,
            stdout: true,
            stderr: true,
            timestamps: options.timestamps,
            tail: options.tail.to_string(),
            ..Default::default()
        };

        let stream = self.client.logs(id, Some(options)).map(|item| {
            item.map(|output| output.into_bytes().to_vec())
                .map_err(ForwarderError::from)
        });

        Ok(stream.boxed())
    }
}

fn descriptor_from_summary(summary: ContainerSummary) -> ContainerDescriptor {
    let id = summary.id.unwrap_or_default();
    let name = summary
        .names
        .and_then(|names| names.into_iter().next())
        .unwrap_or_else(|| crate::container::short_id(&id).to_string());
    let status = summary
        .state
        .as_deref()
        .map(ContainerStatus::from)
        .unwrap_or(ContainerStatus::Other("unknown".to_string()));

    let mut descriptor = ContainerDescriptor::new(id, &name, status);
    descriptor.image = summary.image.filter(|image| !image.is_empty());
    descriptor
}

fn descriptor_from_inspect(requested_id: &str, inspect: ContainerInspectResponse) -> ContainerDescriptor {
    let id = inspect.id.unwrap_or_else(|| requested_id.to_string());
    let name = inspect
        .name
        .unwrap_or_else(|| crate::container::short_id(&id).to_string());
    let status = match inspect.state.and_then(|state| state.status) {
        Some(ContainerStateStatusEnum::RUNNING) => ContainerStatus::Running,
        Some(
            ContainerStateStatusEnum::EXITED
            | ContainerStateStatusEnum::DEAD
            | ContainerStateStatusEnum::CREATED,
        ) => ContainerStatus::Stopped,
        Some(other) => ContainerStatus::Other(other.to_string()),
        None => ContainerStatus::Other("unknown".to_string()),
    };

    let mut descriptor = ContainerDescriptor::new(id, &name, status);
    descriptor.image = inspect
        .config
        .and_then(|config| config.image)
        .filter(|image| !image.is_empty());
    descriptor
}

fn is_untagged_reference(image: Option<&str>) -> bool {
    match image {
        None => true,
        Some(image) => {
            image.is_empty()
                || image.starts_with("sha256:")
                || (image.len() >= 12 && image.chars().all(|c| c.is_ascii_hexdigit()))
        }
    }
}

fn first_repo_tag(image: ImageInspect) -> Option<String> {
    image
        .repo_tags?
        .into_iter()
        .find(|tag| !tag.is_empty() && tag != "<none>:<none>")
}

fn event_from_message(message: EventMessage) -> LifecycleEvent {
    let actor = message.actor.unwrap_or_default();
    let id = actor.id.unwrap_or_default();
    let name = actor
        .attributes
        .and_then(|mut attributes| attributes.remove("name"))
        .unwrap_or_else(|| "unknown".to_string());
    let kind = EventKind::from(message.action.as_deref().unwrap_or_default());

    let event = LifecycleEvent::new(&id, &name, kind);
    match message.time {
        Some(time) => event.with_time(time),
        None => event,
    }
}
