//! Container metadata, lifecycle events and the monitoring filter

use std::collections::HashSet;
use std::fmt;

/// Length of the abbreviated container id used as registry key
pub const SHORT_ID_LEN: usize = 12;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ContainerStatus {
    Running,
    Stopped,
    Other(String),
}

impl From<&str> for ContainerStatus {
    fn from(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "running" => ContainerStatus::Running,
            "exited" | "dead" | "created" | "stopped" => ContainerStatus::Stopped,
            other => ContainerStatus::Other(other.to_string()),
        }
    }
}

impl fmt::Display for ContainerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ContainerStatus::Running => write!(f, "running"),
            ContainerStatus::Stopped => write!(f, "stopped"),
            ContainerStatus::Other(status) => write!(f, "{}", status),
        }
    }
}

/// Read-only snapshot of a container as reported by the engine
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ContainerDescriptor {
    pub id: String,
    pub name: String,
    pub status: ContainerStatus,
    pub image: Option<String>,
}

impl ContainerDescriptor {
    pub fn new(id: impl Into<String>, name: &str, status: ContainerStatus) -> Self {
        Self {
            id: id.into(),
            name: display_name(name),
            status,
            image: None,
        }
    }

    pub fn with_image(mut self, image: impl Into<String>) -> Self {
        self.image = Some(image.into());
        self
    }

    pub fn short_id(&self) -> &str {
        short_id(&self.id)
    }

    pub fn image_or_unknown(&self) -> &str {
        self.image.as_deref().filter(|i| !i.is_empty()).unwrap_or("unknown")
    }
}

/// Strip the leading separator the engine puts in front of names
pub fn display_name(raw: &str) -> String {
    raw.trim_start_matches('/').to_string()
}

pub fn short_id(id: &str) -> &str {
    match id.char_indices().nth(SHORT_ID_LEN) {
        Some((idx, _)) => &id[..idx],
        None => id,
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum EventKind {
    Start,
    Stop,
    Die,
    Other(String),
}

impl EventKind {
    /// Kinds forwarded to the event handler
    pub fn is_dispatched(&self) -> bool {
        matches!(self, EventKind::Start | EventKind::Stop | EventKind::Die)
    }
}

impl From<&str> for EventKind {
    fn from(s: &str) -> Self {
        match s {
            "start" => EventKind::Start,
            "stop" => EventKind::Stop,
            "die" => EventKind::Die,
            other => EventKind::Other(other.to_string()),
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventKind::Start => write!(f, "start"),
            EventKind::Stop => write!(f, "stop"),
            EventKind::Die => write!(f, "die"),
            EventKind::Other(action) => write!(f, "{}", action),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LifecycleEvent {
    pub container_id: String,
    pub container_name: String,
    pub kind: EventKind,
    pub time: Option<i64>,
}

impl LifecycleEvent {
    pub fn new(container_id: &str, container_name: &str, kind: EventKind) -> Self {
        Self {
            container_id: short_id(container_id).to_string(),
            container_name: display_name(container_name),
            kind,
            time: None,
        }
    }

    pub fn with_time(mut self, time: i64) -> Self {
        self.time = Some(time);
        self
    }
}

/// Which containers get a streaming worker
#[derive(Clone, Debug, Default)]
pub struct FilterPolicy {
    excluded: HashSet<String>,
    include_stopped: bool,
}

impl FilterPolicy {
    pub fn new<I, S>(excluded: I, include_stopped: bool) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            excluded: excluded.into_iter().map(Into::into).collect(),
            include_stopped,
        }
    }

    pub fn include_stopped(&self) -> bool {
        self.include_stopped
    }

    pub fn is_excluded(&self, name: &str) -> bool {
        self.excluded.contains(name)
    }

    pub fn should_monitor(&self, container: &ContainerDescriptor) -> bool {
        !self.is_excluded(&container.name)
            && (container.status == ContainerStatus::Running || self.include_stopped)
    }
}
