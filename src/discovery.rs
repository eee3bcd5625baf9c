//! Startup discovery of the containers that should be streamed

use crate::container::{ContainerDescriptor, FilterPolicy};
use crate::engine::ContainerEngine;
use std::sync::Arc;
use tracing::{debug, error, info};

pub struct Discovery {
    engine: Arc<dyn ContainerEngine>,
    policy: FilterPolicy,
}

impl Discovery {
    pub fn new(engine: Arc<dyn ContainerEngine>, policy: FilterPolicy) -> Self {
        Self { engine, policy }
    }

    /// Containers passing the filter, in engine order. Engine failures
    /// yield an empty list.
    pub async fn list_monitored(&self) -> Vec<ContainerDescriptor> {
        let containers = match self.engine.list_containers(self.policy.include_stopped()).await {
            Ok(containers) => containers,
            Err(e) => {
                error!("Failed to list containers: {}", e);
                return Vec::new();
            }
        };

        let total = containers.len();
        let monitored: Vec<ContainerDescriptor> = containers
            .into_iter()
            .filter(|container| {
                let keep = self.policy.should_monitor(container);
                if !keep {
                    debug!(
                        "Skipping container: {} (status: {}, excluded: {})",
                        container.name,
                        container.status,
                        self.policy.is_excluded(&container.name)
                    );
                }
                keep
            })
            .collect();

        info!(
            "Found {} containers to monitor out of {} total",
            monitored.len(),
            total
        );
        for container in &monitored {
            info!("Will monitor container: {}", container.name);
        }

        monitored
    }
}
