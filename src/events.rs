//! Long-lived subscription to container lifecycle events.
//!
//! The subscriber never gives up: any open failure, read error or end of
//! stream moves it to `Reconnecting`, waits a fixed delay and subscribes
//! again. Only cancellation ends the loop.

use crate::container::LifecycleEvent;
use crate::engine::ContainerEngine;
use crate::errors::{ForwarderError, Result};
use async_trait::async_trait;
use futures::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_secs(5);
pub const DEFAULT_DISPATCH_TIMEOUT: Duration = Duration::from_secs(10);

/// Receiver of dispatched lifecycle events
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, event: LifecycleEvent);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriberState {
    Subscribing,
    Subscribed,
    Reconnecting,
    Cancelled,
}

pub struct EventSubscriber {
    engine: Arc<dyn ContainerEngine>,
    reconnect_delay: Duration,
    dispatch_timeout: Duration,
    state: watch::Sender<SubscriberState>,
}

impl EventSubscriber {
    pub fn new(engine: Arc<dyn ContainerEngine>) -> Self {
        Self {
            engine,
            reconnect_delay: DEFAULT_RECONNECT_DELAY,
            dispatch_timeout: DEFAULT_DISPATCH_TIMEOUT,
            state: watch::Sender::new(SubscriberState::Subscribing),
        }
    }

    pub fn with_reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect_delay = delay;
        self
    }

    pub fn with_dispatch_timeout(mut self, limit: Duration) -> Self {
        self.dispatch_timeout = limit;
        self
    }

    pub fn state(&self) -> SubscriberState {
        *self.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<SubscriberState> {
        self.state.subscribe()
    }

    /// Run until `cancel` fires
    pub async fn run(&self, handler: Arc<dyn EventHandler>, cancel: CancellationToken) {
        info!("Starting container event monitor");

        loop {
            self.state.send_replace(SubscriberState::Subscribing);

            let err = tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                err = self.consume(handler.as_ref()) => err,
            };

            error!("Error watching container events: {}", err);
            self.state.send_replace(SubscriberState::Reconnecting);

            tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                () = sleep(self.reconnect_delay) => {}
            }

            info!("Retrying container event monitoring...");
        }

        self.state.send_replace(SubscriberState::Cancelled);
        info!("Container event monitor stopped");
    }

    /// Consume one subscription; only returns on failure
    async fn consume(&self, handler: &dyn EventHandler) -> ForwarderError {
        let mut events = match self.engine.subscribe_events().await {
            Ok(events) => events,
            Err(e) => return e,
        };
        self.state.send_replace(SubscriberState::Subscribed);

        while let Some(item) = events.next().await {
            let event = match item {
                Ok(event) => event,
                Err(e) => return e,
            };

            if !event.kind.is_dispatched() {
                continue;
            }

            info!(
                "Container event: {} ({}) - {}",
                event.container_name, event.container_id, event.kind
            );

            if let Err(e) = self.dispatch(handler, event).await {
                error!("Error processing container event: {}", e);
            }
        }

        ForwarderError::Subscription("event stream closed".to_string())
    }

    async fn dispatch(&self, handler: &dyn EventHandler, event: LifecycleEvent) -> Result<()> {
        let container_id = event.container_id.clone();
        timeout(self.dispatch_timeout, handler.handle(event))
            .await
            .map_err(|_| ForwarderError::DispatchTimeout(self.dispatch_timeout))?;

        debug!("Dispatched event for {}", container_id);
        Ok(())
    }
}
