//! Registry of running streaming tasks, keyed by container short id.
//!
//! A key is present exactly while its task executes: the check-and-insert
//! in [`TaskRegistry::try_spawn`] happens under one lock acquisition, and
//! the only removal path is a guard owned by the spawned task, which runs
//! when the task returns, panics or is aborted.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::{AbortHandle, JoinHandle};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Retry progress published by a running worker
#[derive(Debug, Default)]
pub struct TaskProgress {
    attempts: AtomicU32,
    backoff_ms: AtomicU64,
}

impl TaskProgress {
    pub fn record_failure(&self, attempts: u32, backoff: Duration) {
        self.attempts.store(attempts, Ordering::Relaxed);
        self.backoff_ms.store(backoff.as_millis() as u64, Ordering::Relaxed);
    }

    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::Relaxed)
    }

    pub fn backoff(&self) -> Duration {
        Duration::from_millis(self.backoff_ms.load(Ordering::Relaxed))
    }
}

/// What a spawned task receives from the registry
#[derive(Debug, Clone)]
pub struct TaskContext {
    pub cancel: CancellationToken,
    pub progress: Arc<TaskProgress>,
}

#[derive(Debug)]
pub struct StreamingTask {
    pub container_id: String,
    pub container_name: String,
    cancel: CancellationToken,
    progress: Arc<TaskProgress>,
    handle: JoinHandle<()>,
    started_at: Instant,
}

/// Point-in-time view of one registry entry
#[derive(Debug, Clone, PartialEq)]
pub struct TaskSnapshot {
    pub container_id: String,
    pub container_name: String,
    pub attempts: u32,
    pub backoff: Duration,
    pub uptime: Duration,
}

#[derive(Debug)]
pub struct TaskRegistry {
    tasks: Mutex<HashMap<String, StreamingTask>>,
    active: watch::Sender<usize>,
}

impl TaskRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            tasks: Mutex::new(HashMap::new()),
            active: watch::Sender::new(0),
        })
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, StreamingTask>> {
        self.tasks.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Spawn `task` under `container_id` unless an entry already exists.
    ///
    /// Returns false, without calling `task`, when the id is taken.
    pub fn try_spawn<F, Fut>(
        self: &Arc<Self>,
        container_id: &str,
        container_name: &str,
        cancel: CancellationToken,
        task: F,
    ) -> bool
    where
        F: FnOnce(TaskContext) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let mut tasks = self.lock();
        if tasks.contains_key(container_id) {
            return false;
        }

        let progress = Arc::new(TaskProgress::default());
        let context = TaskContext {
            cancel: cancel.clone(),
            progress: Arc::clone(&progress),
        };

        let guard = RemovalGuard {
            registry: Arc::clone(self),
            container_id: container_id.to_string(),
        };
        let future = task(context);
        let handle = tokio::spawn(async move {
            let _guard = guard;
            future.await;
        });

        tasks.insert(
            container_id.to_string(),
            StreamingTask {
                container_id: container_id.to_string(),
                container_name: container_name.to_string(),
                cancel,
                progress,
                handle,
                started_at: Instant::now(),
            },
        );
        self.active.send_replace(tasks.len());
        true
    }

    fn remove(&self, container_id: &str) {
        let mut tasks = self.lock();
        if let Some(task) = tasks.remove(container_id) {
            debug!(
                "Removed streaming task for {} ({}) after {:?}",
                task.container_name,
                task.container_id,
                task.started_at.elapsed()
            );
        }
        self.active.send_replace(tasks.len());
    }

    pub fn contains(&self, container_id: &str) -> bool {
        self.lock().contains_key(container_id)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn snapshot(&self) -> Vec<TaskSnapshot> {
        let mut snapshot: Vec<TaskSnapshot> = self
            .lock()
            .values()
            .map(|task| TaskSnapshot {
                container_id: task.container_id.clone(),
                container_name: task.container_name.clone(),
                attempts: task.progress.attempts(),
                backoff: task.progress.backoff(),
                uptime: task.started_at.elapsed(),
            })
            .collect();
        snapshot.sort_by(|a, b| a.container_name.cmp(&b.container_name));
        snapshot
    }

    /// Resolves once no task is registered
    pub async fn wait_empty(&self) {
        let mut active = self.active.subscribe();
        // The sender lives in self, so the channel cannot close here
        let _ = active.wait_for(|count| *count == 0).await;
    }

    /// Signal every task to stop; returns the names that were still running
    pub fn cancel_all(&self) -> Vec<String> {
        let (names, tokens): (Vec<String>, Vec<CancellationToken>) = self
            .lock()
            .values()
            .map(|task| (task.container_name.clone(), task.cancel.clone()))
            .unzip();

        for token in tokens {
            token.cancel();
        }
        names
    }

    /// Abort every task at its next suspension point
    pub fn abort_all(&self) {
        let handles: Vec<AbortHandle> = self
            .lock()
            .values()
            .map(|task| task.handle.abort_handle())
            .collect();

        for handle in handles {
            handle.abort();
        }
    }
}

struct RemovalGuard {
    registry: Arc<TaskRegistry>,
    container_id: String,
}

impl Drop for RemovalGuard {
    fn drop(&mut self) {
        self.registry.remove(&self.container_id);
    }
}
