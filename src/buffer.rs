//! In-memory buffering for telemetry records awaiting transmission

use crate::telemetry::TelemetryRecord;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::RwLock;
use tracing::{debug, warn};

/// Bounded record buffer that drops the oldest entry on overflow
#[derive(Debug)]
pub struct RecordBuffer {
    records: RwLock<VecDeque<TelemetryRecord>>,
    max_size: usize,
    batch_size: usize,
    dropped: AtomicU64,
}

impl RecordBuffer {
    pub fn new(max_size: usize, batch_size: usize) -> Self {
        Self {
            records: RwLock::new(VecDeque::new()),
            max_size,
            batch_size,
            dropped: AtomicU64::new(0),
        }
    }

    /// Add a record, evicting the oldest one when full
    pub async fn push(&self, record: TelemetryRecord) {
        let mut records = self.records.write().await;

        if records.len() >= self.max_size {
            records.pop_front();
            let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
            if dropped.is_power_of_two() {
                warn!("Record buffer overflow, {} records dropped so far", dropped);
            }
        }

        records.push_back(record);
    }

    /// Take at most one batch worth of records
    pub async fn drain_batch(&self) -> Option<Vec<TelemetryRecord>> {
        let mut records = self.records.write().await;

        let count = std::cmp::min(self.batch_size, records.len());
        if count == 0 {
            return None;
        }

        let batch: Vec<TelemetryRecord> = records.drain(..count).collect();
        debug!("Drained batch of {} records, {} remaining", batch.len(), records.len());
        Some(batch)
    }

    /// Put a batch back at the front, keeping the size bound
    pub async fn requeue(&self, batch: Vec<TelemetryRecord>) {
        let mut records = self.records.write().await;

        for record in batch.into_iter().rev() {
            if records.len() >= self.max_size {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                continue;
            }
            records.push_front(record);
        }
    }

    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Buffer utilization as a percentage
    pub async fn utilization(&self) -> f64 {
        (self.len().await as f64 / self.max_size as f64) * 100.0
    }
}
