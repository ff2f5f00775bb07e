//! In-process partitioned topic and alert sink.
//!
//! Behaves like a broker topic: append-only per-partition logs, consumer
//! positions, committed offsets, and an explicit end-of-stream. Tests use
//! the failure injection hooks to exercise retry paths.

use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, Notify};
use tracing::debug;

use crate::error::TransportError;

use super::traits::{AlertSink, Received, SourceRecord, TradeSource, TransportResult};

/// Injected failure budget; `u32::MAX` means fail forever.
#[derive(Default)]
struct FailureBudget(AtomicU32);

impl FailureBudget {
    fn set(&self, count: u32) {
        self.0.store(count, Ordering::SeqCst);
    }

    fn take(&self) -> bool {
        self.0
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| match n {
                0 => None,
                u32::MAX => Some(u32::MAX),
                n => Some(n - 1),
            })
            .is_ok()
    }
}

struct TopicInner {
    name: String,
    partition_count: u32,
    logs: DashMap<u32, Vec<String>>,
    committed: DashMap<u32, u64>,
    closed: AtomicBool,
    notify: Notify,
    read_failures: FailureBudget,
}

#[derive(Clone)]
pub struct MemoryTopic {
    inner: Arc<TopicInner>,
}

impl MemoryTopic {
    pub fn new(name: impl Into<String>, partitions: u32) -> Self {
        let logs = DashMap::new();
        for p in 0..partitions {
            logs.insert(p, Vec::new());
        }
        Self {
            inner: Arc::new(TopicInner {
                name: name.into(),
                partition_count: partitions,
                logs,
                committed: DashMap::new(),
                closed: AtomicBool::new(false),
                notify: Notify::new(),
                read_failures: FailureBudget::default(),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn partition_count(&self) -> u32 {
        self.inner.partition_count
    }

    /// Append to a partition, returning the record's offset.
    pub fn append(&self, partition: u32, payload: impl Into<String>) -> TransportResult<u64> {
        let offset = {
            let mut log = self
                .inner
                .logs
                .get_mut(&partition)
                .ok_or(TransportError::UnknownPartition(partition))?;
            log.push(payload.into());
            (log.len() - 1) as u64
        };
        self.inner.notify.notify_waiters();
        Ok(offset)
    }

    /// Partition by key hash, the way the upstream producers key by symbol.
    pub fn append_keyed(&self, key: &str, payload: impl Into<String>) -> TransportResult<(u32, u64)> {
        let partition = self.partition_for(key);
        let offset = self.append(partition, payload)?;
        Ok((partition, offset))
    }

    pub fn partition_for(&self, key: &str) -> u32 {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        (hasher.finish() % u64::from(self.inner.partition_count.max(1))) as u32
    }

    pub fn len(&self, partition: u32) -> usize {
        self.inner.logs.get(&partition).map(|l| l.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.inner.logs.iter().all(|l| l.is_empty())
    }

    /// No more records will be appended; consumers see EndOfStream once drained.
    pub fn close(&self) {
        self.inner.closed.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    pub fn committed(&self, partition: u32) -> Option<u64> {
        self.inner.committed.get(&partition).map(|c| *c)
    }

    /// Make the next `count` reads (across all consumers) fail.
    pub fn fail_next_reads(&self, count: u32) {
        self.inner.read_failures.set(count);
    }

    /// Consumer for the given partitions, starting at their committed offsets.
    pub fn consumer(&self, partitions: Vec<u32>) -> MemoryConsumer {
        let positions = partitions
            .iter()
            .map(|p| (*p, self.committed(*p).unwrap_or(0)))
            .collect();
        MemoryConsumer {
            topic: self.clone(),
            partitions,
            positions,
            cursor: 0,
        }
    }
}

pub struct MemoryConsumer {
    topic: MemoryTopic,
    partitions: Vec<u32>,
    positions: HashMap<u32, u64>,
    cursor: usize,
}

impl MemoryConsumer {
    fn try_next(&mut self) -> Option<SourceRecord> {
        let n = self.partitions.len();
        for step in 0..n {
            let idx = (self.cursor + step) % n;
            let partition = self.partitions[idx];
            let position = self.positions.get(&partition).copied().unwrap_or(0);
            let payload = self
                .topic
                .inner
                .logs
                .get(&partition)
                .and_then(|log| log.get(position as usize).cloned());

            if let Some(payload) = payload {
                self.positions.insert(partition, position + 1);
                self.cursor = (idx + 1) % n;
                return Some(SourceRecord {
                    partition,
                    offset: position,
                    payload,
                });
            }
        }
        None
    }
}

#[async_trait]
impl TradeSource for MemoryConsumer {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn partitions(&self) -> Vec<u32> {
        self.partitions.clone()
    }

    async fn receive(&mut self) -> TransportResult<Received> {
        if self.topic.inner.read_failures.take() {
            return Err(TransportError::Read {
                partition: None,
                reason: "injected read failure".to_string(),
            });
        }

        let inner = self.topic.inner.clone();
        loop {
            let notified = inner.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            // Read the flag first: anything appended before close is visible below.
            let closed = inner.closed.load(Ordering::SeqCst);
            if let Some(record) = self.try_next() {
                return Ok(Received::Record(record));
            }
            if closed {
                return Ok(Received::EndOfStream);
            }

            notified.await;
        }
    }

    async fn seek(&mut self, partition: u32, next_offset: u64) -> TransportResult<()> {
        if !self.partitions.contains(&partition) {
            return Err(TransportError::UnknownPartition(partition));
        }
        self.positions.insert(partition, next_offset);
        Ok(())
    }

    async fn commit(&mut self, partition: u32, next_offset: u64) -> TransportResult<()> {
        if !self.partitions.contains(&partition) {
            return Err(TransportError::Commit {
                partition,
                reason: "partition not assigned to this consumer".to_string(),
            });
        }
        debug!("[MEMORY] {} p{} committed {}", self.topic.name(), partition, next_offset);
        self.topic.inner.committed.insert(partition, next_offset);
        Ok(())
    }
}

/// Collects published alerts in order.
#[derive(Clone, Default)]
pub struct MemoryAlertSink {
    published: Arc<Mutex<Vec<(String, String)>>>,
    failures: Arc<FailureBudget>,
    attempts: Arc<AtomicU32>,
}

impl MemoryAlertSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `count` publishes fail.
    pub fn fail_next(&self, count: u32) {
        self.failures.set(count);
    }

    pub fn fail_always(&self) {
        self.failures.set(u32::MAX);
    }

    pub fn recover(&self) {
        self.failures.set(0);
    }

    /// Total publish calls, including failed ones.
    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }

    pub async fn published(&self) -> Vec<(String, String)> {
        self.published.lock().await.clone()
    }

    pub async fn payloads(&self) -> Vec<String> {
        self.published
            .lock()
            .await
            .iter()
            .map(|(_, payload)| payload.clone())
            .collect()
    }
}

#[async_trait]
impl AlertSink for MemoryAlertSink {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn publish(&self, key: &str, payload: &str) -> TransportResult<()> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if self.failures.take() {
            return Err(TransportError::Publish {
                reason: "injected publish failure".to_string(),
            });
        }
        self.published
            .lock()
            .await
            .push((key.to_string(), payload.to_string()));
        Ok(())
    }
}
