//! Event Ingress: raw queue records in, validated and de-duplicated
//! `TradeEvent`s out.
//!
//! Malformed records and re-delivered trade ids are dropped here and only
//! show up in metrics. Every consumed record advances the partition offset,
//! dropped or not, so a restart never re-reads garbage.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, warn};

use crate::constants::events;
use crate::engine::dedup::BoundedSet;
use crate::engine::metrics::PipelineMetrics;
use crate::error::TransportError;
use crate::events::TradeEvent;
use crate::transport::{Received, TradeSource};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Ingested {
    Event { partition: u32, event: TradeEvent },
    EndOfStream,
}

#[derive(Clone, Copy, Debug)]
pub struct ReadRetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
}

impl ReadRetryPolicy {
    fn delay_for(&self, attempt: u32) -> Duration {
        self.base_delay
            .saturating_mul(2u32.saturating_pow(attempt.saturating_sub(1)))
    }
}

pub struct Ingress {
    worker: usize,
    source: Box<dyn TradeSource>,
    recent_ids: BoundedSet<(String, String)>,
    offsets: BTreeMap<u32, u64>,
    retry: ReadRetryPolicy,
    metrics: Arc<PipelineMetrics>,
}

impl Ingress {
    pub fn new(
        worker: usize,
        source: Box<dyn TradeSource>,
        dedup_window_size: usize,
        retry: ReadRetryPolicy,
        metrics: Arc<PipelineMetrics>,
    ) -> Self {
        Self {
            worker,
            source,
            recent_ids: BoundedSet::new(dedup_window_size),
            offsets: BTreeMap::new(),
            retry,
            metrics,
        }
    }

    pub fn partitions(&self) -> Vec<u32> {
        self.source.partitions()
    }

    /// Next valid, first-seen trade, or end of stream. Blocks until one is
    /// available; cancel safe (dropping the future loses nothing).
    pub async fn receive(&mut self) -> Result<Ingested, TransportError> {
        loop {
            let record = match self.read_with_retry().await? {
                Received::Record(record) => record,
                Received::EndOfStream => return Ok(Ingested::EndOfStream),
            };

            PipelineMetrics::incr(&self.metrics.records_received);
            self.offsets.insert(record.partition, record.offset + 1);

            let event = match TradeEvent::parse(&record.payload) {
                Ok(event) => event,
                Err(e) => {
                    PipelineMetrics::incr(&self.metrics.dropped_invalid);
                    warn!(
                        event = events::EVENT_DROPPED_INVALID,
                        "⚠️ [INGRESS] w{} p{}@{} dropped: {}",
                        self.worker,
                        record.partition,
                        record.offset,
                        e
                    );
                    continue;
                }
            };

            if !self
                .recent_ids
                .insert((event.symbol.clone(), event.trade_id.clone()))
            {
                PipelineMetrics::incr(&self.metrics.dropped_duplicate);
                debug!(
                    event = events::EVENT_DROPPED_DUPLICATE,
                    "[INGRESS] w{} duplicate trade {} {}",
                    self.worker,
                    event.symbol,
                    event.trade_id
                );
                continue;
            }

            return Ok(Ingested::Event {
                partition: record.partition,
                event,
            });
        }
    }

    async fn read_with_retry(&mut self) -> Result<Received, TransportError> {
        let mut attempt = 0u32;
        loop {
            match self.source.receive().await {
                Ok(received) => return Ok(received),
                Err(e) => {
                    attempt += 1;
                    if attempt > self.retry.max_retries {
                        error!(
                            "❌ [INGRESS] w{} read failed {} times, halting: {}",
                            self.worker, attempt, e
                        );
                        return Err(TransportError::ReadBudgetExhausted {
                            attempts: attempt,
                            last: e.to_string(),
                        });
                    }
                    PipelineMetrics::incr(&self.metrics.read_retries);
                    let delay = self.retry.delay_for(attempt);
                    warn!(
                        "⚠️ [INGRESS] w{} read failed (attempt {}/{}), retrying in {:?}: {}",
                        self.worker, attempt, self.retry.max_retries, delay, e
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    /// Next offset to read per partition.
    pub fn offsets(&self) -> BTreeMap<u32, u64> {
        self.offsets.clone()
    }

    pub fn recent_ids(&self) -> Vec<(String, String)> {
        self.recent_ids.to_vec()
    }

    /// Reposition the source and reload the dedup window from a checkpoint.
    pub async fn restore(
        &mut self,
        offsets: BTreeMap<u32, u64>,
        recent_ids: Vec<(String, String)>,
    ) -> Result<(), TransportError> {
        for (partition, next_offset) in &offsets {
            self.source.seek(*partition, *next_offset).await?;
        }
        self.offsets = offsets;
        self.recent_ids.extend(recent_ids);
        Ok(())
    }

    /// Commit offsets that a durable checkpoint covers.
    pub async fn commit(&mut self, offsets: &BTreeMap<u32, u64>) -> Result<(), TransportError> {
        for (partition, next_offset) in offsets {
            self.source.commit(*partition, *next_offset).await?;
        }
        Ok(())
    }
}
