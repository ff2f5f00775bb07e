use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

/// Operator-facing health counters shared by every pipeline task.
#[derive(Debug, Default)]
pub struct PipelineMetrics {
    pub records_received: AtomicU64,
    pub events_applied: AtomicU64,
    pub dropped_invalid: AtomicU64,
    pub dropped_duplicate: AtomicU64,
    pub dropped_late: AtomicU64,
    pub read_retries: AtomicU64,
    pub windows_closing: AtomicU64,
    pub windows_done: AtomicU64,
    pub windows_skipped_done: AtomicU64,
    pub alerts_raised: AtomicU64,
    pub alerts_published: AtomicU64,
    pub alerts_deduplicated: AtomicU64,
    pub publish_retries: AtomicU64,
    pub publish_failures: AtomicU64,
    pub checkpoints_written: AtomicU64,
    pub checkpoint_failures: AtomicU64,
    late_by_symbol: DashMap<String, u64>,
}

impl PipelineMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_late(&self, symbol: &str) {
        Self::incr(&self.dropped_late);
        *self.late_by_symbol.entry(symbol.to_string()).or_insert(0) += 1;
    }

    pub fn late_for(&self, symbol: &str) -> u64 {
        self.late_by_symbol.get(symbol).map(|c| *c).unwrap_or(0)
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        MetricsSnapshot {
            records_received: load(&self.records_received),
            events_applied: load(&self.events_applied),
            dropped_invalid: load(&self.dropped_invalid),
            dropped_duplicate: load(&self.dropped_duplicate),
            dropped_late: load(&self.dropped_late),
            read_retries: load(&self.read_retries),
            windows_closing: load(&self.windows_closing),
            windows_done: load(&self.windows_done),
            windows_skipped_done: load(&self.windows_skipped_done),
            alerts_raised: load(&self.alerts_raised),
            alerts_published: load(&self.alerts_published),
            alerts_deduplicated: load(&self.alerts_deduplicated),
            publish_retries: load(&self.publish_retries),
            publish_failures: load(&self.publish_failures),
            checkpoints_written: load(&self.checkpoints_written),
            checkpoint_failures: load(&self.checkpoint_failures),
            late_by_symbol: self
                .late_by_symbol
                .iter()
                .map(|e| (e.key().clone(), *e.value()))
                .collect(),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub records_received: u64,
    pub events_applied: u64,
    pub dropped_invalid: u64,
    pub dropped_duplicate: u64,
    pub dropped_late: u64,
    pub read_retries: u64,
    pub windows_closing: u64,
    pub windows_done: u64,
    pub windows_skipped_done: u64,
    pub alerts_raised: u64,
    pub alerts_published: u64,
    pub alerts_deduplicated: u64,
    pub publish_retries: u64,
    pub publish_failures: u64,
    pub checkpoints_written: u64,
    pub checkpoint_failures: u64,
    pub late_by_symbol: BTreeMap<String, u64>,
}

impl MetricsSnapshot {
    /// Alerting has lost at least one alert since start.
    pub fn alerting_degraded(&self) -> bool {
        self.publish_failures > 0
    }
}
