//! Watermark Controller
//!
//! Per partition: watermark = max event_time seen - bounded_out_of_orderness.
//! The worker's watermark is the minimum over its partitions, so a lagging
//! partition holds windows open instead of letting them close early. A
//! partition with no events yet leaves the watermark undefined.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::warn;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionProgress {
    pub max_event_time: Option<i64>,
    /// End of stream reached; the partition no longer holds anything back.
    pub finished: bool,
}

#[derive(Debug)]
pub struct WatermarkController {
    bounded_out_of_orderness_ms: i64,
    partitions: BTreeMap<u32, PartitionProgress>,
    // Highest overall watermark handed out; guards monotonicity.
    emitted: Option<i64>,
}

impl WatermarkController {
    pub fn new(bounded_out_of_orderness_ms: i64, partitions: &[u32]) -> Self {
        Self {
            bounded_out_of_orderness_ms,
            partitions: partitions
                .iter()
                .map(|p| (*p, PartitionProgress::default()))
                .collect(),
            emitted: None,
        }
    }

    pub fn partition_watermark(&self, partition: u32) -> Option<i64> {
        self.partitions.get(&partition).and_then(|p| self.watermark_of(p))
    }

    fn watermark_of(&self, progress: &PartitionProgress) -> Option<i64> {
        if progress.finished {
            return Some(i64::MAX);
        }
        progress
            .max_event_time
            .map(|t| t.saturating_sub(self.bounded_out_of_orderness_ms))
    }

    /// Overall watermark; never lower than a value returned before.
    pub fn current(&self) -> Option<i64> {
        self.emitted
    }

    fn recompute(&mut self) -> Option<i64> {
        let mut overall: Option<i64> = None;
        for progress in self.partitions.values() {
            let wm = self.watermark_of(progress)?;
            overall = Some(overall.map_or(wm, |o| o.min(wm)));
        }
        let overall = overall?;

        match self.emitted {
            Some(previous) if previous >= overall => None,
            _ => {
                self.emitted = Some(overall);
                Some(overall)
            }
        }
    }

    /// Record an event time. Returns the new overall watermark when it moved.
    pub fn observe(&mut self, partition: u32, event_time: i64) -> Option<i64> {
        let progress = self.partitions.entry(partition).or_insert_with(|| {
            warn!("[WATERMARK] Event from unassigned partition {}, tracking it", partition);
            PartitionProgress::default()
        });
        match progress.max_event_time {
            Some(max) if max >= event_time => return None,
            _ => progress.max_event_time = Some(event_time),
        }
        self.recompute()
    }

    /// Partition hit end of stream.
    pub fn finish(&mut self, partition: u32) -> Option<i64> {
        self.partitions.entry(partition).or_default().finished = true;
        self.recompute()
    }

    pub fn finish_all(&mut self) -> Option<i64> {
        for progress in self.partitions.values_mut() {
            progress.finished = true;
        }
        self.recompute()
    }

    pub fn snapshot(&self) -> BTreeMap<u32, PartitionProgress> {
        self.partitions.clone()
    }

    pub fn restore(&mut self, progress: BTreeMap<u32, PartitionProgress>) -> Option<i64> {
        for (partition, p) in progress {
            self.partitions.insert(partition, p);
        }
        self.emitted = None;
        self.recompute()
    }
}
