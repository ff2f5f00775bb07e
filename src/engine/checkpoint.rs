//! State Checkpoint/Recovery
//!
//! A checkpoint is one JSON document: per worker the partition offsets and
//! progress, OPEN windows and the CLOSING partials already handed to the
//! coordinator, plus the recently finished window ids and the alerts of
//! finished windows the sink has not acknowledged yet. It is written to a
//! temp file and renamed into place.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{info, warn};
use uuid::Uuid;

use crate::constants::checkpoint::FORMAT_VERSION;
use crate::engine::watermark::PartitionProgress;
use crate::engine::window::WindowSnapshot;
use crate::error::{PipelineError, StateCorruptionError};
use crate::events::{Alert, WindowId};

/// Epoch used for the snapshot a worker takes on its way out.
pub const FINAL_EPOCH: u64 = u64::MAX;

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerCheckpoint {
    pub worker_id: usize,
    /// Next offset to read per partition
    pub offsets: BTreeMap<u32, u64>,
    pub progress: BTreeMap<u32, PartitionProgress>,
    pub open_windows: Vec<WindowSnapshot>,
    /// CLOSING partials the coordinator holds for this worker
    #[serde(default)]
    pub handed_off: Vec<WindowSnapshot>,
    #[serde(default)]
    pub recent_trade_ids: Vec<(String, String)>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub version: u32,
    pub checkpoint_id: Uuid,
    pub epoch: u64,
    pub created_at: DateTime<Utc>,
    pub workers: Vec<WorkerCheckpoint>,
    #[serde(default)]
    pub done_windows: Vec<WindowId>,
    /// Re-sent on restore; their windows are already in `done_windows`
    #[serde(default)]
    pub pending_alerts: Vec<Alert>,
}

impl Checkpoint {
    pub fn new(epoch: u64, mut workers: Vec<WorkerCheckpoint>, done_windows: Vec<WindowId>) -> Self {
        workers.sort_by_key(|w| w.worker_id);
        Self {
            version: FORMAT_VERSION,
            checkpoint_id: Uuid::new_v4(),
            epoch,
            created_at: Utc::now(),
            workers,
            done_windows,
            pending_alerts: Vec::new(),
        }
    }

    pub fn window_count(&self) -> usize {
        self.workers
            .iter()
            .map(|w| w.open_windows.len() + w.handed_off.len())
            .sum()
    }

    pub fn worker(&self, worker_id: usize) -> Option<&WorkerCheckpoint> {
        self.workers.iter().find(|w| w.worker_id == worker_id)
    }

    /// Reject documents this build cannot restore faithfully.
    pub fn validate(&self, workers: usize) -> Result<(), StateCorruptionError> {
        if self.version != FORMAT_VERSION {
            return Err(StateCorruptionError::Version {
                found: self.version,
                expected: FORMAT_VERSION,
            });
        }
        let mut ids: Vec<usize> = self.workers.iter().map(|w| w.worker_id).collect();
        ids.sort_unstable();
        ids.dedup();
        if ids.len() != workers
            || self.workers.len() != workers
            || ids.iter().any(|id| *id >= workers)
        {
            return Err(StateCorruptionError::WorkerMismatch {
                found: ids.len(),
                expected: workers,
            });
        }
        Ok(())
    }
}

#[derive(Clone, Debug)]
pub struct CheckpointStore {
    path: PathBuf,
}

impl CheckpointStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn save(&self, checkpoint: &Checkpoint) -> Result<(), PipelineError> {
        let write_err = |e: &dyn std::fmt::Display| {
            PipelineError::CheckpointWrite(format!("{}: {}", self.path.display(), e))
        };

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|e| write_err(&e))?;
            }
        }

        let bytes = serde_json::to_vec_pretty(checkpoint).map_err(|e| write_err(&e))?;
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, bytes).await.map_err(|e| write_err(&e))?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .map_err(|e| write_err(&e))?;
        Ok(())
    }

    /// `Ok(None)` when no checkpoint exists yet (cold start).
    pub async fn load(&self) -> Result<Option<Checkpoint>, StateCorruptionError> {
        let bytes = match tokio::fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!("[CHECKPOINT] No checkpoint at {}, cold start", self.path.display());
                return Ok(None);
            }
            Err(source) => {
                return Err(StateCorruptionError::Io {
                    path: self.path.display().to_string(),
                    source,
                })
            }
        };

        let checkpoint: Checkpoint =
            serde_json::from_slice(&bytes).map_err(|source| StateCorruptionError::Deserialize {
                path: self.path.display().to_string(),
                source,
            })?;
        info!(
            "♻️ [CHECKPOINT] Loaded epoch {} ({}) with {} windows",
            checkpoint.epoch,
            checkpoint.checkpoint_id,
            checkpoint.window_count()
        );
        Ok(Some(checkpoint))
    }

    /// Load and validate; on corruption either fail or, when allowed, start
    /// cold from the live offsets.
    pub async fn load_for_restore(
        &self,
        workers: usize,
        cold_start_on_corruption: bool,
    ) -> Result<Option<Checkpoint>, StateCorruptionError> {
        let loaded = self
            .load()
            .await
            .and_then(|cp| match cp {
                Some(cp) => cp.validate(workers).map(|_| Some(cp)),
                None => Ok(None),
            });

        match loaded {
            Err(e) if cold_start_on_corruption => {
                warn!(
                    "❌ [CHECKPOINT] {} is corrupt ({}); cold start from live offsets, in-flight windows are lost",
                    self.path.display(),
                    e
                );
                Ok(None)
            }
            other => other,
        }
    }
}
