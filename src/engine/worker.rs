//! Partition Worker: one task per source. Owns the ingress, the windowing
//! engine and the watermark controller for its partitions; hands CLOSING
//! windows and watermark progress to the coordinator.

use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::bus::EventBus;
use crate::config::AppConfig;
use crate::constants::events;
use crate::engine::checkpoint::{WorkerCheckpoint, FINAL_EPOCH};
use crate::engine::coordinator::{CoordinatorLink, WorkerMessage};
use crate::engine::ingress::{Ingested, Ingress};
use crate::engine::metrics::PipelineMetrics;
use crate::engine::watermark::WatermarkController;
use crate::engine::window::{WindowSnapshot, WindowingEngine};
use crate::error::PipelineError;
use crate::events::{Event, TradeEvent};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WorkerExit {
    /// Every partition drained
    EndOfStream,
    Cancelled,
}

pub struct PartitionWorker {
    id: usize,
    ingress: Ingress,
    engine: WindowingEngine,
    watermarks: WatermarkController,
    tx: mpsc::Sender<WorkerMessage>,
    link: CoordinatorLink,
    checkpointing: bool,
    // Offsets captured per snapshot epoch, committed once the epoch is durable
    pending_commits: BTreeMap<u64, BTreeMap<u32, u64>>,
    reported: Option<i64>,
    restored_closing: Vec<WindowSnapshot>,
    bus: EventBus,
    metrics: Arc<PipelineMetrics>,
    cancel: CancellationToken,
}

impl PartitionWorker {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: usize,
        ingress: Ingress,
        config: &AppConfig,
        tx: mpsc::Sender<WorkerMessage>,
        link: CoordinatorLink,
        checkpointing: bool,
        bus: EventBus,
        metrics: Arc<PipelineMetrics>,
        cancel: CancellationToken,
    ) -> Self {
        let partitions = ingress.partitions();
        Self {
            id,
            engine: WindowingEngine::new(config.window_size_ms, config.allowed_lateness_ms),
            watermarks: WatermarkController::new(config.bounded_out_of_orderness_ms, &partitions),
            ingress,
            tx,
            link,
            checkpointing,
            pending_commits: BTreeMap::new(),
            reported: None,
            restored_closing: Vec::new(),
            bus,
            metrics,
            cancel,
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    /// Reposition the source and reinstall windows from a checkpoint.
    /// Windows the restored watermark already passed are announced as
    /// CLOSING when the worker starts running.
    pub async fn restore(&mut self, checkpoint: &WorkerCheckpoint) -> Result<(), PipelineError> {
        self.ingress
            .restore(checkpoint.offsets.clone(), checkpoint.recent_trade_ids.clone())
            .await?;
        let watermark = self.watermarks.restore(checkpoint.progress.clone());
        self.restored_closing = self
            .engine
            .restore(checkpoint.open_windows.clone(), watermark);
        info!(
            "♻️ [WORKER] w{} restored: offsets {:?}, watermark {:?}, {} open, {} forced CLOSING",
            self.id,
            checkpoint.offsets,
            watermark,
            self.engine.open_windows(),
            self.restored_closing.len()
        );
        Ok(())
    }

    pub async fn run(mut self) -> Result<WorkerExit, PipelineError> {
        info!(
            "🚀 [WORKER] w{} started on partitions {:?}",
            self.id,
            self.ingress.partitions()
        );

        let restored = std::mem::take(&mut self.restored_closing);
        self.hand_off(restored).await?;
        self.report_progress().await?;

        let mut epochs_open = true;
        let mut commits_open = true;
        let exit = loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break WorkerExit::Cancelled,
                changed = self.link.epochs.changed(), if epochs_open => match changed {
                    Ok(()) => {
                        let epoch = *self.link.epochs.borrow_and_update();
                        self.snapshot(epoch).await?;
                    }
                    Err(_) => epochs_open = false,
                },
                changed = self.link.committed.changed(), if commits_open => match changed {
                    Ok(()) => {
                        let committed = *self.link.committed.borrow_and_update();
                        self.commit_through(committed).await;
                    }
                    Err(_) => commits_open = false,
                },
                received = self.ingress.receive() => match received? {
                    Ingested::Event { partition, event } => self.on_event(partition, event).await?,
                    Ingested::EndOfStream => {
                        self.on_end_of_stream().await?;
                        break WorkerExit::EndOfStream;
                    }
                },
            }
        };

        self.snapshot(FINAL_EPOCH).await?;
        if self.checkpointing && commits_open {
            self.await_final_commit().await;
        }
        info!(
            "🛑 [WORKER] w{} stopped ({:?}), {} windows still open",
            self.id,
            exit,
            self.engine.open_windows()
        );
        Ok(exit)
    }

    async fn on_event(&mut self, partition: u32, event: TradeEvent) -> Result<(), PipelineError> {
        let event_time = event.event_time;
        match self.engine.apply(&event) {
            Ok(key) => {
                PipelineMetrics::incr(&self.metrics.events_applied);
                trace!("[WORKER] w{} {} += {} ({})", self.id, key, event.quantity, event.trade_id);
            }
            Err(late) => {
                self.metrics.record_late(&event.symbol);
                debug!(event = events::EVENT_DROPPED_LATE, "[WORKER] w{} {}", self.id, late);
                self.bus.emit(Event::LateTrade {
                    worker: self.id,
                    trade: event,
                    horizon: late.horizon,
                });
            }
        }

        if let Some(watermark) = self.watermarks.observe(partition, event_time) {
            self.advance(watermark).await?;
        }
        Ok(())
    }

    async fn on_end_of_stream(&mut self) -> Result<(), PipelineError> {
        info!("🏁 [WORKER] w{} reached end of stream, flushing", self.id);
        // A source without partitions has no watermark of its own; flush anyway.
        let watermark = self.watermarks.finish_all().unwrap_or(i64::MAX);
        self.advance(watermark).await
    }

    async fn advance(&mut self, watermark: i64) -> Result<(), PipelineError> {
        let closing = self.engine.advance_watermark(watermark);
        self.hand_off(closing).await?;
        self.report_progress().await
    }

    async fn hand_off(&mut self, windows: Vec<WindowSnapshot>) -> Result<(), PipelineError> {
        if windows.is_empty() {
            return Ok(());
        }
        let watermark = self.engine.watermark().unwrap_or(i64::MIN);
        for window in &windows {
            PipelineMetrics::incr(&self.metrics.windows_closing);
            debug!(
                event = events::WINDOW_CLOSING,
                "[WORKER] w{} {} CLOSING at watermark {} (volume {})",
                self.id,
                window.key,
                watermark,
                window.aggregate.volume_sum
            );
            self.bus.emit(Event::WindowClosing {
                worker: self.id,
                window: window.key.id(),
                window_end: window.key.window_end,
                watermark,
            });
        }
        self.send(WorkerMessage::Closing {
            worker: self.id,
            windows,
        })
        .await
    }

    async fn report_progress(&mut self) -> Result<(), PipelineError> {
        let Some(watermark) = self.engine.watermark() else {
            return Ok(());
        };
        if self.reported == Some(watermark) {
            return Ok(());
        }
        self.reported = Some(watermark);
        self.send(WorkerMessage::Progress {
            worker: self.id,
            watermark,
        })
        .await
    }

    async fn snapshot(&mut self, epoch: u64) -> Result<(), PipelineError> {
        let offsets = self.ingress.offsets();
        let checkpoint = WorkerCheckpoint {
            worker_id: self.id,
            offsets: offsets.clone(),
            progress: self.watermarks.snapshot(),
            open_windows: self.engine.snapshot(),
            handed_off: Vec::new(),
            recent_trade_ids: self.ingress.recent_ids(),
        };
        if self.checkpointing {
            self.pending_commits.insert(epoch, offsets);
        }
        debug!(
            "[WORKER] w{} snapshot for epoch {} ({} open windows)",
            self.id,
            epoch,
            checkpoint.open_windows.len()
        );
        self.send(WorkerMessage::Snapshot { epoch, checkpoint }).await
    }

    /// Commit the newest offsets covered by a durable checkpoint.
    async fn commit_through(&mut self, committed: u64) {
        let mut newest = None;
        while let Some(entry) = self.pending_commits.first_entry() {
            if *entry.key() > committed {
                break;
            }
            newest = Some(entry.remove());
        }
        let Some(offsets) = newest else {
            return;
        };
        match self.ingress.commit(&offsets).await {
            Ok(()) => debug!("[WORKER] w{} committed {:?}", self.id, offsets),
            Err(e) => warn!("⚠️ [WORKER] w{} offset commit failed: {}", self.id, e),
        }
    }

    /// Wait until the final checkpoint is durable (or the coordinator gave up)
    /// before committing the last offsets.
    async fn await_final_commit(&mut self) {
        loop {
            let committed = *self.link.committed.borrow_and_update();
            if committed == FINAL_EPOCH {
                self.commit_through(FINAL_EPOCH).await;
                return;
            }
            if self.link.committed.changed().await.is_err() {
                return;
            }
        }
    }

    async fn send(&mut self, msg: WorkerMessage) -> Result<(), PipelineError> {
        self.tx
            .send(msg)
            .await
            .map_err(|_| PipelineError::ChannelClosed("coordinator"))
    }
}
