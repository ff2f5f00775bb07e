//! Window Coordinator: the cross-worker merge barrier.
//!
//! Workers hand off CLOSING partials and report their watermark over one
//! ordered channel each. A window becomes CLOSED only when every worker's
//! watermark has reached `window_end + allowed_lateness`; its partials are
//! then merged, evaluated once, and marked DONE.
//!
//! Checkpoints ride the same channels: the coordinator bumps an epoch, each
//! worker answers with its snapshot, and because that snapshot arrives after
//! everything the worker handed off before it, the coordinator can attach
//! exactly the partials that belong to that cut.
//!
//! Alerts are handed to the emitter without waiting: when its queue is full
//! they wait in a local backlog, so a slow or failing sink never stalls the
//! barrier. Alerts not yet acknowledged are written into every checkpoint.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::bus::EventBus;
use crate::constants::{checkpoint::DONE_HISTORY_CAPACITY, events};
use crate::engine::checkpoint::{Checkpoint, CheckpointStore, WorkerCheckpoint, FINAL_EPOCH};
use crate::engine::dedup::BoundedSet;
use crate::engine::emitter::InFlightAlerts;
use crate::engine::evaluator::AnomalyEvaluator;
use crate::engine::metrics::PipelineMetrics;
use crate::engine::window::{WindowAggregate, WindowKey, WindowSnapshot, WindowState};
use crate::error::PipelineError;
use crate::events::{Alert, Event, WindowId};

#[derive(Clone, Debug)]
pub enum WorkerMessage {
    Closing {
        worker: usize,
        windows: Vec<WindowSnapshot>,
    },
    Progress {
        worker: usize,
        watermark: i64,
    },
    Snapshot {
        epoch: u64,
        checkpoint: WorkerCheckpoint,
    },
    Failed {
        worker: usize,
        reason: String,
    },
}

/// Receivers a worker needs to follow checkpoint epochs.
#[derive(Clone, Debug)]
pub struct CoordinatorLink {
    /// Epoch the coordinator wants a snapshot for
    pub epochs: watch::Receiver<u64>,
    /// Highest epoch durably written
    pub committed: watch::Receiver<u64>,
}

#[derive(Debug)]
struct PendingWindow {
    key: WindowKey,
    state: WindowState,
    partials: BTreeMap<usize, WindowAggregate>,
}

pub struct WindowCoordinator {
    workers: usize,
    allowed_lateness_ms: i64,
    evaluator: AnomalyEvaluator,
    worker_watermarks: Vec<Option<i64>>,
    pending: BTreeMap<(i64, WindowId), PendingWindow>,
    done: BoundedSet<WindowId>,
    alert_tx: mpsc::Sender<Alert>,
    backlog: VecDeque<Alert>,
    in_flight: InFlightAlerts,
    store: Option<CheckpointStore>,
    checkpoint_interval: Duration,
    epoch: u64,
    epoch_tx: watch::Sender<u64>,
    committed_tx: watch::Sender<u64>,
    assemblies: BTreeMap<u64, BTreeMap<usize, WorkerCheckpoint>>,
    finals: BTreeMap<usize, WorkerCheckpoint>,
    failed: BTreeSet<usize>,
    bus: EventBus,
    metrics: Arc<PipelineMetrics>,
    cancel: CancellationToken,
}

impl WindowCoordinator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        workers: usize,
        allowed_lateness_ms: i64,
        checkpoint_interval: Duration,
        evaluator: AnomalyEvaluator,
        alert_tx: mpsc::Sender<Alert>,
        store: Option<CheckpointStore>,
        bus: EventBus,
        metrics: Arc<PipelineMetrics>,
        cancel: CancellationToken,
    ) -> Self {
        let (epoch_tx, _) = watch::channel(0);
        let (committed_tx, _) = watch::channel(0);
        Self {
            workers,
            allowed_lateness_ms,
            evaluator,
            worker_watermarks: vec![None; workers],
            pending: BTreeMap::new(),
            done: BoundedSet::new(DONE_HISTORY_CAPACITY),
            alert_tx,
            backlog: VecDeque::new(),
            in_flight: InFlightAlerts::new(),
            store,
            checkpoint_interval,
            epoch: 0,
            epoch_tx,
            committed_tx,
            assemblies: BTreeMap::new(),
            finals: BTreeMap::new(),
            failed: BTreeSet::new(),
            bus,
            metrics,
            cancel,
        }
    }

    pub fn link(&self) -> CoordinatorLink {
        CoordinatorLink {
            epochs: self.epoch_tx.subscribe(),
            committed: self.committed_tx.subscribe(),
        }
    }

    /// Outstanding alerts; the emitter resolves them.
    pub fn in_flight(&self) -> InFlightAlerts {
        self.in_flight.clone()
    }

    pub fn checkpointing(&self) -> bool {
        self.store.is_some()
    }

    /// Reinstall handed-off partials and the DONE history. Call before `link`
    /// so workers start from the restored epoch.
    pub fn restore(&mut self, checkpoint: &Checkpoint) {
        self.epoch = checkpoint.epoch;
        self.epoch_tx.send_replace(checkpoint.epoch);
        self.committed_tx.send_replace(checkpoint.epoch);
        self.done.extend(checkpoint.done_windows.iter().cloned());
        for worker in &checkpoint.workers {
            for partial in &worker.handed_off {
                self.add_partial(worker.worker_id, partial.clone());
            }
        }
        for alert in &checkpoint.pending_alerts {
            self.in_flight.track(alert);
            self.backlog.push_back(alert.clone());
        }
        info!(
            "♻️ [COORD] Restored epoch {}: {} CLOSING windows, {} done, {} alerts to re-send",
            self.epoch,
            self.pending.len(),
            self.done.len(),
            self.backlog.len()
        );
    }

    pub async fn run(mut self, mut rx: mpsc::Receiver<WorkerMessage>) -> Result<(), PipelineError> {
        let result = self.run_loop(&mut rx).await;
        if let Err(e) = &result {
            error!("❌ [COORD] Coordinator failed: {}", e);
            self.cancel.cancel();
        }
        result
    }

    async fn run_loop(&mut self, rx: &mut mpsc::Receiver<WorkerMessage>) -> Result<(), PipelineError> {
        let mut ticker = tokio::time::interval(self.checkpoint_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // First tick fires immediately
        ticker.tick().await;

        info!(
            "🧮 [COORD] Coordinator started ({} workers, checkpoints {})",
            self.workers,
            self.store
                .as_ref()
                .map(|s| s.path().display().to_string())
                .unwrap_or_else(|| "disabled".to_string())
        );

        let checkpointing = self.checkpointing();
        let alert_tx = self.alert_tx.clone();
        while !self.all_finished() {
            tokio::select! {
                msg = rx.recv() => match msg {
                    Some(msg) => self.handle(msg).await?,
                    None => {
                        warn!("[COORD] All workers gone without a final snapshot");
                        break;
                    }
                },
                permit = alert_tx.reserve(), if !self.backlog.is_empty() => match permit {
                    Ok(permit) => {
                        if let Some(alert) = self.backlog.pop_front() {
                            permit.send(alert);
                        }
                    }
                    Err(_) => self.emitter_gone(),
                },
                _ = ticker.tick(), if checkpointing => self.request_checkpoint(),
            }
        }

        self.finish().await;
        Ok(())
    }

    async fn handle(&mut self, msg: WorkerMessage) -> Result<(), PipelineError> {
        match msg {
            WorkerMessage::Closing { worker, windows } => {
                for window in windows {
                    self.add_partial(worker, window);
                }
            }
            WorkerMessage::Progress { worker, watermark } => {
                if let Some(slot) = self.worker_watermarks.get_mut(worker) {
                    *slot = Some(slot.map_or(watermark, |w| w.max(watermark)));
                }
                self.release().await?;
            }
            WorkerMessage::Snapshot { epoch, mut checkpoint } => {
                let worker = checkpoint.worker_id;
                checkpoint.handed_off = self.partials_of(worker);
                if epoch == FINAL_EPOCH {
                    self.finals.insert(worker, checkpoint);
                } else {
                    self.assemblies
                        .entry(epoch)
                        .or_default()
                        .insert(worker, checkpoint);
                }
                self.complete_assemblies().await;
            }
            WorkerMessage::Failed { worker, reason } => {
                error!("❌ [COORD] Worker {} failed: {}", worker, reason);
                self.failed.insert(worker);
            }
        }
        Ok(())
    }

    fn add_partial(&mut self, worker: usize, window: WindowSnapshot) {
        let id = window.key.id();
        if self.done.contains(&id) {
            PipelineMetrics::incr(&self.metrics.windows_skipped_done);
            info!("[COORD] {} already DONE, ignoring replayed partial from w{}", id, worker);
            return;
        }

        let pending = self
            .pending
            .entry((window.key.window_end, id))
            .or_insert_with(|| PendingWindow {
                key: window.key.clone(),
                state: WindowState::Closing,
                partials: BTreeMap::new(),
            });
        pending
            .partials
            .entry(worker)
            .and_modify(|agg| agg.merge(&window.aggregate))
            .or_insert(window.aggregate);
    }

    fn partials_of(&self, worker: usize) -> Vec<WindowSnapshot> {
        self.pending
            .values()
            .filter_map(|p| {
                p.partials.get(&worker).map(|agg| WindowSnapshot {
                    key: p.key.clone(),
                    aggregate: agg.clone(),
                })
            })
            .collect()
    }

    /// Minimum watermark over all workers; undefined until every worker reported.
    pub fn global_watermark(&self) -> Option<i64> {
        self.worker_watermarks
            .iter()
            .try_fold(i64::MAX, |acc, wm| wm.map(|w| acc.min(w)))
    }

    async fn release(&mut self) -> Result<(), PipelineError> {
        let Some(global) = self.global_watermark() else {
            return Ok(());
        };
        while let Some(entry) = self.pending.first_entry() {
            if !entry.get().key.is_closable(global, self.allowed_lateness_ms) {
                break;
            }
            let window = entry.remove();
            self.finalize(window).await?;
        }
        Ok(())
    }

    async fn finalize(&mut self, mut window: PendingWindow) -> Result<(), PipelineError> {
        let id = window.key.id();
        if self.done.contains(&id) {
            PipelineMetrics::incr(&self.metrics.windows_skipped_done);
            return Ok(());
        }
        window.state = window.state.advance(WindowState::Closed)?;

        let mut partials = window.partials.into_values();
        let Some(mut aggregate) = partials.next() else {
            return Ok(());
        };
        for partial in partials {
            aggregate.merge(&partial);
        }
        let closed = WindowSnapshot {
            key: window.key,
            aggregate,
        };

        let alert = self.evaluator.evaluate(&closed);
        let alerted = alert.is_some();
        if let Some(alert) = alert {
            PipelineMetrics::incr(&self.metrics.alerts_raised);
            self.in_flight.track(&alert);
            self.dispatch(alert);
        }

        window.state = window.state.advance(WindowState::Done)?;
        self.done.insert(id.clone());
        PipelineMetrics::incr(&self.metrics.windows_done);
        debug!(
            event = events::WINDOW_DONE,
            "[COORD] {} {} trades={} volume={} vwap={:?} alert={}",
            closed.key,
            window.state.as_str(),
            closed.aggregate.trade_count,
            closed.aggregate.volume_sum,
            closed.aggregate.vwap(),
            alerted
        );
        self.bus.emit(Event::WindowDone { window: id, alerted });
        Ok(())
    }

    /// Queue without waiting; order is kept by never jumping the backlog.
    fn dispatch(&mut self, alert: Alert) {
        if !self.backlog.is_empty() {
            self.backlog.push_back(alert);
            return;
        }
        match self.alert_tx.try_send(alert) {
            Ok(()) => {}
            Err(TrySendError::Full(alert)) => {
                debug!("[COORD] Emitter queue full, holding alert for {}", alert.window_id());
                self.backlog.push_back(alert);
            }
            Err(TrySendError::Closed(alert)) => {
                self.backlog.push_back(alert);
                self.emitter_gone();
            }
        }
    }

    /// Held alerts stay in flight, so the next checkpoint still carries them.
    fn emitter_gone(&mut self) {
        error!(
            "❌ [COORD] Emitter is gone, {} alert(s) left for the next restore",
            self.backlog.len()
        );
        self.backlog.clear();
    }

    /// Hand every held alert to the emitter; false if it is gone.
    async fn flush_backlog(&mut self) -> bool {
        for alert in std::mem::take(&mut self.backlog) {
            if self.alert_tx.send(alert).await.is_err() {
                error!("❌ [COORD] Emitter is gone while draining alerts");
                return false;
            }
        }
        true
    }

    /// Wait until the emitter settled every alert, so the final checkpoint
    /// does not re-send what was delivered.
    async fn await_settled(&self) {
        if self.in_flight.is_empty() {
            return;
        }
        info!("📤 [COORD] Waiting for {} alert(s) to settle", self.in_flight.len());
        tokio::select! {
            _ = self.in_flight.settled() => {}
            _ = self.alert_tx.closed() => {
                warn!("[COORD] Emitter stopped with {} alert(s) unsettled", self.in_flight.len());
            }
        }
    }

    fn request_checkpoint(&mut self) {
        self.epoch += 1;
        debug!("[COORD] Requesting checkpoint epoch {}", self.epoch);
        self.epoch_tx.send_replace(self.epoch);
    }

    fn contributors(&self) -> usize {
        self.finals
            .keys()
            .chain(self.failed.iter())
            .collect::<BTreeSet<_>>()
            .len()
    }

    fn all_finished(&self) -> bool {
        self.contributors() >= self.workers
    }

    /// Write every epoch for which each worker has answered (a worker that
    /// already left contributes its final snapshot).
    async fn complete_assemblies(&mut self) {
        if !self.failed.is_empty() {
            return;
        }
        let ready: Vec<u64> = self
            .assemblies
            .iter()
            .filter(|(_, parts)| {
                (0..self.workers).all(|w| parts.contains_key(&w) || self.finals.contains_key(&w))
            })
            .map(|(epoch, _)| *epoch)
            .collect();

        let Some(latest) = ready.last().copied() else {
            return;
        };
        let mut parts = self.assemblies.remove(&latest).unwrap_or_default();
        self.assemblies.retain(|epoch, _| *epoch > latest);
        self.epoch = self.epoch.max(latest);

        for (worker, final_cp) in &self.finals {
            parts.entry(*worker).or_insert_with(|| final_cp.clone());
        }
        if self.write_checkpoint(latest, parts.into_values().collect()).await {
            self.committed_tx.send_replace(latest);
        }
    }

    async fn write_checkpoint(&self, epoch: u64, workers: Vec<WorkerCheckpoint>) -> bool {
        let Some(store) = &self.store else {
            return false;
        };
        let mut checkpoint = Checkpoint::new(epoch, workers, self.done.to_vec());
        checkpoint.pending_alerts = self.in_flight.snapshot();
        let windows = checkpoint.window_count();
        match store.save(&checkpoint).await {
            Ok(()) => {
                PipelineMetrics::incr(&self.metrics.checkpoints_written);
                info!(
                    event = events::CHECKPOINT_WRITTEN,
                    "💾 [CHECKPOINT] Epoch {} written ({} windows) to {}",
                    epoch,
                    windows,
                    store.path().display()
                );
                self.bus.emit(Event::CheckpointWritten { epoch, windows });
                true
            }
            Err(e) => {
                PipelineMetrics::incr(&self.metrics.checkpoint_failures);
                error!("❌ [CHECKPOINT] Epoch {} failed: {}", epoch, e);
                false
            }
        }
    }

    async fn finish(&mut self) {
        let final_checkpoint =
            self.failed.is_empty() && self.checkpointing() && self.finals.len() == self.workers;
        if self.flush_backlog().await && final_checkpoint {
            self.await_settled().await;
        }
        if !self.failed.is_empty() {
            warn!(
                "[COORD] {} worker(s) failed; keeping the last good checkpoint",
                self.failed.len()
            );
            return;
        }
        if final_checkpoint {
            let epoch = self.epoch + 1;
            let parts = std::mem::take(&mut self.finals).into_values().collect();
            if self.write_checkpoint(epoch, parts).await {
                self.committed_tx.send_replace(FINAL_EPOCH);
            }
        }
        if !self.pending.is_empty() {
            info!(
                "[COORD] Stopping with {} CLOSING windows still behind the barrier",
                self.pending.len()
            );
        }
    }
}
