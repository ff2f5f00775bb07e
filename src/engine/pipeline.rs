//! Wires sources, workers, the coordinator and the emitter together and
//! supervises them until every worker has finished or the run is cancelled.

use futures_util::stream::{FuturesUnordered, StreamExt};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::bus::EventBus;
use crate::config::AppConfig;
use crate::engine::checkpoint::CheckpointStore;
use crate::engine::coordinator::{WindowCoordinator, WorkerMessage};
use crate::engine::emitter::{AlertEmitter, RetryPolicy};
use crate::engine::evaluator::AnomalyEvaluator;
use crate::engine::ingress::{Ingress, ReadRetryPolicy};
use crate::engine::metrics::{MetricsSnapshot, PipelineMetrics};
use crate::engine::worker::{PartitionWorker, WorkerExit};
use crate::error::{ConfigError, PipelineError};
use crate::transport::{AlertSink, TradeSource};

#[derive(Clone, Debug, Serialize)]
pub struct PipelineReport {
    pub metrics: MetricsSnapshot,
    /// Workers that drained their sources (the rest were cancelled)
    pub drained_workers: usize,
}

pub struct Pipeline {
    config: AppConfig,
    bus: EventBus,
    metrics: Arc<PipelineMetrics>,
    cancel: CancellationToken,
}

impl Pipeline {
    pub fn new(config: AppConfig) -> Self {
        let bus = EventBus::new(config.runtime.bus_capacity);
        Self {
            config,
            bus,
            metrics: Arc::new(PipelineMetrics::new()),
            cancel: CancellationToken::new(),
        }
    }

    /// Side channel for late trades, window transitions and alert outcomes.
    pub fn bus(&self) -> EventBus {
        self.bus.clone()
    }

    pub fn metrics(&self) -> Arc<PipelineMetrics> {
        self.metrics.clone()
    }

    /// Cancelling this token stops every worker; each takes a final snapshot
    /// and queued alerts are still delivered.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Run one worker per source until they all end. Fatal errors (a worker
    /// halting, state corruption) stop the whole pipeline.
    pub async fn run(
        self,
        sources: Vec<Box<dyn TradeSource>>,
        sink: Arc<dyn AlertSink>,
    ) -> Result<PipelineReport, PipelineError> {
        let workers = sources.len();
        if workers == 0 {
            return Err(ConfigError::Invalid("at least one trade source is required".into()).into());
        }
        let config = &self.config;

        let store = config.checkpoint.path.clone().map(CheckpointStore::new);
        let restored = match &store {
            Some(store) => {
                store
                    .load_for_restore(workers, config.checkpoint.cold_start_on_corruption)
                    .await?
            }
            None => None,
        };

        let (alert_tx, alert_rx) = mpsc::channel(config.emitter.queue_size);
        let (msg_tx, msg_rx) = mpsc::channel::<WorkerMessage>(config.runtime.channel_capacity);

        let mut coordinator = WindowCoordinator::new(
            workers,
            config.allowed_lateness_ms,
            Duration::from_millis(config.checkpoint_interval_ms),
            AnomalyEvaluator::from_config(config),
            alert_tx,
            store,
            self.bus.clone(),
            self.metrics.clone(),
            self.cancel.clone(),
        );
        if let Some(checkpoint) = &restored {
            coordinator.restore(checkpoint);
        }
        let checkpointing = coordinator.checkpointing();

        let read_retry = ReadRetryPolicy {
            max_retries: config.ingress.max_read_retries,
            base_delay: Duration::from_millis(config.ingress.read_retry_base_delay_ms),
        };
        let mut partition_workers = Vec::with_capacity(workers);
        for (id, source) in sources.into_iter().enumerate() {
            let ingress = Ingress::new(
                id,
                source,
                config.dedup_window_size,
                read_retry,
                self.metrics.clone(),
            );
            let mut worker = PartitionWorker::new(
                id,
                ingress,
                config,
                msg_tx.clone(),
                coordinator.link(),
                checkpointing,
                self.bus.clone(),
                self.metrics.clone(),
                self.cancel.clone(),
            );
            if let Some(cp) = restored.as_ref().and_then(|c| c.worker(id)) {
                worker.restore(cp).await?;
            }
            partition_workers.push(worker);
        }

        let emitter = AlertEmitter::new(
            sink,
            RetryPolicy {
                max_retries: config.max_publish_retries,
                base_delay: Duration::from_millis(config.emitter.retry_base_delay_ms),
                max_delay: Duration::from_millis(config.emitter.retry_max_delay_ms),
            },
            config.emitter.dedup_capacity,
            self.metrics.clone(),
            self.bus.clone(),
        )
        .with_in_flight(coordinator.in_flight())
        .spawn(alert_rx);
        let coordinator = tokio::spawn(coordinator.run(msg_rx));

        info!(
            "🚀 [PIPELINE] Running {} worker(s), window {}ms, lateness {}ms, out-of-orderness {}ms",
            workers,
            config.window_size_ms,
            config.allowed_lateness_ms,
            config.bounded_out_of_orderness_ms
        );

        let mut running: FuturesUnordered<_> = partition_workers
            .into_iter()
            .map(|worker| {
                let id = worker.id();
                let handle = tokio::spawn(worker.run());
                async move { (id, handle.await) }
            })
            .collect();

        let mut first_error: Option<PipelineError> = None;
        let mut drained_workers = 0;
        while let Some((id, joined)) = running.next().await {
            let failure = match joined {
                Ok(Ok(WorkerExit::EndOfStream)) => {
                    drained_workers += 1;
                    None
                }
                Ok(Ok(WorkerExit::Cancelled)) => None,
                Ok(Err(e)) => Some(PipelineError::WorkerFailed {
                    worker: id,
                    reason: e.to_string(),
                }),
                Err(e) => Some(PipelineError::Join {
                    task: format!("worker {}", id),
                    reason: e.to_string(),
                }),
            };
            if let Some(failure) = failure {
                error!("❌ [PIPELINE] {}; stopping the pipeline", failure);
                // The coordinator must hear about it or it waits for a final snapshot forever.
                let _ = msg_tx
                    .send(WorkerMessage::Failed {
                        worker: id,
                        reason: failure.to_string(),
                    })
                    .await;
                self.cancel.cancel();
                first_error.get_or_insert(failure);
            }
        }
        drop(msg_tx);

        match coordinator.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                first_error.get_or_insert(e);
            }
            Err(e) => {
                first_error.get_or_insert(PipelineError::Join {
                    task: "coordinator".into(),
                    reason: e.to_string(),
                });
            }
        }

        // Coordinator is gone, so the alert queue is closed; let it drain.
        if let Err(e) = emitter.await {
            first_error.get_or_insert(PipelineError::Join {
                task: "emitter".into(),
                reason: e.to_string(),
            });
        }

        if let Some(e) = first_error {
            return Err(e);
        }

        let report = PipelineReport {
            metrics: self.metrics.snapshot(),
            drained_workers,
        };
        info!(
            "🏁 [PIPELINE] Done: {} received, {} windows, {} alerts published, {} failed",
            report.metrics.records_received,
            report.metrics.windows_done,
            report.metrics.alerts_published,
            report.metrics.publish_failures
        );
        Ok(report)
    }
}
