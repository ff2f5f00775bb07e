//! Stream-processing core: ingress, windowing, watermarks, the cross-worker
//! merge barrier, evaluation, alert emission and checkpoints.

pub mod checkpoint;
pub mod coordinator;
pub mod dedup;
pub mod emitter;
pub mod evaluator;
pub mod ingress;
pub mod metrics;
pub mod pipeline;
pub mod watermark;
pub mod window;
pub mod worker;

pub use checkpoint::{Checkpoint, CheckpointStore, WorkerCheckpoint};
pub use emitter::{Ack, AlertEmitter, InFlightAlerts, RetryPolicy};
pub use evaluator::AnomalyEvaluator;
pub use metrics::{MetricsSnapshot, PipelineMetrics};
pub use pipeline::{Pipeline, PipelineReport};
pub use window::{WindowAggregate, WindowKey, WindowSnapshot, WindowState, WindowingEngine};
