//! Custom error types for the stream-processing core
//!
//! Validation and lateness errors are recovered locally (counted, never
//! propagated past the worker). Transport errors are retried before they
//! escalate. State corruption is always surfaced.

use thiserror::Error;

/// A raw trade record that could not become a `TradeEvent`.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ValidationError {
    #[error("Malformed payload: {0}")]
    Malformed(String),

    #[error("Missing or empty field: {field}")]
    EmptyField { field: &'static str },

    #[error("Invalid decimal in {field}: {value:?}")]
    InvalidDecimal { field: &'static str, value: String },

    #[error("Non-positive {field} for {symbol}: {value}")]
    NonPositive {
        field: &'static str,
        symbol: String,
        value: String,
    },
}

/// Event older than the allowed-lateness horizon of its worker.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("Late event {trade_id} for {symbol}: event_time {event_time} < horizon {horizon}")]
pub struct LateEventError {
    pub symbol: String,
    pub trade_id: String,
    pub event_time: i64,
    pub horizon: i64,
}

/// Failures at the queue boundary (ingress reads or alert publishes).
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TransportError {
    #[error("Read failed on partition {partition:?}: {reason}")]
    Read {
        partition: Option<u32>,
        reason: String,
    },

    #[error("Ingress gave up after {attempts} attempts: {last}")]
    ReadBudgetExhausted { attempts: u32, last: String },

    #[error("Publish failed: {reason}")]
    Publish { reason: String },

    #[error("Publish of {key} gave up after {attempts} attempts: {last}")]
    PublishBudgetExhausted {
        key: String,
        attempts: u32,
        last: String,
    },

    #[error("Commit failed on partition {partition}: {reason}")]
    Commit { partition: u32, reason: String },

    #[error("Unknown partition {0}")]
    UnknownPartition(u32),
}

/// A checkpoint that exists but cannot be trusted.
#[derive(Error, Debug)]
pub enum StateCorruptionError {
    #[error("Checkpoint {path} is unreadable: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Checkpoint {path} failed to deserialize: {source}")]
    Deserialize {
        path: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("Checkpoint version {found} is not supported (expected {expected})")]
    Version { found: u32, expected: u32 },

    #[error("Checkpoint was written by {found} workers, pipeline has {expected}")]
    WorkerMismatch { found: usize, expected: usize },
}

/// Window lifecycle violated (backwards or skipped transition).
#[derive(Error, Debug, Clone, PartialEq)]
#[error("Illegal window transition {from} -> {to}")]
pub struct TransitionError {
    pub from: &'static str,
    pub to: &'static str,
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("Invalid environment override {key}={value}")]
    Env { key: String, value: String },

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Top-level pipeline errors
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("State corruption: {0}")]
    StateCorruption(#[from] StateCorruptionError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Window lifecycle error: {0}")]
    Lifecycle(#[from] TransitionError),

    #[error("Checkpoint write failed: {0}")]
    CheckpointWrite(String),

    #[error("Task {task} panicked or was aborted: {reason}")]
    Join { task: String, reason: String },

    #[error("Channel to {0} closed")]
    ChannelClosed(&'static str),

    #[error("Worker {worker} failed: {reason}")]
    WorkerFailed { worker: usize, reason: String },
}

impl PipelineError {
    /// True when the error must stop the process rather than degrade it.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, PipelineError::CheckpointWrite(_))
    }
}
