//! Application-wide constants and default tunables
//!
//! Centralizes the values the config layer falls back to, so the YAML file
//! and the tests agree on what "default" means.

/// Queue topic names used by the upstream producers and downstream consumers
pub mod topics {
    pub const TRADES_RAW: &str = "trades.raw";
    pub const SIGNALS_ALERTS: &str = "signals.alerts";
}

/// Windowing and watermark defaults
pub mod windowing {
    /// Tumbling window size (10 seconds)
    pub const DEFAULT_WINDOW_SIZE_MS: i64 = 10_000;

    /// Grace period after window_end during which late events are still applied
    pub const DEFAULT_ALLOWED_LATENESS_MS: i64 = 0;

    /// Worst-case disorder assumed between producers (matches the 5s watermark delay upstream)
    pub const DEFAULT_BOUNDED_OUT_OF_ORDERNESS_MS: i64 = 5_000;
}

/// Anomaly rule defaults
pub mod evaluation {
    /// Volume threshold used when a symbol has no override
    pub const DEFAULT_VOLUME_THRESHOLD: i64 = 100;

    /// observed / threshold ratio at which an alert becomes CRITICAL
    pub const DEFAULT_CRITICAL_RATIO: i64 = 2;

    pub const VOLUME_METRIC: &str = "volume";
}

/// Ingress defaults
pub mod ingress {
    /// Recent trade ids remembered per worker for re-delivery dedup
    pub const DEFAULT_DEDUP_WINDOW_SIZE: usize = 100_000;

    /// Consecutive read failures tolerated before the worker halts
    pub const DEFAULT_MAX_READ_RETRIES: u32 = 5;

    /// Base delay for read retry backoff
    pub const READ_RETRY_BASE_DELAY_MS: u64 = 100;
}

/// Alert emitter defaults
pub mod emitter {
    pub const DEFAULT_MAX_PUBLISH_RETRIES: u32 = 5;

    /// Exponential backoff base (doubles per attempt)
    pub const RETRY_BASE_DELAY_MS: u64 = 100;

    /// Backoff ceiling
    pub const RETRY_MAX_DELAY_MS: u64 = 10_000;

    /// Acknowledged alert keys remembered for publish dedup
    pub const DEFAULT_DEDUP_CAPACITY: usize = 10_000;

    pub const DEFAULT_QUEUE_SIZE: usize = 1_024;
}

/// Checkpoint defaults
pub mod checkpoint {
    pub const DEFAULT_INTERVAL_MS: u64 = 30_000;
    pub const DEFAULT_PATH: &str = "./data/checkpoint.json";
    pub const FORMAT_VERSION: u32 = 1;

    /// DONE window ids carried across restarts
    pub const DONE_HISTORY_CAPACITY: usize = 10_000;
}

/// Runtime defaults
pub mod runtime {
    pub const DEFAULT_WORKERS: usize = 1;
    pub const DEFAULT_CHANNEL_CAPACITY: usize = 4_096;
    pub const DEFAULT_BUS_CAPACITY: usize = 1_024;
    pub const DEFAULT_CONFIG_PATH: &str = "config.yaml";
}

/// Logging event names for structured logging
pub mod events {
    pub const EVENT_DROPPED_INVALID: &str = "event_dropped_invalid";
    pub const EVENT_DROPPED_DUPLICATE: &str = "event_dropped_duplicate";
    pub const EVENT_DROPPED_LATE: &str = "event_dropped_late";
    pub const WINDOW_CLOSING: &str = "window_closing";
    pub const WINDOW_DONE: &str = "window_done";
    pub const ALERT_PUBLISHED: &str = "alert_published";
    pub const ALERT_RETRY: &str = "alert_retry";
    pub const ALERT_DEGRADED: &str = "alert_degraded";
    pub const CHECKPOINT_WRITTEN: &str = "checkpoint_written";
}
