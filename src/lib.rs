//! TradeWatch - trade-window volume anomaly detection
//!
//! This library provides the streaming core: trade ingestion, event-time
//! tumbling windows with watermarks, a cross-worker merge barrier, threshold
//! evaluation, alert publishing and checkpoint/restore.

pub mod api;
pub mod bus;
pub mod config;
pub mod constants;
pub mod engine;
pub mod error;
pub mod events;
pub mod transport;

// Re-export commonly used types
pub use bus::EventBus;
pub use config::AppConfig;
pub use engine::{Pipeline, PipelineReport};
pub use error::PipelineError;
pub use events::{Alert, AlertMessage, Event, Severity, TradeEvent};

#[cfg(test)]
mod events_tests;
