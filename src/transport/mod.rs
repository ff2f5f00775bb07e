pub mod traits;

pub mod jsonl;
pub mod memory;

pub use traits::{AlertSink, Received, SourceRecord, TradeSource, TransportResult};
