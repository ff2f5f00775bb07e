use async_trait::async_trait;

use crate::error::TransportError;

pub type TransportResult<T> = Result<T, TransportError>;

/// One raw message as read from the trades queue.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SourceRecord {
    pub partition: u32,
    pub offset: u64,
    pub payload: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Received {
    Record(SourceRecord),
    EndOfStream,
}

/// Ordered-per-partition, at-least-once queue consumer.
///
/// Offsets follow the "next offset to read" convention: after processing the
/// record at offset `n`, the position to persist is `n + 1`.
///
/// `receive` must be cancel safe: dropping the future before it resolves must
/// not lose a record.
#[async_trait]
pub trait TradeSource: Send {
    fn name(&self) -> &'static str;

    /// Partitions assigned to this consumer.
    fn partitions(&self) -> Vec<u32>;

    async fn receive(&mut self) -> TransportResult<Received>;

    /// Reposition `partition` so the next record read is `next_offset`.
    async fn seek(&mut self, partition: u32, next_offset: u64) -> TransportResult<()>;

    /// Tell the broker everything before `next_offset` is durably processed.
    async fn commit(&mut self, partition: u32, next_offset: u64) -> TransportResult<()>;
}

/// Best-effort publisher for serialized alerts.
#[async_trait]
pub trait AlertSink: Send + Sync {
    fn name(&self) -> &'static str;

    /// `key` is the downstream dedup key; `payload` the JSON alert message.
    async fn publish(&self, key: &str, payload: &str) -> TransportResult<()>;
}
