//! Line-delimited JSON transports used by the binary: trades from a file or
//! stdin, alerts to a file or stdout. A file is treated as a single
//! partition whose offsets are line numbers.

use async_trait::async_trait;
use std::path::Path;
use tokio::fs::{File, OpenOptions};
use tokio::io::{self, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader, Lines};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::error::TransportError;

use super::traits::{AlertSink, Received, SourceRecord, TradeSource, TransportResult};

type LineReader = Lines<BufReader<Box<dyn io::AsyncRead + Unpin + Send>>>;

pub struct JsonlSource {
    lines: LineReader,
    next_offset: u64,
    label: String,
}

impl JsonlSource {
    pub async fn open(path: impl AsRef<Path>) -> TransportResult<Self> {
        let path = path.as_ref();
        let file = File::open(path).await.map_err(|e| TransportError::Read {
            partition: Some(0),
            reason: format!("open {}: {}", path.display(), e),
        })?;
        info!("📥 [JSONL] Reading trades from {}", path.display());
        Ok(Self::from_reader(Box::new(file), path.display().to_string()))
    }

    pub fn stdin() -> Self {
        info!("📥 [JSONL] Reading trades from stdin");
        Self::from_reader(Box::new(io::stdin()), "stdin".to_string())
    }

    pub fn from_reader(reader: Box<dyn io::AsyncRead + Unpin + Send>, label: String) -> Self {
        Self {
            lines: BufReader::new(reader).lines(),
            next_offset: 0,
            label,
        }
    }

    async fn read_line(&mut self) -> TransportResult<Option<String>> {
        self.lines.next_line().await.map_err(|e| TransportError::Read {
            partition: Some(0),
            reason: format!("{}: {}", self.label, e),
        })
    }
}

#[async_trait]
impl TradeSource for JsonlSource {
    fn name(&self) -> &'static str {
        "jsonl"
    }

    fn partitions(&self) -> Vec<u32> {
        vec![0]
    }

    async fn receive(&mut self) -> TransportResult<Received> {
        match self.read_line().await? {
            Some(payload) => {
                let offset = self.next_offset;
                self.next_offset += 1;
                Ok(Received::Record(SourceRecord {
                    partition: 0,
                    offset,
                    payload,
                }))
            }
            None => Ok(Received::EndOfStream),
        }
    }

    /// Forward-only: skips already processed lines after a restart.
    async fn seek(&mut self, partition: u32, next_offset: u64) -> TransportResult<()> {
        if partition != 0 {
            return Err(TransportError::UnknownPartition(partition));
        }
        while self.next_offset < next_offset {
            if self.read_line().await?.is_none() {
                break;
            }
            self.next_offset += 1;
        }
        debug!("[JSONL] {} positioned at line {}", self.label, self.next_offset);
        Ok(())
    }

    async fn commit(&mut self, partition: u32, next_offset: u64) -> TransportResult<()> {
        debug!("[JSONL] {} p{} processed through line {}", self.label, partition, next_offset);
        Ok(())
    }
}

pub struct JsonlAlertSink {
    writer: Mutex<Box<dyn AsyncWrite + Unpin + Send>>,
}

impl JsonlAlertSink {
    pub async fn append_to(path: impl AsRef<Path>) -> TransportResult<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| TransportError::Publish {
                    reason: format!("create {}: {}", parent.display(), e),
                })?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await
            .map_err(|e| TransportError::Publish {
                reason: format!("open {}: {}", path.display(), e),
            })?;
        info!("📤 [JSONL] Writing alerts to {}", path.display());
        Ok(Self::from_writer(Box::new(file)))
    }

    pub fn stdout() -> Self {
        Self::from_writer(Box::new(io::stdout()))
    }

    pub fn from_writer(writer: Box<dyn AsyncWrite + Unpin + Send>) -> Self {
        Self {
            writer: Mutex::new(writer),
        }
    }
}

#[async_trait]
impl AlertSink for JsonlAlertSink {
    fn name(&self) -> &'static str {
        "jsonl"
    }

    async fn publish(&self, _key: &str, payload: &str) -> TransportResult<()> {
        let mut writer = self.writer.lock().await;
        let line = format!("{}\n", payload);
        writer
            .write_all(line.as_bytes())
            .await
            .map_err(|e| TransportError::Publish { reason: e.to_string() })?;
        writer
            .flush()
            .await
            .map_err(|e| TransportError::Publish { reason: e.to_string() })
    }
}
