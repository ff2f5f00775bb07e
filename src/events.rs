use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::constants::evaluation::VOLUME_METRIC;
use crate::error::ValidationError;

/// Wire shape of one `trades.raw` message. Upstream producers also emit
/// `qty` / `ts` spellings plus `exchange`, `side` and `ingest_ts`; the
/// latter are ignored.
#[derive(Clone, Debug, Deserialize)]
pub struct RawTrade {
    pub symbol: String,
    pub price: String,
    #[serde(alias = "qty")]
    pub quantity: String,
    pub trade_id: String,
    #[serde(alias = "ts")]
    pub event_time: i64,
}

/// A validated trade. quantity > 0, price > 0, symbol upper-cased.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TradeEvent {
    pub symbol: String,
    pub price: Decimal,
    pub quantity: Decimal,
    pub event_time: i64,
    pub trade_id: String,
}

impl TradeEvent {
    /// Parse and validate a raw payload. No implicit coercion: decimals must be
    /// JSON strings and the timestamp a JSON integer.
    pub fn parse(payload: &str) -> Result<Self, ValidationError> {
        let raw: RawTrade = serde_json::from_str(payload)
            .map_err(|e| ValidationError::Malformed(e.to_string()))?;
        Self::try_from(raw)
    }
}

impl TryFrom<RawTrade> for TradeEvent {
    type Error = ValidationError;

    fn try_from(raw: RawTrade) -> Result<Self, Self::Error> {
        let symbol = raw.symbol.trim().to_uppercase();
        if symbol.is_empty() {
            return Err(ValidationError::EmptyField { field: "symbol" });
        }
        let trade_id = raw.trade_id.trim().to_string();
        if trade_id.is_empty() {
            return Err(ValidationError::EmptyField { field: "trade_id" });
        }

        let price = parse_positive("price", &symbol, &raw.price)?;
        let quantity = parse_positive("quantity", &symbol, &raw.quantity)?;

        Ok(Self {
            symbol,
            price,
            quantity,
            event_time: raw.event_time,
            trade_id,
        })
    }
}

fn parse_positive(field: &'static str, symbol: &str, raw: &str) -> Result<Decimal, ValidationError> {
    let value = Decimal::from_str(raw.trim()).map_err(|_| ValidationError::InvalidDecimal {
        field,
        value: raw.to_string(),
    })?;
    if value <= Decimal::ZERO {
        return Err(ValidationError::NonPositive {
            field,
            symbol: symbol.to_string(),
            value: raw.to_string(),
        });
    }
    Ok(value)
}

/// Identity of a window across the pipeline; (symbol, window_start) is unique.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct WindowId {
    pub symbol: String,
    pub window_start: i64,
}

impl fmt::Display for WindowId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.symbol, self.window_start)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Metric {
    Volume,
}

impl Metric {
    pub fn as_str(&self) -> &'static str {
        match self {
            Metric::Volume => VOLUME_METRIC,
        }
    }
}

impl fmt::Display for Metric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Severity {
    Warn,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Warn => "WARN",
            Severity::Critical => "CRITICAL",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Internal alert record. Checkpoints keep unacknowledged ones, so decimals
/// are stored as strings here; the wire shape is `AlertMessage`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Alert {
    pub symbol: String,
    pub window_start: i64,
    pub window_end: i64,
    pub metric_name: Metric,
    #[serde(with = "rust_decimal::serde::str")]
    pub observed_value: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub threshold: Decimal,
    pub severity: Severity,
}

impl Alert {
    /// Downstream dedup key: (symbol, window_start, metric)
    pub fn dedup_key(&self) -> AlertKey {
        AlertKey {
            symbol: self.symbol.clone(),
            window_start: self.window_start,
            metric: self.metric_name,
        }
    }

    pub fn window_id(&self) -> WindowId {
        WindowId {
            symbol: self.symbol.clone(),
            window_start: self.window_start,
        }
    }

    pub fn to_message(&self) -> AlertMessage {
        AlertMessage {
            symbol: self.symbol.clone(),
            window_start: self.window_start,
            window_end: self.window_end,
            metric: self.metric_name,
            observed_value: self.observed_value,
            threshold: self.threshold,
            severity: self.severity,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct AlertKey {
    pub symbol: String,
    pub window_start: i64,
    pub metric: Metric,
}

impl fmt::Display for AlertKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}/{}", self.symbol, self.window_start, self.metric)
    }
}

/// Wire shape of one `signals.alerts` message.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AlertMessage {
    pub symbol: String,
    pub window_start: i64,
    pub window_end: i64,
    pub metric: Metric,
    #[serde(with = "rust_decimal::serde::float")]
    pub observed_value: Decimal,
    #[serde(with = "rust_decimal::serde::float")]
    pub threshold: Decimal,
    pub severity: Severity,
}

impl AlertMessage {
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// Operational notifications broadcast on the `EventBus`. Late trades are the
/// late-event side channel; the rest let observers follow window lifecycle
/// and alert delivery without touching engine state.
#[derive(Clone, Debug)]
pub enum Event {
    LateTrade {
        worker: usize,
        trade: TradeEvent,
        horizon: i64,
    },
    WindowClosing {
        worker: usize,
        window: WindowId,
        window_end: i64,
        watermark: i64,
    },
    WindowDone {
        window: WindowId,
        alerted: bool,
    },
    AlertPublished(AlertMessage),
    AlertDegraded {
        alert: AlertMessage,
        reason: String,
    },
    CheckpointWritten {
        epoch: u64,
        windows: usize,
    },
}
