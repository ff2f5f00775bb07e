//! Tumbling windows and the per-worker Windowing Engine.
//!
//! A window is `[window_start, window_end)` with
//! `window_start = floor(event_time / size) * size`. Aggregates are folded
//! with sum/min/max only, so partials from different partitions merge in any
//! order.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::error::{LateEventError, TransitionError};
use crate::events::{TradeEvent, WindowId};

/// Floor division so negative timestamps land in the window below them.
pub fn window_start_for(event_time: i64, size_ms: i64) -> i64 {
    event_time.div_euclid(size_ms) * size_ms
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct WindowKey {
    pub symbol: String,
    pub window_start: i64,
    pub window_end: i64,
}

impl WindowKey {
    pub fn for_event(symbol: &str, event_time: i64, size_ms: i64) -> Self {
        let window_start = window_start_for(event_time, size_ms);
        Self {
            symbol: symbol.to_string(),
            window_start,
            window_end: window_start.saturating_add(size_ms),
        }
    }

    pub fn id(&self) -> WindowId {
        WindowId {
            symbol: self.symbol.clone(),
            window_start: self.window_start,
        }
    }

    /// Watermark at which this window may leave OPEN.
    pub fn closes_at(&self, allowed_lateness_ms: i64) -> i64 {
        self.window_end.saturating_add(allowed_lateness_ms)
    }

    pub fn is_closable(&self, watermark: i64, allowed_lateness_ms: i64) -> bool {
        watermark >= self.closes_at(allowed_lateness_ms)
    }
}

impl fmt::Display for WindowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}, {})", self.symbol, self.window_start, self.window_end)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowAggregate {
    pub volume_sum: Decimal,
    pub trade_count: u64,
    pub min_price: Decimal,
    pub max_price: Decimal,
    pub vwap_numerator: Decimal,
}

impl WindowAggregate {
    pub fn from_trade(trade: &TradeEvent) -> Self {
        Self {
            volume_sum: trade.quantity,
            trade_count: 1,
            min_price: trade.price,
            max_price: trade.price,
            vwap_numerator: trade.price.saturating_mul(trade.quantity),
        }
    }

    pub fn apply(&mut self, trade: &TradeEvent) {
        self.volume_sum = self.volume_sum.saturating_add(trade.quantity);
        self.trade_count += 1;
        self.min_price = self.min_price.min(trade.price);
        self.max_price = self.max_price.max(trade.price);
        self.vwap_numerator = self
            .vwap_numerator
            .saturating_add(trade.price.saturating_mul(trade.quantity));
    }

    /// Combine a partial aggregate of the same window from another worker.
    pub fn merge(&mut self, other: &WindowAggregate) {
        self.volume_sum = self.volume_sum.saturating_add(other.volume_sum);
        self.trade_count += other.trade_count;
        self.min_price = self.min_price.min(other.min_price);
        self.max_price = self.max_price.max(other.max_price);
        self.vwap_numerator = self.vwap_numerator.saturating_add(other.vwap_numerator);
    }

    pub fn vwap(&self) -> Option<Decimal> {
        if self.volume_sum.is_zero() {
            return None;
        }
        self.vwap_numerator.checked_div(self.volume_sum)
    }
}

/// A window and its aggregate outside the engine: handed off while CLOSING,
/// merged at the barrier, and written to checkpoints.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowSnapshot {
    pub key: WindowKey,
    pub aggregate: WindowAggregate,
}

/// OPEN -> CLOSING -> CLOSED -> DONE, one step at a time, never backwards.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum WindowState {
    Open,
    Closing,
    Closed,
    Done,
}

impl WindowState {
    pub fn as_str(&self) -> &'static str {
        match self {
            WindowState::Open => "OPEN",
            WindowState::Closing => "CLOSING",
            WindowState::Closed => "CLOSED",
            WindowState::Done => "DONE",
        }
    }

    fn successor(&self) -> Option<WindowState> {
        match self {
            WindowState::Open => Some(WindowState::Closing),
            WindowState::Closing => Some(WindowState::Closed),
            WindowState::Closed => Some(WindowState::Done),
            WindowState::Done => None,
        }
    }

    pub fn advance(self, next: WindowState) -> Result<WindowState, TransitionError> {
        if self.successor() == Some(next) {
            Ok(next)
        } else {
            Err(TransitionError {
                from: self.as_str(),
                to: next.as_str(),
            })
        }
    }
}

/// Owns every OPEN window of one worker. Single-threaded by construction: the
/// worker task is its only caller.
#[derive(Debug)]
pub struct WindowingEngine {
    size_ms: i64,
    allowed_lateness_ms: i64,
    watermark: Option<i64>,
    // Keyed by (window_end, symbol) so closing walks a prefix of the map.
    windows: BTreeMap<(i64, String), WindowSnapshot>,
}

impl WindowingEngine {
    pub fn new(size_ms: i64, allowed_lateness_ms: i64) -> Self {
        Self {
            size_ms,
            allowed_lateness_ms,
            watermark: None,
            windows: BTreeMap::new(),
        }
    }

    pub fn size_ms(&self) -> i64 {
        self.size_ms
    }

    pub fn allowed_lateness_ms(&self) -> i64 {
        self.allowed_lateness_ms
    }

    pub fn watermark(&self) -> Option<i64> {
        self.watermark
    }

    /// Events strictly older than this are late.
    pub fn late_horizon(&self) -> Option<i64> {
        self.watermark
            .map(|wm| wm.saturating_sub(self.allowed_lateness_ms))
    }

    /// Fold a trade into its window, creating the window on first sight.
    /// Deduplication is the caller's job.
    pub fn apply(&mut self, trade: &TradeEvent) -> Result<WindowKey, LateEventError> {
        if let Some(horizon) = self.late_horizon() {
            if trade.event_time < horizon {
                return Err(LateEventError {
                    symbol: trade.symbol.clone(),
                    trade_id: trade.trade_id.clone(),
                    event_time: trade.event_time,
                    horizon,
                });
            }
        }

        let key = WindowKey::for_event(&trade.symbol, trade.event_time, self.size_ms);
        self.windows
            .entry((key.window_end, key.symbol.clone()))
            .and_modify(|w| w.aggregate.apply(trade))
            .or_insert_with(|| WindowSnapshot {
                key: key.clone(),
                aggregate: WindowAggregate::from_trade(trade),
            });
        Ok(key)
    }

    /// Move the watermark forward (never back) and take every window that is
    /// now OPEN -> CLOSING, ordered by window_end then symbol.
    pub fn advance_watermark(&mut self, watermark: i64) -> Vec<WindowSnapshot> {
        let watermark = match self.watermark {
            Some(current) if current >= watermark => current,
            _ => watermark,
        };
        self.watermark = Some(watermark);
        self.close_ready(watermark)
    }

    fn close_ready(&mut self, watermark: i64) -> Vec<WindowSnapshot> {
        let mut closing = Vec::new();
        while let Some(entry) = self.windows.first_entry() {
            if !entry.get().key.is_closable(watermark, self.allowed_lateness_ms) {
                break;
            }
            closing.push(entry.remove());
        }
        closing
    }

    pub fn open_windows(&self) -> usize {
        self.windows.len()
    }

    pub fn get(&self, key: &WindowKey) -> Option<&WindowAggregate> {
        self.windows
            .get(&(key.window_end, key.symbol.clone()))
            .map(|w| &w.aggregate)
    }

    pub fn snapshot(&self) -> Vec<WindowSnapshot> {
        self.windows.values().cloned().collect()
    }

    /// Reinstall OPEN windows from a checkpoint. Windows already past their
    /// close point for `watermark` come straight back as CLOSING.
    pub fn restore(
        &mut self,
        windows: Vec<WindowSnapshot>,
        watermark: Option<i64>,
    ) -> Vec<WindowSnapshot> {
        self.windows.clear();
        for w in windows {
            self.windows
                .insert((w.key.window_end, w.key.symbol.clone()), w);
        }
        self.watermark = None;
        match watermark {
            Some(wm) => self.advance_watermark(wm),
            None => Vec::new(),
        }
    }
}
