use crate::events::Event;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Broadcast side channel for operational events (late trades, window
/// lifecycle, alert delivery, checkpoints). Engine correctness never depends
/// on anyone listening.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<Event>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }

    /// Fire-and-forget publish; returns how many subscribers saw the event.
    pub fn emit(&self, event: Event) -> usize {
        self.tx.send(event).unwrap_or(0)
    }

    /// Log late trades until the bus closes. A logger that falls behind skips
    /// ahead and keeps going. Resolves to the number of late trades logged.
    pub fn log_late_trades(&self) -> JoinHandle<u64> {
        let mut rx = self.subscribe();
        tokio::spawn(async move {
            let mut logged = 0;
            loop {
                match rx.recv().await {
                    Ok(Event::LateTrade { trade, horizon, .. }) => {
                        logged += 1;
                        info!(
                            "⏰ [LATE] {} {} at {} behind horizon {}",
                            trade.symbol, trade.trade_id, trade.event_time, horizon
                        );
                    }
                    Ok(_) => {}
                    Err(RecvError::Lagged(skipped)) => {
                        warn!("⚠️ [LATE] Logger lagged, {} bus events skipped", skipped);
                    }
                    Err(RecvError::Closed) => break,
                }
            }
            logged
        })
    }
}
