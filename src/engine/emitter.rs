//! Alert Emitter
//!
//! Publishes alerts with bounded exponential backoff. Alerts it already
//! delivered are skipped; a failed alert is counted, announced as degraded
//! alerting and dropped so later windows keep flowing.

use dashmap::DashMap;
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::bus::EventBus;
use crate::constants::events;
use crate::engine::dedup::BoundedSet;
use crate::engine::metrics::PipelineMetrics;
use crate::error::TransportError;
use crate::events::{Alert, AlertKey, Event};
use crate::transport::AlertSink;

#[derive(Clone, Copy, Debug)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    /// base * 2^(attempt-1), capped, plus up to 25% jitter.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = 2u32.saturating_pow(attempt.saturating_sub(1));
        let delay = self.base_delay.saturating_mul(exp).min(self.max_delay);
        let jitter_ms = (delay.as_millis() as u64) / 4;
        if jitter_ms == 0 {
            return delay;
        }
        let jitter = rand::thread_rng().gen_range(0..=jitter_ms);
        delay + Duration::from_millis(jitter)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Ack {
    Published { attempts: u32 },
    Duplicate,
}

/// Alerts whose window is already DONE but which the emitter has not yet
/// acknowledged or given up on. Checkpoints carry them so a crash in between
/// re-sends them instead of losing them.
#[derive(Clone, Default)]
pub struct InFlightAlerts {
    alerts: Arc<DashMap<AlertKey, Alert>>,
    settled: Arc<Notify>,
}

impl InFlightAlerts {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn track(&self, alert: &Alert) {
        self.alerts.insert(alert.dedup_key(), alert.clone());
    }

    /// The alert was acknowledged, skipped as a duplicate or dropped after retries.
    pub fn resolve(&self, key: &AlertKey) {
        self.alerts.remove(key);
        if self.alerts.is_empty() {
            self.settled.notify_waiters();
        }
    }

    pub fn len(&self) -> usize {
        self.alerts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.alerts.is_empty()
    }

    /// Outstanding alerts in (window_start, symbol) order.
    pub fn snapshot(&self) -> Vec<Alert> {
        let mut alerts: Vec<Alert> = self.alerts.iter().map(|e| e.value().clone()).collect();
        alerts.sort_by(|a, b| (a.window_start, &a.symbol).cmp(&(b.window_start, &b.symbol)));
        alerts
    }

    /// Resolves once nothing is outstanding.
    pub async fn settled(&self) {
        loop {
            let notified = self.settled.notified();
            if self.alerts.is_empty() {
                return;
            }
            notified.await;
        }
    }
}

pub struct AlertEmitter {
    sink: Arc<dyn AlertSink>,
    policy: RetryPolicy,
    delivered: BoundedSet<AlertKey>,
    in_flight: InFlightAlerts,
    metrics: Arc<PipelineMetrics>,
    bus: EventBus,
}

impl AlertEmitter {
    pub fn new(
        sink: Arc<dyn AlertSink>,
        policy: RetryPolicy,
        dedup_capacity: usize,
        metrics: Arc<PipelineMetrics>,
        bus: EventBus,
    ) -> Self {
        Self {
            sink,
            policy,
            delivered: BoundedSet::new(dedup_capacity),
            in_flight: InFlightAlerts::new(),
            metrics,
            bus,
        }
    }

    /// Share the coordinator's outstanding-alert set; the spawned loop
    /// resolves each alert once its outcome is final.
    pub fn with_in_flight(mut self, in_flight: InFlightAlerts) -> Self {
        self.in_flight = in_flight;
        self
    }

    pub async fn publish(&mut self, alert: &Alert) -> Result<Ack, TransportError> {
        let key = alert.dedup_key();
        if self.delivered.contains(&key) {
            PipelineMetrics::incr(&self.metrics.alerts_deduplicated);
            debug!("[EMITTER] {} already delivered, skipping", key);
            return Ok(Ack::Duplicate);
        }

        let message = alert.to_message();
        let payload = message.to_json().map_err(|e| TransportError::Publish {
            reason: format!("serialize {}: {}", key, e),
        })?;
        let key_str = key.to_string();

        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match self.sink.publish(&key_str, &payload).await {
                Ok(()) => {
                    self.delivered.insert(key);
                    PipelineMetrics::incr(&self.metrics.alerts_published);
                    info!(
                        event = events::ALERT_PUBLISHED,
                        "🚨 [EMITTER] {} {} volume {} > {} ({} attempt(s))",
                        message.severity,
                        key_str,
                        message.observed_value,
                        message.threshold,
                        attempt
                    );
                    self.bus.emit(Event::AlertPublished(message));
                    return Ok(Ack::Published { attempts: attempt });
                }
                Err(e) if attempt <= self.policy.max_retries => {
                    PipelineMetrics::incr(&self.metrics.publish_retries);
                    let delay = self.policy.delay_for(attempt);
                    warn!(
                        event = events::ALERT_RETRY,
                        "⚠️ [EMITTER] {} publish failed (attempt {}/{}), retrying in {:?}: {}",
                        key_str,
                        attempt,
                        self.policy.max_retries + 1,
                        delay,
                        e
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    PipelineMetrics::incr(&self.metrics.publish_failures);
                    error!(
                        event = events::ALERT_DEGRADED,
                        "❌ [EMITTER] {} dropped after {} attempts: {}", key_str, attempt, e
                    );
                    self.bus.emit(Event::AlertDegraded {
                        alert: message,
                        reason: e.to_string(),
                    });
                    return Err(TransportError::PublishBudgetExhausted {
                        key: key_str,
                        attempts: attempt,
                        last: e.to_string(),
                    });
                }
            }
        }
    }

    /// Publish everything sent on `rx` until every sender is gone. Queued
    /// alerts are always drained before the task ends.
    pub fn spawn(mut self, mut rx: mpsc::Receiver<Alert>) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!("📤 [EMITTER] Alert emitter started (sink: {})", self.sink.name());
            while let Some(alert) = rx.recv().await {
                // Failures are already counted and announced; keep going.
                let _ = self.publish(&alert).await;
                self.in_flight.resolve(&alert.dedup_key());
            }
            info!("📤 [EMITTER] Alert queue closed, emitter stopped");
        })
    }
}
