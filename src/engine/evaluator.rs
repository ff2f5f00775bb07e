use rust_decimal::Decimal;
use std::collections::HashMap;

use crate::config::AppConfig;
use crate::engine::window::WindowSnapshot;
use crate::events::{Alert, Metric, Severity};

/// Threshold rule over a closed window. Pure: the same window always gives
/// the same answer, which is what makes replay after a crash safe.
#[derive(Clone, Debug)]
pub struct AnomalyEvaluator {
    default_threshold: Decimal,
    thresholds: HashMap<String, Decimal>,
    critical_ratio: Decimal,
}

impl AnomalyEvaluator {
    pub fn new(
        default_threshold: Decimal,
        thresholds: HashMap<String, Decimal>,
        critical_ratio: Decimal,
    ) -> Self {
        Self {
            default_threshold,
            thresholds: thresholds
                .into_iter()
                .map(|(symbol, t)| (symbol.to_uppercase(), t))
                .collect(),
            critical_ratio,
        }
    }

    pub fn from_config(config: &AppConfig) -> Self {
        Self::new(
            config.volume_thresholds.default,
            config.volume_thresholds.symbols.clone(),
            config.severity.critical_ratio,
        )
    }

    pub fn threshold_for(&self, symbol: &str) -> Decimal {
        self.thresholds
            .get(symbol)
            .copied()
            .unwrap_or(self.default_threshold)
    }

    /// WARN below `critical_ratio` x threshold, CRITICAL at or above it.
    pub fn severity_for(&self, observed: Decimal, threshold: Decimal) -> Severity {
        if threshold <= Decimal::ZERO {
            return Severity::Critical;
        }
        match observed.checked_div(threshold) {
            Some(ratio) if ratio < self.critical_ratio => Severity::Warn,
            _ => Severity::Critical,
        }
    }

    pub fn evaluate(&self, window: &WindowSnapshot) -> Option<Alert> {
        let threshold = self.threshold_for(&window.key.symbol);
        let observed = window.aggregate.volume_sum;
        if observed <= threshold {
            return None;
        }

        Some(Alert {
            symbol: window.key.symbol.clone(),
            window_start: window.key.window_start,
            window_end: window.key.window_end,
            metric_name: Metric::Volume,
            observed_value: observed,
            threshold,
            severity: self.severity_for(observed, threshold),
        })
    }
}
