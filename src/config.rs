use rust_decimal::Decimal;
use serde::Deserialize;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tracing::info;

use crate::constants::{checkpoint, emitter, evaluation, ingress, runtime, windowing};
use crate::error::ConfigError;

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct ThresholdConfig {
    /// Used for any symbol without an override
    pub default: Decimal,
    pub symbols: HashMap<String, Decimal>,
}

impl Default for ThresholdConfig {
    fn default() -> Self {
        Self {
            default: Decimal::from(evaluation::DEFAULT_VOLUME_THRESHOLD),
            symbols: HashMap::new(),
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct SeverityConfig {
    /// observed / threshold at or above which the alert is CRITICAL
    pub critical_ratio: Decimal,
}

impl Default for SeverityConfig {
    fn default() -> Self {
        Self {
            critical_ratio: Decimal::from(evaluation::DEFAULT_CRITICAL_RATIO),
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct IngressConfig {
    pub max_read_retries: u32,
    pub read_retry_base_delay_ms: u64,
}

impl Default for IngressConfig {
    fn default() -> Self {
        Self {
            max_read_retries: ingress::DEFAULT_MAX_READ_RETRIES,
            read_retry_base_delay_ms: ingress::READ_RETRY_BASE_DELAY_MS,
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct EmitterConfig {
    pub retry_base_delay_ms: u64,
    pub retry_max_delay_ms: u64,
    pub dedup_capacity: usize,
    pub queue_size: usize,
}

impl Default for EmitterConfig {
    fn default() -> Self {
        Self {
            retry_base_delay_ms: emitter::RETRY_BASE_DELAY_MS,
            retry_max_delay_ms: emitter::RETRY_MAX_DELAY_MS,
            dedup_capacity: emitter::DEFAULT_DEDUP_CAPACITY,
            queue_size: emitter::DEFAULT_QUEUE_SIZE,
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct CheckpointConfig {
    /// `None` disables checkpointing entirely
    pub path: Option<PathBuf>,
    /// Start from the live offset when the checkpoint is corrupt instead of halting
    pub cold_start_on_corruption: bool,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            path: Some(PathBuf::from(checkpoint::DEFAULT_PATH)),
            cold_start_on_corruption: false,
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub workers: usize,
    pub channel_capacity: usize,
    pub bus_capacity: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            workers: runtime::DEFAULT_WORKERS,
            channel_capacity: runtime::DEFAULT_CHANNEL_CAPACITY,
            bus_capacity: runtime::DEFAULT_BUS_CAPACITY,
        }
    }
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// JSONL trade file; stdin when unset
    pub input: Option<PathBuf>,
    /// JSONL alert file; stdout when unset
    pub output: Option<PathBuf>,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub window_size_ms: i64,
    pub allowed_lateness_ms: i64,
    pub bounded_out_of_orderness_ms: i64,
    pub volume_thresholds: ThresholdConfig,
    pub checkpoint_interval_ms: u64,
    pub max_publish_retries: u32,
    pub dedup_window_size: usize,

    pub severity: SeverityConfig,
    pub ingress: IngressConfig,
    pub emitter: EmitterConfig,
    pub checkpoint: CheckpointConfig,
    pub runtime: RuntimeConfig,
    pub transport: TransportConfig,

    /// Status API bind address, e.g. "0.0.0.0:3000"; disabled when unset
    pub http_bind: Option<String>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            window_size_ms: windowing::DEFAULT_WINDOW_SIZE_MS,
            allowed_lateness_ms: windowing::DEFAULT_ALLOWED_LATENESS_MS,
            bounded_out_of_orderness_ms: windowing::DEFAULT_BOUNDED_OUT_OF_ORDERNESS_MS,
            volume_thresholds: ThresholdConfig::default(),
            checkpoint_interval_ms: checkpoint::DEFAULT_INTERVAL_MS,
            max_publish_retries: emitter::DEFAULT_MAX_PUBLISH_RETRIES,
            dedup_window_size: ingress::DEFAULT_DEDUP_WINDOW_SIZE,
            severity: SeverityConfig::default(),
            ingress: IngressConfig::default(),
            emitter: EmitterConfig::default(),
            checkpoint: CheckpointConfig::default(),
            runtime: RuntimeConfig::default(),
            transport: TransportConfig::default(),
            http_bind: None,
        }
    }
}

impl AppConfig {
    /// Load `.env`, then the YAML file (`TRADEWATCH_CONFIG` or `config.yaml`),
    /// then environment overrides. A missing file means built-in defaults.
    pub fn load() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();

        let config_path = std::env::var("TRADEWATCH_CONFIG")
            .unwrap_or_else(|_| runtime::DEFAULT_CONFIG_PATH.to_string());

        let mut config = if Path::new(&config_path).exists() {
            Self::load_from(&config_path)?
        } else {
            info!("No config file at {}, using defaults", config_path);
            Self::default()
        };

        config.apply_env(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn load_from(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;

        // Strip BOM if present
        let content = content.strip_prefix('\u{feff}').unwrap_or(&content);

        serde_yaml::from_str(content).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })
    }

    pub fn from_yaml_str(yaml: &str) -> Result<Self, ConfigError> {
        let config: AppConfig = serde_yaml::from_str(yaml).map_err(|source| ConfigError::Parse {
            path: "<inline>".to_string(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Apply overrides for the options operators tune most. `lookup` is the
    /// environment in production and a map in tests.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        override_from(&lookup, "WINDOW_SIZE_MS", &mut self.window_size_ms)?;
        override_from(&lookup, "ALLOWED_LATENESS_MS", &mut self.allowed_lateness_ms)?;
        override_from(
            &lookup,
            "BOUNDED_OUT_OF_ORDERNESS_MS",
            &mut self.bounded_out_of_orderness_ms,
        )?;
        override_from(
            &lookup,
            "DEFAULT_VOLUME_THRESHOLD",
            &mut self.volume_thresholds.default,
        )?;
        override_from(&lookup, "CHECKPOINT_INTERVAL_MS", &mut self.checkpoint_interval_ms)?;
        override_from(&lookup, "MAX_PUBLISH_RETRIES", &mut self.max_publish_retries)?;
        override_from(&lookup, "DEDUP_WINDOW_SIZE", &mut self.dedup_window_size)?;
        override_from(&lookup, "WORKERS", &mut self.runtime.workers)?;

        if let Some(path) = lookup("CHECKPOINT_PATH") {
            self.checkpoint.path = if path.is_empty() {
                None
            } else {
                Some(PathBuf::from(path))
            };
        }
        if let Some(bind) = lookup("HTTP_BIND") {
            self.http_bind = Some(bind).filter(|b| !b.is_empty());
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.window_size_ms <= 0 {
            return Err(ConfigError::Invalid(format!(
                "window_size_ms must be positive, got {}",
                self.window_size_ms
            )));
        }
        if self.allowed_lateness_ms < 0 {
            return Err(ConfigError::Invalid(format!(
                "allowed_lateness_ms must not be negative, got {}",
                self.allowed_lateness_ms
            )));
        }
        if self.bounded_out_of_orderness_ms < 0 {
            return Err(ConfigError::Invalid(format!(
                "bounded_out_of_orderness_ms must not be negative, got {}",
                self.bounded_out_of_orderness_ms
            )));
        }
        if self.dedup_window_size == 0 {
            return Err(ConfigError::Invalid("dedup_window_size must be at least 1".into()));
        }
        if self.runtime.workers == 0 {
            return Err(ConfigError::Invalid("runtime.workers must be at least 1".into()));
        }
        if self.checkpoint_interval_ms == 0 {
            return Err(ConfigError::Invalid("checkpoint_interval_ms must be positive".into()));
        }
        if self.severity.critical_ratio <= Decimal::ONE {
            return Err(ConfigError::Invalid(format!(
                "severity.critical_ratio must be greater than 1, got {}",
                self.severity.critical_ratio
            )));
        }
        if self.emitter.queue_size == 0 || self.runtime.channel_capacity == 0 {
            return Err(ConfigError::Invalid("channel sizes must be at least 1".into()));
        }
        Ok(())
    }
}

fn override_from<F, T>(lookup: &F, key: &str, target: &mut T) -> Result<(), ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    if let Some(raw) = lookup(key) {
        *target = raw.trim().parse().map_err(|_| ConfigError::Env {
            key: key.to_string(),
            value: raw.clone(),
        })?;
    }
    Ok(())
}
