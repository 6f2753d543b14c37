use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::error::DonorflowResult;

/// Root application configuration. Loaded from environment variables
/// with the prefix `DONORFLOW__` and an optional TOML config file.
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    #[serde(default = "default_node_id")]
    pub node_id: String,
    #[serde(default)]
    pub metrics: MetricsConfig,
    #[serde(default)]
    pub journey: JourneyConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    #[serde(default = "default_metrics_enabled")]
    pub enabled: bool,
    #[serde(default = "default_metrics_host")]
    pub host: String,
    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

// ─── Journey Config ─────────────────────────────────────────────────────
#[derive(Debug, Clone, Deserialize)]
pub struct JourneyConfig {
    #[serde(default = "default_journey_enabled")]
    pub enabled: bool,
    /// Period of the scheduler ticker.
    #[serde(default = "default_tick_interval_secs")]
    pub tick_interval_secs: u64,
    /// Number of runs executed in parallel within one tick.
    #[serde(default = "default_worker_pool_size")]
    pub worker_pool_size: usize,
    /// Dispatch attempts per message node before the run is failed.
    #[serde(default = "default_max_dispatch_attempts")]
    pub max_dispatch_attempts: u32,
    #[serde(default = "default_retry_backoff_secs")]
    pub retry_backoff_secs: u64,
    #[serde(default = "default_max_retry_backoff_secs")]
    pub max_retry_backoff_secs: u64,
    /// Fraction of the backoff applied as random jitter (0.0 disables it).
    #[serde(default = "default_retry_jitter_ratio")]
    pub retry_jitter_ratio: f64,
    /// How long a run may sit in `processing` before the sweep reclaims it.
    #[serde(default = "default_stale_claim_timeout_secs")]
    pub stale_claim_timeout_secs: u64,
    #[serde(default = "default_max_runs_per_tick")]
    pub max_runs_per_tick: usize,
    /// Zero-delay steps a worker may chain before handing the run back.
    #[serde(default = "default_max_inline_steps")]
    pub max_inline_steps: usize,
}

// Default functions
fn default_node_id() -> String {
    "node-01".to_string()
}
fn default_metrics_enabled() -> bool {
    true
}
fn default_metrics_host() -> String {
    "0.0.0.0".to_string()
}
fn default_metrics_port() -> u16 {
    9091
}

fn default_journey_enabled() -> bool { true }
fn default_tick_interval_secs() -> u64 { 60 }
fn default_worker_pool_size() -> usize { 8 }
fn default_max_dispatch_attempts() -> u32 { 3 }
fn default_retry_backoff_secs() -> u64 { 300 }
fn default_max_retry_backoff_secs() -> u64 { 3600 }
fn default_retry_jitter_ratio() -> f64 { 0.1 }
fn default_stale_claim_timeout_secs() -> u64 { 600 }
fn default_max_runs_per_tick() -> usize { 10_000 }
fn default_max_inline_steps() -> usize { 32 }

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: default_metrics_enabled(),
            host: default_metrics_host(),
            port: default_metrics_port(),
        }
    }
}

impl Default for JourneyConfig {
    fn default() -> Self {
        Self {
            enabled: default_journey_enabled(),
            tick_interval_secs: default_tick_interval_secs(),
            worker_pool_size: default_worker_pool_size(),
            max_dispatch_attempts: default_max_dispatch_attempts(),
            retry_backoff_secs: default_retry_backoff_secs(),
            max_retry_backoff_secs: default_max_retry_backoff_secs(),
            retry_jitter_ratio: default_retry_jitter_ratio(),
            stale_claim_timeout_secs: default_stale_claim_timeout_secs(),
            max_runs_per_tick: default_max_runs_per_tick(),
            max_inline_steps: default_max_inline_steps(),
        }
    }
}

impl JourneyConfig {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs(self.tick_interval_secs.max(1))
    }

    pub fn stale_claim_timeout(&self) -> chrono::Duration {
        chrono_secs(self.stale_claim_timeout_secs)
    }

    /// Exponential backoff for the given (1-based) failed attempt, capped at
    /// `max_retry_backoff_secs`. Jitter is applied by the caller.
    pub fn retry_backoff(&self, attempt: u32) -> chrono::Duration {
        let exponent = attempt.saturating_sub(1).min(20);
        let secs = self
            .retry_backoff_secs
            .saturating_mul(1u64 << exponent)
            .min(self.max_retry_backoff_secs);
        chrono_secs(secs)
    }
}

/// Largest second count `chrono::Duration` holds.
const MAX_CHRONO_SECS: u64 = i64::MAX as u64 / 1000;

fn chrono_secs(secs: u64) -> chrono::Duration {
    chrono::Duration::seconds(secs.min(MAX_CHRONO_SECS) as i64)
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            node_id: default_node_id(),
            metrics: MetricsConfig::default(),
            journey: JourneyConfig::default(),
        }
    }
}

impl AppConfig {
    /// Load configuration from an optional TOML file overlaid with
    /// environment variables.
    pub fn load(path: Option<&Path>) -> DonorflowResult<Self> {
        let mut builder = config::Config::builder();

        if let Some(path) = path {
            builder = builder.add_source(
                config::File::from(path)
                    .format(config::FileFormat::Toml)
                    .required(true),
            );
        }

        let config = builder
            .add_source(
                config::Environment::with_prefix("DONORFLOW")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;
        Ok(config.try_deserialize()?)
    }
}
