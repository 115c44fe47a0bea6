//! Configuration management for Warden.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Result, WardenError};
use crate::ratelimit::{CoordinatorSettings, FailMode, TieBreak};

/// Environment variable prefix, e.g. `WARDEN__ENGINE__FAIL_MODE=closed`.
pub const ENV_PREFIX: &str = "WARDEN";

/// Main configuration for the Warden engine.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WardenConfig {
    #[serde(default)]
    pub engine: EngineConfig,

    #[serde(default)]
    pub policies: PoliciesConfig,

    #[serde(default)]
    pub store: StoreConfig,

    #[serde(default)]
    pub feedback: FeedbackConfig,

    #[serde(default)]
    pub violations: ViolationsConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Decision coordinator configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Decision when the counter store is unavailable
    #[serde(default)]
    pub fail_mode: FailMode,

    /// Deadline for one counter store operation
    #[serde(default = "default_check_timeout")]
    pub check_timeout_ms: u64,

    /// Retry hint returned by fail-closed denials
    #[serde(default = "default_fail_closed_retry_after")]
    pub fail_closed_retry_after_ms: u64,

    /// Maximum random jitter added to the fail-closed retry hint
    #[serde(default = "default_fail_closed_jitter")]
    pub fail_closed_retry_jitter_ms: u64,

    /// Winner between policies of equal priority and scope
    #[serde(default)]
    pub tie_break: TieBreak,

    /// Stamped on violation events
    #[serde(default = "Uuid::new_v4")]
    pub instance_id: Uuid,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            fail_mode: FailMode::default(),
            check_timeout_ms: default_check_timeout(),
            fail_closed_retry_after_ms: default_fail_closed_retry_after(),
            fail_closed_retry_jitter_ms: default_fail_closed_jitter(),
            tie_break: TieBreak::default(),
            instance_id: Uuid::new_v4(),
        }
    }
}

fn default_check_timeout() -> u64 {
    50
}

fn default_fail_closed_retry_after() -> u64 {
    1000
}

fn default_fail_closed_jitter() -> u64 {
    250
}

/// Policy feed configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoliciesConfig {
    /// YAML policy file
    pub path: Option<PathBuf>,

    /// How long a fetched policy snapshot may be used before refreshing
    #[serde(default = "default_max_staleness")]
    pub max_staleness_ms: u64,

    /// How long a check waits on a policy refresh before using the previous snapshot
    #[serde(default = "default_refresh_timeout")]
    pub refresh_timeout_ms: u64,
}

impl Default for PoliciesConfig {
    fn default() -> Self {
        Self {
            path: None,
            max_staleness_ms: default_max_staleness(),
            refresh_timeout_ms: default_refresh_timeout(),
        }
    }
}

fn default_max_staleness() -> u64 {
    2000
}

fn default_refresh_timeout() -> u64 {
    100
}

/// Counter store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Interval between expired-state sweeps
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            sweep_interval_ms: default_sweep_interval(),
        }
    }
}

fn default_sweep_interval() -> u64 {
    1000
}

/// Adaptive load feedback configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedbackConfig {
    /// EWMA weight of a new load report, 1.0 disables smoothing
    #[serde(default = "default_smoothing")]
    pub smoothing: f64,

    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,

    /// Concurrent checks that count as full load, 0 disables sampling
    #[serde(default)]
    pub inflight_capacity: usize,
}

impl Default for FeedbackConfig {
    fn default() -> Self {
        Self {
            smoothing: default_smoothing(),
            poll_interval_ms: default_poll_interval(),
            inflight_capacity: 0,
        }
    }
}

fn default_smoothing() -> f64 {
    1.0
}

fn default_poll_interval() -> u64 {
    500
}

/// Violation event delivery configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ViolationsConfig {
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
}

impl Default for ViolationsConfig {
    fn default() -> Self {
        Self {
            channel_capacity: default_channel_capacity(),
        }
    }
}

fn default_channel_capacity() -> usize {
    1024
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default filter directive, `RUST_LOG` takes precedence
    #[serde(default = "default_log_level")]
    pub level: String,

    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

impl WardenConfig {
    /// Load configuration from an optional YAML file overlaid with
    /// `WARDEN__SECTION__KEY` environment variables.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(
                config::File::from(path)
                    .format(config::FileFormat::Yaml)
                    .required(true),
            );
        }
        let config = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__"),
            )
            .build()
            .map_err(|e| WardenError::Config(e.to_string()))?;

        let config: WardenConfig = config
            .try_deserialize()
            .map_err(|e| WardenError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from YAML text, without environment overrides.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: WardenConfig =
            serde_yaml::from_str(yaml).map_err(|e| WardenError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.engine.check_timeout_ms == 0 {
            return Err(WardenError::Config(
                "engine.check_timeout_ms must be positive".to_string(),
            ));
        }
        if self.store.sweep_interval_ms == 0 {
            return Err(WardenError::Config(
                "store.sweep_interval_ms must be positive".to_string(),
            ));
        }
        if self.feedback.poll_interval_ms == 0 {
            return Err(WardenError::Config(
                "feedback.poll_interval_ms must be positive".to_string(),
            ));
        }
        if !(self.feedback.smoothing > 0.0 && self.feedback.smoothing <= 1.0) {
            return Err(WardenError::Config(format!(
                "feedback.smoothing must be in (0, 1], got {}",
                self.feedback.smoothing
            )));
        }
        Ok(())
    }

    /// Coordinator settings derived from the `engine` section.
    pub fn coordinator_settings(&self) -> CoordinatorSettings {
        CoordinatorSettings {
            fail_mode: self.engine.fail_mode,
            check_timeout: Duration::from_millis(self.engine.check_timeout_ms),
            fail_closed_retry_after: Duration::from_millis(self.engine.fail_closed_retry_after_ms),
            fail_closed_jitter: Duration::from_millis(self.engine.fail_closed_retry_jitter_ms),
            tie_break: self.engine.tie_break,
            instance_id: self.engine.instance_id,
        }
    }

    pub fn max_staleness(&self) -> Duration {
        Duration::from_millis(self.policies.max_staleness_ms)
    }

    pub fn refresh_timeout(&self) -> Duration {
        Duration::from_millis(self.policies.refresh_timeout_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.store.sweep_interval_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.feedback.poll_interval_ms)
    }
}
