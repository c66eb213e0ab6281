//! Supervisor configuration parsing and validation.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use tracing::warn;

use crate::models::recovery::{BackoffKind, RecoveryStrategy};
use crate::{AppError, Result};

/// Environment variable consulted when the config does not name a state directory.
pub const STATE_DIR_ENV: &str = "AGENT_SENTINEL_STATE_DIR";

/// Heartbeat cadence and staleness thresholds.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct HeartbeatConfig {
    /// Expected refresh interval written into new session records.
    #[serde(default = "default_heartbeat_interval")]
    pub interval_seconds: u64,
    /// Missed intervals tolerated before a record counts as stale.
    #[serde(default = "default_max_missed")]
    pub max_missed: u32,
    /// Absolute age ceiling for records written before heartbeats existed.
    #[serde(default = "default_legacy_max_age")]
    pub legacy_max_age_seconds: u64,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval_seconds: default_heartbeat_interval(),
            max_missed: default_max_missed(),
            legacy_max_age_seconds: default_legacy_max_age(),
        }
    }
}

impl HeartbeatConfig {
    /// Heartbeat interval as a [`Duration`].
    #[must_use]
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_seconds)
    }

    /// Legacy age ceiling as a [`Duration`].
    #[must_use]
    pub fn legacy_max_age(&self) -> Duration {
        Duration::from_secs(self.legacy_max_age_seconds)
    }
}

/// Stale session reaper settings.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct ReaperConfig {
    /// Delay between periodic sweeps.
    #[serde(default = "default_reaper_interval")]
    pub interval_seconds: u64,
    /// Whether to confirm that a live pid still runs the expected program.
    #[serde(default)]
    pub verify_identity: bool,
    /// Substring expected in the worker's command line when verifying identity.
    #[serde(default)]
    pub expected_signature: Option<String>,
    /// Upper bound on a single identity probe.
    #[serde(default = "default_probe_timeout_ms")]
    pub probe_timeout_ms: u64,
    /// Age a legacy record must reach before it is reclaimed.
    #[serde(default)]
    pub legacy_grace_seconds: u64,
    /// Run one sweep whenever a worker registers.
    #[serde(default = "default_true")]
    pub sweep_on_register: bool,
}

impl Default for ReaperConfig {
    fn default() -> Self {
        Self {
            interval_seconds: default_reaper_interval(),
            verify_identity: false,
            expected_signature: None,
            probe_timeout_ms: default_probe_timeout_ms(),
            legacy_grace_seconds: 0,
            sweep_on_register: true,
        }
    }
}

impl ReaperConfig {
    /// Sweep cadence as a [`Duration`].
    #[must_use]
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_seconds)
    }

    /// Identity probe timeout as a [`Duration`].
    #[must_use]
    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    /// Legacy grace window as a [`Duration`].
    #[must_use]
    pub fn legacy_grace(&self) -> Duration {
        Duration::from_secs(self.legacy_grace_seconds)
    }
}

/// Checkpoint retention and retry ceiling.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct CheckpointConfig {
    /// Checkpoints older than this are garbage-collected by `gc`.
    #[serde(default = "default_checkpoint_max_age_hours")]
    pub max_age_hours: u64,
    /// Task-level restarts allowed before a staged task gives up.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            max_age_hours: default_checkpoint_max_age_hours(),
            max_retries: default_max_retries(),
        }
    }
}

impl CheckpointConfig {
    /// Retention ceiling as a [`Duration`].
    #[must_use]
    pub fn max_age(&self) -> Duration {
        Duration::from_secs(self.max_age_hours.saturating_mul(3600))
    }
}

/// Retry policy for units of work run through the recovery engine.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub struct RetryConfig {
    /// Total attempts allowed per unit, including the first.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Delay growth between attempts.
    #[serde(default = "default_backoff")]
    pub backoff: BackoffKind,
    /// Base delay in milliseconds.
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    /// Growth factor for exponential backoff.
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
    /// Cap applied to every computed delay.
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    /// Spread delays by up to 25% in either direction.
    #[serde(default = "default_true")]
    pub jitter: bool,
    /// What the caller does after a unit fails terminally.
    #[serde(default = "default_strategy")]
    pub strategy: RecoveryStrategy,
    /// Whether missing-dependency failures are retried.
    #[serde(default)]
    pub retry_dependency: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            backoff: default_backoff(),
            base_delay_ms: default_base_delay_ms(),
            multiplier: default_multiplier(),
            max_delay_ms: default_max_delay_ms(),
            jitter: true,
            strategy: default_strategy(),
            retry_dependency: false,
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_heartbeat_interval() -> u64 {
    300
}

fn default_max_missed() -> u32 {
    3
}

fn default_legacy_max_age() -> u64 {
    86_400
}

fn default_reaper_interval() -> u64 {
    60
}

fn default_probe_timeout_ms() -> u64 {
    100
}

fn default_checkpoint_max_age_hours() -> u64 {
    168
}

fn default_max_retries() -> u32 {
    3
}

fn default_max_attempts() -> u32 {
    3
}

fn default_backoff() -> BackoffKind {
    BackoffKind::Exponential
}

fn default_base_delay_ms() -> u64 {
    1000
}

fn default_multiplier() -> f64 {
    2.0
}

fn default_max_delay_ms() -> u64 {
    60_000
}

fn default_strategy() -> RecoveryStrategy {
    RecoveryStrategy::RetryThenFail
}

/// Global supervisor configuration parsed from `config.toml`.
#[derive(Debug, Clone, Deserialize, PartialEq, Default)]
#[serde(rename_all = "snake_case")]
pub struct SupervisorConfig {
    /// Directory holding `sessions/` and `checkpoints/`.
    #[serde(default)]
    pub state_dir: Option<PathBuf>,
    /// Heartbeat protocol thresholds.
    #[serde(default)]
    pub heartbeat: HeartbeatConfig,
    /// Reaper behavior.
    #[serde(default)]
    pub reaper: ReaperConfig,
    /// Checkpoint retention.
    #[serde(default)]
    pub checkpoint: CheckpointConfig,
    /// Recovery engine policy.
    #[serde(default)]
    pub retry: RetryConfig,
}

impl SupervisorConfig {
    /// Load and validate configuration from a TOML file path.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if the file cannot be read or contains
    /// invalid TOML, or if validation fails.
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .map_err(|err| AppError::Config(format!("failed to read config: {err}")))?;
        Self::from_toml_str(&raw)
    }

    /// Parse configuration from a TOML string and validate it.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if parsing or validation fails.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Resolve the state directory: config value, then `AGENT_SENTINEL_STATE_DIR`,
    /// then `.agent-sentinel` under the current directory.
    #[must_use]
    pub fn resolve_state_dir(&self) -> PathBuf {
        if let Some(ref dir) = self.state_dir {
            return dir.clone();
        }
        match env::var(STATE_DIR_ENV) {
            Ok(value) if !value.trim().is_empty() => PathBuf::from(value.trim()),
            Ok(_) => {
                warn!(env = STATE_DIR_ENV, "state dir env var is empty, using default");
                PathBuf::from(".agent-sentinel")
            }
            Err(_) => PathBuf::from(".agent-sentinel"),
        }
    }

    /// Check cross-field constraints.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` describing the first violated constraint.
    pub fn validate(&self) -> Result<()> {
        if self.heartbeat.max_missed == 0 {
            return Err(AppError::Config(
                "heartbeat.max_missed must be greater than zero".into(),
            ));
        }

        if self.retry.max_attempts == 0 {
            return Err(AppError::Config(
                "retry.max_attempts must be greater than zero".into(),
            ));
        }

        if !self.retry.multiplier.is_finite() || self.retry.multiplier < 1.0 {
            return Err(AppError::Config(
                "retry.multiplier must be a finite value >= 1.0".into(),
            ));
        }

        if self.retry.base_delay_ms > self.retry.max_delay_ms {
            return Err(AppError::Config(
                "retry.base_delay_ms must not exceed retry.max_delay_ms".into(),
            ));
        }

        if self.reaper.verify_identity
            && self
                .reaper
                .expected_signature
                .as_deref()
                .is_none_or(|sig| sig.trim().is_empty())
        {
            return Err(AppError::Config(
                "reaper.expected_signature is required when verify_identity is enabled".into(),
            ));
        }

        Ok(())
    }
}
