//! Configuration loading and validation.
//!
//! Loaded from `$PURSER_CONFIG_PATH` or `./purser.toml`. Every section is
//! optional and falls back to defaults. Environment variables override file
//! values; file values override defaults.
//!
//! Precedence: env vars > config file > defaults.

use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::orchestrator::Timing;
use crate::pool::SlotSpec;
use crate::types::Priority;

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Checkpoint timing and clearance lifetime.
    pub timing: TimingConfig,
    /// Slot layout of the staging and launch pools.
    pub pools: PoolsConfig,
    /// Clearance policy for new security profiles.
    pub authorization: AuthorizationConfig,
    /// Oversight threshold.
    pub commit: CommitConfig,
    /// Lifecycle event sinks.
    pub events: EventsConfig,
    /// Runtime tuning.
    pub runtime: RuntimeConfig,
}

/// Checkpoint timing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingConfig {
    /// Delay between scheduling and DEPART, in milliseconds.
    pub lead_time_ms: u64,
    /// Unit lead `u` in milliseconds.
    pub unit_lead_ms: u64,
    /// Reconciliation sweep period in milliseconds.
    pub sweep_interval_ms: u64,
    /// Clearance lifetime in seconds.
    pub clearance_ttl_secs: u64,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            lead_time_ms: default_lead_time_ms(),
            unit_lead_ms: default_unit_lead_ms(),
            sweep_interval_ms: default_sweep_interval_ms(),
            clearance_ttl_secs: default_clearance_ttl_secs(),
        }
    }
}

impl TimingConfig {
    /// Checkpoint spacing used by the orchestrator.
    pub fn timing(&self) -> Timing {
        Timing {
            lead_time: millis(self.lead_time_ms),
            unit_lead: millis(self.unit_lead_ms),
        }
    }

    /// Period of the reconciliation sweep.
    pub fn sweep_interval(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.sweep_interval_ms)
    }

    /// Lifetime of newly issued clearances.
    pub fn clearance_ttl(&self) -> chrono::Duration {
        chrono::Duration::from_std(std::time::Duration::from_secs(self.clearance_ttl_secs))
            .unwrap_or(chrono::Duration::MAX)
    }
}

fn millis(ms: u64) -> chrono::Duration {
    chrono::Duration::from_std(std::time::Duration::from_millis(ms))
        .unwrap_or(chrono::Duration::MAX)
}

/// Slot layout of both pools.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolsConfig {
    /// Staging (gate) pool.
    pub staging: PoolConfig,
    /// Launch pool.
    pub launch: PoolConfig,
}

impl Default for PoolsConfig {
    fn default() -> Self {
        Self {
            staging: PoolConfig {
                slots: vec![
                    slot("gate", 4, Priority::Standard),
                    slot("gate-priority", 1, Priority::High),
                ],
            },
            launch: PoolConfig {
                slots: vec![
                    slot("pad", 2, Priority::Standard),
                    slot("pad-priority", 1, Priority::High),
                ],
            },
        }
    }
}

/// Slot layout of one pool.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Slot groups in scan order.
    #[serde(default)]
    pub slots: Vec<SlotSpec>,
}

impl PoolConfig {
    /// Total number of slots.
    pub fn capacity(&self) -> u64 {
        self.slots.iter().map(|s| u64::from(s.capacity)).sum()
    }
}

/// Clearance policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthorizationConfig {
    /// Whether newly seen participants are cleared.
    pub default_cleared: bool,
    /// Participants never cleared when their profile is created.
    pub denied_participants: Vec<String>,
}

impl Default for AuthorizationConfig {
    fn default() -> Self {
        Self {
            default_cleared: true,
            denied_participants: Vec::new(),
        }
    }
}

/// Oversight settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CommitConfig {
    /// Minimum aggregate confidence for automatic approval.
    pub approval_threshold: f64,
}

impl Default for CommitConfig {
    fn default() -> Self {
        Self {
            approval_threshold: default_approval_threshold(),
        }
    }
}

/// Lifecycle event sinks.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EventsConfig {
    /// Append lifecycle events as JSON lines to this file.
    pub journal_path: Option<PathBuf>,
}

/// Runtime tuning.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Capacity of the execution hand-off channel.
    pub channel_buffer_size: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            channel_buffer_size: default_channel_buffer_size(),
        }
    }
}

// Default value functions

fn default_lead_time_ms() -> u64 {
    300_000
}
fn default_unit_lead_ms() -> u64 {
    60_000
}
fn default_sweep_interval_ms() -> u64 {
    1_000
}
fn default_clearance_ttl_secs() -> u64 {
    14_400
}
fn default_approval_threshold() -> f64 {
    0.90
}
fn default_channel_buffer_size() -> usize {
    256
}

fn slot(name: &str, capacity: u32, priority: Priority) -> SlotSpec {
    SlotSpec {
        name: name.to_owned(),
        capacity,
        priority,
    }
}

impl Config {
    /// Load with precedence env vars > TOML file > defaults, then validate.
    ///
    /// A missing config file is not an error.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or parsed, or
    /// if the resulting configuration is invalid.
    pub fn load() -> anyhow::Result<Self> {
        Self::load_with(|key| std::env::var(key).ok())
    }

    /// [`Self::load`] with a custom env resolver (for testing).
    ///
    /// # Errors
    ///
    /// See [`Self::load`].
    pub fn load_with(env: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let path = env("PURSER_CONFIG_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("purser.toml"));
        let mut config = match std::fs::read_to_string(&path) {
            Ok(contents) => {
                tracing::info!(path = %path.display(), "loading config from file");
                Self::from_toml(&contents)
                    .with_context(|| format!("failed to parse config at {}", path.display()))?
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!("no config file found, using defaults");
                Self::default()
            }
            Err(e) => {
                return Err(anyhow::anyhow!(
                    "failed to read config at {}: {e}",
                    path.display()
                ))
            }
        };
        config.apply_overrides(env);
        config.validate()?;
        Ok(config)
    }

    /// Parse a TOML string.
    ///
    /// # Errors
    ///
    /// Returns an error if the TOML is malformed.
    pub fn from_toml(toml_str: &str) -> anyhow::Result<Self> {
        toml::from_str(toml_str).context("failed to parse config TOML")
    }

    /// Apply `PURSER_*` environment overrides.
    ///
    /// Takes a resolver function for testability. Invalid values are logged
    /// and ignored.
    pub fn apply_overrides(&mut self, env: impl Fn(&str) -> Option<String>) {
        override_number(&env, "PURSER_LEAD_TIME_MS", &mut self.timing.lead_time_ms);
        override_number(&env, "PURSER_UNIT_LEAD_MS", &mut self.timing.unit_lead_ms);
        override_number(
            &env,
            "PURSER_SWEEP_INTERVAL_MS",
            &mut self.timing.sweep_interval_ms,
        );
        override_number(
            &env,
            "PURSER_CLEARANCE_TTL_SECS",
            &mut self.timing.clearance_ttl_secs,
        );
        override_number(
            &env,
            "PURSER_APPROVAL_THRESHOLD",
            &mut self.commit.approval_threshold,
        );
        if let Some(v) = env("PURSER_JOURNAL_PATH") {
            self.events.journal_path = Some(PathBuf::from(v));
        }
        if let Some(v) = env("PURSER_DENIED_PARTICIPANTS") {
            self.authorization.denied_participants = v
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_owned)
                .collect();
        }
    }

    /// Reject configurations the engine cannot run with.
    ///
    /// # Errors
    ///
    /// Returns an error describing the first invalid setting.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.timing.unit_lead_ms == 0 {
            anyhow::bail!("timing.unit_lead_ms must be greater than zero");
        }
        if self.timing.sweep_interval_ms == 0 {
            anyhow::bail!("timing.sweep_interval_ms must be greater than zero");
        }
        if self.timing.clearance_ttl_secs == 0 {
            anyhow::bail!("timing.clearance_ttl_secs must be greater than zero");
        }
        if self.pools.staging.capacity() == 0 {
            anyhow::bail!("pools.staging must have at least one slot");
        }
        if self.pools.launch.capacity() == 0 {
            anyhow::bail!("pools.launch must have at least one slot");
        }
        if !(0.0..=1.0).contains(&self.commit.approval_threshold) {
            anyhow::bail!("commit.approval_threshold must be within [0, 1]");
        }
        if self.runtime.channel_buffer_size == 0 {
            anyhow::bail!("runtime.channel_buffer_size must be greater than zero");
        }
        Ok(())
    }
}

fn override_number<T: std::str::FromStr>(
    env: &impl Fn(&str) -> Option<String>,
    key: &'static str,
    target: &mut T,
) {
    if let Some(v) = env(key) {
        match v.parse() {
            Ok(n) => *target = n,
            Err(_) => tracing::warn!(var = key, value = %v, "ignoring invalid env override"),
        }
    }
}

/// Load configuration from an explicit TOML file and validate it.
///
/// # Errors
///
/// Returns an error if the file cannot be read, parsed, or validated.
pub fn load_config(path: &Path) -> anyhow::Result<Config> {
    let contents = std::fs::read_to_string(path)
        .map_err(|e| anyhow::anyhow!("failed to read config at {}: {e}", path.display()))?;
    let config = Config::from_toml(&contents)
        .with_context(|| format!("failed to parse config at {}", path.display()))?;
    config.validate()?;
    Ok(config)
}

/// Resolve the default state directory (`~/.purser/`).
///
/// # Errors
///
/// Returns an error if the home directory cannot be determined.
pub fn config_dir() -> anyhow::Result<PathBuf> {
    let home = directories::BaseDirs::new()
        .ok_or_else(|| anyhow::anyhow!("cannot determine home directory"))?;
    Ok(home.home_dir().join(".purser"))
}
