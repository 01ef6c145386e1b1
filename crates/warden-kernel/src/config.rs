//! Kernel configuration, loaded from `warden.toml`

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use warden_exec::{EngineConfig, HealthChecker, MAX_HEAL_ATTEMPTS};
use warden_plan::{FreezeLimits, SamplingPolicy, DEFAULT_LOCKFILES, MAX_FILE_CAP};

use crate::budget::RiskBudget;
use crate::error::ConfigError;
use crate::invariants::InvariantLimits;

/// Default configuration file name
pub const CONFIG_FILE: &str = "warden.toml";

/// Kernel configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WardenConfig {
    /// Hard runtime cap in milliseconds
    pub runtime_cap_ms: u64,
    /// Maximum files in a repo map or plan scope
    pub max_file_cap: usize,
    /// Self-healing attempts per command
    pub heal_max_attempts: u32,
    /// Restarts allowed in IMPLEMENTING
    pub implement_retry_budget: u32,
    /// How long an approval request stays valid
    pub approval_window_secs: u64,
    /// Health probes per background server
    pub health_probe_attempts: u32,
    /// Delay between health probes
    pub health_probe_delay_ms: u64,
    /// Replaces bucket timeouts when set
    pub timeout_override_secs: Option<u64>,
    /// Dependencies scoring at or above this are rejected
    pub risk_threshold: f32,
    /// Lockfile names hashed for the dependency freeze
    pub lockfiles: Vec<String>,
    /// The one file allowed to be dirty when planning starts
    pub ignore_file: String,
    /// Isolation branch prefix; the task id is appended
    pub branch_prefix: String,
    /// Remote tracked for drift; empty compares against the local main branch
    pub remote: Option<String>,
    /// Branch tasks start from and merge into
    pub main_branch: String,
    /// Oracle sampling; temperature must stay zero
    pub sampling: SamplingPolicy,
    /// Change-size and command-count limits
    pub budget: RiskBudget,
}

impl Default for WardenConfig {
    fn default() -> Self {
        Self {
            runtime_cap_ms: 15 * 60 * 1000,
            max_file_cap: MAX_FILE_CAP,
            heal_max_attempts: MAX_HEAL_ATTEMPTS,
            implement_retry_budget: 3,
            approval_window_secs: 24 * 60 * 60,
            health_probe_attempts: 3,
            health_probe_delay_ms: 2000,
            timeout_override_secs: None,
            risk_threshold: 0.8,
            lockfiles: DEFAULT_LOCKFILES.iter().map(|s| (*s).to_string()).collect(),
            ignore_file: ".gitignore".into(),
            branch_prefix: "agent/task-".into(),
            remote: Some("origin".into()),
            main_branch: "main".into(),
            sampling: SamplingPolicy::default(),
            budget: RiskBudget::default(),
        }
    }
}

impl WardenConfig {
    /// Defaults
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Load and validate a TOML file
    ///
    /// # Errors
    /// [`ConfigError`] on read, parse or validation failure
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self = toml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        tracing::info!(path = %path.display(), "configuration loaded");
        Ok(config)
    }

    /// Load `dir/warden.toml` if it exists, otherwise defaults
    ///
    /// # Errors
    /// As [`WardenConfig::load`]
    pub fn discover(dir: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path: PathBuf = dir.as_ref().join(CONFIG_FILE);
        if path.exists() {
            Self::load(path)
        } else {
            tracing::debug!(dir = %dir.as_ref().display(), "no configuration file, using defaults");
            Ok(Self::default())
        }
    }

    /// Reject values no task could run under
    ///
    /// # Errors
    /// [`ConfigError::Invalid`], or a sampling-policy error
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.runtime_cap_ms == 0 {
            return Err(ConfigError::Invalid("runtime_cap_ms must be positive".into()));
        }
        if self.max_file_cap == 0 {
            return Err(ConfigError::Invalid("max_file_cap must be positive".into()));
        }
        if self.heal_max_attempts == 0 {
            return Err(ConfigError::Invalid("heal_max_attempts must be at least 1".into()));
        }
        if !(0.0..=1.0).contains(&self.risk_threshold) {
            return Err(ConfigError::Invalid(format!(
                "risk_threshold {} is outside [0, 1]",
                self.risk_threshold
            )));
        }
        if self.budget.max_patch_lines == 0 || self.budget.max_total_lines == 0 || self.budget.max_commands == 0 {
            return Err(ConfigError::Invalid("budget limits must be positive".into()));
        }
        if self.budget.max_patch_lines > self.budget.max_total_lines {
            return Err(ConfigError::Invalid(format!(
                "budget.max_patch_lines {} exceeds budget.max_total_lines {}",
                self.budget.max_patch_lines, self.budget.max_total_lines
            )));
        }
        if self.branch_prefix.trim().is_empty() {
            return Err(ConfigError::Invalid("branch_prefix must not be empty".into()));
        }
        self.sampling.validate()?;
        Ok(())
    }

    /// Replace the runtime cap
    #[inline]
    #[must_use]
    pub fn with_runtime_cap(mut self, cap: Duration) -> Self {
        self.runtime_cap_ms = u64::try_from(cap.as_millis()).unwrap_or(u64::MAX);
        self
    }

    /// Replace the tracked remote
    #[inline]
    #[must_use]
    pub fn with_remote(mut self, remote: Option<String>) -> Self {
        self.remote = remote;
        self
    }

    /// Replace the health probe schedule
    #[inline]
    #[must_use]
    pub fn with_health_schedule(mut self, attempts: u32, delay: Duration) -> Self {
        self.health_probe_attempts = attempts;
        self.health_probe_delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
        self
    }

    /// Remote compared for drift; an empty name means the local main branch
    #[must_use]
    pub fn tracked_remote(&self) -> Option<String> {
        self.remote.clone().filter(|r| !r.trim().is_empty())
    }

    /// Runtime cap as a duration
    #[must_use]
    pub fn runtime_cap(&self) -> Duration {
        Duration::from_millis(self.runtime_cap_ms)
    }

    /// Limits the controller evaluates invariants against
    #[must_use]
    pub fn limits(&self) -> InvariantLimits {
        InvariantLimits {
            max_file_cap: self.max_file_cap,
            implement_retry_budget: self.implement_retry_budget,
            approval_window: Duration::from_secs(self.approval_window_secs),
            budget: self.budget,
        }
    }

    /// Limits applied when a plan is frozen
    #[must_use]
    pub fn freeze_limits(&self) -> FreezeLimits {
        FreezeLimits {
            max_files: self.max_file_cap,
        }
    }

    /// Engine settings rooted at `workdir`
    #[must_use]
    pub fn engine_config(&self, workdir: impl Into<PathBuf>) -> EngineConfig {
        let mut config = EngineConfig::new(workdir);
        config.max_heal_attempts = self.heal_max_attempts;
        config.timeout_override = self.timeout_override_secs.map(Duration::from_secs);
        config.max_fix_lines = Some(self.budget.max_patch_lines);
        config
    }

    /// Health checker for background servers
    #[must_use]
    pub fn health_checker(&self) -> HealthChecker {
        HealthChecker::new().with_schedule(
            self.health_probe_attempts,
            Duration::from_millis(self.health_probe_delay_ms),
        )
    }
}
