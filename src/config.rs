//! Configuration for lead-forge runs.
//!
//! Values are layered: built-in defaults, then an optional YAML file, then
//! `LEADFORGE_*` environment variables. The CLI applies its own flags last.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::agents::AgentKind;
use crate::llm::{DEFAULT_MODEL, OPENROUTER_API_BASE};

/// Errors that can occur during configuration operations.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// An environment variable has an invalid value.
    #[error("Invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    /// Configuration validation failed.
    #[error("Configuration validation failed: {0}")]
    ValidationFailed(String),

    /// The YAML configuration file could not be parsed.
    #[error("Invalid configuration file {path}: {message}")]
    InvalidFile { path: PathBuf, message: String },

    /// IO error while reading configuration.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Configuration shared by every run a controller executes.
#[derive(Debug, Clone)]
pub struct ForgeConfig {
    // Workspace settings
    /// Directory holding one sub-directory per run.
    pub runs_dir: PathBuf,
    /// Unlocked workspaces older than this are purged.
    pub purge_age: Duration,

    // Execution settings
    /// Maximum number of runs executing at once per controller.
    pub max_concurrent_runs: usize,
    /// Maximum number of stage tasks executing at once within a run.
    pub max_concurrency: usize,
    /// Deadline for a single research stage.
    pub stage_timeout: Duration,
    /// How long in-flight stages may take to observe cancellation.
    pub cancel_grace: Duration,
    /// Research agents every query is fanned out to.
    pub agent_kinds: Vec<AgentKind>,

    // Structuring settings
    /// Total structuring attempts per stage result, including the first.
    pub structuring_attempts: u32,
    /// Constant delay between structuring attempts.
    pub structuring_retry_delay: Duration,

    // Storage settings
    /// Number of pre-append backups kept per run.
    pub backup_retention: usize,
    /// Interval between progress snapshots.
    pub progress_interval: Duration,

    // LLM settings
    /// Model used by research agents, the structurer and the planner.
    pub model: String,
    /// OpenAI-compatible API base URL.
    pub api_base: String,
    /// API key, if the endpoint requires one.
    pub api_key: Option<String>,
}

impl Default for ForgeConfig {
    fn default() -> Self {
        Self {
            runs_dir: PathBuf::from("./runs"),
            purge_age: Duration::from_secs(3 * 3600),

            max_concurrent_runs: 5,
            max_concurrency: 4,
            stage_timeout: Duration::from_secs(300),
            cancel_grace: Duration::from_secs(10),
            agent_kinds: AgentKind::all().to_vec(),

            structuring_attempts: 3,
            structuring_retry_delay: Duration::from_secs(1),

            backup_retention: 3,
            progress_interval: Duration::from_secs(5),

            model: DEFAULT_MODEL.to_string(),
            api_base: OPENROUTER_API_BASE.to_string(),
            api_key: None,
        }
    }
}

/// On-disk shape of the YAML configuration file. Every key is optional.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ForgeConfigFile {
    pub runs_dir: Option<PathBuf>,
    pub purge_age_hours: Option<u64>,
    pub max_concurrent_runs: Option<usize>,
    pub max_concurrency: Option<usize>,
    pub stage_timeout_secs: Option<u64>,
    pub cancel_grace_secs: Option<u64>,
    pub agents: Option<Vec<AgentKind>>,
    pub structuring_attempts: Option<u32>,
    pub structuring_retry_delay_ms: Option<u64>,
    pub backup_retention: Option<usize>,
    pub progress_interval_secs: Option<u64>,
    pub model: Option<String>,
    pub api_base: Option<String>,
    pub api_key: Option<String>,
}

impl ForgeConfig {
    /// Creates a new configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads defaults, the optional YAML file and environment overrides,
    /// then validates the result.
    ///
    /// # Environment Variables
    ///
    /// - `LEADFORGE_RUNS_DIR`: Runs directory (default: ./runs)
    /// - `LEADFORGE_PURGE_AGE_HOURS`: Purge age in hours (default: 3)
    /// - `LEADFORGE_MAX_CONCURRENT_RUNS`: Runs executing at once (default: 5)
    /// - `LEADFORGE_MAX_CONCURRENCY`: Concurrent stage tasks per run (default: 4)
    /// - `LEADFORGE_STAGE_TIMEOUT_SECS`: Stage deadline in seconds (default: 300)
    /// - `LEADFORGE_CANCEL_GRACE_SECS`: Cancellation grace in seconds (default: 10)
    /// - `LEADFORGE_AGENTS`: Comma-separated agent kinds (default: all)
    /// - `LEADFORGE_STRUCTURING_ATTEMPTS`: Structuring attempts (default: 3)
    /// - `LEADFORGE_STRUCTURING_RETRY_DELAY_MS`: Delay between attempts (default: 1000)
    /// - `LEADFORGE_BACKUP_RETENTION`: Backups kept per run (default: 3)
    /// - `LEADFORGE_PROGRESS_INTERVAL_SECS`: Snapshot interval (default: 5)
    /// - `LEADFORGE_MODEL`: LLM model
    /// - `LEADFORGE_API_BASE`: LLM API base URL
    /// - `LEADFORGE_API_KEY`: LLM API key
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        if let Some(path) = path {
            config.apply_file(&Self::read_file(path)?);
        }
        config.apply_env()?;
        config.validate()?;
        Ok(config)
    }

    /// Parses a YAML configuration file.
    pub fn read_file(path: &Path) -> Result<ForgeConfigFile, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        serde_yaml::from_str(&content).map_err(|e| ConfigError::InvalidFile {
            path: path.to_path_buf(),
            message: e.to_string(),
        })
    }

    /// Overlays the keys present in `file`.
    pub fn apply_file(&mut self, file: &ForgeConfigFile) {
        if let Some(dir) = &file.runs_dir {
            self.runs_dir = dir.clone();
        }
        if let Some(hours) = file.purge_age_hours {
            self.purge_age = hours_to_duration(hours);
        }
        if let Some(max) = file.max_concurrent_runs {
            self.max_concurrent_runs = max;
        }
        if let Some(max) = file.max_concurrency {
            self.max_concurrency = max;
        }
        if let Some(secs) = file.stage_timeout_secs {
            self.stage_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = file.cancel_grace_secs {
            self.cancel_grace = Duration::from_secs(secs);
        }
        if let Some(agents) = &file.agents {
            self.agent_kinds = agents.clone();
        }
        if let Some(attempts) = file.structuring_attempts {
            self.structuring_attempts = attempts;
        }
        if let Some(ms) = file.structuring_retry_delay_ms {
            self.structuring_retry_delay = Duration::from_millis(ms);
        }
        if let Some(retention) = file.backup_retention {
            self.backup_retention = retention;
        }
        if let Some(secs) = file.progress_interval_secs {
            self.progress_interval = Duration::from_secs(secs);
        }
        if let Some(model) = &file.model {
            self.model = model.clone();
        }
        if let Some(base) = &file.api_base {
            self.api_base = base.clone();
        }
        if let Some(key) = &file.api_key {
            self.api_key = Some(key.clone());
        }
    }

    fn apply_env(&mut self) -> Result<(), ConfigError> {
        if let Ok(val) = std::env::var("LEADFORGE_RUNS_DIR") {
            self.runs_dir = PathBuf::from(val);
        }

        if let Ok(val) = std::env::var("LEADFORGE_PURGE_AGE_HOURS") {
            let hours: u64 = parse_env_value(&val, "LEADFORGE_PURGE_AGE_HOURS")?;
            self.purge_age = hours_to_duration(hours);
        }

        if let Ok(val) = std::env::var("LEADFORGE_MAX_CONCURRENT_RUNS") {
            self.max_concurrent_runs = parse_env_value(&val, "LEADFORGE_MAX_CONCURRENT_RUNS")?;
        }

        if let Ok(val) = std::env::var("LEADFORGE_MAX_CONCURRENCY") {
            self.max_concurrency = parse_env_value(&val, "LEADFORGE_MAX_CONCURRENCY")?;
        }

        if let Ok(val) = std::env::var("LEADFORGE_STAGE_TIMEOUT_SECS") {
            let secs: u64 = parse_env_value(&val, "LEADFORGE_STAGE_TIMEOUT_SECS")?;
            self.stage_timeout = Duration::from_secs(secs);
        }

        if let Ok(val) = std::env::var("LEADFORGE_CANCEL_GRACE_SECS") {
            let secs: u64 = parse_env_value(&val, "LEADFORGE_CANCEL_GRACE_SECS")?;
            self.cancel_grace = Duration::from_secs(secs);
        }

        if let Ok(val) = std::env::var("LEADFORGE_AGENTS") {
            self.agent_kinds = parse_agent_list(&val, "LEADFORGE_AGENTS")?;
        }

        if let Ok(val) = std::env::var("LEADFORGE_STRUCTURING_ATTEMPTS") {
            self.structuring_attempts = parse_env_value(&val, "LEADFORGE_STRUCTURING_ATTEMPTS")?;
        }

        if let Ok(val) = std::env::var("LEADFORGE_STRUCTURING_RETRY_DELAY_MS") {
            let ms: u64 = parse_env_value(&val, "LEADFORGE_STRUCTURING_RETRY_DELAY_MS")?;
            self.structuring_retry_delay = Duration::from_millis(ms);
        }

        if let Ok(val) = std::env::var("LEADFORGE_BACKUP_RETENTION") {
            self.backup_retention = parse_env_value(&val, "LEADFORGE_BACKUP_RETENTION")?;
        }

        if let Ok(val) = std::env::var("LEADFORGE_PROGRESS_INTERVAL_SECS") {
            let secs: u64 = parse_env_value(&val, "LEADFORGE_PROGRESS_INTERVAL_SECS")?;
            self.progress_interval = Duration::from_secs(secs);
        }

        if let Ok(val) = std::env::var("LEADFORGE_MODEL") {
            self.model = val;
        }

        if let Ok(val) = std::env::var("LEADFORGE_API_BASE") {
            self.api_base = val;
        }

        if let Ok(val) = std::env::var("LEADFORGE_API_KEY") {
            self.api_key = Some(val);
        }

        Ok(())
    }

    /// Validates the configuration values.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationFailed` if any values are invalid.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_concurrent_runs == 0 {
            return Err(ConfigError::ValidationFailed(
                "max_concurrent_runs must be greater than 0".to_string(),
            ));
        }

        if self.max_concurrency == 0 {
            return Err(ConfigError::ValidationFailed(
                "max_concurrency must be greater than 0".to_string(),
            ));
        }

        if self.stage_timeout.is_zero() {
            return Err(ConfigError::ValidationFailed(
                "stage_timeout must be greater than 0".to_string(),
            ));
        }

        if self.agent_kinds.is_empty() {
            return Err(ConfigError::ValidationFailed(
                "agent_kinds cannot be empty".to_string(),
            ));
        }

        if self.structuring_attempts == 0 {
            return Err(ConfigError::ValidationFailed(
                "structuring_attempts must be at least 1".to_string(),
            ));
        }

        if self.backup_retention == 0 {
            return Err(ConfigError::ValidationFailed(
                "backup_retention must be at least 1".to_string(),
            ));
        }

        if self.progress_interval.is_zero() {
            return Err(ConfigError::ValidationFailed(
                "progress_interval must be greater than 0".to_string(),
            ));
        }

        if self.runs_dir.as_os_str().is_empty() {
            return Err(ConfigError::ValidationFailed(
                "runs_dir cannot be empty".to_string(),
            ));
        }

        if self.model.is_empty() {
            return Err(ConfigError::ValidationFailed(
                "model cannot be empty".to_string(),
            ));
        }

        Ok(())
    }

    /// Builder method to set the runs directory.
    pub fn with_runs_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.runs_dir = dir.into();
        self
    }

    /// Builder method to set the purge age.
    pub fn with_purge_age(mut self, age: Duration) -> Self {
        self.purge_age = age;
        self
    }

    /// Builder method to set the number of runs executing at once.
    pub fn with_max_concurrent_runs(mut self, max: usize) -> Self {
        self.max_concurrent_runs = max;
        self
    }

    /// Builder method to set max concurrency.
    pub fn with_max_concurrency(mut self, max: usize) -> Self {
        self.max_concurrency = max;
        self
    }

    /// Builder method to set the stage timeout.
    pub fn with_stage_timeout(mut self, timeout: Duration) -> Self {
        self.stage_timeout = timeout;
        self
    }

    /// Builder method to set the cancellation grace period.
    pub fn with_cancel_grace(mut self, grace: Duration) -> Self {
        self.cancel_grace = grace;
        self
    }

    /// Builder method to set the agent kinds.
    pub fn with_agent_kinds(mut self, kinds: Vec<AgentKind>) -> Self {
        self.agent_kinds = kinds;
        self
    }

    /// Builder method to set structuring attempts.
    pub fn with_structuring_attempts(mut self, attempts: u32) -> Self {
        self.structuring_attempts = attempts;
        self
    }

    /// Builder method to set the structuring retry delay.
    pub fn with_structuring_retry_delay(mut self, delay: Duration) -> Self {
        self.structuring_retry_delay = delay;
        self
    }

    /// Builder method to set backup retention.
    pub fn with_backup_retention(mut self, retention: usize) -> Self {
        self.backup_retention = retention;
        self
    }

    /// Builder method to set the progress interval.
    pub fn with_progress_interval(mut self, interval: Duration) -> Self {
        self.progress_interval = interval;
        self
    }

    /// Builder method to set the model.
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    /// Builder method to set the API base URL.
    pub fn with_api_base(mut self, base: impl Into<String>) -> Self {
        self.api_base = base.into();
        self
    }

    /// Builder method to set the API key.
    pub fn with_api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(key.into());
        self
    }
}

/// Saturates instead of overflowing for absurd hour counts.
fn hours_to_duration(hours: u64) -> Duration {
    Duration::from_secs(hours.saturating_mul(3600))
}

/// Parse an environment variable value into a type.
fn parse_env_value<T: std::str::FromStr>(value: &str, key: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        message: format!("could not parse '{}'", value),
    })
}

/// Parse a comma-separated list of agent kinds.
pub fn parse_agent_list(value: &str, key: &str) -> Result<Vec<AgentKind>, ConfigError> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| {
            s.parse::<AgentKind>()
                .map_err(|message| ConfigError::InvalidValue {
                    key: key.to_string(),
                    message,
                })
        })
        .collect()
}
