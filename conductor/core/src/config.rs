//! TOML Configuration File Support
//!
//! Centralized configuration loading, from a TOML file at
//! `~/.config/model-conductor/conductor.toml`.
//!
//! # Configuration Priority
//!
//! Configuration values are loaded with the following priority (highest first):
//! 1. CLI arguments (via [`ConfigOverrides`])
//! 2. Environment variables
//! 3. TOML configuration file
//! 4. Default values
//!
//! When the file declares no `[[backends]]`, the built-in catalog of local
//! Ollama models is used.
//!
//! # Example Configuration
//!
//! ```toml
//! [dispatch]
//! max_attempts = 3
//! per_attempt_timeout_ms = 300000
//! admission_timeout_ms = 5000
//! quality_threshold = 0.6
//! degraded_policy = "hard_failure"   # or "best_effort"
//! initial_backoff_ms = 0
//!
//! [ledger]
//! window_size = 50
//! window_max_age_secs = 3600          # 0 keeps records regardless of age
//! min_samples_for_recommendation = 3
//!
//! [[backends]]
//! name = "codellama:13b-instruct"
//! task_types = ["coding", "review", "debugging"]
//! tier = "balanced"
//! concurrency_limit = 2
//! priority_weight = 6
//! temperature = 0.3
//! ```

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::routing::config::{BackendConfig, DegradedPolicy, DispatchConfig, LedgerConfig};
use crate::routing::registry::validate_backend_config;

// =============================================================================
// Error Types
// =============================================================================

/// Errors that can occur when loading configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read config file
    #[error("Failed to read config file at {path}: {source}")]
    ReadError {
        /// The path that was attempted
        path: PathBuf,
        /// The underlying IO error
        source: std::io::Error,
    },

    /// Failed to parse TOML
    #[error("Failed to parse TOML config: {0}")]
    ParseError(#[from] toml::de::Error),

    /// Invalid configuration value
    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

// =============================================================================
// Configuration Source Tracking
// =============================================================================

/// Tracks where a configuration value came from
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConfigSource {
    /// Value from command-line argument
    Cli,
    /// Value from environment variable
    Env,
    /// Value from TOML configuration file
    File,
    /// Default value
    Default,
}

impl std::fmt::Display for ConfigSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Cli => write!(f, "CLI"),
            Self::Env => write!(f, "environment"),
            Self::File => write!(f, "config file"),
            Self::Default => write!(f, "default"),
        }
    }
}

// =============================================================================
// TOML Configuration Structures
// =============================================================================

/// Dispatch section of the TOML configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchToml {
    /// Maximum distinct backends tried per task
    pub max_attempts: Option<usize>,

    /// Time limit for one backend call in milliseconds
    pub per_attempt_timeout_ms: Option<u64>,

    /// Time limit for waiting on a slot in milliseconds
    pub admission_timeout_ms: Option<u64>,

    /// Minimum quality score for a response to win
    pub quality_threshold: Option<f64>,

    /// Behaviour when only below-threshold responses were produced
    pub degraded_policy: Option<DegradedPolicy>,

    /// Delay before the second attempt in milliseconds (0 = none)
    pub initial_backoff_ms: Option<u64>,

    /// Backoff cap in milliseconds
    pub max_backoff_ms: Option<u64>,
}

/// Ledger section of the TOML configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LedgerToml {
    /// Raw records kept per (backend, task type)
    pub window_size: Option<usize>,

    /// Maximum record age in seconds (0 = unlimited)
    pub window_max_age_secs: Option<u64>,

    /// Windowed attempts needed before a backend is recommended
    pub min_samples_for_recommendation: Option<u64>,
}

/// Top-level TOML configuration structure
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ConductorToml {
    /// Dispatch configuration section
    pub dispatch: DispatchToml,

    /// Ledger configuration section
    pub ledger: LedgerToml,

    /// Backend catalog
    pub backends: Vec<BackendConfig>,
}

// =============================================================================
// Main Configuration Struct
// =============================================================================

/// Effective configuration of an orchestrator
#[derive(Clone, Debug)]
pub struct ConductorConfig {
    /// Dispatch limits
    pub dispatch: DispatchConfig,

    /// Ledger retention
    pub ledger: LedgerConfig,

    /// Backend catalog
    pub backends: Vec<BackendConfig>,

    /// Path to the config file that was loaded (if any)
    pub config_file_path: Option<PathBuf>,

    /// Source of configuration values
    source: ConfigSource,
}

impl Default for ConductorConfig {
    fn default() -> Self {
        Self {
            dispatch: DispatchConfig::default(),
            ledger: LedgerConfig::default(),
            backends: BackendConfig::default_catalog(),
            config_file_path: None,
            source: ConfigSource::Default,
        }
    }
}

impl ConductorConfig {
    /// Create a new configuration with default values
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Configuration with no backends, for callers that register their own
    #[must_use]
    pub fn empty() -> Self {
        Self {
            backends: Vec::new(),
            ..Self::default()
        }
    }

    /// Get the primary source of this configuration
    #[must_use]
    pub fn source(&self) -> ConfigSource {
        self.source
    }

    /// Set the configuration source
    pub fn set_source(&mut self, source: ConfigSource) {
        self.source = source;
    }

    /// Keep only backends the model server actually hosts
    ///
    /// Catalog entries missing from `installed` are dropped. Installed models
    /// the catalog does not know are added with [`BackendConfig::discovered`].
    pub fn retain_installed(&mut self, installed: &[String]) {
        let before = self.backends.len();
        self.backends
            .retain(|backend| installed.iter().any(|name| *name == backend.name));
        let dropped = before - self.backends.len();

        let mut discovered = Vec::new();
        for name in installed {
            if !self.backends.iter().any(|backend| backend.name == *name) {
                self.backends.push(BackendConfig::discovered(name.as_str()));
                discovered.push(name.as_str());
            }
        }

        tracing::info!(
            available = self.backends.len(),
            dropped,
            discovered = ?discovered,
            "Matched backends to installed models"
        );
    }

    /// Reject values the orchestrator cannot run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: String| Err(ConfigError::ValidationError(msg));

        if self.dispatch.max_attempts == 0 {
            return invalid("dispatch.max_attempts must be at least 1".to_string());
        }
        if !(0.0..=1.0).contains(&self.dispatch.quality_threshold) {
            return invalid(format!(
                "dispatch.quality_threshold must be within [0, 1], got {}",
                self.dispatch.quality_threshold
            ));
        }
        if self.dispatch.per_attempt_timeout.is_zero() {
            return invalid("dispatch.per_attempt_timeout_ms must be positive".to_string());
        }
        if self.ledger.window_size == 0 {
            return invalid("ledger.window_size must be at least 1".to_string());
        }

        let mut seen = HashSet::new();
        for backend in &self.backends {
            validate_backend_config(backend)
                .map_err(|e| ConfigError::ValidationError(e.to_string()))?;
            if !seen.insert(backend.name.as_str()) {
                return invalid(format!("backend '{}' is declared twice", backend.name));
            }
        }
        Ok(())
    }
}

// =============================================================================
// Configuration Loading
// =============================================================================

/// Get the default configuration file path
///
/// Returns `$XDG_CONFIG_HOME/model-conductor/conductor.toml` or
/// `~/.config/model-conductor/conductor.toml` if `XDG_CONFIG_HOME` is not set.
#[must_use]
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|p| p.join("model-conductor").join("conductor.toml"))
}

/// Load configuration from all sources with proper priority
///
/// # Errors
///
/// Returns an error if the config file exists but cannot be parsed, or if the
/// merged configuration is invalid. A missing config file is not an error.
pub fn load_config() -> Result<ConductorConfig, ConfigError> {
    load_config_from_path(default_config_path())
}

/// Load configuration from a specific path
///
/// # Errors
///
/// Returns an error if the specified config file cannot be read or parsed, or
/// if the merged configuration is invalid.
pub fn load_config_from_path(path: Option<PathBuf>) -> Result<ConductorConfig, ConfigError> {
    let mut config = ConductorConfig::default();

    if let Some(ref config_path) = path {
        if config_path.exists() {
            let toml_config = read_toml(config_path)?;
            apply_toml_config(&mut config, toml_config);
            config.config_file_path = Some(config_path.clone());
            config.source = ConfigSource::File;

            tracing::info!(
                path = %config_path.display(),
                backends = config.backends.len(),
                "Loaded configuration from file"
            );
        } else {
            tracing::debug!(
                path = %config_path.display(),
                "Config file not found, using defaults"
            );
        }
    }

    apply_env_config(&mut config, |key| std::env::var(key).ok());
    config.validate()?;

    Ok(config)
}

fn read_toml(path: &Path) -> Result<ConductorToml, ConfigError> {
    let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
        path: path.to_path_buf(),
        source: e,
    })?;
    Ok(toml::from_str(&content)?)
}

/// Apply TOML configuration values to the config struct
fn apply_toml_config(config: &mut ConductorConfig, toml: ConductorToml) {
    let dispatch = &mut config.dispatch;
    if let Some(n) = toml.dispatch.max_attempts {
        dispatch.max_attempts = n;
    }
    if let Some(ms) = toml.dispatch.per_attempt_timeout_ms {
        dispatch.per_attempt_timeout = Duration::from_millis(ms);
    }
    if let Some(ms) = toml.dispatch.admission_timeout_ms {
        dispatch.admission_timeout = Duration::from_millis(ms);
    }
    if let Some(threshold) = toml.dispatch.quality_threshold {
        dispatch.quality_threshold = threshold;
    }
    if let Some(policy) = toml.dispatch.degraded_policy {
        dispatch.degraded_policy = policy;
    }
    if let Some(ms) = toml.dispatch.initial_backoff_ms {
        dispatch.retry.initial_backoff_ms = ms;
    }
    if let Some(ms) = toml.dispatch.max_backoff_ms {
        dispatch.retry.max_backoff_ms = ms;
    }

    let ledger = &mut config.ledger;
    if let Some(size) = toml.ledger.window_size {
        ledger.window_size = size;
    }
    if let Some(secs) = toml.ledger.window_max_age_secs {
        ledger.window_max_age = (secs > 0).then(|| Duration::from_secs(secs));
    }
    if let Some(n) = toml.ledger.min_samples_for_recommendation {
        ledger.min_samples_for_recommendation = n;
    }

    if !toml.backends.is_empty() {
        config.backends = toml.backends;
    }
}

/// Apply environment variable overrides to the config
///
/// `lookup` resolves a variable name; unparsable values are ignored with a
/// warning.
fn apply_env_config(config: &mut ConductorConfig, lookup: impl Fn(&str) -> Option<String>) {
    fn parsed<T: std::str::FromStr>(
        lookup: &impl Fn(&str) -> Option<String>,
        key: &str,
    ) -> Option<T> {
        let raw = lookup(key)?;
        let value = raw.trim().parse().ok();
        if value.is_none() {
            tracing::warn!(key, value = %raw, "Ignoring unparsable environment override");
        }
        value
    }

    if let Some(n) = parsed::<usize>(&lookup, "CONDUCTOR_MAX_ATTEMPTS") {
        config.dispatch.max_attempts = n;
        config.source = ConfigSource::Env;
    }
    if let Some(ms) = parsed::<u64>(&lookup, "CONDUCTOR_ATTEMPT_TIMEOUT_MS") {
        config.dispatch.per_attempt_timeout = Duration::from_millis(ms);
        config.source = ConfigSource::Env;
    }
    if let Some(ms) = parsed::<u64>(&lookup, "CONDUCTOR_ADMISSION_TIMEOUT_MS") {
        config.dispatch.admission_timeout = Duration::from_millis(ms);
        config.source = ConfigSource::Env;
    }
    if let Some(threshold) = parsed::<f64>(&lookup, "CONDUCTOR_QUALITY_THRESHOLD") {
        config.dispatch.quality_threshold = threshold;
        config.source = ConfigSource::Env;
    }
    if let Some(raw) = lookup("CONDUCTOR_DEGRADED_POLICY") {
        match DegradedPolicy::parse(&raw) {
            Some(policy) => {
                config.dispatch.degraded_policy = policy;
                config.source = ConfigSource::Env;
            }
            None => tracing::warn!(value = %raw, "Ignoring unknown CONDUCTOR_DEGRADED_POLICY"),
        }
    }
}

// =============================================================================
// CLI Override Support
// =============================================================================

/// Builder for applying CLI overrides to configuration
///
/// Use this after [`load_config`] to apply command-line argument overrides.
#[derive(Clone, Debug, Default)]
pub struct ConfigOverrides {
    /// Attempt budget override
    pub max_attempts: Option<usize>,

    /// Quality threshold override
    pub quality_threshold: Option<f64>,

    /// Degraded policy override
    pub degraded_policy: Option<DegradedPolicy>,
}

impl ConfigOverrides {
    /// Create a new empty set of overrides
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set attempt budget override
    #[must_use]
    pub fn with_max_attempts(mut self, n: usize) -> Self {
        self.max_attempts = Some(n);
        self
    }

    /// Set quality threshold override
    #[must_use]
    pub fn with_quality_threshold(mut self, threshold: f64) -> Self {
        self.quality_threshold = Some(threshold);
        self
    }

    /// Set degraded policy override
    #[must_use]
    pub fn with_degraded_policy(mut self, policy: DegradedPolicy) -> Self {
        self.degraded_policy = Some(policy);
        self
    }

    /// Apply overrides to a configuration and re-validate it
    pub fn apply(&self, config: &mut ConductorConfig) -> Result<(), ConfigError> {
        if self.max_attempts.is_some()
            || self.quality_threshold.is_some()
            || self.degraded_policy.is_some()
        {
            config.source = ConfigSource::Cli;
        }

        if let Some(n) = self.max_attempts {
            config.dispatch.max_attempts = n;
        }
        if let Some(threshold) = self.quality_threshold {
            config.dispatch.quality_threshold = threshold;
        }
        if let Some(policy) = self.degraded_policy {
            config.dispatch.degraded_policy = policy;
        }

        config.validate()
    }
}

// =============================================================================
// Tests
// =============================================================================
