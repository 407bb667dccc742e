//! Engine configuration
//!
//! Loaded from a TOML file where every field has a default, then adjusted
//! from `DISPATCH_*` environment variables and validated.
//!
//! ```toml
//! state_dir = "/var/lib/dispatch"
//!
//! [breaker]
//! failure_threshold = 3
//! reset_timeout_ms = 300000
//!
//! [retry]
//! max_attempts = 3
//!
//! [[backends]]
//! id = "deep"
//! class = "deep_reasoning"
//! timeout_secs = 240
//! ```

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::cache::CacheConfig;
use crate::registry::{BackendClass, BackendId, BackendProfile, BackendRegistry};
use crate::resilience::RetryConfig;
use crate::router::{BreakerConfig, SelectorConfig};

/// Environment variable overriding [`EngineConfig::state_dir`]
pub const ENV_STATE_DIR: &str = "DISPATCH_STATE_DIR";
/// Environment variable overriding [`BreakerConfig::failure_threshold`]
pub const ENV_FAILURE_THRESHOLD: &str = "DISPATCH_FAILURE_THRESHOLD";
/// Environment variable overriding [`BreakerConfig::reset_timeout_ms`]
pub const ENV_RESET_TIMEOUT_MS: &str = "DISPATCH_RESET_TIMEOUT_MS";
/// Environment variable overriding [`RetryConfig::max_attempts`]
pub const ENV_MAX_ATTEMPTS: &str = "DISPATCH_MAX_ATTEMPTS";

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid config: {0}")]
    Invalid(String),
}

/// One `[[backends]]` table
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackendConfig {
    pub id: BackendId,
    pub class: BackendClass,
    /// Overrides the class default timeout
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
}

impl BackendConfig {
    pub fn profile(&self) -> BackendProfile {
        let profile = BackendProfile::new(self.id.clone(), self.class);
        match self.timeout_secs {
            Some(secs) => profile.with_timeout(Duration::from_secs(secs)),
            None => profile,
        }
    }
}

/// Top-level engine configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Directory for persisted breaker/stats/cache state; in-memory only
    /// when unset
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state_dir: Option<PathBuf>,
    pub breaker: BreakerConfig,
    pub retry: RetryConfig,
    pub selector: SelectorConfig,
    pub cache: CacheConfig,
    /// Known backends, in fallback order
    pub backends: Vec<BackendConfig>,
}

impl EngineConfig {
    /// Read `path`, apply environment overrides and validate.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        Self::load_with(path, |key| std::env::var(key).ok())
    }

    /// Like [`load`](Self::load), with overrides read through `lookup`.
    pub fn load_with<F>(path: &Path, lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let mut config = Self::from_toml_str(&content)?;
        config.apply_overrides(lookup)?;
        config.validate()?;
        Ok(config)
    }

    /// Parse TOML without overrides or validation.
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    /// Apply `DISPATCH_*` overrides read through `lookup`.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(dir) = lookup(ENV_STATE_DIR) {
            self.state_dir = if dir.is_empty() {
                None
            } else {
                Some(PathBuf::from(dir))
            };
        }
        if let Some(value) = lookup(ENV_FAILURE_THRESHOLD) {
            self.breaker.failure_threshold = parse_env(ENV_FAILURE_THRESHOLD, &value)?;
        }
        if let Some(value) = lookup(ENV_RESET_TIMEOUT_MS) {
            self.breaker.reset_timeout_ms = parse_env(ENV_RESET_TIMEOUT_MS, &value)?;
        }
        if let Some(value) = lookup(ENV_MAX_ATTEMPTS) {
            self.retry.max_attempts = parse_env(ENV_MAX_ATTEMPTS, &value)?;
        }
        Ok(())
    }

    /// Check semantic constraints serde cannot express.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.breaker.failure_threshold == 0 {
            return invalid("breaker.failure_threshold must be > 0");
        }
        if self.breaker.reset_timeout_ms == 0 {
            return invalid("breaker.reset_timeout_ms must be > 0");
        }
        if self.retry.max_attempts == 0 {
            return invalid("retry.max_attempts must be > 0");
        }
        if !(self.retry.multiplier >= 1.0 && self.retry.multiplier.is_finite()) {
            return Err(ConfigError::Invalid(format!(
                "retry.multiplier must be >= 1.0, got {}",
                self.retry.multiplier
            )));
        }
        if self.retry.initial_delay_ms > self.retry.max_delay_ms {
            return invalid("retry.initial_delay_ms must not exceed retry.max_delay_ms");
        }
        if !(0.0..=1.0).contains(&self.selector.confidence_floor) {
            return Err(ConfigError::Invalid(format!(
                "selector.confidence_floor must be in [0, 1], got {}",
                self.selector.confidence_floor
            )));
        }
        if self.cache.sweep_interval_secs == 0 {
            return invalid("cache.sweep_interval_secs must be > 0");
        }
        if self.backends.is_empty() {
            return invalid("at least one [[backends]] entry is required");
        }

        let mut seen = HashSet::new();
        for backend in &self.backends {
            if backend.id.as_str().is_empty() {
                return invalid("backend id must not be empty");
            }
            if !seen.insert(&backend.id) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate backend id '{}'",
                    backend.id
                )));
            }
            if backend.timeout_secs == Some(0) {
                return Err(ConfigError::Invalid(format!(
                    "backend '{}' timeout_secs must be > 0",
                    backend.id
                )));
            }
        }
        Ok(())
    }

    /// Registry of the configured backends.
    pub fn registry(&self) -> BackendRegistry {
        BackendRegistry::new(self.backends.iter().map(BackendConfig::profile))
    }

    /// Longest a retrying half-open trial goes between lease renewals: one
    /// attempt bounded by the slowest backend timeout, or one backoff.
    pub fn trial_lease(&self) -> Duration {
        let slowest = self
            .registry()
            .profiles()
            .iter()
            .map(|p| p.timeout)
            .max()
            .unwrap_or_default();
        slowest.max(Duration::from_millis(self.retry.max_delay_ms))
    }

    pub fn breaker_state_path(&self) -> Option<PathBuf> {
        self.state_dir.as_ref().map(|dir| dir.join("breaker.json"))
    }

    pub fn stats_state_path(&self) -> Option<PathBuf> {
        self.state_dir.as_ref().map(|dir| dir.join("stats.json"))
    }

    pub fn cache_state_path(&self) -> Option<PathBuf> {
        self.state_dir.as_ref().map(|dir| dir.join("cache.json"))
    }
}

fn invalid(message: &str) -> Result<(), ConfigError> {
    Err(ConfigError::Invalid(message.to_string()))
}

fn parse_env<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
    value
        .trim()
        .parse()
        .map_err(|_| ConfigError::Invalid(format!("{key} has invalid value '{value}'")))
}
