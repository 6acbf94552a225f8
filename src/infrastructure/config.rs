//! Runtime configuration loading.
//!
//! Hierarchical merge, lowest to highest precedence: programmatic
//! defaults, `.workfarm/config.yaml` in the current directory, then
//! `WORKFARM_`-prefixed environment variables.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use figment::providers::{Env, Format, Serialized, Yaml};
use figment::Figment;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Configuration error types.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid log level: {0}. Must be one of: trace, debug, info, warn, error")]
    InvalidLogLevel(String),

    #[error("invalid log format: {0}. Must be one of: json, pretty")]
    InvalidLogFormat(String),

    #[error("worker binary cannot be empty")]
    EmptyWorkerBinary,

    #[error("oracle timeout must be at least 1 second")]
    InvalidOracleTimeout,

    #[error("scheduler tick must be at least 100 ms")]
    InvalidSchedulerTick(u64),
}

/// Worker subprocess settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Binary invoked for worker and oracle subprocesses.
    pub binary: String,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            binary: "claude".to_string(),
        }
    }
}

/// Oracle subprocess settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OracleConfig {
    /// Hard cap on a single completion, in seconds.
    pub timeout_secs: u64,
    /// Give up retrying transient spawn failures after this long.
    pub retry_max_elapsed_secs: u64,
}

impl Default for OracleConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 300,
            retry_max_elapsed_secs: 60,
        }
    }
}

/// Logging settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// trace | debug | info | warn | error
    pub level: String,
    /// json | pretty
    pub format: String,
    /// Write to `<data_dir>/workfarm.log` instead of stdout. Defaults to
    /// true so log lines don't interleave with the REPL.
    pub file: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
            file: true,
        }
    }
}

/// Top-level runtime configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Root directory for persisted state.
    pub data_dir: PathBuf,
    pub worker: WorkerConfig,
    pub oracle: OracleConfig,
    pub logging: LoggingConfig,
    /// Trigger scheduler tick interval.
    pub scheduler_tick_ms: u64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            worker: WorkerConfig::default(),
            oracle: OracleConfig::default(),
            logging: LoggingConfig::default(),
            scheduler_tick_ms: 1000,
        }
    }
}

/// `$HOME/.workfarm-data`, falling back to the current directory.
pub fn default_data_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".workfarm-data")
}

/// Configuration loader with hierarchical merging.
pub struct ConfigLoader;

impl ConfigLoader {
    /// Load configuration from the default locations.
    pub fn load() -> Result<RuntimeConfig> {
        let config: RuntimeConfig = Figment::new()
            .merge(Serialized::defaults(RuntimeConfig::default()))
            .merge(Yaml::file(".workfarm/config.yaml"))
            .merge(Env::prefixed("WORKFARM_").split("__"))
            .extract()
            .context("failed to extract configuration")?;

        Self::validate(&config)?;
        Ok(config)
    }

    /// Load configuration from a specific file.
    pub fn load_from_file(path: impl AsRef<Path>) -> Result<RuntimeConfig> {
        let config: RuntimeConfig = Figment::new()
            .merge(Serialized::defaults(RuntimeConfig::default()))
            .merge(Yaml::file(path.as_ref()))
            .merge(Env::prefixed("WORKFARM_").split("__"))
            .extract()
            .context(format!(
                "failed to load config from {}",
                path.as_ref().display()
            ))?;

        Self::validate(&config)?;
        Ok(config)
    }

    /// Validate configuration after loading.
    pub fn validate(config: &RuntimeConfig) -> Result<(), ConfigError> {
        let valid_log_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_log_levels.contains(&config.logging.level.as_str()) {
            return Err(ConfigError::InvalidLogLevel(config.logging.level.clone()));
        }

        let valid_log_formats = ["json", "pretty"];
        if !valid_log_formats.contains(&config.logging.format.as_str()) {
            return Err(ConfigError::InvalidLogFormat(config.logging.format.clone()));
        }

        if config.worker.binary.trim().is_empty() {
            return Err(ConfigError::EmptyWorkerBinary);
        }

        if config.oracle.timeout_secs == 0 {
            return Err(ConfigError::InvalidOracleTimeout);
        }

        if config.scheduler_tick_ms < 100 {
            return Err(ConfigError::InvalidSchedulerTick(config.scheduler_tick_ms));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = RuntimeConfig::default();
        assert!(ConfigLoader::validate(&config).is_ok());
        assert_eq!(config.worker.binary, "claude");
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let config = RuntimeConfig {
            logging: LoggingConfig {
                level: "verbose".to_string(),
                ..LoggingConfig::default()
            },
            ..RuntimeConfig::default()
        };
        assert!(ConfigLoader::validate(&config).is_err());

        let config = RuntimeConfig {
            worker: WorkerConfig {
                binary: "  ".to_string(),
            },
            ..RuntimeConfig::default()
        };
        assert!(ConfigLoader::validate(&config).is_err());

        let config = RuntimeConfig {
            scheduler_tick_ms: 10,
            ..RuntimeConfig::default()
        };
        assert!(ConfigLoader::validate(&config).is_err());
    }

    #[test]
    fn test_default_data_dir_is_under_home() {
        let dir = default_data_dir();
        assert!(dir.ends_with(".workfarm-data"));
    }
}
