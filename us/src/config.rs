//! Configuration types and loading

use eyre::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::scheduler::SchedulerConfig;

/// Main configuration file contents
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Scheduler limits and retry policy
    pub scheduler: SchedulerConfig,

    /// Log output settings
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration with fallback chain
    pub fn load(config_path: Option<&PathBuf>) -> Result<Self> {
        // If explicit config path provided, try to load it
        if let Some(path) = config_path {
            return Self::load_from_file(path).context(format!("Failed to load config from {}", path.display()));
        }

        // Try project-local config: .uploadsched.yml
        let local_config = PathBuf::from(".uploadsched.yml");
        if local_config.exists() {
            match Self::load_from_file(&local_config) {
                Ok(config) => return Ok(config),
                Err(e) => {
                    tracing::warn!("Failed to load config from {}: {}", local_config.display(), e);
                }
            }
        }

        // Try user config: ~/.config/uploadsched/uploadsched.yml
        if let Some(config_dir) = dirs::config_dir() {
            let user_config = config_dir.join("uploadsched").join("uploadsched.yml");
            if user_config.exists() {
                match Self::load_from_file(&user_config) {
                    Ok(config) => return Ok(config),
                    Err(e) => {
                        tracing::warn!("Failed to load config from {}: {}", user_config.display(), e);
                    }
                }
            }
        }

        // No config file found, use defaults
        tracing::info!("No config file found, using defaults");
        Ok(Self::default())
    }

    /// Read just the logging section, before logging is set up
    ///
    /// Errors are swallowed here; `load` reports them once logging works.
    pub fn load_logging(config_path: Option<&PathBuf>) -> LoggingConfig {
        let candidates = match config_path {
            Some(path) => vec![path.clone()],
            None => {
                let mut paths = vec![PathBuf::from(".uploadsched.yml")];
                if let Some(config_dir) = dirs::config_dir() {
                    paths.push(config_dir.join("uploadsched").join("uploadsched.yml"));
                }
                paths
            }
        };

        candidates
            .iter()
            .find(|p| p.exists())
            .and_then(|p| Self::load_from_file(p).ok())
            .map(|c| c.logging)
            .unwrap_or_default()
    }

    fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(&path).context("Failed to read config file")?;

        let config: Self = serde_yaml::from_str(&content).context("Failed to parse config file")?;
        config
            .scheduler
            .validate()
            .context("Invalid scheduler configuration")?;

        tracing::info!("Loaded config from: {}", path.as_ref().display());
        Ok(config)
    }
}

/// Log output settings
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default level (trace, debug, info, warn, error); `--verbose` overrides
    pub level: Option<String>,

    /// Log file path, defaults to the platform data directory
    pub file: Option<PathBuf>,
}

impl LoggingConfig {
    /// Log file to write, falling back to `<data_local_dir>/uploadsched/logs/uploadsched.log`
    pub fn log_path(&self) -> PathBuf {
        self.file.clone().unwrap_or_else(default_log_path)
    }
}

pub fn default_log_path() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("uploadsched")
        .join("logs")
        .join("uploadsched.log")
}
