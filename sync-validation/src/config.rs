//! Configuration loading for sync-validation.
//!
//! Configuration is loaded from a TOML file (default: `peerlog.toml`).

use serde::Deserialize;
use std::path::PathBuf;
use sync_store::StorageConfig;

/// Root configuration for the validation pipeline.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    /// Storage configuration.
    #[serde(default)]
    pub storage: StorageConfig,
    /// Validation pool configuration.
    #[serde(default)]
    pub validation: ValidationConfig,
}

/// Validation pool configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ValidationConfig {
    /// Maximum validators running at once
    /// (default: available parallelism minus one, at least 1).
    pub threads: Option<usize>,
}

impl ValidationConfig {
    /// Number of validator permits to create.
    pub fn effective_threads(&self) -> usize {
        match self.threads {
            Some(threads) => threads.max(1),
            None => default_threads(),
        }
    }
}

// Leave one core for the storage worker
fn default_threads() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
        .saturating_sub(1)
        .max(1)
}

impl Config {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: &std::path::Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
            path: path.to_path_buf(),
            source: e,
        })?;

        toml::from_str(&content).map_err(|e| ConfigError::ParseError {
            path: path.to_path_buf(),
            source: e,
        })
    }
}

/// Configuration error types.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Failed to read configuration file.
    #[error("failed to read config file {path}: {source}")]
    ReadError {
        /// Path to the configuration file.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },
    /// Failed to parse configuration file.
    #[error("failed to parse config file {path}: {source}")]
    ParseError {
        /// Path to the configuration file.
        path: PathBuf,
        /// Underlying TOML parse error.
        source: toml::de::Error,
    },
}
