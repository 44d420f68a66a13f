use nestfs_core::{Strategy, DEFAULT_EVICTION_TIMEOUT_MS, DEFAULT_MAX_MOUNTED};
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

pub const ENV_MAX_MOUNTED: &str = "NESTFS_MAX_MOUNTED";
pub const ENV_STRATEGY: &str = "NESTFS_STRATEGY";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Io(#[from] io::Error),
    #[error("TOML parse error: {0}")]
    Toml(String),
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Which kind of buffers stage cached entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BufferPoolKind {
    #[default]
    Memory,
    TempFile,
}

/// Settings of a [`NestFs`](crate::NestFs) context.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct Config {
    /// Number of archives kept mounted before the least recently used is synced.
    pub max_mounted: usize,
    pub strategy: Strategy,
    pub buffer_pool: BufferPoolKind,
    /// Directory for temp-file buffers; the system temp directory if unset.
    pub temp_dir: Option<PathBuf>,
    /// How long unmounting waits for other threads' streams; zero waits indefinitely.
    pub sync_timeout_ms: u64,
    /// How long evicting an archive waits for other threads' streams before
    /// trying again on a later operation; zero waits indefinitely.
    pub eviction_timeout_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_mounted: DEFAULT_MAX_MOUNTED,
            strategy: Strategy::WriteBack,
            buffer_pool: BufferPoolKind::Memory,
            temp_dir: None,
            sync_timeout_ms: 0,
            eviction_timeout_ms: DEFAULT_EVICTION_TIMEOUT_MS,
        }
    }
}

impl Config {
    /// Parse a config from TOML text. Missing keys take their defaults.
    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        toml::from_str(text).map_err(|e| ConfigError::Toml(e.to_string()))
    }

    /// Read and parse the TOML file at `path`.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path.as_ref())?;
        Self::from_toml(&text)
    }

    /// Override settings from `NESTFS_MAX_MOUNTED` and `NESTFS_STRATEGY`.
    pub fn apply_env(&mut self) -> Result<(), ConfigError> {
        self.apply_vars(|key| env::var(key).ok())
    }

    fn apply_vars<F: Fn(&str) -> Option<String>>(&mut self, var: F) -> Result<(), ConfigError> {
        if let Some(value) = var(ENV_MAX_MOUNTED) {
            self.max_mounted = value.trim().parse().map_err(|_| {
                ConfigError::Invalid(format!("{} must be a number, got {:?}", ENV_MAX_MOUNTED, value))
            })?;
        }
        if let Some(value) = var(ENV_STRATEGY) {
            self.strategy = match value.trim() {
                "write-back" => Strategy::WriteBack,
                "write-through" => Strategy::WriteThrough,
                other => {
                    return Err(ConfigError::Invalid(format!(
                        "{} must be write-back or write-through, got {:?}",
                        ENV_STRATEGY, other
                    )))
                }
            };
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_mounted == 0 {
            return Err(ConfigError::Invalid(
                "max-mounted must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}
