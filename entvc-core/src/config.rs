//! Engine configuration, stored at `<repo>/entvc-config.json`

use crate::error::{EngineError, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

const CONFIG_FILE: &str = "entvc-config.json";

/// Where ids, timestamps and counters come from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ClockMode {
    /// OS entropy for ids, wall clock for timestamps
    System,
    /// Seeded counter; identical seed and call order give identical output
    Deterministic { seed: u64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClockConfig {
    pub mode: ClockMode,
    /// Store the counter in `engine_meta` so a reopened engine continues the
    /// sequence instead of restarting from zero
    #[serde(default)]
    pub persist_counter: bool,
}

impl Default for ClockConfig {
    fn default() -> Self {
        Self {
            mode: ClockMode::System,
            persist_counter: false,
        }
    }
}

impl ClockConfig {
    pub fn deterministic(seed: u64) -> Self {
        Self {
            mode: ClockMode::Deterministic { seed },
            persist_counter: false,
        }
    }
}

/// What a read does when a version's cached state is marked stale
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheReadPolicy {
    /// Rebuild the version's cache, then read from it
    RebuildBeforeRead,
    /// Leave the cache alone and resolve from the log directly
    DirectLogFallback,
}

/// Engine configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub clock: ClockConfig,
    #[serde(default = "default_cache_read_policy")]
    pub cache_read_policy: CacheReadPolicy,
    /// Rebuild the cache inside the commit transaction instead of marking stale
    #[serde(default)]
    pub eager_cache_rebuild: bool,
    /// Entries kept in the in-process snapshot content cache
    #[serde(default = "default_snapshot_cache_capacity")]
    pub snapshot_cache_capacity: usize,
}

fn default_cache_read_policy() -> CacheReadPolicy {
    CacheReadPolicy::RebuildBeforeRead
}

fn default_snapshot_cache_capacity() -> usize {
    256
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            clock: ClockConfig::default(),
            cache_read_policy: default_cache_read_policy(),
            eager_cache_rebuild: false,
            snapshot_cache_capacity: default_snapshot_cache_capacity(),
        }
    }
}

impl EngineConfig {
    /// Deterministic configuration, as used by reproducible tests
    pub fn deterministic(seed: u64) -> Self {
        Self {
            clock: ClockConfig::deterministic(seed),
            ..Self::default()
        }
    }

    /// Load the config of a repository directory, falling back to defaults
    pub fn load(repo_path: &Path) -> Result<Self> {
        let config_path = Self::config_path(repo_path);
        if !config_path.exists() {
            return Ok(Self::default());
        }
        let data = fs::read_to_string(&config_path).map_err(|e| {
            EngineError::InvalidOperation(format!(
                "Failed to read config from {:?}: {}",
                config_path, e
            ))
        })?;
        Ok(serde_json::from_str(&data)?)
    }

    /// Save the config into a repository directory (atomic rename)
    pub fn save(&self, repo_path: &Path) -> Result<()> {
        let config_path = Self::config_path(repo_path);
        let tmp_path = config_path.with_extension("tmp");
        let data = serde_json::to_string_pretty(self)?;
        let io_err = |e: std::io::Error| {
            EngineError::InvalidOperation(format!(
                "Failed to write config to {:?}: {}",
                config_path, e
            ))
        };
        fs::write(&tmp_path, data).map_err(io_err)?;
        fs::rename(&tmp_path, &config_path).map_err(io_err)?;
        Ok(())
    }

    fn config_path(repo_path: &Path) -> PathBuf {
        repo_path.join(CONFIG_FILE)
    }
}
