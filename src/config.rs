//! Configuration management
//!
//! [`EngineConfig`] tunes a single engine; [`AppConfig`] is the YAML file
//! read by the `persist-engine` binary.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::fs;

pub use crate::engine::WriteFanOut;
use crate::storage::{MemoryStorage, SledStorage, StorageAdapter};

/// How `rehydrate` drains the task queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RunMode {
    /// All queued loads are started before any is awaited.
    #[default]
    Concurrent,
    /// Loads run one after another in registration order.
    Sequential,
}

/// Per-engine settings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Defer hydration until `rehydrate` is called.
    pub skip_hydration: bool,
    pub run_mode: RunMode,
    pub write_fan_out: WriteFanOut,
    /// Keys that must be tracked and hydrated before the engine reports ready.
    ///
    /// Empty means the barrier closes once every registered key is hydrated.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub storage_keys: Vec<String>,
}

impl EngineConfig {
    /// Fields hydrate as soon as they are bound.
    pub fn eager() -> Self {
        Self::default()
    }

    /// Fields hydrate on the next `rehydrate` call.
    pub fn deferred() -> Self {
        Self {
            skip_hydration: true,
            ..Self::default()
        }
    }

    pub fn with_run_mode(mut self, run_mode: RunMode) -> Self {
        self.run_mode = run_mode;
        self
    }

    pub fn with_fan_out(mut self, write_fan_out: WriteFanOut) -> Self {
        self.write_fan_out = write_fan_out;
        self
    }

    /// Declare every key the engine will own up front.
    pub fn with_storage_keys<I, K>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = K>,
        K: Into<String>,
    {
        self.storage_keys = keys.into_iter().map(Into::into).collect();
        self
    }
}

/// Storage backend selection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    #[default]
    Sled,
    Memory,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct StorageConfig {
    #[serde(default)]
    pub backend: StorageBackend,
    /// Database location; defaults to the platform data directory.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
}

impl StorageConfig {
    /// Open the configured adapter.
    pub fn open(&self, default_path: PathBuf) -> Result<Arc<dyn StorageAdapter>> {
        match self.backend {
            StorageBackend::Sled => {
                let path = self.path.clone().unwrap_or(default_path);
                if let Some(parent) = path.parent() {
                    std::fs::create_dir_all(parent).with_context(|| {
                        format!("Failed to create storage directory: {}", parent.display())
                    })?;
                }
                Ok(Arc::new(SledStorage::open(&path)?))
            }
            StorageBackend::Memory => Ok(Arc::new(MemoryStorage::new())),
        }
    }
}

/// Root configuration of the binary.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct AppConfig {
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub engine: EngineConfig,
}

impl AppConfig {
    /// Load configuration from file.
    pub async fn load(path: &str) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read config file: {}", path))?;

        let config: AppConfig = serde_yaml::from_str(&contents)
            .with_context(|| format!("Failed to parse YAML config: {}", path))?;

        Ok(config)
    }

    /// Load `path` if it exists, otherwise fall back to defaults.
    pub async fn load_or_default(path: &str) -> Result<Self> {
        if fs::try_exists(path).await.unwrap_or(false) {
            Self::load(path).await
        } else {
            Ok(Self::default())
        }
    }

    /// Save configuration to file.
    pub async fn save(&self, path: &str) -> Result<()> {
        let yaml = serde_yaml::to_string(self).context("Failed to serialize config to YAML")?;

        fs::write(path, yaml)
            .await
            .with_context(|| format!("Failed to write config file: {}", path))?;

        Ok(())
    }
}
