//! Default locations for the config file and the storage database.
//!
//! ## Mode Detection
//!
//! - **Portable mode**: If a `.portable` marker file exists next to the
//!   executable, the config and database live in that directory.
//! - **Installed mode** (default): Data is stored under the platform data
//!   directory (`%APPDATA%\persist-engine`, `~/.local/share/persist-engine`).

use std::path::PathBuf;
use tracing::debug;

/// Application name used for directories in installed mode.
const APP_NAME: &str = "persist-engine";

#[derive(Debug, Clone)]
pub struct AppPaths {
    /// Path to the configuration file.
    pub config: PathBuf,
    /// Directory holding the storage database.
    pub state_dir: PathBuf,
    pub is_portable: bool,
}

impl AppPaths {
    /// Detect the appropriate paths based on environment.
    pub fn detect() -> Self {
        let exe_dir = std::env::current_exe()
            .ok()
            .and_then(|p| p.parent().map(|p| p.to_path_buf()))
            .unwrap_or_else(|| PathBuf::from("."));

        if exe_dir.join(".portable").exists() {
            debug!("Running in portable mode: {}", exe_dir.display());
            return Self::rooted_at(exe_dir, true);
        }

        let data_dir = dirs::data_dir().unwrap_or_else(|| exe_dir.clone()).join(APP_NAME);
        debug!("Running in installed mode: {}", data_dir.display());
        Self::rooted_at(data_dir, false)
    }

    /// All paths inside `base`.
    pub fn rooted_at(base: PathBuf, is_portable: bool) -> Self {
        Self {
            config: base.join("config.yaml"),
            state_dir: base.join("state"),
            is_portable,
        }
    }

    /// Get the sled database path (within state_dir).
    pub fn sled_db_path(&self) -> PathBuf {
        self.state_dir.join("sled")
    }
}
