//! CLI configuration.
//!
//! Read from `<config dir>/imgup/config.json`. Every field is optional; a
//! missing or unparsable file means defaults.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CliConfig {
    /// Bytes per chunk for `split`.
    pub chunk_size: u64,

    /// Worker thread cap; `None` means the pool default.
    pub max_workers: Option<usize>,

    /// Session lifetime in hours.
    pub session_ttl_hours: u64,

    /// Where session files live; `None` means the platform default.
    pub session_dir: Option<PathBuf>,
}

impl Default for CliConfig {
    fn default() -> Self {
        Self {
            chunk_size: imgup_hasher::DEFAULT_CHUNK_SIZE,
            max_workers: None,
            session_ttl_hours: 24,
            session_dir: None,
        }
    }
}

impl CliConfig {
    /// Loads `path`, or the default location when `path` is `None`.
    pub fn load(path: Option<&Path>) -> Self {
        let Some(path) = path.map(Path::to_path_buf).or_else(default_config_path) else {
            tracing::debug!("no config directory, using defaults");
            return Self::default();
        };
        Self::load_from(&path)
    }

    fn load_from(path: &Path) -> Self {
        let content = match std::fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "no config file, using defaults");
                return Self::default();
            }
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "failed to read config, using defaults");
                return Self::default();
            }
        };

        match serde_json::from_str::<CliConfig>(&content) {
            Ok(config) => {
                tracing::debug!(path = %path.display(), "configuration loaded");
                config.sanitized()
            }
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "failed to parse config, using defaults");
                Self::default()
            }
        }
    }

    fn sanitized(mut self) -> Self {
        if self.chunk_size == 0 {
            tracing::warn!("chunkSize must be positive, using default");
            self.chunk_size = imgup_hasher::DEFAULT_CHUNK_SIZE;
        }
        self
    }

    pub fn session_ttl(&self) -> Duration {
        Duration::from_secs(self.session_ttl_hours.saturating_mul(60 * 60))
    }
}

/// `<config dir>/imgup/config.json`.
pub fn default_config_path() -> Option<PathBuf> {
    imgup_session_store::default_config_dir().map(|d| d.join("config.json"))
}
