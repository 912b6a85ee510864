//! Engine configuration via TOML.
//!
//! Missing or corrupted config files log a warning and fall back to defaults,
//! so a fresh install needs no config at all.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Root for blobs, keys, subscriptions, and reassembled downloads.
    pub data_dir: PathBuf,
    /// Blob server port; 0 picks an ephemeral port.
    pub listen_port: u16,
    /// Global cap on simultaneously active blob downloads.
    pub max_concurrent_downloads: usize,
    /// Subscription poll period in seconds.
    pub poll_interval_secs: u64,
    /// Blob store capacity in bytes; oldest blobs are evicted past it.
    pub store_capacity_bytes: u64,
    /// Cap on simultaneously served peer connections.
    pub max_connections: usize,
    /// Re-hash every stored blob at startup, quarantining mismatches.
    pub verify_store_on_open: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("strand-data"),
            listen_port: 0,
            max_concurrent_downloads: 3,
            poll_interval_secs: 600,
            store_capacity_bytes: 10 * 1024 * 1024 * 1024,
            max_connections: 64,
            verify_store_on_open: false,
        }
    }
}

impl EngineConfig {
    /// Load from `path`, falling back to defaults if the file is missing or
    /// unreadable.
    pub fn load(path: &Path) -> Self {
        match std::fs::read_to_string(path) {
            Ok(contents) => match toml::from_str(&contents) {
                Ok(config) => {
                    tracing::info!(path = %path.display(), "config loaded");
                    config
                }
                Err(e) => {
                    tracing::warn!(
                        path = %path.display(),
                        error = %e,
                        "corrupted config file, using defaults"
                    );
                    Self::default()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!(path = %path.display(), "config file not found, using defaults");
                Self::default()
            }
            Err(e) => {
                tracing::warn!(
                    path = %path.display(),
                    error = %e,
                    "failed to read config file, using defaults"
                );
                Self::default()
            }
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create config directory: {}", parent.display()))?;
        }
        let contents = toml::to_string_pretty(self).context("failed to serialize config")?;
        std::fs::write(path, contents)
            .with_context(|| format!("failed to write config file: {}", path.display()))?;
        Ok(())
    }
}
