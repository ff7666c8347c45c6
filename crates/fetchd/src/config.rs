use std::path::{Path, PathBuf};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Configuration for the fetch daemon and its background job manager
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// External download tool invoked for video/audio jobs
    pub downloader_bin: PathBuf,
    /// Directory the download tool's output template points into
    pub download_dir: PathBuf,
    /// Age in seconds after which terminal job records become prunable
    pub retention_secs: u64,
    /// Interval in seconds between retention sweeps
    pub prune_interval_secs: u64,
    /// Maximum bytes of interleaved process output retained per job
    pub output_tail_bytes: usize,
    /// Optional hard timeout for a single job, in seconds
    pub job_timeout_secs: Option<u64>,
    /// Buffered capacity of the lifecycle event channel
    pub event_capacity: usize,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self::default_config()
    }
}

impl ServiceConfig {
    /// Create a default configuration with sensible values
    pub fn default_config() -> Self {
        Self {
            downloader_bin: PathBuf::from("yt-dlp"),
            download_dir: PathBuf::from("/tmp/fetchd"),
            retention_secs: 3600,
            prune_interval_secs: 300,
            output_tail_bytes: 16 * 1024,
            job_timeout_secs: None,
            event_capacity: 256,
        }
    }

    /// Load configuration from a file, or return defaults if path is None or file doesn't exist
    pub fn load_config(path: Option<&Path>) -> Result<Self> {
        let mut config = Self::default_config();

        if let Some(config_path) = path {
            if config_path.exists() {
                let content = std::fs::read_to_string(config_path)
                    .with_context(|| format!("Failed to read config file: {}", config_path.display()))?;

                // Try JSON first, then TOML
                if config_path.extension().and_then(|s| s.to_str()) == Some("toml") {
                    let file_config: ServiceConfig = toml::from_str(&content)
                        .with_context(|| format!("Failed to parse TOML config: {}", config_path.display()))?;
                    config = file_config;
                } else {
                    let file_config: ServiceConfig = serde_json::from_str(&content)
                        .with_context(|| format!("Failed to parse JSON config: {}", config_path.display()))?;
                    config = file_config;
                }
            }
        }

        Ok(config)
    }
}
