//! # Configuration Module
//!
//! This module handles configuration management and data directory setup for
//! Songmesh. Settings come from a plain `key = value` properties file; every
//! key is optional and falls back to a default.
//!
//! ## Data Storage
//!
//! Songmesh keeps its files in the platform-standard data directory:
//! - Linux: `~/.local/share/songmesh/`
//! - macOS: `~/Library/Application Support/songmesh/`
//! - Windows: `%APPDATA%\songmesh\`
//!
//! ## Recognized Keys
//!
//! | key                                | meaning                              |
//! |------------------------------------|--------------------------------------|
//! | `songhandler.downloadlist.length`  | prefetch queue capacity (≥ 1)        |
//! | `songmesh.scheduler.threads`       | background pool size                 |
//! | `songmesh.worker.idle_backoff_ms`  | worker wait when nothing to fetch    |
//! | `songmesh.filter.expected_items`   | catalog filter sizing                |
//! | `songmesh.filter.fp_rate`          | catalog filter false-positive target |
//! | `songmesh.cache_dir`               | where fetched songs are stored       |
//! | `songmesh.library_db`              | on-disk library index (optional)     |

use anyhow::{bail, Context, Result};
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Name of the properties file inside the data directory.
pub const CONFIG_FILE: &str = "songmesh.properties";

/// Prefetch queue capacity key, in the older `songhandler` namespace.
pub const DOWNLOAD_LIST_LENGTH: &str = "songhandler.downloadlist.length";

/// Returns the platform-appropriate data directory for Songmesh, creating it
/// if needed.
///
/// # Errors
///
/// This function will return an error if:
/// - The system data directory cannot be determined
/// - The songmesh subdirectory cannot be created due to permissions
pub fn get_data_dir() -> Result<PathBuf> {
    // Get platform-appropriate data directory
    let data_dir = dirs::data_dir()
        .ok_or_else(|| anyhow::anyhow!(
            "Could not determine system data directory. Please ensure your platform supports standard data directories."
        ))?;

    data_dir_in(&data_dir)
}

/// The `songmesh` directory under `base`, created if missing.
fn data_dir_in(base: &Path) -> Result<PathBuf> {
    let songmesh_dir = base.join("songmesh");
    fs::create_dir_all(&songmesh_dir)
        .with_context(|| format!(
            "Failed to create Songmesh data directory at {}. Please check file permissions.",
            songmesh_dir.display()
        ))?;

    Ok(songmesh_dir)
}

/// Default location of the properties file.
///
/// # Errors
///
/// Same as [`get_data_dir`].
pub fn get_config_path() -> Result<PathBuf> {
    Ok(get_data_dir()?.join(CONFIG_FILE))
}

/// Default cache directory for songs fetched from other peers.
fn default_cache_dir() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("songmesh")
}

/// Runtime settings of a node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeConfig {
    /// How many songs are fetched ahead of playback.
    pub download_list_length: usize,
    pub scheduler_threads: usize,
    pub idle_backoff_ms: u64,
    pub filter_expected_items: usize,
    pub filter_fp_rate: f64,
    pub cache_dir: PathBuf,
    /// In-memory index when unset.
    pub library_db: Option<PathBuf>,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            download_list_length: 5,
            scheduler_threads: crate::scheduler::DEFAULT_THREADS,
            idle_backoff_ms: 500,
            filter_expected_items: 2000,
            filter_fp_rate: 0.01,
            cache_dir: default_cache_dir(),
            library_db: None,
        }
    }
}

impl NodeConfig {
    /// Load settings from `path`. A missing file means defaults.
    ///
    /// # Errors
    ///
    /// Fails if the file exists but cannot be read or holds invalid values.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            debug!("No config at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config: {}", path.display()))?;
        Self::parse(&content).with_context(|| format!("Invalid config: {}", path.display()))
    }

    /// Load from the default location.
    ///
    /// # Errors
    ///
    /// See [`NodeConfig::load`].
    pub fn load_default() -> Result<Self> {
        Self::load(&get_config_path()?)
    }

    /// Parse `key = value` lines. `#` starts a comment line; unknown keys are
    /// warned about and skipped.
    ///
    /// # Errors
    ///
    /// Fails on lines without `=` and on values that do not parse.
    pub fn parse(content: &str) -> Result<Self> {
        let mut config = Self::default();

        for (number, line) in content.lines().enumerate() {
            let line = line.trim();

            // Skip comments and empty lines
            if line.starts_with('#') || line.is_empty() {
                continue;
            }

            let Some((key, value)) = line.split_once('=') else {
                bail!("Line {}: expected `key = value`, got `{line}'", number + 1);
            };
            let (key, value) = (key.trim(), value.trim().trim_matches('"'));

            match key {
                DOWNLOAD_LIST_LENGTH => {
                    config.download_list_length = parse_value(key, value)?;
                    if config.download_list_length == 0 {
                        bail!("{DOWNLOAD_LIST_LENGTH} must be a positive integer");
                    }
                }
                "songmesh.scheduler.threads" => config.scheduler_threads = parse_value(key, value)?,
                "songmesh.worker.idle_backoff_ms" => config.idle_backoff_ms = parse_value(key, value)?,
                "songmesh.filter.expected_items" => config.filter_expected_items = parse_value(key, value)?,
                "songmesh.filter.fp_rate" => {
                    config.filter_fp_rate = parse_value(key, value)?;
                    if !(config.filter_fp_rate > 0.0 && config.filter_fp_rate < 1.0) {
                        bail!("songmesh.filter.fp_rate must be between 0 and 1");
                    }
                }
                "songmesh.cache_dir" => config.cache_dir = expand_home(value),
                "songmesh.library_db" => config.library_db = Some(expand_home(value)),
                _ => warn!("Ignoring unknown config key `{key}'"),
            }
        }

        Ok(config)
    }

    #[must_use]
    pub const fn idle_backoff(&self) -> Duration {
        Duration::from_millis(self.idle_backoff_ms)
    }

    /// Pretty JSON, for `songmesh config show`.
    ///
    /// # Errors
    ///
    /// Only fails if serde_json cannot serialize the config.
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).context("Failed to render config")
    }
}

fn parse_value<T>(key: &str, value: &str) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    value
        .parse()
        .map_err(|e| anyhow::anyhow!("Invalid value `{value}' for {key}: {e}"))
}

/// Expand a leading `~` to the home directory.
fn expand_home(value: &str) -> PathBuf {
    match value.strip_prefix("~/") {
        Some(rest) => dirs::home_dir().map_or_else(|| PathBuf::from(value), |home| home.join(rest)),
        None => PathBuf::from(value),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_parse_download_list_length() {
        let config = NodeConfig::parse("songhandler.downloadlist.length = 3\n").unwrap();
        assert_eq!(config.download_list_length, 3);
        assert_eq!(config.idle_backoff_ms, NodeConfig::default().idle_backoff_ms);
    }

    #[test]
    fn test_parse_all_keys_and_comments() {
        let content = "
            # prefetch
            songhandler.downloadlist.length=7
            songmesh.scheduler.threads = 6
            songmesh.worker.idle_backoff_ms = 20
            songmesh.filter.expected_items = 10000
            songmesh.filter.fp_rate = 0.001
            songmesh.cache_dir = \"/tmp/songmesh-cache\"
            songmesh.library_db = /tmp/library.db3
            something.else = 1
        ";
        let config = NodeConfig::parse(content).unwrap();

        assert_eq!(config.download_list_length, 7);
        assert_eq!(config.scheduler_threads, 6);
        assert_eq!(config.idle_backoff(), Duration::from_millis(20));
        assert_eq!(config.filter_expected_items, 10_000);
        assert!((config.filter_fp_rate - 0.001).abs() < f64::EPSILON);
        assert_eq!(config.cache_dir, PathBuf::from("/tmp/songmesh-cache"));
        assert_eq!(config.library_db, Some(PathBuf::from("/tmp/library.db3")));
    }

    #[test]
    fn test_rejects_invalid_values() {
        assert!(NodeConfig::parse("songhandler.downloadlist.length = 0").is_err());
        assert!(NodeConfig::parse("songhandler.downloadlist.length = -2").is_err());
        assert!(NodeConfig::parse("songhandler.downloadlist.length = many").is_err());
        assert!(NodeConfig::parse("songmesh.filter.fp_rate = 1.5").is_err());
        assert!(NodeConfig::parse("no equals sign").is_err());
    }

    #[test]
    fn test_load_missing_file_gives_defaults() {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let config = NodeConfig::load(&temp_dir.path().join("absent.properties")).unwrap();
        assert_eq!(config, NodeConfig::default());
    }

    #[test]
    fn test_load_from_file() {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let path = temp_dir.path().join(CONFIG_FILE);
        fs::write(&path, "songhandler.downloadlist.length = 2\n").unwrap();

        assert_eq!(NodeConfig::load(&path).unwrap().download_list_length, 2);
    }

    #[test]
    fn test_config_json() {
        let json = NodeConfig::default().to_json().unwrap();
        assert!(json.contains("download_list_length"));
    }

    #[test]
    fn test_data_dir_is_created_under_base() {
        let base = TempDir::new().unwrap();
        let dir = data_dir_in(base.path()).expect("data dir should be created");
        assert!(dir.is_dir());
        assert_eq!(dir, base.path().join("songmesh"));

        assert_eq!(data_dir_in(base.path()).unwrap(), dir, "Existing directory is reused");
    }
}
