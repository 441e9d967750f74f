//! Configuration and data directory discovery

use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::history::models::PopularityMetric;

/// Environment variable overriding the data directory
pub const DATA_DIR_ENV: &str = "HISTORY_HEATMAP_DATA_DIR";

/// Name of the config file inside the data directory
pub const CONFIG_FILE_NAME: &str = "config.json";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Get the data directory path
/// Priority: 1. Custom path, 2. HISTORY_HEATMAP_DATA_DIR env var, 3. platform local data dir
pub fn get_data_dir(custom_path: Option<&str>) -> PathBuf {
    if let Some(path) = custom_path {
        return PathBuf::from(path);
    }

    if let Ok(env_path) = env::var(DATA_DIR_ENV) {
        if !env_path.trim().is_empty() {
            return PathBuf::from(env_path);
        }
    }

    if let Some(dir) = dirs::data_local_dir() {
        return dir.join("history-heatmap");
    }

    PathBuf::from(".history-heatmap")
}

/// Path of the key-value database within the data directory
pub fn get_store_path(custom_path: Option<&str>) -> PathBuf {
    get_data_dir(custom_path).join("store.db")
}

/// Application configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppConfig {
    #[serde(default)]
    pub data_path: Option<String>,
    #[serde(default = "default_tick_interval_secs")]
    pub tick_interval_secs: u64,
    #[serde(default = "default_max_tick_gap_secs")]
    pub max_tick_gap_secs: u64,
    #[serde(default = "default_time_flush_interval_secs")]
    pub time_flush_interval_secs: u64,
    #[serde(default = "default_store_debounce_ms")]
    pub store_debounce_ms: u64,
    #[serde(default = "default_row_height")]
    pub row_height: f64,
    #[serde(default = "default_col_width")]
    pub col_width: f64,
    #[serde(default = "default_row_buffer")]
    pub row_buffer: usize,
    #[serde(default = "default_col_buffer")]
    pub col_buffer: usize,
    #[serde(default)]
    pub popularity_metric: PopularityMetric,
    #[serde(default = "default_closed_tabs_limit")]
    pub closed_tabs_limit: usize,
    #[serde(default = "default_favicon_ttl_days")]
    pub favicon_ttl_days: i64,
    #[serde(default = "default_calendar_lookahead_days")]
    pub calendar_lookahead_days: i64,
}

fn default_tick_interval_secs() -> u64 {
    1
}

fn default_max_tick_gap_secs() -> u64 {
    90
}

fn default_time_flush_interval_secs() -> u64 {
    30
}

fn default_store_debounce_ms() -> u64 {
    3000
}

fn default_row_height() -> f64 {
    28.0
}

fn default_col_width() -> f64 {
    32.0
}

fn default_row_buffer() -> usize {
    5
}

fn default_col_buffer() -> usize {
    3
}

fn default_closed_tabs_limit() -> usize {
    50
}

fn default_favicon_ttl_days() -> i64 {
    7
}

fn default_calendar_lookahead_days() -> i64 {
    7
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            data_path: None,
            tick_interval_secs: default_tick_interval_secs(),
            max_tick_gap_secs: default_max_tick_gap_secs(),
            time_flush_interval_secs: default_time_flush_interval_secs(),
            store_debounce_ms: default_store_debounce_ms(),
            row_height: default_row_height(),
            col_width: default_col_width(),
            row_buffer: default_row_buffer(),
            col_buffer: default_col_buffer(),
            popularity_metric: PopularityMetric::default(),
            closed_tabs_limit: default_closed_tabs_limit(),
            favicon_ttl_days: default_favicon_ttl_days(),
            calendar_lookahead_days: default_calendar_lookahead_days(),
        }
    }
}

impl AppConfig {
    /// Load `config.json` from the data directory
    ///
    /// A missing file yields defaults; a malformed one is logged and ignored.
    pub fn load(custom_path: Option<&str>) -> Self {
        let path = get_data_dir(custom_path).join(CONFIG_FILE_NAME);
        match Self::load_from(&path) {
            Ok(Some(mut config)) => {
                if config.data_path.is_none() {
                    config.data_path = custom_path.map(str::to_string);
                }
                config
            }
            Ok(None) => Self {
                data_path: custom_path.map(str::to_string),
                ..Self::default()
            },
            Err(e) => {
                log::warn!("Ignoring unreadable config {:?}: {}", path, e);
                Self {
                    data_path: custom_path.map(str::to_string),
                    ..Self::default()
                }
            }
        }
    }

    fn load_from(path: &Path) -> Result<Option<Self>, ConfigError> {
        if !path.exists() {
            return Ok(None);
        }
        let raw = fs::read_to_string(path)?;
        Ok(Some(serde_json::from_str(&raw)?))
    }

    /// Write the config into its data directory
    pub fn save(&self) -> Result<PathBuf, ConfigError> {
        let dir = get_data_dir(self.data_path.as_deref());
        fs::create_dir_all(&dir)?;
        let path = dir.join(CONFIG_FILE_NAME);
        fs::write(&path, serde_json::to_string_pretty(self)?)?;
        Ok(path)
    }

    pub fn data_dir(&self) -> PathBuf {
        get_data_dir(self.data_path.as_deref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_custom_path_takes_priority() {
        assert_eq!(get_data_dir(Some("/tmp/heatmap")), PathBuf::from("/tmp/heatmap"));
        assert_eq!(
            get_store_path(Some("/tmp/heatmap")),
            PathBuf::from("/tmp/heatmap/store.db")
        );
    }

    #[test]
    fn test_missing_config_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().to_str().unwrap();
        let config = AppConfig::load(Some(path));
        assert_eq!(config.max_tick_gap_secs, 90);
        assert_eq!(config.closed_tabs_limit, 50);
        assert_eq!(config.data_path.as_deref(), Some(path));
    }

    #[test]
    fn test_save_and_load_partial_config() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().to_str().unwrap().to_string();
        fs::write(
            dir.path().join(CONFIG_FILE_NAME),
            r#"{"rowHeight": 20.0, "popularityMetric": "totalVisits"}"#,
        )
        .unwrap();

        let config = AppConfig::load(Some(&path));
        assert_eq!(config.row_height, 20.0);
        assert_eq!(config.popularity_metric, PopularityMetric::TotalVisits);
        assert_eq!(config.col_width, 32.0);

        let written = config.save().unwrap();
        assert!(written.exists());
    }

    #[test]
    fn test_malformed_config_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join(CONFIG_FILE_NAME), "{not json").unwrap();
        let config = AppConfig::load(dir.path().to_str());
        assert_eq!(config.store_debounce_ms, 3000);
    }
}
