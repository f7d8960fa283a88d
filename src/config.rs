//! # Configuration Module
//!
//! Data directory discovery, the `config.toml` file and environment
//! overrides.
//!
//! ## Data Storage
//!
//! Everything lives in the platform data directory unless
//! `TUNESIFT_DATA_DIR` points elsewhere:
//! - Linux: `~/.local/share/tunesift/`
//! - macOS: `~/Library/Application Support/tunesift/`
//! - Windows: `%APPDATA%\tunesift\`
//!
//! | File | Contents |
//! |---|---|
//! | `tunesift.db` | library, statistics, interaction log |
//! | `search_cache.json` | cached search results |
//! | `config.toml` | [`CoreConfig`] |
//!
//! ## Environment
//!
//! - `TUNESIFT_DATA_DIR`: data directory (relative paths are absolutized)
//! - `TUNESIFT_REMOTE_URL`: federated search endpoint
//! - `TUNESIFT_MODE`: `hybrid` (default) or `offline`

use anyhow::{Context, Result};
use log::{debug, info};
use path_absolutize::Absolutize;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::offline::CoordinatorSettings;
use crate::scoring::ScoringPreferences;

pub const DATA_DIR_ENV: &str = "TUNESIFT_DATA_DIR";
pub const REMOTE_URL_ENV: &str = "TUNESIFT_REMOTE_URL";
pub const MODE_ENV: &str = "TUNESIFT_MODE";

const APP_DIR: &str = "tunesift";
const DB_FILE: &str = "tunesift.db";
const CACHE_FILE: &str = "search_cache.json";
const CONFIG_FILE: &str = "config.toml";

/// Whether remote search is used at all
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AppMode {
    /// Local library plus federated search
    #[default]
    Hybrid,
    /// Local library and cache only; probing is disabled
    Offline,
}

impl std::str::FromStr for AppMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "hybrid" => Ok(Self::Hybrid),
            "offline" => Ok(Self::Offline),
            other => Err(anyhow::anyhow!("Unknown mode `{other}`. Use 'hybrid' or 'offline'")),
        }
    }
}

/// Tunables of the search core, loaded from `config.toml`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoreConfig {
    pub mode: AppMode,
    pub remote_url: String,
    pub remote_timeout_ms: u64,
    pub probe_interval_secs: u64,
    pub probe_timeout_ms: u64,
    pub cache_max_memory_bytes: usize,
    pub cache_ttl_secs: u64,
    pub cache_max_results_per_query: usize,
    pub sweep_interval_secs: u64,
    pub interaction_flush_ms: u64,
    /// Remote engines used when a search names none; empty means all
    pub default_engines: Vec<String>,
    pub scoring: ScoringPreferences,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            mode: AppMode::Hybrid,
            remote_url: "http://localhost:8888".to_string(),
            remote_timeout_ms: 10_000,
            probe_interval_secs: 30,
            probe_timeout_ms: 5_000,
            cache_max_memory_bytes: 50 * 1024 * 1024,
            cache_ttl_secs: 3_600,
            cache_max_results_per_query: 100,
            sweep_interval_secs: 60,
            interaction_flush_ms: 500,
            default_engines: Vec::new(),
            scoring: ScoringPreferences::default(),
        }
    }
}

impl CoreConfig {
    /// Read `path`, falling back to defaults when the file does not exist
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            debug!("No config at {}, using defaults", path.display());
            return Ok(Self::default());
        }
        let text = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let config: Self = toml::from_str(&text)
            .with_context(|| format!("Invalid config file {}", path.display()))?;
        info!("Loaded config from {}", path.display());
        Ok(config.validated())
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let text = toml::to_string_pretty(self).context("Failed to serialize config")?;
        fs::write(path, text)
            .with_context(|| format!("Failed to write config file {}", path.display()))
    }

    /// Clamp values that would make the core misbehave
    #[must_use]
    pub fn validated(mut self) -> Self {
        self.scoring = self.scoring.validated();
        self.remote_timeout_ms = self.remote_timeout_ms.max(1);
        self.probe_timeout_ms = self.probe_timeout_ms.max(1);
        self.probe_interval_secs = self.probe_interval_secs.max(1);
        self.sweep_interval_secs = self.sweep_interval_secs.max(1);
        self.interaction_flush_ms = self.interaction_flush_ms.max(1);
        self.remote_url = self.remote_url.trim_end_matches('/').to_string();
        self
    }

    /// Apply `TUNESIFT_REMOTE_URL` and `TUNESIFT_MODE` from the process
    /// environment
    pub fn apply_env_overrides(&mut self) -> Result<()> {
        self.apply_overrides_from(|key| std::env::var(key).ok())
    }

    /// Same as [`Self::apply_env_overrides`] with an injectable lookup
    pub fn apply_overrides_from(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(url) = lookup(REMOTE_URL_ENV).filter(|u| !u.trim().is_empty()) {
            debug!("Remote URL overridden by {REMOTE_URL_ENV}");
            self.remote_url = url.trim().trim_end_matches('/').to_string();
        }
        if let Some(mode) = lookup(MODE_ENV) {
            self.mode = mode
                .parse::<AppMode>()
                .with_context(|| format!("Invalid {MODE_ENV} value"))?;
        }
        Ok(())
    }

    #[must_use]
    pub const fn remote_timeout(&self) -> Duration {
        Duration::from_millis(self.remote_timeout_ms)
    }

    #[must_use]
    pub const fn probe_interval(&self) -> Duration {
        Duration::from_secs(self.probe_interval_secs)
    }

    #[must_use]
    pub const fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    #[must_use]
    pub const fn interaction_flush(&self) -> Duration {
        Duration::from_millis(self.interaction_flush_ms)
    }

    #[must_use]
    pub const fn coordinator_settings(&self) -> CoordinatorSettings {
        CoordinatorSettings {
            cache_max_memory: self.cache_max_memory_bytes,
            cache_ttl: Duration::from_secs(self.cache_ttl_secs),
            max_results_per_query: self.cache_max_results_per_query,
            probe_timeout: Duration::from_millis(self.probe_timeout_ms),
        }
    }
}

/// Resolved locations of everything tunesift keeps on disk
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataPaths {
    pub data_dir: PathBuf,
    pub db_path: PathBuf,
    pub cache_snapshot: PathBuf,
    pub config_file: PathBuf,
}

impl DataPaths {
    /// Lay out the files under `data_dir`, creating it if needed
    pub fn in_dir(data_dir: &Path) -> Result<Self> {
        let data_dir = data_dir
            .absolutize()
            .with_context(|| format!("Failed to resolve data directory {}", data_dir.display()))?
            .into_owned();
        fs::create_dir_all(&data_dir).with_context(|| {
            format!(
                "Failed to create data directory at {}. Please check file permissions.",
                data_dir.display()
            )
        })?;
        Ok(Self {
            db_path: data_dir.join(DB_FILE),
            cache_snapshot: data_dir.join(CACHE_FILE),
            config_file: data_dir.join(CONFIG_FILE),
            data_dir,
        })
    }

    /// `override_dir`, else `TUNESIFT_DATA_DIR`, else the platform data
    /// directory
    pub fn resolve(override_dir: Option<&Path>) -> Result<Self> {
        if let Some(dir) = override_dir {
            return Self::in_dir(dir);
        }
        if let Some(dir) = std::env::var_os(DATA_DIR_ENV).filter(|d| !d.is_empty()) {
            return Self::in_dir(Path::new(&dir));
        }
        let base = dirs::data_dir().ok_or_else(|| {
            anyhow::anyhow!(
                "Could not determine system data directory. Set {DATA_DIR_ENV} to choose one."
            )
        })?;
        Self::in_dir(&base.join(APP_DIR))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::tempdir;

    #[test]
    fn test_missing_file_gives_defaults() {
        let dir = tempdir().unwrap();
        let config = CoreConfig::load(&dir.path().join("config.toml")).unwrap();
        assert_eq!(config, CoreConfig::default());
        assert_eq!(config.remote_timeout(), Duration::from_secs(10));
    }

    #[test]
    fn test_partial_file_keeps_other_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(
            &path,
            "remote_url = \"http://searx.lan:8080/\"\ncache_ttl_secs = 60\n\n[scoring]\nblend_weight = 4.0\n",
        )
        .unwrap();

        let config = CoreConfig::load(&path).unwrap();
        assert_eq!(config.remote_url, "http://searx.lan:8080");
        assert_eq!(config.cache_ttl_secs, 60);
        assert_eq!(config.probe_interval_secs, 30);
        assert_eq!(config.scoring.blend_weight, 1.0, "blend weight is clamped on load");
        assert_eq!(config.scoring.rating_weight, 0.25);
    }

    #[test]
    fn test_invalid_file_is_an_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "remote_timeout_ms = \"soon\"").unwrap();
        assert!(CoreConfig::load(&path).is_err());
    }

    #[test]
    fn test_save_then_load() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.toml");
        let config = CoreConfig {
            default_engines: vec!["bandcamp".to_string()],
            mode: AppMode::Offline,
            ..CoreConfig::default()
        };
        config.save(&path).unwrap();
        assert_eq!(CoreConfig::load(&path).unwrap(), config);
    }

    #[test]
    fn test_overrides() {
        let env: HashMap<&str, &str> = [
            (REMOTE_URL_ENV, "http://10.0.0.2:8888/"),
            (MODE_ENV, "OFFLINE"),
        ]
        .into_iter()
        .collect();
        let mut config = CoreConfig::default();
        config
            .apply_overrides_from(|key| env.get(key).map(|v| (*v).to_string()))
            .unwrap();

        assert_eq!(config.remote_url, "http://10.0.0.2:8888");
        assert_eq!(config.mode, AppMode::Offline);

        let mut bad = CoreConfig::default();
        assert!(bad
            .apply_overrides_from(|key| (key == MODE_ENV).then(|| "sometimes".to_string()))
            .is_err());
    }

    #[test]
    fn test_data_paths_layout() {
        let dir = tempdir().unwrap();
        let paths = DataPaths::in_dir(&dir.path().join("nested")).unwrap();
        assert!(paths.data_dir.is_dir());
        assert!(paths.db_path.ends_with("tunesift.db"));
        assert!(paths.cache_snapshot.ends_with("search_cache.json"));
        assert!(paths.db_path.is_absolute());
    }

    #[test]
    fn test_relative_data_dir_is_absolutized() {
        let paths = DataPaths::in_dir(Path::new("target/tunesift-test-data")).unwrap();
        assert!(paths.data_dir.is_absolute());
        fs::remove_dir_all(&paths.data_dir).ok();
    }
}
