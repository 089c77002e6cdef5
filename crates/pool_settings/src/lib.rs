//! Layered configuration for the agent pool subsystem.
//!
//! Settings are resolved, in increasing precedence, from a baked-in default, an optional
//! TOML file, and environment variables prefixed `POOL_`. This mirrors the file+env layering
//! used throughout the rest of this workspace's configuration story.

use directories::ProjectDirs;
use serde::Serialize;
use std::collections::HashMap;
use std::path::PathBuf;
use twelf::{config, Layer};

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("config error: {0}")]
    Config(#[from] twelf::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type PoolSettingsResult<T> = std::result::Result<T, Error>;

/// Default directory settings are loaded from when no path is given explicitly.
pub const DEFAULT_CONFIG_PATH: &str = ".config";

/// Baked-in settings used to seed a fresh config file on first run.
pub const DEFAULT_SETTINGS: &str = include_str!("../default/settings.toml");

/// Runtime configuration for the pool subsystem: which document-store backend(s) the
/// Repository should use, and the Manager's background-loop cadences.
///
/// These values are resolved once at startup and do not change while the process runs.
#[config]
#[derive(Debug, Serialize, Clone)]
pub struct PoolSettings {
    /// Whether this settings instance has been materialized from a real config file.
    pub initialized: bool,
    /// Default on-disk path for backends that need one (e.g. `dashmap`, `rocksdb`).
    pub default_data_path: String,
    /// Named document-store backend profiles, keyed by profile name. Each profile must
    /// carry at least a `type` key naming an `opendal` scheme (`memory`, `dashmap`, ...).
    pub profiles: HashMap<String, HashMap<String, String>>,
    /// Whether the Resource Manager's optimizer loop (spec.md §4.2) should run.
    pub auto_scaling_enabled: bool,
    /// Cadence, in seconds, of the Manager's metrics-collection loop (spec.md §4.5).
    pub metrics_interval_secs: u64,
    /// Cadence, in seconds, of the Manager's old-metrics cleanup loop (spec.md §4.5).
    pub cleanup_interval_secs: u64,
    /// Metrics retention window, in seconds, passed to `CleanupOldMetrics` (spec.md §4.4).
    pub metrics_retention_secs: u64,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self::new()
    }
}

impl PoolSettings {
    /// Load settings from the default config path, falling back to an embedded default
    /// if no file is present or loading otherwise fails.
    pub fn new() -> Self {
        Self::load_from_env_and_file(None).unwrap_or_else(|e| {
            tracing::warn!(error = %e, "failed to load pool settings from file, using embedded default");
            Self::default_memory_only()
        })
    }

    /// A settings instance that only ever uses the in-process `memory` backend. Used by
    /// tests and by any embedded/offline deployment that has no durable storage available.
    pub fn default_memory_only() -> Self {
        let mut profiles = HashMap::new();
        let mut memory_profile = HashMap::new();
        memory_profile.insert("type".to_string(), "memory".to_string());
        profiles.insert("memory".to_string(), memory_profile);

        Self {
            initialized: true,
            default_data_path: "/tmp/codevaldcortex-pool".to_string(),
            profiles,
            auto_scaling_enabled: false,
            metrics_interval_secs: 30,
            cleanup_interval_secs: 300,
            metrics_retention_secs: 604_800,
        }
    }

    /// The default directory settings are stored under, per-platform.
    pub fn default_config_path() -> PathBuf {
        if let Some(proj_dirs) = ProjectDirs::from("dev", "codevaldcortex", "pool") {
            proj_dirs.config_dir().to_path_buf()
        } else {
            PathBuf::from(DEFAULT_CONFIG_PATH)
        }
    }

    /// Load settings from an optional directory (containing `settings.toml`) layered with
    /// `POOL_`-prefixed environment variables. The directory is created and seeded with the
    /// embedded default if it does not already contain a settings file.
    pub fn load_from_env_and_file(config_path: Option<PathBuf>) -> PoolSettingsResult<Self> {
        let config_path = config_path.unwrap_or_else(Self::default_config_path);
        tracing::debug!(path = ?config_path, "loading pool settings");
        let config_file = init_config_file(&config_path)?;

        Ok(Self::with_layers(&[
            Layer::Toml(config_file),
            Layer::Env(Some(String::from("POOL_"))),
        ])?)
    }
}

fn init_config_file(path: &PathBuf) -> std::result::Result<PathBuf, std::io::Error> {
    if !path.exists() {
        std::fs::create_dir_all(path)?;
    }
    let config_file = path.join("settings.toml");
    if !config_file.exists() {
        tracing::info!(path = ?config_file, "seeding default pool settings file");
        std::fs::write(&config_file, DEFAULT_SETTINGS)?;
    }
    Ok(config_file)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loads_seeded_default_file() {
        let dir = tempfile::tempdir().unwrap();
        let settings = PoolSettings::load_from_env_and_file(Some(dir.path().to_path_buf()))
            .expect("settings should load from a freshly seeded file");

        assert!(settings.profiles.contains_key("memory"));
        assert_eq!(settings.metrics_interval_secs, 30);
        assert_eq!(settings.cleanup_interval_secs, 300);
    }

    #[test]
    fn env_layer_overrides_file_layer() {
        let dir = tempfile::tempdir().unwrap();
        unsafe { std::env::set_var("POOL_METRICS_INTERVAL_SECS", "5") };

        let settings = PoolSettings::load_from_env_and_file(Some(dir.path().to_path_buf()))
            .expect("settings should load");
        assert_eq!(settings.metrics_interval_secs, 5);

        unsafe { std::env::remove_var("POOL_METRICS_INTERVAL_SECS") };
    }

    #[test]
    fn default_memory_only_has_single_memory_profile() {
        let settings = PoolSettings::default_memory_only();
        assert_eq!(settings.profiles.len(), 1);
        assert_eq!(settings.profiles["memory"]["type"], "memory");
    }
}
