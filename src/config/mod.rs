//! Configuration management for isofetch
//!
//! This module provides a layered configuration system that loads settings from:
//! 1. Default values (embedded in structs)
//! 2. TOML configuration file
//! 3. Environment variables (highest priority)
//!
//! # Usage
//!
//! ```no_run
//! use isofetch::config::Config;
//!
//! let config = Config::load(None).expect("Failed to load configuration");
//! println!("Downloading into: {}", config.download.directory.display());
//! ```
//!
//! # Environment Variables
//!
//! Configuration can be overridden using environment variables with the pattern:
//! `ISOFETCH__<section>__<key>`
//!
//! Examples:
//! - `ISOFETCH__DOWNLOAD__MAX_PARALLEL_DOWNLOADS=2`
//! - `ISOFETCH__RABBITMQ__HOST=broker.internal`
//! - `ISOFETCH__QUEUE__BACKEND=embedded`
//!
//! The broker password is read from `RABBITMQ_PASSWORD` and never written to disk.
//!
//! # Configuration File
//!
//! By default, the configuration is loaded from `config/isofetch.toml`.
//! This can be overridden using the `ISOFETCH_CONFIG` environment variable
//! or the `--config` flag.

mod models;
mod sources;
mod validation;

pub use models::{
    Config, DownloadConfig, Frequency, IsoConfig, IsoGlobConfig, QueueBackend, QueueConfig, RabbitMqConfig,
    ScheduleConfig, WorkerConfig,
};
pub use sources::{CONFIG_ENV_VAR, DEFAULT_CONFIG_PATH, resolve_path};
pub use validation::{ValidationError, check_target_url, parse_sha256, parse_time_of_day};

use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to load configuration: {0}")]
    LoadError(#[from] config::ConfigError),

    #[error("Configuration validation failed: {0}")]
    ValidationError(#[from] ValidationError),

    #[error("Failed to read or write configuration file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse configuration file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Failed to serialize configuration: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("Target '{0}' not found in configuration")]
    UnknownTarget(String),

    #[error("Glob '{0}' not found in configuration")]
    UnknownGlob(String),
}

impl Config {
    /// Load configuration from all sources (file + environment)
    ///
    /// Configuration is loaded with the following priority (highest to lowest):
    /// 1. Environment variables (`ISOFETCH__*`, `RABBITMQ_PASSWORD`)
    /// 2. TOML file (`path`, else `ISOFETCH_CONFIG`, else `config/isofetch.toml`)
    /// 3. Default values
    ///
    /// # Errors
    ///
    /// Returns an error if the file is malformed or validation fails.
    pub fn load(path: Option<PathBuf>) -> Result<Self, ConfigError> {
        let config = sources::load(&resolve_path(path))?;
        validation::validate(&config)?;
        Ok(config)
    }

    /// Load configuration from a specific path without secrets from the
    /// environment. Useful for testing with custom configuration files.
    pub fn load_from_path(path: &Path) -> Result<Self, ConfigError> {
        let config = sources::load_from_sources(path)?;
        validation::validate(&config)?;
        Ok(config)
    }

    /// Parse only the TOML file, ignoring environment overrides
    pub fn read_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&text)?;
        validation::validate(&config)?;
        Ok(config)
    }

    /// Write the configuration back as TOML via a temporary file and rename
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let text = toml::to_string_pretty(self)?;
        let tmp = path.with_extension("toml.tmp");
        std::fs::write(&tmp, text)?;
        std::fs::rename(&tmp, path)?;
        Ok(())
    }

    /// Enable or disable a target by name. Returns the previous state.
    pub fn set_enabled(&mut self, name: &str, enabled: bool) -> Result<bool, ConfigError> {
        let iso = self
            .isos
            .iter_mut()
            .find(|iso| iso.name == name)
            .ok_or_else(|| ConfigError::UnknownTarget(name.to_string()))?;

        let previous = iso.enabled;
        iso.enabled = enabled;
        Ok(previous)
    }

    /// Enable or disable a glob by name. Returns the previous state.
    pub fn set_glob_enabled(&mut self, name: &str, enabled: bool) -> Result<bool, ConfigError> {
        let glob = self
            .iso_globs
            .iter_mut()
            .find(|glob| glob.name == name)
            .ok_or_else(|| ConfigError::UnknownGlob(name.to_string()))?;

        Ok(std::mem::replace(&mut glob.enabled, enabled))
    }
}

/// Flip a target's `enabled` flag in the config file on disk
///
/// Only the file is rewritten, so environment overrides and secrets never leak
/// into it. Download history (status records) is untouched.
pub fn toggle_target(path: &Path, name: &str, enabled: bool) -> Result<bool, ConfigError> {
    let mut config = Config::read_file(path)?;
    let previous = config.set_enabled(name, enabled)?;
    config.save(path)?;
    tracing::info!(target_name = name, enabled, previous, "Target toggled");
    Ok(previous)
}

/// Flip a glob's `enabled` flag in the config file on disk
pub fn toggle_glob(path: &Path, name: &str, enabled: bool) -> Result<bool, ConfigError> {
    let mut config = Config::read_file(path)?;
    let previous = config.set_glob_enabled(name, enabled)?;
    config.save(path)?;
    tracing::info!(glob = name, enabled, previous, "Glob toggled");
    Ok(previous)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    const SAMPLE: &str = r#"
[download]
directory = "/srv/isos"
max_parallel_downloads = 1

[schedule]
frequency = "daily"
time_of_day = "04:00"

[[isos]]
name = "Ubuntu 24.04 LTS"
url = "https://releases.example/ubuntu.iso"
protocol = "http"

[[isos]]
name = "Fedora 40"
url = "https://download.example/fedora.iso"
protocol = "http"
    "#;

    #[test]
    fn test_load_minimal_config() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("isofetch.toml");
        fs::write(&config_path, SAMPLE).unwrap();

        let config = Config::load_from_path(&config_path).unwrap();
        assert_eq!(config.isos.len(), 2);
        assert_eq!(config.enabled_targets().len(), 2);
        assert_eq!(
            config.targets()[0].destination_path,
            PathBuf::from("/srv/isos/ubuntu.iso")
        );
    }

    #[test]
    fn test_validation_catches_duplicate_names() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("isofetch.toml");

        let toml_content = r#"
[[isos]]
name = "Same"
url = "https://a.example/a.iso"

[[isos]]
name = "Same"
url = "https://b.example/b.iso"
        "#;
        fs::write(&config_path, toml_content).unwrap();

        let result = Config::load_from_path(&config_path);
        assert!(matches!(
            result.unwrap_err(),
            ConfigError::ValidationError(ValidationError::DuplicateTargetName { .. })
        ));
    }

    #[test]
    fn test_toggle_target_round_trips_file() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("isofetch.toml");
        fs::write(&config_path, SAMPLE).unwrap();

        let previous = toggle_target(&config_path, "Fedora 40", false).unwrap();
        assert!(previous);

        let config = Config::read_file(&config_path).unwrap();
        let names: Vec<_> = config.enabled_targets().into_iter().map(|t| t.name).collect();
        assert_eq!(names, vec!["Ubuntu 24.04 LTS".to_string()]);
        assert_eq!(config.isos.len(), 2);

        let saved = fs::read_to_string(&config_path).unwrap();
        assert!(!saved.contains("password"));
    }

    #[test]
    fn test_toggle_unknown_target_fails() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("isofetch.toml");
        fs::write(&config_path, SAMPLE).unwrap();

        let err = toggle_target(&config_path, "Gentoo", true).unwrap_err();
        assert!(matches!(err, ConfigError::UnknownTarget(name) if name == "Gentoo"));
    }

    #[test]
    fn test_toggle_glob_keeps_patterns() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("isofetch.toml");
        let text = format!(
            "{SAMPLE}\n[[iso_globs]]\nname = \"Debian CD\"\n\
             base_url = \"https://cdimage.example/debian-cd/current/amd64/iso-cd/\"\n\
             include_patterns = [\"debian-*-netinst.iso\"]\n\
             exclude_patterns = [\"*edu*\"]\n"
        );
        fs::write(&config_path, text).unwrap();

        assert!(toggle_glob(&config_path, "Debian CD", false).unwrap());
        assert!(!toggle_glob(&config_path, "Debian CD", false).unwrap());

        let config = Config::read_file(&config_path).unwrap();
        let glob = &config.iso_globs[0];
        assert!(!glob.enabled);
        assert_eq!(glob.include_patterns, vec!["debian-*-netinst.iso".to_string()]);
        assert_eq!(glob.exclude_patterns, vec!["*edu*".to_string()]);
        assert_eq!(config.isos.len(), 2);

        let err = toggle_glob(&config_path, "Gentoo", true).unwrap_err();
        assert!(matches!(err, ConfigError::UnknownGlob(name) if name == "Gentoo"));
    }
}
