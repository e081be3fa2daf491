use super::models::Config;
use config::{ConfigError, Environment, File, FileFormat};
use std::env;
use std::path::{Path, PathBuf};

pub const CONFIG_ENV_VAR: &str = "ISOFETCH_CONFIG";
pub const DEFAULT_CONFIG_PATH: &str = "config/isofetch.toml";
const ENV_PREFIX: &str = "ISOFETCH";
const ENV_SEPARATOR: &str = "__";

/// Path of the configuration file: explicit argument, then `ISOFETCH_CONFIG`,
/// then the default location
pub fn resolve_path(explicit: Option<PathBuf>) -> PathBuf {
    explicit
        .or_else(|| env::var(CONFIG_ENV_VAR).ok().map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH))
}

/// Load configuration from multiple sources with priority:
/// 1. Defaults (embedded in structs)
/// 2. TOML file (if exists)
/// 3. Environment variables from .env file (via dotenvy)
/// 4. System environment variables (highest priority)
pub fn load(config_path: &Path) -> Result<Config, ConfigError> {
    // A missing .env file is normal
    let _ = dotenvy::dotenv();

    let mut config = load_from_sources(config_path)?;
    load_secrets(&mut config);
    Ok(config)
}

/// Secrets come from the environment only and are never persisted
fn load_secrets(config: &mut Config) {
    if let Ok(password) = env::var("RABBITMQ_PASSWORD") {
        config.rabbitmq.password = password;
    }
    if let Ok(username) = env::var("RABBITMQ_USERNAME") {
        config.rabbitmq.username = username;
    }
}

/// Load configuration from a specific path and the environment
pub fn load_from_sources(config_path: &Path) -> Result<Config, ConfigError> {
    let mut builder = config::Config::builder();

    if config_path.exists() {
        tracing::info!("Loading configuration from: {}", config_path.display());
        builder = builder.add_source(File::from(config_path).format(FileFormat::Toml));
    } else {
        tracing::warn!(
            "Configuration file not found at {}, using defaults and environment overrides",
            config_path.display()
        );
    }

    // ISOFETCH__DOWNLOAD__MAX_PARALLEL_DOWNLOADS -> download.max_parallel_downloads
    builder = builder.add_source(
        Environment::with_prefix(ENV_PREFIX)
            .separator(ENV_SEPARATOR)
            .try_parsing(true),
    );

    builder.build()?.try_deserialize()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::models::{Frequency, QueueBackend};
    use crate::model::Protocol;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_load_defaults_only() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("nonexistent.toml");

        let config = load_from_sources(&config_path).unwrap();
        assert_eq!(config.download.max_parallel_downloads, 3);
        assert_eq!(config.rabbitmq.queue_name, "iso_downloads");
        assert!(config.isos.is_empty());
    }

    #[test]
    fn test_load_from_toml() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("isofetch.toml");

        let toml_content = r#"
[rabbitmq]
host = "broker.internal"
port = 5673
queue_name = "mirror_jobs"

[queue]
backend = "embedded"
path = "/var/lib/isofetch/queue"
max_deliveries = 3

[download]
max_parallel_downloads = 2
directory = "/srv/isos"
timeout_seconds = 600
max_retries = 4
chunk_size = "1MB"

[schedule]
frequency = "weekly"
time_of_day = "03:15"
weekday = "Sat"

[[isos]]
name = "Ubuntu 24.04 LTS"
url = "https://releases.example/24.04/ubuntu-24.04-desktop-amd64.iso"
protocol = "http"

[[isos]]
name = "Debian 12"
url = "rsync://mirror.example/debian-cd/12.5.0/amd64/iso-cd/debian-12.5.0-amd64-netinst.iso"
protocol = "rsync"
enabled = false
        "#;

        fs::write(&config_path, toml_content).unwrap();

        let config = load_from_sources(&config_path).unwrap();
        assert_eq!(config.rabbitmq.host, "broker.internal");
        assert_eq!(config.rabbitmq.port, 5673);
        assert_eq!(config.queue.backend, QueueBackend::Embedded);
        assert_eq!(config.queue.max_deliveries, 3);
        assert_eq!(config.download.max_parallel_downloads, 2);
        assert_eq!(config.download.chunk_size.as_u64(), 1024 * 1024);
        assert_eq!(config.schedule.frequency, Frequency::Weekly);
        assert_eq!(config.schedule.weekday, chrono::Weekday::Sat);
        assert_eq!(config.isos.len(), 2);
        assert_eq!(config.isos[1].protocol, Protocol::Rsync);
        assert!(!config.isos[1].enabled);
        assert!(config.isos[0].enabled);
    }
}
