use super::models::{Config, IsoConfig, IsoGlobConfig};
use crate::model::Protocol;
use chrono::NaiveTime;
use std::collections::HashSet;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("Target name must not be empty (url: {url})")]
    EmptyTargetName { url: String },

    #[error("Duplicate target name '{name}'")]
    DuplicateTargetName { name: String },

    #[error("Target '{name}' has an invalid {protocol} URL '{url}': {reason}")]
    InvalidTargetUrl {
        name: String,
        protocol: Protocol,
        url: String,
        reason: String,
    },

    #[error("Target '{name}' has an invalid checksum '{checksum}', expected sha256:<64 hex digits>")]
    InvalidChecksum { name: String, checksum: String },

    #[error("Glob name must not be empty (base_url: {base_url})")]
    EmptyGlobName { base_url: String },

    #[error("Duplicate glob name '{name}'")]
    DuplicateGlobName { name: String },

    #[error("Glob '{name}' has an invalid {protocol} base URL '{url}': {reason}")]
    InvalidGlobUrl {
        name: String,
        protocol: Protocol,
        url: String,
        reason: String,
    },

    #[error("Glob '{name}' has no include patterns")]
    EmptyIncludePatterns { name: String },

    #[error("download.max_parallel_downloads must be at least 1")]
    InvalidParallelism,

    #[error("download.max_retries must be at least 1")]
    InvalidMaxRetries,

    #[error("download.chunk_size must be positive")]
    InvalidChunkSize,

    #[error("schedule.time_of_day '{value}' is not a valid HH:MM time")]
    InvalidTimeOfDay { value: String },

    #[error("schedule.day_of_month must be between 1 and 28, got {value}")]
    InvalidDayOfMonth { value: u32 },

    #[error("queue.max_deliveries must be at least 1")]
    InvalidMaxDeliveries,

    #[error("worker.batch_size must be at least 1")]
    InvalidBatchSize,
}

/// Validate the entire configuration
pub fn validate(config: &Config) -> Result<(), ValidationError> {
    validate_targets(&config.isos)?;
    validate_globs(&config.iso_globs)?;
    validate_download(config)?;
    validate_schedule(config)?;
    validate_queue(config)?;
    Ok(())
}

fn validate_targets(isos: &[IsoConfig]) -> Result<(), ValidationError> {
    let mut seen = HashSet::new();

    for iso in isos {
        if iso.name.trim().is_empty() {
            return Err(ValidationError::EmptyTargetName {
                url: iso.url.clone(),
            });
        }

        if !seen.insert(iso.name.as_str()) {
            return Err(ValidationError::DuplicateTargetName {
                name: iso.name.clone(),
            });
        }

        check_target_url(iso.protocol, &iso.url).map_err(|reason| {
            ValidationError::InvalidTargetUrl {
                name: iso.name.clone(),
                protocol: iso.protocol,
                url: iso.url.clone(),
                reason,
            }
        })?;

        if let Some(checksum) = &iso.checksum {
            if parse_sha256(checksum).is_none() {
                return Err(ValidationError::InvalidChecksum {
                    name: iso.name.clone(),
                    checksum: checksum.clone(),
                });
            }
        }
    }

    Ok(())
}

fn validate_globs(globs: &[IsoGlobConfig]) -> Result<(), ValidationError> {
    let mut seen = HashSet::new();

    for glob in globs {
        if glob.name.trim().is_empty() {
            return Err(ValidationError::EmptyGlobName {
                base_url: glob.base_url.clone(),
            });
        }

        if !seen.insert(glob.name.as_str()) {
            return Err(ValidationError::DuplicateGlobName {
                name: glob.name.clone(),
            });
        }

        check_target_url(glob.protocol, &glob.base_url).map_err(|reason| {
            ValidationError::InvalidGlobUrl {
                name: glob.name.clone(),
                protocol: glob.protocol,
                url: glob.base_url.clone(),
                reason,
            }
        })?;

        if glob.include_patterns.iter().all(|p| p.trim().is_empty()) {
            return Err(ValidationError::EmptyIncludePatterns {
                name: glob.name.clone(),
            });
        }
    }

    Ok(())
}

/// Check that a URL is usable with the given protocol. Shared with the
/// executors, which re-check targets arriving from the queue.
pub fn check_target_url(protocol: Protocol, url: &str) -> Result<(), String> {
    match protocol {
        Protocol::Http => {
            let parsed = reqwest::Url::parse(url).map_err(|e| e.to_string())?;
            match parsed.scheme() {
                "http" | "https" => {}
                other => return Err(format!("unsupported scheme '{other}'")),
            }
            if parsed.host_str().is_none_or(str::is_empty) {
                return Err("missing host".to_string());
            }
            Ok(())
        }
        Protocol::Rsync => {
            if let Some(rest) = url.strip_prefix("rsync://") {
                let (host, path) = rest.split_once('/').unwrap_or((rest, ""));
                if host.is_empty() || path.is_empty() {
                    return Err("expected rsync://host/module/path".to_string());
                }
                Ok(())
            } else if let Some((host, path)) = url.split_once("::") {
                if host.is_empty() || path.is_empty() {
                    return Err("expected host::module/path".to_string());
                }
                Ok(())
            } else {
                Err("expected rsync://host/module/path or host::module/path".to_string())
            }
        }
    }
}

/// Parse `sha256:<hex>` or bare hex into a lowercase 64-digit digest
pub fn parse_sha256(checksum: &str) -> Option<String> {
    let hex_part = checksum
        .strip_prefix("sha256:")
        .unwrap_or(checksum)
        .trim();

    if hex_part.len() == 64 && hex_part.chars().all(|c| c.is_ascii_hexdigit()) {
        Some(hex_part.to_ascii_lowercase())
    } else {
        None
    }
}

fn validate_download(config: &Config) -> Result<(), ValidationError> {
    if config.download.max_parallel_downloads == 0 {
        return Err(ValidationError::InvalidParallelism);
    }
    if config.download.max_retries == 0 {
        return Err(ValidationError::InvalidMaxRetries);
    }
    if config.download.chunk_size.as_u64() == 0 {
        return Err(ValidationError::InvalidChunkSize);
    }
    if config.worker.batch_size == 0 {
        return Err(ValidationError::InvalidBatchSize);
    }
    Ok(())
}

/// Parse `HH:MM` into a wall-clock time
pub fn parse_time_of_day(value: &str) -> Option<NaiveTime> {
    NaiveTime::parse_from_str(value.trim(), "%H:%M").ok()
}

fn validate_schedule(config: &Config) -> Result<(), ValidationError> {
    if parse_time_of_day(&config.schedule.time_of_day).is_none() {
        return Err(ValidationError::InvalidTimeOfDay {
            value: config.schedule.time_of_day.clone(),
        });
    }

    if !(1..=28).contains(&config.schedule.day_of_month) {
        return Err(ValidationError::InvalidDayOfMonth {
            value: config.schedule.day_of_month,
        });
    }

    Ok(())
}

fn validate_queue(config: &Config) -> Result<(), ValidationError> {
    if config.queue.max_deliveries == 0 {
        return Err(ValidationError::InvalidMaxDeliveries);
    }
    Ok(())
}
