//! Expansion of `[[iso_globs]]` into download targets
//!
//! A glob names a mirror directory. On every publish pass the [`Discoverer`]
//! lists it (an HTML index page over HTTP, or `rsync --list-only`), keeps the
//! files whose names pass the include and exclude patterns, and
//! [`resolve_targets`] merges them after the configured `[[isos]]`, one
//! target per URL.

mod listing;
mod pattern;

pub use listing::{ListingParser, RsyncEntry};
pub use pattern::{FileFilter, GlobPattern};

use reqwest::{Client, Url};
use std::collections::{HashSet, VecDeque};
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::config::{Config, DownloadConfig, IsoGlobConfig};
use crate::model::{DownloadTarget, Protocol};

/// Upper bound for one listing request or `rsync --list-only` run
const LISTING_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("Listing request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Listing {url} returned HTTP {status}")]
    HttpStatus { url: String, status: u16 },

    #[error("Invalid base URL '{url}': {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("Invalid pattern: {0}")]
    Pattern(#[from] regex::Error),

    #[error("rsync listing failed: {0}")]
    Process(String),

    #[error("Listing timed out after {0:?}")]
    Timeout(Duration),
}

pub type Result<T> = std::result::Result<T, DiscoveryError>;

/// One file found below a glob's base URL
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredIso {
    pub url: String,
    /// Path below the base URL, `/`-separated and percent-decoded
    pub relative_path: String,
}

pub struct Discoverer {
    client: Client,
    rsync_program: PathBuf,
    timeout: Duration,
    parser: ListingParser,
}

impl Discoverer {
    pub fn new(config: &DownloadConfig) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(config.connect_timeout())
            .user_agent(&config.user_agent)
            .redirect(reqwest::redirect::Policy::limited(10))
            .build()?;

        Ok(Self {
            client,
            rsync_program: PathBuf::from("rsync"),
            timeout: LISTING_TIMEOUT,
            parser: ListingParser::new()?,
        })
    }

    /// Use a specific binary instead of `rsync` from `PATH`
    pub fn with_rsync_program(mut self, program: impl Into<PathBuf>) -> Self {
        self.rsync_program = program.into();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Files below `glob.base_url` accepted by its patterns, deduplicated by
    /// URL in listing order. Runs regardless of `glob.enabled`.
    pub async fn discover(&self, glob: &IsoGlobConfig) -> Result<Vec<DiscoveredIso>> {
        let filter = FileFilter::new(&glob.include_patterns, &glob.exclude_patterns)?;
        let max_depth = if glob.recursive { glob.max_depth } else { 0 };

        let found = match glob.protocol {
            Protocol::Http => self.crawl_http(&glob.base_url, max_depth, &filter).await?,
            Protocol::Rsync => self.list_rsync(&glob.base_url, max_depth, &filter).await?,
        };

        info!(glob = %glob.name, base_url = %glob.base_url, found = found.len(), "Discovery finished");
        Ok(found)
    }

    /// Breadth-first walk of index pages, never leaving the base directory
    async fn crawl_http(
        &self,
        base_url: &str,
        max_depth: u32,
        filter: &FileFilter,
    ) -> Result<Vec<DiscoveredIso>> {
        let base = directory_url(base_url)?;
        let mut pending = VecDeque::from([(base.clone(), 0u32)]);
        let mut visited = HashSet::from([base.to_string()]);
        let mut seen = HashSet::new();
        let mut found = Vec::new();

        while let Some((page, depth)) = pending.pop_front() {
            let body = match self.fetch_listing(&page).await {
                Ok(body) => body,
                Err(e) if depth > 0 => {
                    warn!(url = %page, error = %e, "Skipping unreadable subdirectory");
                    continue;
                }
                Err(e) => return Err(e),
            };

            for href in self.parser.html_links(&body) {
                let Ok(mut url) = page.join(href) else {
                    continue;
                };
                url.set_fragment(None);
                if !matches!(url.scheme(), "http" | "https") {
                    continue;
                }

                if url.path().ends_with('/') {
                    let inside = url.query().is_none() && url.as_str().starts_with(base.as_str());
                    if inside && depth < max_depth && visited.insert(url.to_string()) {
                        pending.push_back((url, depth + 1));
                    }
                    continue;
                }

                let Some(name) = file_name(&url) else {
                    continue;
                };
                if !filter.accepts(&name) || !seen.insert(url.to_string()) {
                    continue;
                }

                let relative_path = relative_path(&base, &url).unwrap_or(name);
                debug!(url = %url, %relative_path, "Discovered image");
                found.push(DiscoveredIso {
                    url: url.to_string(),
                    relative_path,
                });
            }
        }

        Ok(found)
    }

    async fn fetch_listing(&self, url: &Url) -> Result<String> {
        let response = self
            .client
            .get(url.clone())
            .timeout(self.timeout)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(DiscoveryError::HttpStatus {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }
        Ok(response.text().await?)
    }

    async fn list_rsync(
        &self,
        base_url: &str,
        max_depth: u32,
        filter: &FileFilter,
    ) -> Result<Vec<DiscoveredIso>> {
        let base = format!("{}/", base_url.trim_end_matches('/'));

        let mut cmd = Command::new(&self.rsync_program);
        cmd.arg("--list-only");
        if max_depth > 0 {
            cmd.arg("--recursive");
        }
        cmd.arg(&base)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        debug!(program = %self.rsync_program.display(), %base, "Listing rsync directory");
        let output = tokio::time::timeout(self.timeout, cmd.output())
            .await
            .map_err(|_| DiscoveryError::Timeout(self.timeout))?
            .map_err(|e| {
                DiscoveryError::Process(format!(
                    "failed to spawn {}: {e}",
                    self.rsync_program.display()
                ))
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let detail = stderr.lines().rev().find(|l| !l.trim().is_empty()).unwrap_or("");
            return Err(DiscoveryError::Process(detail.trim().to_string()));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let mut seen = HashSet::new();
        let mut found = Vec::new();

        for entry in self.parser.rsync_entries(&stdout) {
            if entry.is_dir || !is_safe_relative(&entry.path) {
                continue;
            }
            let depth = entry.path.matches('/').count();
            if depth > max_depth as usize {
                continue;
            }
            let name = entry.path.rsplit('/').next().unwrap_or(&entry.path);
            if !filter.accepts(name) {
                continue;
            }

            let url = format!("{base}{}", entry.path);
            if seen.insert(url.clone()) {
                found.push(DiscoveredIso {
                    url,
                    relative_path: entry.path,
                });
            }
        }

        Ok(found)
    }
}

/// Configured targets followed by the discoveries of every enabled glob,
/// one target per URL and per name. A glob whose listing fails contributes
/// nothing to this pass.
pub async fn resolve_targets(config: &Config, discoverer: &Discoverer) -> Vec<DownloadTarget> {
    let mut targets = config.targets();
    let mut urls: HashSet<String> = targets.iter().map(|t| t.url.clone()).collect();
    let mut names: HashSet<String> = targets.iter().map(|t| t.name.clone()).collect();

    for glob in config.iso_globs.iter().filter(|g| g.enabled) {
        let found = match discoverer.discover(glob).await {
            Ok(found) => found,
            Err(e) => {
                warn!(glob = %glob.name, error = %e, "Discovery failed, glob skipped this pass");
                continue;
            }
        };

        for iso in found {
            if !urls.insert(iso.url.clone()) {
                debug!(url = %iso.url, "Already targeted, skipping");
                continue;
            }
            let target = glob.to_target(&iso.url, &iso.relative_path, &config.download.directory);
            if !names.insert(target.name.clone()) {
                warn!(target_name = %target.name, "Discovered name already in use, skipping");
                continue;
            }
            targets.push(target);
        }
    }

    targets
}

/// Parse `base_url` as a directory, appending the trailing slash `join`
/// needs to resolve relative links beneath it
fn directory_url(base_url: &str) -> Result<Url> {
    let with_slash = if base_url.ends_with('/') {
        base_url.to_string()
    } else {
        format!("{base_url}/")
    };
    Url::parse(&with_slash).map_err(|e| DiscoveryError::InvalidUrl {
        url: base_url.to_string(),
        reason: e.to_string(),
    })
}

/// Last path segment, percent-decoded, when it is usable as a file name
fn file_name(url: &Url) -> Option<String> {
    let segment = url.path_segments()?.rev().find(|s| !s.is_empty())?;
    let decoded = urlencoding::decode(segment).ok()?;
    is_safe_relative(&decoded)
        .then(|| decoded.into_owned())
        .filter(|name| !name.contains('/'))
}

/// Path of `url` below `base`, when it is on the same origin and beneath it
fn relative_path(base: &Url, url: &Url) -> Option<String> {
    if url.origin() != base.origin() {
        return None;
    }
    let rest = url.path().strip_prefix(base.path())?;
    let decoded = urlencoding::decode(rest).ok()?;
    is_safe_relative(&decoded).then(|| decoded.into_owned())
}

/// Relative path that stays inside the directory it is joined to
fn is_safe_relative(path: &str) -> bool {
    !path.is_empty()
        && !path.contains('\\')
        && path
            .split('/')
            .all(|segment| !segment.is_empty() && segment != "." && segment != "..")
}
