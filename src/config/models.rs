use crate::humanize::ByteSize;
use crate::model::{DownloadTarget, Protocol};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub rabbitmq: RabbitMqConfig,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub download: DownloadConfig,
    #[serde(default)]
    pub schedule: ScheduleConfig,
    #[serde(default)]
    pub worker: WorkerConfig,
    #[serde(default)]
    pub isos: Vec<IsoConfig>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub iso_globs: Vec<IsoGlobConfig>,
}

/// Broker connection settings
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RabbitMqConfig {
    #[serde(default = "default_rabbitmq_host")]
    pub host: String,
    #[serde(default = "default_rabbitmq_port")]
    pub port: u16,
    #[serde(default = "default_rabbitmq_username")]
    pub username: String,
    /// Loaded from `RABBITMQ_PASSWORD` when set; never written back to disk
    #[serde(default = "default_rabbitmq_password", skip_serializing)]
    pub password: String,
    #[serde(default = "default_vhost")]
    pub vhost: String,
    #[serde(default = "default_queue_name")]
    pub queue_name: String,
}

impl Default for RabbitMqConfig {
    fn default() -> Self {
        Self {
            host: default_rabbitmq_host(),
            port: default_rabbitmq_port(),
            username: default_rabbitmq_username(),
            password: default_rabbitmq_password(),
            vhost: default_vhost(),
            queue_name: default_queue_name(),
        }
    }
}

impl RabbitMqConfig {
    /// AMQP URI for the configured broker, credentials and vhost
    /// percent-encoded
    pub fn uri(&self) -> String {
        // "/" is the default vhost and must stay a single encoded segment
        let vhost = match self.vhost.as_str() {
            "/" => "/",
            other => other.trim_start_matches('/'),
        };
        format!(
            "amqp://{}:{}@{}:{}/{}",
            urlencoding::encode(&self.username),
            urlencoding::encode(&self.password),
            self.host,
            self.port,
            urlencoding::encode(vhost)
        )
    }
}

fn default_rabbitmq_host() -> String {
    "localhost".to_string()
}

fn default_rabbitmq_port() -> u16 {
    5672
}

fn default_rabbitmq_username() -> String {
    "guest".to_string()
}

fn default_rabbitmq_password() -> String {
    "guest".to_string()
}

fn default_vhost() -> String {
    "/".to_string()
}

fn default_queue_name() -> String {
    "iso_downloads".to_string()
}

/// Queue channel backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueBackend {
    /// RabbitMQ broker (multi-process)
    #[default]
    Amqp,
    /// Fjall keyspace owned by a single process
    Embedded,
}

/// Queue delivery settings
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct QueueConfig {
    #[serde(default)]
    pub backend: QueueBackend,
    /// Keyspace directory for the embedded backend
    #[serde(default = "default_queue_path")]
    pub path: PathBuf,
    /// Persist messages across broker restarts
    #[serde(default = "default_true")]
    pub persistent: bool,
    /// Deliveries allowed before a message is dead-lettered
    #[serde(default = "default_max_deliveries")]
    pub max_deliveries: u32,
    /// Dead-letter queue name (amqp backend); defaults to `<queue_name>.dead`
    pub dead_letter_queue: Option<String>,
    /// Unacknowledged messages a consumer may hold
    #[serde(default = "default_prefetch")]
    pub prefetch: u16,
    /// Connection attempts at startup before giving up
    #[serde(default = "default_connect_retries")]
    pub connect_retries: u32,
    #[serde(default = "default_reconnect_delay_secs")]
    pub reconnect_delay_secs: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            backend: QueueBackend::default(),
            path: default_queue_path(),
            persistent: true,
            max_deliveries: default_max_deliveries(),
            dead_letter_queue: None,
            prefetch: default_prefetch(),
            connect_retries: default_connect_retries(),
            reconnect_delay_secs: default_reconnect_delay_secs(),
        }
    }
}

impl QueueConfig {
    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_secs(self.reconnect_delay_secs)
    }
}

fn default_queue_path() -> PathBuf {
    PathBuf::from("data/queue")
}

fn default_true() -> bool {
    true
}

fn default_max_deliveries() -> u32 {
    5
}

fn default_prefetch() -> u16 {
    4
}

fn default_connect_retries() -> u32 {
    5
}

fn default_reconnect_delay_secs() -> u64 {
    5
}

/// Transfer settings
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DownloadConfig {
    #[serde(default = "default_max_parallel_downloads")]
    pub max_parallel_downloads: usize,
    #[serde(default = "default_directory")]
    pub directory: PathBuf,
    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: u64,
    /// Executor invocations per target before it is marked failed
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_chunk_size")]
    pub chunk_size: ByteSize,
    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,
    #[serde(default = "default_retry_max_delay_ms")]
    pub retry_max_delay_ms: u64,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            max_parallel_downloads: default_max_parallel_downloads(),
            directory: default_directory(),
            timeout_seconds: default_timeout_seconds(),
            max_retries: default_max_retries(),
            chunk_size: default_chunk_size(),
            retry_base_delay_ms: default_retry_base_delay_ms(),
            retry_max_delay_ms: default_retry_max_delay_ms(),
            connect_timeout_secs: default_connect_timeout_secs(),
            user_agent: default_user_agent(),
        }
    }
}

impl DownloadConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

fn default_max_parallel_downloads() -> usize {
    3
}

fn default_directory() -> PathBuf {
    PathBuf::from("./downloads")
}

fn default_timeout_seconds() -> u64 {
    3600
}

fn default_max_retries() -> u32 {
    3
}

fn default_chunk_size() -> ByteSize {
    ByteSize::kib(64)
}

fn default_retry_base_delay_ms() -> u64 {
    1000
}

fn default_retry_max_delay_ms() -> u64 {
    60_000
}

fn default_connect_timeout_secs() -> u64 {
    30
}

fn default_user_agent() -> String {
    concat!("isofetch/", env!("CARGO_PKG_VERSION")).to_string()
}

/// Cadence of the scheduler
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Frequency {
    #[default]
    Daily,
    Weekly,
    Monthly,
}

/// Schedule settings
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ScheduleConfig {
    #[serde(default)]
    pub frequency: Frequency,
    /// Local wall-clock time, `HH:MM`
    #[serde(default = "default_time_of_day")]
    pub time_of_day: String,
    /// Day used by the weekly cadence
    #[serde(default = "default_weekday")]
    pub weekday: chrono::Weekday,
    /// Day used by the monthly cadence (1..=28)
    #[serde(default = "default_day_of_month")]
    pub day_of_month: u32,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            frequency: Frequency::default(),
            time_of_day: default_time_of_day(),
            weekday: default_weekday(),
            day_of_month: default_day_of_month(),
        }
    }
}

fn default_time_of_day() -> String {
    "02:00".to_string()
}

fn default_weekday() -> chrono::Weekday {
    chrono::Weekday::Mon
}

fn default_day_of_month() -> u32 {
    1
}

/// Worker process settings
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WorkerConfig {
    /// Messages gathered into one Download Manager batch
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// How long to wait for a batch to fill after its first message
    #[serde(default = "default_linger_ms")]
    pub linger_ms: u64,
    /// Time in-flight transfers get to finish after a shutdown signal;
    /// defaults to `download.timeout_seconds`
    pub shutdown_grace_secs: Option<u64>,
    /// Status record directory; defaults to `<download.directory>/.status`
    pub status_dir: Option<PathBuf>,
    /// Serve /health, /status and /metrics when set
    pub http_addr: Option<SocketAddr>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            linger_ms: default_linger_ms(),
            shutdown_grace_secs: None,
            status_dir: None,
            http_addr: None,
        }
    }
}

fn default_batch_size() -> usize {
    4
}

fn default_linger_ms() -> u64 {
    250
}

/// One `[[isos]]` entry as written in the config file
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct IsoConfig {
    pub name: String,
    pub url: String,
    #[serde(default = "default_protocol")]
    pub protocol: Protocol,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub destination_path: Option<PathBuf>,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
}

fn default_protocol() -> Protocol {
    Protocol::Http
}

/// One `[[iso_globs]]` entry: a mirror directory whose listing is scanned
/// for images on every publish pass
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct IsoGlobConfig {
    pub name: String,
    /// Directory listing to scan, an HTTP index page or an rsync module path
    pub base_url: String,
    #[serde(default = "default_protocol")]
    pub protocol: Protocol,
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Shell-style patterns matched against file names, case-insensitively
    #[serde(default = "default_include_patterns")]
    pub include_patterns: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub exclude_patterns: Vec<String>,
    /// Descend into subdirectories of `base_url`
    #[serde(default)]
    pub recursive: bool,
    /// Directory levels below `base_url` visited when `recursive` is set
    #[serde(default = "default_max_depth")]
    pub max_depth: u32,
    /// Relative to `download.directory` unless absolute
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub destination_dir: Option<PathBuf>,
}

fn default_include_patterns() -> Vec<String> {
    vec!["*.iso".to_string()]
}

fn default_max_depth() -> u32 {
    2
}

impl IsoGlobConfig {
    /// Glob over `base_url` with the default patterns
    pub fn new(name: impl Into<String>, base_url: impl Into<String>, protocol: Protocol) -> Self {
        Self {
            name: name.into(),
            base_url: base_url.into(),
            protocol,
            enabled: true,
            include_patterns: default_include_patterns(),
            exclude_patterns: Vec::new(),
            recursive: false,
            max_depth: default_max_depth(),
            destination_dir: None,
        }
    }

    /// Target for one discovered file. `relative_path` is the file's path
    /// below `base_url` and becomes both the name suffix and the path under
    /// the glob's destination directory.
    pub fn to_target(&self, url: &str, relative_path: &str, download_dir: &Path) -> DownloadTarget {
        let dir = match &self.destination_dir {
            Some(path) if path.is_absolute() => path.clone(),
            Some(path) => download_dir.join(path),
            None => download_dir.to_path_buf(),
        };

        DownloadTarget {
            name: format!("{} - {}", self.name, relative_path),
            url: url.to_string(),
            protocol: self.protocol,
            destination_path: dir.join(relative_path),
            enabled: self.enabled,
            checksum: None,
        }
    }
}

impl IsoConfig {
    /// Resolve the destination against the download directory
    pub fn to_target(&self, download_dir: &Path) -> DownloadTarget {
        let destination_path = match &self.destination_path {
            Some(path) if path.is_absolute() => path.clone(),
            Some(path) => download_dir.join(path),
            None => download_dir.join(file_name_from_url(&self.url, &self.name)),
        };

        DownloadTarget {
            name: self.name.clone(),
            url: self.url.clone(),
            protocol: self.protocol,
            destination_path,
            enabled: self.enabled,
            checksum: self.checksum.clone(),
        }
    }
}

/// Last non-empty path segment of the URL, falling back to the target name
fn file_name_from_url(url: &str, fallback: &str) -> String {
    let without_query = url.split(['?', '#']).next().unwrap_or(url);
    let path = without_query
        .split_once("://")
        .map(|(_, rest)| rest)
        .unwrap_or(without_query);
    // rsync "host::module/path" and "host/path" alike: drop the authority part
    let path = path.split_once('/').map(|(_, rest)| rest).unwrap_or("");

    path.rsplit('/')
        .find(|segment| !segment.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| fallback.replace(['/', '\\'], "_"))
}

impl Config {
    /// Snapshot of every configured target with resolved destinations
    pub fn targets(&self) -> Vec<DownloadTarget> {
        self.isos
            .iter()
            .map(|iso| iso.to_target(&self.download.directory))
            .collect()
    }

    /// Snapshot of the enabled targets only
    pub fn enabled_targets(&self) -> Vec<DownloadTarget> {
        self.targets().into_iter().filter(|t| t.enabled).collect()
    }

    pub fn status_dir(&self) -> PathBuf {
        self.worker
            .status_dir
            .clone()
            .unwrap_or_else(|| self.download.directory.join(".status"))
    }

    pub fn dead_letter_queue(&self) -> String {
        self.queue
            .dead_letter_queue
            .clone()
            .unwrap_or_else(|| format!("{}.dead", self.rabbitmq.queue_name))
    }
}
