use clap::{ArgGroup, Parser, Subcommand};
use std::path::PathBuf;

use isofetch::model::Protocol;

#[derive(Parser, Debug)]
#[command(name = "isofetch")]
#[command(about = "Scheduled ISO image mirroring over a durable job queue", long_about = None)]
pub struct Cli {
    /// Configuration file (defaults to $ISOFETCH_CONFIG, then config/isofetch.toml)
    #[arg(long, short, global = true)]
    pub config: Option<PathBuf>,

    /// Verbose logging for isofetch itself (RUST_LOG still wins)
    #[arg(long, global = true)]
    pub debug: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Publish jobs on the configured cadence until interrupted
    StartScheduler,

    /// Consume jobs and download them until interrupted
    StartWorker,

    /// Publish one job per enabled target right now
    TriggerDownload,

    /// Show schedule, queue depth and the last outcome per target
    Status,

    /// List configured targets
    ListIsos,

    /// Enable or disable a target in the configuration file
    ToggleIso(ToggleArgs),

    /// Scheduler and worker in one process sharing one queue channel
    Run(RunArgs),

    /// List the images a mirror directory would contribute as a glob
    Discover(DiscoverArgs),

    /// List configured globs
    ListGlobs,

    /// Enable or disable a glob in the configuration file
    ToggleGlob(ToggleArgs),

    /// Show every target the next publish would enqueue, globs expanded
    PreviewDownloads,
}

#[derive(clap::Args, Debug)]
#[command(group(ArgGroup::new("state").required(true).args(["enable", "disable"])))]
pub struct ToggleArgs {
    /// Target or glob name as written in the configuration
    #[arg(long)]
    pub name: String,

    #[arg(long)]
    pub enable: bool,

    #[arg(long)]
    pub disable: bool,
}

#[derive(clap::Args, Debug)]
pub struct DiscoverArgs {
    /// Directory to list: an HTTP index page or an rsync path
    #[arg(long)]
    pub url: String,

    #[arg(long = "type", default_value = "http", value_parser = parse_protocol)]
    pub protocol: Protocol,

    /// File name pattern to keep (repeatable, default *.iso)
    #[arg(long)]
    pub include: Vec<String>,

    /// File name pattern to drop (repeatable)
    #[arg(long)]
    pub exclude: Vec<String>,

    #[arg(long)]
    pub recursive: bool,

    #[arg(long, default_value_t = 2)]
    pub max_depth: u32,
}

fn parse_protocol(value: &str) -> Result<Protocol, String> {
    match value.to_ascii_lowercase().as_str() {
        "http" | "https" => Ok(Protocol::Http),
        "rsync" => Ok(Protocol::Rsync),
        other => Err(format!("unknown protocol '{other}', expected http or rsync")),
    }
}

#[derive(clap::Args, Debug)]
pub struct RunArgs {
    /// Publish once at startup instead of waiting for the first tick
    #[arg(long)]
    pub trigger_now: bool,
}
