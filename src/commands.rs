use chrono::Local;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

use isofetch::app;
use isofetch::config::{self, Config, IsoGlobConfig, QueueBackend, resolve_path};
use isofetch::discovery::{self, Discoverer};
use isofetch::humanize::ByteSize;
use isofetch::observability::Metrics;
use isofetch::queue::{self, AmqpChannel, AmqpSettings, QueueChannel, QueueStats};
use isofetch::scheduler::Cadence;
use isofetch::status::{FileStatusStore, StatusRecord};

use crate::cli::{DiscoverArgs, RunArgs, ToggleArgs};

type AnyError = Box<dyn std::error::Error + Send + Sync + 'static>;

pub async fn start_scheduler(config_path: Option<PathBuf>) -> Result<(), AnyError> {
    let config = Config::load(config_path.clone())?;
    let channel = queue::open_channel(&config).await?;

    let publisher = app::publisher(&config, config_path, channel.clone(), Arc::new(Metrics::new()))?;
    let (scheduler, _handle) = app::scheduler(&config, publisher)?;

    scheduler.run(app::shutdown_on_signal()).await;

    channel.close().await?;
    Ok(())
}

pub async fn start_worker(config_path: Option<PathBuf>) -> Result<(), AnyError> {
    let config = Config::load(config_path)?;
    let channel = queue::open_channel(&config).await?;

    let summary = app::run_worker(
        &config,
        channel,
        app::shutdown_on_signal(),
        Arc::new(Metrics::new()),
    )
    .await?;
    info!(processed = summary.processed, "Worker exited");
    Ok(())
}

pub async fn trigger_download(config_path: Option<PathBuf>) -> Result<(), AnyError> {
    let config = Config::load(config_path.clone())?;
    let channel = queue::open_channel(&config).await?;

    let publisher = app::publisher(&config, config_path, channel.clone(), Arc::new(Metrics::new()))?;
    let report = publisher.publish_enabled().await?;
    channel.close().await?;

    println!(
        "Published {} download job(s), {} disabled target(s) skipped",
        report.published, report.disabled
    );
    Ok(())
}

pub async fn status(config_path: Option<PathBuf>) -> Result<(), AnyError> {
    let config = Config::load(config_path)?;
    let cadence = Cadence::from_config(&config.schedule)?;

    println!("Schedule: {:?} at {}", config.schedule.frequency, config.schedule.time_of_day);
    println!("Next run: {}", cadence.next_after(&Local::now()).format("%Y-%m-%d %H:%M %Z"));

    match queue_stats(&config).await {
        Some(stats) => {
            println!("Queue:    {} ready", stats.ready);
            if let Some(unacked) = stats.unacked {
                println!("          {unacked} in flight");
            }
            if let Some(dead) = stats.dead_lettered {
                println!("          {dead} dead-lettered");
            }
            if let Some(consumers) = stats.consumers {
                println!("          {consumers} consumer(s)");
            }
        }
        None => println!("Queue:    n/a"),
    }

    let records = FileStatusStore::new(config.status_dir()).list().await?;
    println!();
    let print_record = |name: &str, state: &str, record: &StatusRecord| {
        println!(
            "{:<24} {:<8} {:>10} {} {}",
            name,
            state,
            ByteSize(record.bytes_transferred).to_human_readable(),
            record.finished_at.with_timezone(&Local).format("%Y-%m-%d %H:%M"),
            record.outcome(),
        );
    };

    for target in config.targets() {
        let state = if target.enabled { "enabled" } else { "disabled" };
        match records.iter().find(|r| r.target_name == target.name) {
            Some(record) => print_record(&target.name, state, record),
            None => println!("{:<24} {:<8} never downloaded", target.name, state),
        }
    }

    // Glob-discovered targets only exist at publish time
    for record in records
        .iter()
        .filter(|r| !config.isos.iter().any(|iso| iso.name == r.target_name))
    {
        print_record(&record.target_name, "glob", record);
    }
    Ok(())
}

/// Depth of the broker queue. The embedded keyspace belongs to the process
/// running it, so it is not opened from here.
async fn queue_stats(config: &Config) -> Option<QueueStats> {
    if config.queue.backend == QueueBackend::Embedded {
        return None;
    }

    let channel = AmqpChannel::new(AmqpSettings::from_config(config));
    let stats = match channel.connect().await {
        Ok(()) => channel.stats().await,
        Err(e) => Err(e),
    };
    let _ = channel.close().await;

    match stats {
        Ok(stats) => Some(stats),
        Err(e) => {
            warn!(error = %e, "Queue statistics unavailable");
            None
        }
    }
}

pub fn list_isos(config_path: Option<PathBuf>) -> Result<(), AnyError> {
    let config = Config::load(config_path)?;

    if config.isos.is_empty() {
        println!("No targets configured");
        return Ok(());
    }

    for target in config.targets() {
        let state = if target.enabled { "enabled" } else { "disabled" };
        println!(
            "{:<24} {:<8} {:<5} {}",
            target.name,
            state,
            target.protocol.to_string(),
            target.url
        );
        println!("{:<24} -> {}", "", target.destination_path.display());
    }
    Ok(())
}

pub fn toggle_iso(config_path: Option<PathBuf>, args: ToggleArgs) -> Result<(), AnyError> {
    let path = resolve_path(config_path);
    let previous = config::toggle_target(&path, &args.name, args.enable)?;
    report_toggle(&args, previous);
    Ok(())
}

pub fn toggle_glob(config_path: Option<PathBuf>, args: ToggleArgs) -> Result<(), AnyError> {
    let path = resolve_path(config_path);
    let previous = config::toggle_glob(&path, &args.name, args.enable)?;
    report_toggle(&args, previous);
    Ok(())
}

fn report_toggle(args: &ToggleArgs, previous: bool) {
    let word = |on: bool| if on { "enabled" } else { "disabled" };
    if previous == args.enable {
        println!("{} is already {}", args.name, word(args.enable));
    } else {
        println!("{} {}", args.name, word(args.enable));
    }
}

pub fn list_globs(config_path: Option<PathBuf>) -> Result<(), AnyError> {
    let config = Config::load(config_path)?;

    if config.iso_globs.is_empty() {
        println!("No globs configured");
        return Ok(());
    }

    for glob in &config.iso_globs {
        let state = if glob.enabled { "enabled" } else { "disabled" };
        println!(
            "{:<24} {:<8} {:<5} {}",
            glob.name,
            state,
            glob.protocol.to_string(),
            glob.base_url
        );
        println!("{:<24} include: {}", "", glob.include_patterns.join(", "));
        if !glob.exclude_patterns.is_empty() {
            println!("{:<24} exclude: {}", "", glob.exclude_patterns.join(", "));
        }
        if glob.recursive {
            println!("{:<24} recursive, max depth {}", "", glob.max_depth);
        }
    }
    Ok(())
}

pub async fn discover(config_path: Option<PathBuf>, args: DiscoverArgs) -> Result<(), AnyError> {
    let config = Config::load(config_path)?;
    let discoverer = Discoverer::new(&config.download)?;

    let mut glob = IsoGlobConfig::new("discover", args.url, args.protocol);
    if !args.include.is_empty() {
        glob.include_patterns = args.include;
    }
    glob.exclude_patterns = args.exclude;
    glob.recursive = args.recursive;
    glob.max_depth = args.max_depth;

    let found = discoverer.discover(&glob).await?;
    if found.is_empty() {
        println!("No matching images under {}", glob.base_url);
        return Ok(());
    }
    for iso in &found {
        println!("{:<48} {}", iso.relative_path, iso.url);
    }
    println!("{} image(s) found", found.len());
    Ok(())
}

pub async fn preview_downloads(config_path: Option<PathBuf>) -> Result<(), AnyError> {
    let config = Config::load(config_path)?;
    let discoverer = Discoverer::new(&config.download)?;
    let targets = discovery::resolve_targets(&config, &discoverer).await;

    let configured = config.isos.len();
    let enabled = targets.iter().filter(|t| t.enabled).count();
    for (i, target) in targets.iter().enumerate() {
        let origin = if i < configured { "config" } else { "glob" };
        let state = if target.enabled { "enabled" } else { "disabled" };
        println!(
            "{:<40} {:<8} {:<6} {:<5} {}",
            target.name,
            state,
            origin,
            target.protocol.to_string(),
            target.url
        );
        println!("{:<40} -> {}", "", target.destination_path.display());
    }
    println!(
        "{} target(s), {} enabled, {} discovered",
        targets.len(),
        enabled,
        targets.len() - configured
    );
    Ok(())
}

pub async fn run(config_path: Option<PathBuf>, args: RunArgs) -> Result<(), AnyError> {
    let config = Config::load(config_path.clone())?;
    if config.queue.backend == QueueBackend::Amqp {
        info!("Combined mode over the broker; other workers may share the queue");
    }
    let channel: Arc<dyn QueueChannel> = queue::open_channel(&config).await?;

    let summary = app::run_combined(
        &config,
        config_path,
        channel,
        app::shutdown_on_signal(),
        args.trigger_now,
    )
    .await?;
    info!(processed = summary.processed, "Combined mode exited");
    Ok(())
}
