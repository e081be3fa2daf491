mod cli;
mod commands;

use clap::Parser;
use cli::{Cli, Commands};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let cli = Cli::parse();
    isofetch::observability::init_tracing(cli.debug);

    let config = cli.config;
    match cli.command {
        Commands::StartScheduler => commands::start_scheduler(config).await?,
        Commands::StartWorker => commands::start_worker(config).await?,
        Commands::TriggerDownload => commands::trigger_download(config).await?,
        Commands::Status => commands::status(config).await?,
        Commands::ListIsos => commands::list_isos(config)?,
        Commands::ToggleIso(args) => commands::toggle_iso(config, args)?,
        Commands::Run(args) => commands::run(config, args).await?,
        Commands::Discover(args) => commands::discover(config, args).await?,
        Commands::ListGlobs => commands::list_globs(config)?,
        Commands::ToggleGlob(args) => commands::toggle_glob(config, args)?,
        Commands::PreviewDownloads => commands::preview_downloads(config).await?,
    }

    Ok(())
}
