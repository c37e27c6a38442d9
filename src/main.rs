//! Crosspost CLI entry point.

use anyhow::Context as _;
use clap::Parser;
use crosspost::config::Config;
use crosspost::crosspost::{Crosspost, CrosspostDeps};
use crosspost::http::HttpFetcher;
use crosspost::messaging::discord::{self, DiscordTransport};
use crosspost::settings::RedbSettingsStore;
use crosspost::sites::SiteRegistry;

use std::sync::Arc;

#[derive(Parser)]
#[command(name = "crosspost")]
#[command(about = "Repost the media behind social media links on Discord")]
struct Cli {
    /// Path to config file (optional)
    #[arg(short, long)]
    config: Option<std::path::PathBuf>,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => Config::load_from_path(path)
            .with_context(|| format!("failed to load config from {}", path.display()))?,
        None => Config::load().context("failed to load configuration")?,
    };

    let log_dir = config.log_dir();
    std::fs::create_dir_all(&log_dir)
        .with_context(|| format!("failed to create log directory {}", log_dir.display()))?;
    let _log_guard = crosspost::logging::init(&log_dir, cli.debug);

    tracing::info!(data_dir = %config.data_dir.display(), "configuration loaded");

    let token = config.discord_token()?.to_string();
    let settings = Arc::new(
        RedbSettingsStore::open(&config.settings_path())
            .context("failed to open settings database")?,
    );
    let fetch = Arc::new(HttpFetcher::new(&config.crosspost)?);
    let sites = SiteRegistry::from_config(&config.sites)?;
    let transport = Arc::new(DiscordTransport::new(&token));

    let crosspost = Arc::new(Crosspost::new(
        config.crosspost.clone(),
        CrosspostDeps {
            sites,
            settings,
            transport: transport.clone(),
            fetch,
            translator: None,
        },
    ));
    crosspost.load().await;

    let mut client = discord::connect(&token, Arc::clone(&crosspost), transport).await?;
    let shard_manager = Arc::clone(&client.shard_manager);

    tokio::select! {
        result = client.start() => {
            if let Err(error) = result {
                tracing::error!(%error, "discord client stopped");
            }
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutdown signal received");
        }
    }

    shard_manager.shutdown_all().await;
    crosspost.shutdown().await;

    tracing::info!("crosspost stopped");
    Ok(())
}
