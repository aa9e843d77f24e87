//! Sitesync: reconciles object listings across storage sites.

use std::path::Path;

use anyhow::{Context, Result};
use clap::Parser;
use sitesync_core::{Config, LogFormat};
use sitesync_engine::init_metrics;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

mod cli;
mod commands;

use cli::{Cli, Commands};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Commands::Version = cli.command {
        println!("sitesync {}", env!("CARGO_PKG_VERSION"));
        return Ok(());
    }

    let config = load_config(cli.config.as_deref())?;
    init_logging(&config)?;
    init_metrics();

    let ctx = commands::Context::open(&config)?;
    match cli.command {
        Commands::Run(args) => commands::run(&ctx, args).await,
        Commands::Export(args) => commands::export(&ctx, args).await,
        Commands::Merge(args) => commands::merge(&ctx, args).await,
        Commands::Plan(args) => commands::plan(&ctx, args).await,
        Commands::Actions(args) => commands::actions(&ctx, args).await,
        Commands::Purge(args) => commands::purge(&ctx, args).await,
        Commands::Stop(args) => commands::stop(&ctx, args).await,
        Commands::Status(args) => commands::status(&ctx, args).await,
        Commands::Version => Ok(()),
    }
}

fn load_config(path: Option<&Path>) -> Result<Config> {
    Config::load(path).context("Failed to load configuration")
}

fn init_logging(config: &Config) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.logging.level));

    // Logs go to stderr; stdout carries exported JSON lines.
    let fmt_layer = tracing_subscriber::fmt::layer().with_writer(std::io::stderr);

    match config.logging.format {
        LogFormat::Json => {
            tracing_subscriber::registry().with(filter).with(fmt_layer.json()).init();
        }
        LogFormat::Pretty => {
            tracing_subscriber::registry().with(filter).with(fmt_layer).init();
        }
    }

    Ok(())
}
