use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;

mod config;
mod controller;
mod db;
mod error;
mod models;
mod scraper;
mod tui;

use config::Config;
use controller::Controller;
use scraper::FailurePolicy;

#[derive(Parser, Debug)]
#[command(name = "imsa-scraper", version, about = "Scrape scoring.imsa.com")]
struct Cli {
    /// Filename to use for sqlite3 database
    filename: PathBuf,

    /// Polling interval, in seconds
    #[arg(short, long)]
    interval: Option<u64>,

    /// Reinitialize database before beginning
    #[arg(short, long)]
    clean: bool,

    /// Stop after this many seconds instead of waiting for Ctrl+C
    #[arg(short, long)]
    duration: Option<u64>,

    /// What to do when a request or database write fails
    #[arg(long, value_enum)]
    on_error: Option<FailurePolicy>,

    /// API subscription key
    #[arg(long, env = "IMSA_SUBSCRIPTION_KEY", hide_env_values = true)]
    subscription_key: Option<String>,

    /// Config file to use instead of the default location
    #[arg(long)]
    config: Option<PathBuf>,

    /// Don't draw the live request counter
    #[arg(long)]
    no_status: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging (only show warnings and errors by default)
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::WARN.into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    // Load configuration, command line wins over the file
    let mut config = match &cli.config {
        Some(path) => Config::load_from(path),
        None => Config::load(),
    }
    .context("failed to load configuration")?;

    apply_cli(&mut config, &cli);
    config.validate().context("invalid configuration")?;

    let controller = Controller::new(config, cli.filename, cli.clean)
        .await
        .context("failed to prepare database")?;
    tracing::info!(
        "{} rows already stored in {}",
        controller.row_count().await?,
        controller.db_path().display()
    );

    let summary = match cli.duration {
        Some(secs) => controller.run_for(Duration::from_secs(secs)).await,
        None => controller.run_interactive(!cli.no_status).await,
    }
    .context("scraper stopped with an error")?;

    println!(
        "Received {} responses, {} rows stored",
        summary.requests, summary.stored_rows
    );
    if let Some(latest) = summary.latest_capture {
        println!("Latest capture at {}", latest.format("%Y-%m-%d %H:%M:%S %:z"));
    }

    Ok(())
}

/// Flags given on the command line (or through the env) replace file values.
fn apply_cli(config: &mut Config, cli: &Cli) {
    if let Some(interval) = cli.interval {
        config.poll_interval_secs = interval;
    }
    if let Some(policy) = cli.on_error {
        config.failure_policy = policy;
    }
    if let Some(key) = &cli.subscription_key {
        config.subscription_key = Some(key.clone());
    }
}
