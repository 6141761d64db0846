use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use bucketgate::config::{LoggingConfig, ServiceConfig};
use bucketgate::ratelimit::{
    InMemoryBackend, LoggingNotifier, RateLimitConfig, RateLimiterEngine, TokenBucketStore,
};

/// Evaluate subject keys read from stdin against a set of rate rules.
///
/// Each input line is one request from the subject it names. One JSON outcome
/// is printed per line.
#[derive(Debug, Parser)]
#[command(version, about)]
struct Cli {
    /// Service configuration file (YAML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Rate rules file (YAML). Overrides `rate_limiting.config_path`.
    #[arg(short, long)]
    rules: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => ServiceConfig::from_file(path)?,
        None => ServiceConfig::default(),
    };
    init_tracing(&config.logging);

    info!("Starting Bucketgate rate limiter");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let rules_path = cli
        .rules
        .or_else(|| config.rate_limiting.config_path.as_ref().map(PathBuf::from))
        .context("no rules file given; pass --rules or set rate_limiting.config_path")?;
    let configuration = RateLimitConfig::from_file(&rules_path)?.to_configuration()?;
    info!(
        name = %configuration.name(),
        rules = configuration.rules().len(),
        logic = ?configuration.logic(),
        "Rate limiter configured"
    );

    let store = TokenBucketStore::new(InMemoryBackend::<String>::new())
        .with_settings(config.store.settings());
    let engine = RateLimiterEngine::new(configuration, store, Arc::new(LoggingNotifier));

    tokio::select! {
        result = serve_stdin(&engine) => result?,
        _ = shutdown_signal() => {
            info!("Received Ctrl+C, shutting down");
        }
    }

    info!("Bucketgate stopped");
    Ok(())
}

fn init_tracing(logging: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&logging.level));

    // Logs go to stderr so stdout carries only outcomes
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true)
        .with_writer(std::io::stderr);

    if logging.json {
        builder.json().init();
    } else {
        builder.init();
    }
}

async fn serve_stdin(
    engine: &RateLimiterEngine<String, InMemoryBackend<String>>,
) -> anyhow::Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    while let Some(line) = lines.next_line().await? {
        let subject = line.trim();
        if subject.is_empty() {
            continue;
        }

        match engine.evaluate(&subject.to_string()).await {
            Ok(outcome) => {
                let record = serde_json::json!({ "subject": subject, "outcome": outcome });
                println!("{}", record);
            }
            Err(e) => {
                error!(subject = %subject, error = %e, "Rate limiter failed to decide");
                let record = serde_json::json!({ "subject": subject, "error": e.to_string() });
                println!("{}", record);
            }
        }
    }

    info!("Input closed");
    Ok(())
}

/// Wait for Ctrl+C.
async fn shutdown_signal() {
    if let Err(e) = signal::ctrl_c().await {
        error!(error = %e, "Failed to install Ctrl+C handler");
        std::future::pending::<()>().await;
    }
}
