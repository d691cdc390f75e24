//! blobdir - read-through cache over a remote object store
//!
//! CLI entry point that dispatches to subcommands.

use blobdir::cli::{Cli, Commands};
use blobdir::config::{Config, ConfigManager};
use blobdir::error::BlobdirResult;
use clap::Parser;
use console::style;
use std::process::ExitCode;
use tracing::debug;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{} {}", style("Error:").red().bold(), e);
            if let Some(hint) = e.hint() {
                eprintln!("{} {}", style("Hint:").yellow(), hint);
            }
            ExitCode::FAILURE
        }
    }
}

async fn run() -> BlobdirResult<()> {
    let cli = Cli::parse();

    let manager = match cli.config {
        Some(ref path) => ConfigManager::with_path(path.clone()),
        None => ConfigManager::new(),
    };

    // Config commands must work even when the file on disk is invalid
    let config = match (&cli.command, manager.load().await) {
        (_, Ok(config)) => config,
        (Commands::Config(_), Err(e)) => {
            eprintln!("{} {}", style("Warning:").yellow(), e);
            Config::default()
        }
        (_, Err(e)) => return Err(e),
    };

    init_logging(cli.verbose, &config);
    debug!(path = %manager.path().display(), "configuration loaded");

    match cli.command {
        Commands::Put(args) => blobdir::cli::commands::put(args, &config).await,
        Commands::Cat(args) => blobdir::cli::commands::cat(args, &config).await,
        Commands::Stat(args) => blobdir::cli::commands::stat(args, &config).await,
        Commands::Lock(args) => blobdir::cli::commands::lock(args, &config).await,
        Commands::Config(args) => blobdir::cli::commands::config(args, &manager, &config).await,
    }
}

/// 0 = warn, 1 = info, 2+ = debug; `RUST_LOG` overrides
fn init_logging(verbose: u8, config: &Config) {
    let default = match verbose {
        0 => "blobdir=warn",
        1 => "blobdir=info",
        _ => "blobdir=debug",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);

    if config.general.log_format == "json" {
        builder.json().init();
    } else {
        builder.without_time().init();
    }
}
