//! Seine CLI.
//!
//! Subcommands:
//! - `run` - start the indexing engine
//! - `migrate` - create the cache schema and exit
//! - `version` - print version information
//!
//! Exit codes: 0 clean shutdown, 1 fatal configuration or handler error,
//! 2 RPC permanently unavailable.

use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use seine::cache::{CacheStore, SqlCacheStore};
use seine::config::Settings;
use seine::dispatch::{HandlerRegistry, MemoryRecordStore};
use seine::orchestrator::Orchestrator;

/// Seine event indexing engine.
#[derive(Parser, Debug)]
#[command(name = "seine")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Subcommand to execute.
    #[command(subcommand)]
    command: Commands,

    /// Configuration file path.
    #[arg(short, long, default_value = "seine.toml")]
    config: String,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the indexer.
    Run,

    /// Create the cache schema and exit.
    Migrate,

    /// Show version information.
    Version,
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();
}

fn main() -> ExitCode {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    init_tracing();

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("failed to start runtime: {e}");
            return ExitCode::FAILURE;
        }
    };

    match cli.command {
        Commands::Version => {
            println!("seine {}", seine::VERSION);
            ExitCode::SUCCESS
        }
        Commands::Migrate => runtime.block_on(migrate(&cli.config)),
        Commands::Run => runtime.block_on(run(&cli.config)),
    }
}

fn load_settings(path: &str) -> Option<Settings> {
    match Settings::load(path) {
        Ok(settings) => Some(settings),
        Err(e) => {
            error!(config = path, error = %e, "failed to load configuration");
            None
        }
    }
}

async fn migrate(config: &str) -> ExitCode {
    let Some(settings) = load_settings(config) else { return ExitCode::FAILURE };
    let url = settings.database_url();
    match SqlCacheStore::connect(&url).await {
        Ok(store) => match store.migrate().await {
            Ok(()) => {
                info!("cache schema ready");
                ExitCode::SUCCESS
            }
            Err(e) => {
                error!(error = %e, "migration failed");
                ExitCode::FAILURE
            }
        },
        Err(e) => {
            error!(error = %e, url, "cannot connect to cache database");
            ExitCode::FAILURE
        }
    }
}

async fn run(config: &str) -> ExitCode {
    info!(version = seine::VERSION, config, "starting seine");
    let Some(settings) = load_settings(config) else { return ExitCode::FAILURE };

    // Handlers are registered by the embedding application; the bare binary
    // runs with an empty registry and an in-memory store, which still
    // exercises sync, caching, and ordering end to end.
    let registry = HandlerRegistry::new();
    let records = Arc::new(MemoryRecordStore::new());

    let orchestrator = Orchestrator::new(settings, registry, records);
    let shutdown = CancellationToken::new();

    let ctrl_c = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received, shutting down");
            ctrl_c.cancel();
        }
    });

    match orchestrator.run(shutdown).await {
        Ok(()) => {
            info!("clean shutdown");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(error = %e, "indexer failed");
            // Error::exit_code is i32 by contract; clamp into ExitCode range.
            ExitCode::from(u8::try_from(e.exit_code()).unwrap_or(1))
        }
    }
}
