//! Engine node entry point.
//!
//! `oban start` boots the engine against `DATABASE_URL` and runs until
//! interrupted. Exit codes: 0 on clean shutdown, 1 on configuration or
//! initialization failure, 2 on an unrecoverable runtime error.

use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use oban::{Config, Engine, Registry};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "oban")]
#[command(about = "Durable background job processor")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Boot the engine and run until interrupted.
    Start,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,sqlx=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Start => start().await,
    }
}

async fn start() -> ExitCode {
    let config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            tracing::error!(error = %format!("{e:#}"), "configuration failed");
            return ExitCode::from(1);
        }
    };

    // Worker registration happens in code: embed the engine as a library to
    // run handlers. A bare node still stages, prunes, rescues, and serves
    // any queues configured via OBAN_QUEUES.
    let registry = Registry::new();

    let engine = match Engine::connect(config, registry).await {
        Ok(engine) => Arc::new(engine),
        Err(e) => {
            tracing::error!(error = %e, "engine initialization failed");
            return ExitCode::from(1);
        }
    };

    let signal_target = engine.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("shutdown signal received");
            signal_target.initiate_shutdown();
        }
    });

    match engine.run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "unrecoverable runtime error");
            ExitCode::from(2)
        }
    }
}
