//! certsync CLI - inspect and drain the offline certificate queue
//!
//! Field devices normally drain on their own; this tool exposes the same
//! engine for support staff and scripted environments.

mod cli;
mod commands;
mod error;


use clap::Parser;

use crate::cli::{Cli, Commands, QueueCommands};
use crate::commands::common::{open_store, resolve_db_path};
use crate::commands::discard::run_discard;
use crate::commands::drain::{run_drain, run_watch};
use crate::commands::queue::{run_dead_letters, run_queue_list, run_queue_retry};
use crate::commands::status::run_status;
use crate::error::CliError;

#[tokio::main]
async fn main() {
    if let Err(error) = run().await {
        eprintln!("Error: {error}");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), CliError> {
    dotenvy::dotenv().ok();

    let filter = tracing_subscriber::EnvFilter::from_default_env();
    let filter = match "certsync=info".parse() {
        Ok(directive) => filter.add_directive(directive),
        Err(_) => filter,
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let cli = Cli::parse();
    let config = certsync_core::config::ClientConfig::from_env()?;
    let db_path = resolve_db_path(cli.db_path, config.db_path.clone());
    let store = open_store(&db_path).await?;

    match cli.command {
        Commands::Status { json } => run_status(&store, json).await?,
        Commands::Queue { command } => match command {
            QueueCommands::List { json } => run_queue_list(&store, json).await?,
            QueueCommands::DeadLetters { json } => run_dead_letters(&store, json).await?,
            QueueCommands::Retry { seq } => run_queue_retry(&store, seq).await?,
        },
        Commands::Drain { json } => run_drain(&store, &config, json).await?,
        Commands::Watch { probe_interval } => run_watch(&store, &config, probe_interval).await?,
        Commands::Discard { id } => run_discard(&store, &id).await?,
    }

    store.close().await;
    Ok(())
}
