//! Tandem CLI - edit local records offline and sync them with a Tandem server

mod cli;
mod commands;
mod error;

#[cfg(test)]
mod tests;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use crate::cli::{Cli, Commands, ConflictCommands, RecordCommands};
use crate::commands::common::resolve_db_path;
use crate::commands::conflicts::{run_conflicts_list, run_conflicts_resolve};
use crate::commands::records::{run_add, run_delete, run_list, run_update};
use crate::commands::status::run_status;
use crate::commands::sync::{run_sync, run_watch};
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

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("tandem=info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let db_path = resolve_db_path(cli.db_path)?;

    match cli.command {
        Commands::Records { command } => match command {
            RecordCommands::Add { entity, payload } => {
                run_add(&entity, payload.as_deref(), &db_path)?;
            }
            RecordCommands::Update {
                entity,
                id,
                payload,
            } => run_update(&entity, &id, payload.as_deref(), &db_path)?,
            RecordCommands::Delete { entity, id } => run_delete(&entity, &id, &db_path)?,
            RecordCommands::List {
                entity,
                limit,
                all,
                json,
            } => run_list(&entity, limit, all, json, &db_path)?,
        },
        Commands::Sync { json } => run_sync(json, &db_path).await?,
        Commands::Status { json } => run_status(json, &db_path)?,
        Commands::Conflicts { command } => match command {
            ConflictCommands::List { limit, all, json } => {
                run_conflicts_list(limit, all, json, &db_path)?;
            }
            ConflictCommands::Resolve { id, strategy } => {
                run_conflicts_resolve(id, strategy.into(), &db_path)?;
            }
        },
        Commands::Watch => run_watch(&db_path).await?,
    }

    Ok(())
}
