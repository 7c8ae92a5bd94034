use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};
use tandem_core::models::ResolutionStrategy;

#[derive(Parser)]
#[command(name = "tandem")]
#[command(about = "Local-first records kept in sync with a Tandem server")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Optional path to local database file
    #[arg(long, global = true, value_name = "PATH")]
    pub db_path: Option<PathBuf>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Create, edit and list local records
    Records {
        #[command(subcommand)]
        command: RecordCommands,
    },
    /// Run one push/pull cycle against the server
    Sync {
        /// Output the cycle report as JSON
        #[arg(long)]
        json: bool,
    },
    /// Show pending, conflicted and failed rows per entity type
    Status {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Inspect and resolve sync conflicts
    Conflicts {
        #[command(subcommand)]
        command: ConflictCommands,
    },
    /// Keep syncing on a timer and on server notifications until Ctrl-C
    Watch,
}

#[derive(Subcommand)]
pub enum RecordCommands {
    /// Create a record from a JSON object (argument or stdin)
    Add {
        /// Entity type, e.g. `topic`
        entity: String,
        /// JSON object payload
        payload: Option<String>,
    },
    /// Replace the payload of a record
    Update {
        entity: String,
        /// Local ID or unique ID prefix
        id: String,
        /// JSON object payload
        payload: Option<String>,
    },
    /// Delete a record (kept as a tombstone until synced)
    Delete {
        entity: String,
        /// Local ID or unique ID prefix
        id: String,
    },
    /// List records of one entity type
    List {
        entity: String,
        /// Number of records to show
        #[arg(short, long, default_value = "10")]
        limit: usize,
        /// Include deleted records
        #[arg(long)]
        all: bool,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
}

#[derive(Subcommand)]
pub enum ConflictCommands {
    /// List conflicts, newest first
    List {
        /// Number of conflicts to show
        #[arg(short, long, default_value = "10")]
        limit: usize,
        /// Include resolved conflicts
        #[arg(long)]
        all: bool,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Settle an open conflict
    Resolve {
        /// Conflict ID
        id: i64,
        /// Side to keep
        #[arg(long, value_enum)]
        strategy: StrategyArg,
    },
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, ValueEnum)]
pub enum StrategyArg {
    KeepLocal,
    KeepRemote,
    Merge,
}

impl From<StrategyArg> for ResolutionStrategy {
    fn from(value: StrategyArg) -> Self {
        match value {
            StrategyArg::KeepLocal => Self::KeepLocal,
            StrategyArg::KeepRemote => Self::KeepRemote,
            StrategyArg::Merge => Self::Merge,
        }
    }
}
