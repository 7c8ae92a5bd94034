use std::io;

use tandem_core::config::ConfigError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CliError {
    #[error(transparent)]
    Core(#[from] tandem_core::Error),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Serialization(#[from] serde_json::Error),
    #[error("No payload provided; pass a JSON object or pipe one on stdin")]
    EmptyPayload,
    #[error("Payload must be a JSON object: {0}")]
    InvalidPayload(String),
    #[error("Record ID cannot be empty")]
    EmptyRecordId,
    #[error("Record not found for id/prefix: {0}")]
    RecordNotFound(String),
    #[error("{0}")]
    AmbiguousRecordId(String),
    #[error("Conflict not found: {0}")]
    ConflictNotFound(i64),
    #[error("Could not resolve a data directory; pass --db-path or set TANDEM_DB_PATH")]
    NoDataDir,
    #[error("Sync stopped early: {0}")]
    SyncAborted(String),
}
