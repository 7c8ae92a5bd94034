//! Error types for tandem-core

use thiserror::Error;

/// Result type alias using tandem-core's Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in tandem-core operations
#[derive(Error, Debug)]
pub enum Error {
    /// Local store failure that is not a SQLite error (lock poisoning, bad rows)
    #[error("Database error: {0}")]
    Database(String),

    /// SQLite error
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Record or conflict not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Invalid input
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Entity type was never registered with the store
    #[error("Unknown entity type: {0}")]
    UnknownEntity(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Remote sync API unreachable or timed out
    #[error("Network error: {0}")]
    Network(String),

    /// Credential rejected by the remote sync API
    #[error("Authentication error: {0}")]
    Auth(String),

    /// Payload rejected by the remote sync API
    #[error("Validation error: {0}")]
    Validation(String),

    /// Remote sync API failed or answered with something unexpected
    #[error("Remote server error: {0}")]
    Server(String),

    /// Another sync cycle currently holds the guard
    #[error("Sync already in progress")]
    SyncInProgress,
}

impl Error {
    /// Whether this failure must abort the remaining entity types of a cycle.
    ///
    /// All requests of a cycle share one endpoint and one credential, so a
    /// network, auth or server failure on one entity type applies to all.
    pub const fn aborts_cycle(&self) -> bool {
        matches!(self, Self::Network(_) | Self::Auth(_) | Self::Server(_))
    }

    /// Whether the caller should re-authenticate before the next cycle.
    pub const fn is_auth(&self) -> bool {
        matches!(self, Self::Auth(_))
    }
}

impl From<reqwest::Error> for Error {
    fn from(error: reqwest::Error) -> Self {
        if error.is_decode() {
            Self::Server(format!("invalid response body: {error}"))
        } else {
            Self::Network(error.to_string())
        }
    }
}
