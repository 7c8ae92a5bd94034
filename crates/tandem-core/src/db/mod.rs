//! Database layer for Tandem

mod change_tracker;
mod conflict_repository;
mod connection;
mod metadata_repository;
mod migrations;
mod repository;

pub use change_tracker::ChangeTracker;
pub use conflict_repository::{NewConflict, SqliteConflictRepository};
pub use connection::Database;
pub use metadata_repository::SqliteMetadataRepository;
pub use migrations::entity_table_name;
pub use repository::{RecordRepository, SqliteRecordRepository};
