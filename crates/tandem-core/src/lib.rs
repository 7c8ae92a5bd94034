//! tandem-core - Core library for Tandem
//!
//! Local-first record storage with change tracking, conflict resolution and
//! the sync engine that keeps it consistent with the Remote Sync API. Shared
//! by the CLI and the reference server.

pub mod config;
pub mod db;
pub mod entity;
pub mod error;
pub mod models;
pub mod protocol;
pub mod remote;
pub mod services;
pub mod sync;
pub mod util;

pub use entity::{EntityRegistry, Entry, SyncEntity, Syncable};
pub use error::{Error, Result};
pub use services::LocalStore;
