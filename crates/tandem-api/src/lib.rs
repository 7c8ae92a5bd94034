//! tandem-api - reference Remote Sync API server
//!
//! Serves the four record endpoints and the change notification channel over
//! an in-memory [`tandem_core::protocol::Authority`].

pub mod config;
pub mod error;
pub mod routes;

pub use config::{AppConfig, ConfigError};
pub use error::AppError;
pub use routes::{app_router, AppState};
