use std::collections::HashMap;
use std::env;
use std::fmt;
use std::time::Duration;

use tandem_core::util::normalize_text_option;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingVar(&'static str),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Clone)]
pub struct AppConfig {
    pub bind_addr: String,
    /// Shared bearer token every client must present
    pub api_token: String,
    /// Upper bound on items per `GET /{entity}s` page
    pub pull_page_limit: usize,
    /// Period of `PING` frames on the notification channel
    pub ping_interval: Duration,
}

impl fmt::Debug for AppConfig {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("AppConfig")
            .field("bind_addr", &self.bind_addr)
            .field("api_token", &"[REDACTED]")
            .field("pull_page_limit", &self.pull_page_limit)
            .field("ping_interval", &self.ping_interval)
            .finish()
    }
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let values: HashMap<String, String> = env::vars().collect();
        Self::from_lookup(|name| values.get(name).cloned())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let bind_addr = value_or_default(&lookup, "TANDEM_API_BIND_ADDR", "127.0.0.1:8080");
        let api_token = required_trimmed(&lookup, "TANDEM_API_TOKEN")?;

        let pull_page_limit = value_or_default(&lookup, "TANDEM_PULL_PAGE_LIMIT", "500")
            .parse::<usize>()
            .map_err(|_| {
                ConfigError::Invalid(
                    "TANDEM_PULL_PAGE_LIMIT must be an integer in [1, 5000]".to_string(),
                )
            })?;
        if !(1..=5_000).contains(&pull_page_limit) {
            return Err(ConfigError::Invalid(
                "TANDEM_PULL_PAGE_LIMIT must be in [1, 5000]".to_string(),
            ));
        }

        let ping_interval_secs = value_or_default(&lookup, "TANDEM_PING_INTERVAL_SECS", "30")
            .parse::<u64>()
            .map_err(|_| {
                ConfigError::Invalid(
                    "TANDEM_PING_INTERVAL_SECS must be an integer in [5, 300]".to_string(),
                )
            })?;
        if !(5..=300).contains(&ping_interval_secs) {
            return Err(ConfigError::Invalid(
                "TANDEM_PING_INTERVAL_SECS must be in [5, 300]".to_string(),
            ));
        }

        Ok(Self {
            bind_addr,
            api_token,
            pull_page_limit,
            ping_interval: Duration::from_secs(ping_interval_secs),
        })
    }
}

fn value_or_default(lookup: impl Fn(&str) -> Option<String>, name: &str, default: &str) -> String {
    normalize_text_option(lookup(name)).unwrap_or_else(|| default.to_string())
}

fn required_trimmed(
    lookup: impl Fn(&str) -> Option<String>,
    name: &'static str,
) -> Result<String, ConfigError> {
    normalize_text_option(lookup(name)).ok_or(ConfigError::MissingVar(name))
}
