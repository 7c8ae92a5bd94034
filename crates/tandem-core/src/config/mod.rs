//! Client sync settings.
//!
//! Read from `TANDEM_*` environment variables through an injectable lookup so
//! binaries and tests share the same validation.

use std::collections::HashMap;
use std::env;
use std::fmt;
use std::time::Duration;

use thiserror::Error;

use crate::entity::EntityRegistry;
use crate::models::ResolutionStrategy;
use crate::remote::HttpRemoteApi;
use crate::sync::{SchedulerConfig, SyncOptions, DEFAULT_BATCH_SIZE};
use crate::util::{is_http_url, is_ws_url, normalize_text_option};

const DEFAULT_ENTITIES: &str = "topic,session";
const MAX_BATCH_SIZE: usize = 500;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingVar(&'static str),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Clone, PartialEq, Eq)]
pub struct SyncSettings {
    /// Remote Sync API base URL, without the `/v1` prefix
    pub api_url: String,
    pub api_token: String,
    /// Entity types in dependency order
    pub entities: Vec<String>,
    pub batch_size: usize,
    pub sync_interval: Duration,
    /// Change Notification Channel; notifications are off when `None`
    pub notify_url: Option<String>,
    pub notify_debounce: Duration,
    pub conflict_strategy: ResolutionStrategy,
    pub shutdown_timeout: Duration,
    pub request_timeout: Duration,
}

impl fmt::Debug for SyncSettings {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("SyncSettings")
            .field("api_url", &self.api_url)
            .field("api_token", &"[REDACTED]")
            .field("entities", &self.entities)
            .field("batch_size", &self.batch_size)
            .field("sync_interval", &self.sync_interval)
            .field("notify_url", &self.notify_url)
            .field("notify_debounce", &self.notify_debounce)
            .field("conflict_strategy", &self.conflict_strategy)
            .field("shutdown_timeout", &self.shutdown_timeout)
            .field("request_timeout", &self.request_timeout)
            .finish()
    }
}

impl SyncSettings {
    pub fn from_env() -> Result<Self, ConfigError> {
        let values: HashMap<String, String> = env::vars().collect();
        Self::from_lookup(|name| values.get(name).cloned())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let api_url = required_trimmed(&lookup, "TANDEM_API_URL")?
            .trim_end_matches('/')
            .to_string();
        if !is_http_url(&api_url) {
            return Err(ConfigError::Invalid(
                "TANDEM_API_URL must start with http:// or https://".to_string(),
            ));
        }
        let api_token = required_trimmed(&lookup, "TANDEM_API_TOKEN")?;

        let entities: Vec<String> = value_or_default(&lookup, "TANDEM_ENTITIES", DEFAULT_ENTITIES)
            .split(',')
            .filter_map(|name| normalize_text_option(Some(name.to_string())))
            .collect();
        if entities.is_empty() {
            return Err(ConfigError::Invalid(
                "TANDEM_ENTITIES must name at least one entity type".to_string(),
            ));
        }
        EntityRegistry::from_names(entities.iter().map(String::as_str))
            .map_err(|error| ConfigError::Invalid(format!("TANDEM_ENTITIES: {error}")))?;

        let batch_size = parse_in_range(
            &lookup,
            "TANDEM_BATCH_SIZE",
            DEFAULT_BATCH_SIZE as u64,
            1,
            MAX_BATCH_SIZE as u64,
        )?;
        let sync_interval_secs =
            parse_in_range(&lookup, "TANDEM_SYNC_INTERVAL_SECS", 300, 10, 86_400)?;

        let notify_url = optional_trimmed(&lookup, "TANDEM_NOTIFY_URL");
        if let Some(url) = notify_url.as_deref() {
            if !is_ws_url(url) {
                return Err(ConfigError::Invalid(
                    "TANDEM_NOTIFY_URL must start with ws:// or wss://".to_string(),
                ));
            }
        }
        let notify_debounce_ms =
            parse_in_range(&lookup, "TANDEM_NOTIFY_DEBOUNCE_MS", 750, 0, 60_000)?;

        let conflict_strategy = optional_trimmed(&lookup, "TANDEM_CONFLICT_STRATEGY")
            .map(|value| value.parse::<ResolutionStrategy>())
            .transpose()
            .map_err(|_| {
                ConfigError::Invalid(
                    "TANDEM_CONFLICT_STRATEGY must be keep_local, keep_remote, merge or manual"
                        .to_string(),
                )
            })?
            .unwrap_or_default();

        let shutdown_timeout_secs =
            parse_in_range(&lookup, "TANDEM_SHUTDOWN_TIMEOUT_SECS", 5, 1, 60)?;
        let request_timeout_secs =
            parse_in_range(&lookup, "TANDEM_REQUEST_TIMEOUT_SECS", 30, 1, 600)?;

        Ok(Self {
            api_url,
            api_token,
            entities,
            batch_size: usize::try_from(batch_size).unwrap_or(DEFAULT_BATCH_SIZE),
            sync_interval: Duration::from_secs(sync_interval_secs),
            notify_url,
            notify_debounce: Duration::from_millis(notify_debounce_ms),
            conflict_strategy,
            shutdown_timeout: Duration::from_secs(shutdown_timeout_secs),
            request_timeout: Duration::from_secs(request_timeout_secs),
        })
    }

    /// Registry of the configured entity types, untyped with shallow merge
    pub fn registry(&self) -> crate::Result<EntityRegistry> {
        EntityRegistry::from_names(self.entities.iter().map(String::as_str))
    }

    pub fn remote(&self) -> crate::Result<HttpRemoteApi> {
        HttpRemoteApi::new(&self.api_url, &self.api_token, self.request_timeout)
    }

    pub const fn sync_options(&self) -> SyncOptions {
        SyncOptions {
            batch_size: self.batch_size,
            pull_page_limit: None,
            default_strategy: self.conflict_strategy,
        }
    }

    pub const fn scheduler_config(&self) -> SchedulerConfig {
        SchedulerConfig {
            interval: self.sync_interval,
            debounce: self.notify_debounce,
            push_on_save: true,
        }
    }
}

fn parse_in_range(
    lookup: impl Fn(&str) -> Option<String>,
    name: &str,
    default: u64,
    min: u64,
    max: u64,
) -> Result<u64, ConfigError> {
    let value = optional_trimmed(lookup, name)
        .map(|raw| raw.parse::<u64>())
        .transpose()
        .map_err(|_| ConfigError::Invalid(format!("{name} must be an integer in [{min}, {max}]")))?
        .unwrap_or(default);
    if !(min..=max).contains(&value) {
        return Err(ConfigError::Invalid(format!(
            "{name} must be in [{min}, {max}]"
        )));
    }
    Ok(value)
}

fn value_or_default(lookup: impl Fn(&str) -> Option<String>, name: &str, default: &str) -> String {
    optional_trimmed(lookup, name).unwrap_or_else(|| default.to_string())
}

fn required_trimmed(
    lookup: impl Fn(&str) -> Option<String>,
    name: &'static str,
) -> Result<String, ConfigError> {
    optional_trimmed(lookup, name).ok_or(ConfigError::MissingVar(name))
}

fn optional_trimmed(lookup: impl Fn(&str) -> Option<String>, name: &str) -> Option<String> {
    normalize_text_option(lookup(name))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn settings(pairs: &[(&str, &str)]) -> Result<SyncSettings, ConfigError> {
        let map: HashMap<&str, &str> = pairs.iter().copied().collect();
        SyncSettings::from_lookup(|key| map.get(key).map(|value| (*value).to_string()))
    }

    const MINIMAL: [(&str, &str); 2] = [
        ("TANDEM_API_URL", "https://sync.example.com/"),
        ("TANDEM_API_TOKEN", "sensitive-token"),
    ];

    #[test]
    fn settings_require_url_and_token() {
        let err = settings(&[]).unwrap_err();
        assert!(err.to_string().contains("TANDEM_API_URL"));
        let err = settings(&MINIMAL[..1]).unwrap_err();
        assert!(matches!(err, ConfigError::MissingVar("TANDEM_API_TOKEN")));
    }

    #[test]
    fn settings_defaults() {
        let settings = settings(&MINIMAL).unwrap();
        assert_eq!(settings.api_url, "https://sync.example.com");
        assert_eq!(settings.entities, vec!["topic", "session"]);
        assert_eq!(settings.batch_size, 100);
        assert_eq!(settings.sync_interval, Duration::from_secs(300));
        assert_eq!(settings.notify_url, None);
        assert_eq!(settings.notify_debounce, Duration::from_millis(750));
        assert_eq!(settings.conflict_strategy, ResolutionStrategy::Manual);
        assert_eq!(settings.shutdown_timeout, Duration::from_secs(5));
        assert_eq!(settings.request_timeout, Duration::from_secs(30));
        assert_eq!(settings.registry().unwrap().len(), 2);
    }

    #[test]
    fn settings_read_overrides() {
        let mut pairs = MINIMAL.to_vec();
        pairs.extend([
            ("TANDEM_ENTITIES", " project, task ,note "),
            ("TANDEM_BATCH_SIZE", "25"),
            ("TANDEM_NOTIFY_URL", "wss://sync.example.com/v1/notifications"),
            ("TANDEM_CONFLICT_STRATEGY", "keep-remote"),
        ]);
        let settings = settings(&pairs).unwrap();
        assert_eq!(settings.entities, vec!["project", "task", "note"]);
        assert_eq!(settings.sync_options().batch_size, 25);
        assert_eq!(
            settings.sync_options().default_strategy,
            ResolutionStrategy::KeepRemote
        );
        assert!(settings.notify_url.is_some());
    }

    #[test]
    fn settings_reject_out_of_range_values() {
        for (name, value) in [
            ("TANDEM_BATCH_SIZE", "0"),
            ("TANDEM_BATCH_SIZE", "501"),
            ("TANDEM_SYNC_INTERVAL_SECS", "5"),
            ("TANDEM_SHUTDOWN_TIMEOUT_SECS", "soon"),
            ("TANDEM_NOTIFY_URL", "https://sync.example.com"),
            ("TANDEM_CONFLICT_STRATEGY", "newest"),
            ("TANDEM_ENTITIES", "topic,topic"),
        ] {
            let mut pairs = MINIMAL.to_vec();
            pairs.push((name, value));
            assert!(
                matches!(settings(&pairs), Err(ConfigError::Invalid(_))),
                "{name}={value} should be rejected"
            );
        }
    }

    #[test]
    fn settings_redact_token() {
        let settings = settings(&MINIMAL).unwrap();
        let debug_output = format!("{settings:?}");
        assert!(!debug_output.contains("sensitive-token"));
        assert!(debug_output.contains("[REDACTED]"));
    }
}
