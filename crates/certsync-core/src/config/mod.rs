//! Client runtime configuration.
//!
//! Every surface that embeds the sync engine (CLI, field app shells) resolves
//! the same `CERTSYNC_*` variables through [`ClientConfig`].

use std::collections::HashMap;
use std::env;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::sync::RetryPolicy;
use crate::util::normalize_base_url;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingVar(&'static str),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Resolved client settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientConfig {
    /// Base URL of the certsync API, when the device is provisioned for sync.
    pub api_base_url: Option<String>,
    /// Explicit local store location; callers pick a platform default otherwise.
    pub db_path: Option<PathBuf>,
    pub sync_max_attempts: u32,
    pub sync_base_delay: Duration,
    pub sync_max_delay: Duration,
    pub http_timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        let retry = RetryPolicy::default();
        Self {
            api_base_url: None,
            db_path: None,
            sync_max_attempts: retry.max_attempts,
            sync_base_delay: retry.base_delay,
            sync_max_delay: retry.max_delay,
            http_timeout: Duration::from_secs(30),
        }
    }
}

impl ClientConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let values: HashMap<String, String> = env::vars().collect();
        Self::from_lookup(|name| values.get(name).cloned())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let api_base_url = optional_trimmed(&lookup, "CERTSYNC_API_BASE_URL")
            .map(|raw| {
                normalize_base_url(&raw)
                    .map_err(|error| ConfigError::Invalid(format!("CERTSYNC_API_BASE_URL: {error}")))
            })
            .transpose()?;

        let db_path = optional_trimmed(&lookup, "CERTSYNC_DB_PATH").map(PathBuf::from);

        let sync_max_attempts =
            parse_bounded(&lookup, "CERTSYNC_SYNC_MAX_ATTEMPTS", 8, 1..=100)?;
        let base_delay_secs =
            parse_bounded(&lookup, "CERTSYNC_SYNC_BASE_DELAY_SECS", 5, 0..=3_600)?;
        let max_delay_secs =
            parse_bounded(&lookup, "CERTSYNC_SYNC_MAX_DELAY_SECS", 900, 1..=86_400)?;
        if max_delay_secs < base_delay_secs {
            return Err(ConfigError::Invalid(
                "CERTSYNC_SYNC_MAX_DELAY_SECS must be >= CERTSYNC_SYNC_BASE_DELAY_SECS"
                    .to_string(),
            ));
        }
        let http_timeout_secs = parse_bounded(&lookup, "CERTSYNC_HTTP_TIMEOUT_SECS", 30, 1..=600)?;

        Ok(Self {
            api_base_url,
            db_path,
            sync_max_attempts,
            sync_base_delay: Duration::from_secs(u64::from(base_delay_secs)),
            sync_max_delay: Duration::from_secs(u64::from(max_delay_secs)),
            http_timeout: Duration::from_secs(u64::from(http_timeout_secs)),
        })
    }

    /// Base URL, or an error naming the variable to set.
    pub fn require_api_base_url(&self) -> Result<&str, ConfigError> {
        self.api_base_url
            .as_deref()
            .ok_or(ConfigError::MissingVar("CERTSYNC_API_BASE_URL"))
    }

    pub const fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.sync_max_attempts,
            base_delay: self.sync_base_delay,
            max_delay: self.sync_max_delay,
        }
    }
}

fn parse_bounded(
    lookup: impl Fn(&str) -> Option<String>,
    name: &str,
    default: u32,
    range: std::ops::RangeInclusive<u32>,
) -> Result<u32, ConfigError> {
    let Some(raw) = optional_trimmed(lookup, name) else {
        return Ok(default);
    };
    let value = raw.parse::<u32>().map_err(|_| {
        ConfigError::Invalid(format!(
            "{name} must be an integer in [{}, {}]",
            range.start(),
            range.end()
        ))
    })?;
    if !range.contains(&value) {
        return Err(ConfigError::Invalid(format!(
            "{name} must be in [{}, {}]",
            range.start(),
            range.end()
        )));
    }
    Ok(value)
}

fn optional_trimmed(lookup: impl Fn(&str) -> Option<String>, name: &str) -> Option<String> {
    lookup(name).and_then(|value| {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    })
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn config(pairs: &[(&str, &str)]) -> Result<ClientConfig, ConfigError> {
        let map: HashMap<&str, &str> = pairs.iter().copied().collect();
        ClientConfig::from_lookup(|key| map.get(key).map(|value| (*value).to_string()))
    }

    #[test]
    fn defaults_apply_when_unset() {
        let resolved = config(&[]).unwrap();
        assert_eq!(resolved, ClientConfig::default());
        assert_eq!(resolved.retry_policy(), RetryPolicy::default());
        assert!(resolved.require_api_base_url().is_err());
    }

    #[test]
    fn base_url_is_normalized() {
        let resolved = config(&[("CERTSYNC_API_BASE_URL", " https://api.example.com/ ")]).unwrap();
        assert_eq!(resolved.require_api_base_url().unwrap(), "https://api.example.com");

        let err = config(&[("CERTSYNC_API_BASE_URL", "api.example.com")]).unwrap_err();
        assert!(err.to_string().contains("CERTSYNC_API_BASE_URL"));
    }

    #[test]
    fn retry_settings_are_bounded() {
        assert!(config(&[("CERTSYNC_SYNC_MAX_ATTEMPTS", "0")]).is_err());
        assert!(config(&[("CERTSYNC_SYNC_MAX_ATTEMPTS", "many")]).is_err());
        assert!(config(&[
            ("CERTSYNC_SYNC_BASE_DELAY_SECS", "60"),
            ("CERTSYNC_SYNC_MAX_DELAY_SECS", "30"),
        ])
        .is_err());

        let resolved = config(&[
            ("CERTSYNC_SYNC_MAX_ATTEMPTS", "3"),
            ("CERTSYNC_SYNC_BASE_DELAY_SECS", "1"),
            ("CERTSYNC_DB_PATH", "/tmp/certsync.db"),
        ])
        .unwrap();
        assert_eq!(resolved.retry_policy().max_attempts, 3);
        assert_eq!(resolved.sync_base_delay, Duration::from_secs(1));
        assert_eq!(resolved.db_path, Some(PathBuf::from("/tmp/certsync.db")));
    }
}
