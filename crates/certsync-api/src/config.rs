use std::collections::HashMap;
use std::env;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

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
    pub database_path: PathBuf,
    pub jwks_url: String,
    pub jwt_issuer: String,
    pub jwt_audience: String,
    pub jwks_cache_ttl: Duration,
    pub auth_clock_skew: Duration,
    pub rate_limit_window: Duration,
    pub sync_rate_limit_per_window: u32,
    pub media_presign_rate_limit_per_window: u32,
    pub media_url_ttl: Duration,
    /// Reject every write with 503 while set.
    pub read_only: bool,
    pub r2: Option<R2RuntimeConfig>,
}

#[derive(Clone, PartialEq, Eq)]
pub struct R2RuntimeConfig {
    pub account_id: String,
    pub bucket: String,
    pub access_key_id: String,
    pub secret_access_key: String,
}

impl fmt::Debug for R2RuntimeConfig {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("R2RuntimeConfig")
            .field("account_id", &self.account_id)
            .field("bucket", &self.bucket)
            .field("access_key_id", &"[REDACTED]")
            .field("secret_access_key", &"[REDACTED]")
            .finish()
    }
}

impl fmt::Debug for AppConfig {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("AppConfig")
            .field("bind_addr", &self.bind_addr)
            .field("database_path", &self.database_path)
            .field("jwks_url", &self.jwks_url)
            .field("jwt_issuer", &self.jwt_issuer)
            .field("jwt_audience", &self.jwt_audience)
            .field("jwks_cache_ttl", &self.jwks_cache_ttl)
            .field("auth_clock_skew", &self.auth_clock_skew)
            .field("rate_limit_window", &self.rate_limit_window)
            .field(
                "sync_rate_limit_per_window",
                &self.sync_rate_limit_per_window,
            )
            .field(
                "media_presign_rate_limit_per_window",
                &self.media_presign_rate_limit_per_window,
            )
            .field("media_url_ttl", &self.media_url_ttl)
            .field("read_only", &self.read_only)
            .field("r2", &self.r2)
            .finish()
    }
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let values: HashMap<String, String> = env::vars().collect();
        Self::from_lookup(|name| values.get(name).cloned())
    }

    pub(crate) fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let bind_addr = value_or_default(&lookup, "CERTSYNC_API_BIND_ADDR", "127.0.0.1:8080");
        let database_path = PathBuf::from(value_or_default(
            &lookup,
            "CERTSYNC_DATABASE_PATH",
            "certsync-server.db",
        ));

        let jwks_url = required_trimmed(&lookup, "AUTH_JWKS_URL")?;
        if !is_http_url(&jwks_url) {
            return Err(ConfigError::Invalid(
                "AUTH_JWKS_URL must start with http:// or https://".to_string(),
            ));
        }
        let jwt_issuer = required_trimmed(&lookup, "AUTH_JWT_ISSUER")?;
        let jwt_audience = value_or_default(&lookup, "AUTH_JWT_AUDIENCE", "authenticated");

        let jwks_cache_ttl_secs =
            bounded_u64(&lookup, "AUTH_JWKS_CACHE_TTL_SECS", 300, 30..=86_400)?;
        let auth_clock_skew_secs = bounded_u64(&lookup, "AUTH_CLOCK_SKEW_SECS", 60, 0..=300)?;
        let rate_limit_window_secs =
            bounded_u64(&lookup, "RATE_LIMIT_WINDOW_SECS", 60, 10..=3_600)?;
        let sync_rate_limit_per_window =
            bounded_u32(&lookup, "SYNC_RATE_LIMIT_PER_WINDOW", 600, 1..=10_000)?;
        let media_presign_rate_limit_per_window =
            bounded_u32(&lookup, "MEDIA_PRESIGN_RATE_LIMIT_PER_WINDOW", 120, 1..=5_000)?;
        let media_ttl_secs = bounded_u64(&lookup, "MEDIA_SIGNED_URL_TTL_SECS", 600, 60..=3_600)?;

        let read_only = match optional_trimmed(&lookup, "CERTSYNC_READ_ONLY").as_deref() {
            None | Some("0" | "false" | "no") => false,
            Some("1" | "true" | "yes") => true,
            Some(other) => {
                return Err(ConfigError::Invalid(format!(
                    "CERTSYNC_READ_ONLY must be true or false, got `{other}`"
                )))
            }
        };

        let r2 = parse_r2_config(&lookup)?;

        Ok(Self {
            bind_addr,
            database_path,
            jwks_url,
            jwt_issuer,
            jwt_audience,
            jwks_cache_ttl: Duration::from_secs(jwks_cache_ttl_secs),
            auth_clock_skew: Duration::from_secs(auth_clock_skew_secs),
            rate_limit_window: Duration::from_secs(rate_limit_window_secs),
            sync_rate_limit_per_window,
            media_presign_rate_limit_per_window,
            media_url_ttl: Duration::from_secs(media_ttl_secs),
            read_only,
            r2,
        })
    }
}

fn parse_r2_config(
    lookup: impl Fn(&str) -> Option<String>,
) -> Result<Option<R2RuntimeConfig>, ConfigError> {
    let account_id = optional_trimmed(&lookup, "R2_ACCOUNT_ID");
    let bucket = optional_trimmed(&lookup, "R2_BUCKET");
    let access_key_id = optional_trimmed(&lookup, "R2_ACCESS_KEY_ID");
    let secret_access_key = optional_trimmed(&lookup, "R2_SECRET_ACCESS_KEY");

    let any_set = account_id.is_some()
        || bucket.is_some()
        || access_key_id.is_some()
        || secret_access_key.is_some();
    if !any_set {
        return Ok(None);
    }

    Ok(Some(R2RuntimeConfig {
        account_id: account_id.ok_or(ConfigError::MissingVar("R2_ACCOUNT_ID"))?,
        bucket: bucket.ok_or(ConfigError::MissingVar("R2_BUCKET"))?,
        access_key_id: access_key_id.ok_or(ConfigError::MissingVar("R2_ACCESS_KEY_ID"))?,
        secret_access_key: secret_access_key
            .ok_or(ConfigError::MissingVar("R2_SECRET_ACCESS_KEY"))?,
    }))
}

fn bounded_u64(
    lookup: impl Fn(&str) -> Option<String>,
    name: &str,
    default: u64,
    range: std::ops::RangeInclusive<u64>,
) -> Result<u64, ConfigError> {
    let Some(raw) = optional_trimmed(lookup, name) else {
        return Ok(default);
    };
    raw.parse::<u64>()
        .ok()
        .filter(|value| range.contains(value))
        .ok_or_else(|| {
            ConfigError::Invalid(format!(
                "{name} must be an integer in [{}, {}]",
                range.start(),
                range.end()
            ))
        })
}

fn bounded_u32(
    lookup: impl Fn(&str) -> Option<String>,
    name: &str,
    default: u32,
    range: std::ops::RangeInclusive<u32>,
) -> Result<u32, ConfigError> {
    let value = bounded_u64(
        lookup,
        name,
        u64::from(default),
        u64::from(*range.start())..=u64::from(*range.end()),
    )?;
    u32::try_from(value).map_err(|_| ConfigError::Invalid(format!("{name} is out of range")))
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
    lookup(name).and_then(|value| {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    })
}

fn is_http_url(value: &str) -> bool {
    value.starts_with("http://") || value.starts_with("https://")
}

#[cfg(test)]
pub(crate) fn test_config() -> AppConfig {
    AppConfig {
        bind_addr: "127.0.0.1:0".to_string(),
        database_path: PathBuf::from(":memory:"),
        jwks_url: "https://id.example.com/.well-known/jwks.json".to_string(),
        jwt_issuer: "https://id.example.com".to_string(),
        jwt_audience: "authenticated".to_string(),
        jwks_cache_ttl: Duration::from_secs(300),
        auth_clock_skew: Duration::from_secs(60),
        rate_limit_window: Duration::from_secs(60),
        sync_rate_limit_per_window: 100,
        media_presign_rate_limit_per_window: 100,
        media_url_ttl: Duration::from_secs(600),
        read_only: false,
        r2: None,
    }
}
