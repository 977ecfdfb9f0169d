use std::env;
use std::path::{Path, PathBuf};

use certsync_core::config::ClientConfig;
use certsync_core::db::LocalStore;
use certsync_core::media::MediaApiClient;
use certsync_core::sync::{StaticTokenProvider, SyncApiClient, SyncDrain};
use certsync_core::{CertificateId, CertificateSnapshot, SyncQueueItem};
use chrono::Utc;
use serde::Serialize;

use crate::error::CliError;

pub type CliDrain = SyncDrain<SyncApiClient, MediaApiClient, StaticTokenProvider>;

pub fn resolve_db_path(cli_db_path: Option<PathBuf>, configured: Option<PathBuf>) -> PathBuf {
    cli_db_path.or(configured).unwrap_or_else(default_db_path)
}

pub fn default_db_path() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("certsync")
        .join("certsync.db")
}

pub async fn open_store(db_path: &Path) -> Result<LocalStore, CliError> {
    Ok(LocalStore::open_path(db_path).await?)
}

pub fn parse_certificate_id(raw: &str) -> Result<CertificateId, CliError> {
    raw.trim()
        .parse::<CertificateId>()
        .map_err(|_| CliError::InvalidCertificateId(raw.trim().to_string()))
}

/// Bearer token for the API, read through `lookup`.
pub fn access_token(lookup: impl Fn(&str) -> Option<String>) -> Result<String, CliError> {
    lookup("CERTSYNC_ACCESS_TOKEN")
        .map(|token| token.trim().to_string())
        .filter(|token| !token.is_empty())
        .ok_or(CliError::MissingAccessToken)
}

/// Drain wired to the configured API with the environment's access token.
pub fn build_drain(store: &LocalStore, config: &ClientConfig) -> Result<CliDrain, CliError> {
    let base_url = config.require_api_base_url()?;
    let token = access_token(|name| env::var(name).ok())?;
    let transport = SyncApiClient::new(base_url, config.http_timeout)?;
    let media = MediaApiClient::new(base_url, config.http_timeout)?;
    Ok(
        SyncDrain::new(store.clone(), transport, media, StaticTokenProvider::new(token))
            .with_policy(config.retry_policy()),
    )
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CertificateStatusItem {
    pub id: String,
    pub status: &'static str,
    pub last_modified: i64,
    pub last_synced: Option<i64>,
    pub pending_operations: usize,
    pub dead_lettered: usize,
}

pub fn certificate_status_item(
    snapshot: &CertificateSnapshot,
    queue: &[SyncQueueItem],
) -> CertificateStatusItem {
    let items = queue
        .iter()
        .filter(|item| item.operation.certificate_id == snapshot.id);
    let (dead, live): (Vec<_>, Vec<_>) = items.partition(|item| item.dead_lettered);
    CertificateStatusItem {
        id: snapshot.id.to_string(),
        status: if snapshot.is_dirty { "pending" } else { "synced" },
        last_modified: snapshot.last_modified,
        last_synced: snapshot.last_synced,
        pending_operations: live.len(),
        dead_lettered: dead.len(),
    }
}

pub fn format_status_lines(items: &[CertificateStatusItem]) -> Vec<String> {
    let now_ms = Utc::now().timestamp_millis();
    items
        .iter()
        .map(|item| {
            let synced = item
                .last_synced
                .map_or_else(|| "never".to_string(), |at| format_relative_time(at, now_ms));
            let mut line = format!(
                "{:<36}  {:<8}  edited {:<8}  synced {:<8}  {} queued",
                item.id,
                item.status,
                format_relative_time(item.last_modified, now_ms),
                synced,
                item.pending_operations
            );
            if item.dead_lettered > 0 {
                line.push_str(&format!(", {} dead-lettered", item.dead_lettered));
            }
            line
        })
        .collect()
}

pub fn format_queue_lines(items: &[SyncQueueItem]) -> Vec<String> {
    let now_ms = Utc::now().timestamp_millis();
    items
        .iter()
        .map(|item| {
            let operation = &item.operation;
            let target = operation.entity_id().unwrap_or("-");
            let state = if item.dead_lettered {
                "dead".to_string()
            } else {
                match item.next_attempt_at {
                    Some(at) if at > now_ms => {
                        format!("retry in {}s", (at - now_ms).div_euclid(1000).max(1))
                    }
                    _ => "due".to_string(),
                }
            };
            let mut line = format!(
                "#{:<5}  {:<36}  {:<18}  {:<20}  {:<12}  retries {}",
                item.seq,
                operation.certificate_id,
                operation.kind.label(),
                target,
                state,
                item.retries
            );
            if let Some(error) = item.last_error.as_deref() {
                line.push_str(&format!("  ({})", certsync_core::util::compact_text(error)));
            }
            line
        })
        .collect()
}

pub fn format_relative_time(timestamp_ms: i64, now_ms: i64) -> String {
    let diff = now_ms.saturating_sub(timestamp_ms);
    let minute = 60_000;
    let hour = 60 * minute;
    let day = 24 * hour;

    if diff < minute {
        "just now".to_string()
    } else if diff < hour {
        format!("{}m ago", diff / minute)
    } else if diff < day {
        format!("{}h ago", diff / hour)
    } else {
        format!("{}d ago", diff / day)
    }
}
