use std::io;

use certsync_core::config::ConfigError;
use certsync_core::sync::SyncError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CliError {
    #[error(transparent)]
    Core(#[from] certsync_core::Error),
    #[error(transparent)]
    Sync(#[from] SyncError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Serialization(#[from] serde_json::Error),
    #[error("Invalid certificate id: {0}")]
    InvalidCertificateId(String),
    #[error("Certificate not found locally: {0}")]
    CertificateNotFound(String),
    #[error("No queued operation with sequence number {0}")]
    QueueItemNotFound(i64),
    #[error("No access token. Set CERTSYNC_ACCESS_TOKEN to a bearer token for the certsync API.")]
    MissingAccessToken,
}
