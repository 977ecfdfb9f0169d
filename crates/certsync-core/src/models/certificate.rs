//! Certificate snapshot model

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Snapshot data key holding the distribution boards array.
pub const BOARDS_KEY: &str = "distributionBoards";
/// Snapshot data key holding the circuits array.
pub const CIRCUITS_KEY: &str = "circuits";
/// Snapshot data key holding the observations array.
pub const OBSERVATIONS_KEY: &str = "observations";

/// Schema-shaped field bag for one certificate.
pub type CertificateData = Map<String, Value>;

/// A unique identifier for a certificate, using UUID v7 (time-sortable)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CertificateId(Uuid);

impl CertificateId {
    /// Create a new unique certificate ID using UUID v7
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    /// Get the string representation of this ID
    #[must_use]
    pub fn as_str(&self) -> String {
        self.0.to_string()
    }
}

impl Default for CertificateId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for CertificateId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for CertificateId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// Whether a snapshot still holds work the server has not acknowledged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SnapshotStatus {
    Synced,
    PendingSync,
}

/// Local working copy of one certificate
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CertificateSnapshot {
    /// Stable identifier
    pub id: CertificateId,
    /// Editable fields, including the nested entity arrays
    pub data: CertificateData,
    /// Most recent local write (Unix ms)
    pub last_modified: i64,
    /// Last confirmed server acknowledgment (Unix ms)
    pub last_synced: Option<i64>,
    /// Local data not yet confirmed by the server
    pub is_dirty: bool,
}

impl CertificateSnapshot {
    /// Status shown next to the certificate in lists.
    pub const fn status(&self) -> SnapshotStatus {
        if self.is_dirty {
            SnapshotStatus::PendingSync
        } else {
            SnapshotStatus::Synced
        }
    }

    /// Header fields of the certificate, without the nested entity arrays.
    pub fn header_fields(&self) -> CertificateData {
        self.data
            .iter()
            .filter(|(key, _)| !is_collection_key(key))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect()
    }

    /// Entries of a nested collection, or an empty slice when absent.
    pub fn collection(&self, key: &str) -> &[Value] {
        self.data
            .get(key)
            .and_then(Value::as_array)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }
}

/// Shallow-merge `partial` into `data`, replacing whole top-level values.
pub(crate) fn merge_fields(data: &mut CertificateData, partial: CertificateData) {
    for (key, value) in partial {
        data.insert(key, value);
    }
}

pub(crate) fn is_collection_key(key: &str) -> bool {
    matches!(key, BOARDS_KEY | CIRCUITS_KEY | OBSERVATIONS_KEY)
}
