//! Sync operations and their queue wrapper

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

use super::certificate::CertificateId;

/// Semantic change recorded by the editing surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SyncOperationKind {
    AddCircuit,
    UpdateCircuit,
    DeleteCircuit,
    AddObservation,
    UpdateObservation,
    DeleteObservation,
    AddBoard,
    UpdateBoard,
    UpdateCertificate,
    FullSync,
}

impl SyncOperationKind {
    pub const fn label(self) -> &'static str {
        match self {
            Self::AddCircuit => "add-circuit",
            Self::UpdateCircuit => "update-circuit",
            Self::DeleteCircuit => "delete-circuit",
            Self::AddObservation => "add-observation",
            Self::UpdateObservation => "update-observation",
            Self::DeleteObservation => "delete-observation",
            Self::AddBoard => "add-board",
            Self::UpdateBoard => "update-board",
            Self::UpdateCertificate => "update-certificate",
            Self::FullSync => "full-sync",
        }
    }

    /// Whether applying this operation changes the observation set.
    pub const fn touches_observations(self) -> bool {
        matches!(
            self,
            Self::AddObservation | Self::UpdateObservation | Self::DeleteObservation
        )
    }
}

impl fmt::Display for SyncOperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// One queued change for a single certificate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncOperation {
    #[serde(rename = "type")]
    pub kind: SyncOperationKind,
    pub certificate_id: CertificateId,
    #[serde(default)]
    pub payload: Map<String, Value>,
    /// Creation timestamp (Unix ms)
    pub created_at: i64,
}

impl SyncOperation {
    /// Create an operation stamped with the current time.
    #[must_use]
    pub fn new(
        kind: SyncOperationKind,
        certificate_id: CertificateId,
        payload: Map<String, Value>,
    ) -> Self {
        Self {
            kind,
            certificate_id,
            payload,
            created_at: chrono::Utc::now().timestamp_millis(),
        }
    }

    /// Request a bulk push of the whole snapshot.
    #[must_use]
    pub fn full_sync(certificate_id: CertificateId) -> Self {
        Self::new(SyncOperationKind::FullSync, certificate_id, Map::new())
    }

    /// Identity of the nested entity this operation targets, when it has one.
    pub fn entity_id(&self) -> Option<&str> {
        self.payload.get("id").and_then(Value::as_str)
    }
}

/// A queued operation awaiting a confirmed apply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncQueueItem {
    /// FIFO sequence number
    pub seq: i64,
    pub operation: SyncOperation,
    /// Failed drain attempts so far
    pub retries: u32,
    /// Enqueue timestamp (Unix ms)
    pub created_at: i64,
    pub last_error: Option<String>,
    /// Earliest time the drain may retry this item (Unix ms)
    pub next_attempt_at: Option<i64>,
    /// Set once the drain has stopped retrying this item
    pub dead_lettered: bool,
}

impl SyncQueueItem {
    /// Whether the drain should attempt this item at `now`.
    pub fn is_due(&self, now: i64) -> bool {
        !self.dead_lettered && self.next_attempt_at.map_or(true, |at| at <= now)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn operation_serializes_with_kebab_case_tag() {
        let id = CertificateId::new();
        let mut payload = Map::new();
        payload.insert("id".to_string(), json!("circuit-1"));
        let op = SyncOperation::new(SyncOperationKind::DeleteCircuit, id, payload);

        let value = serde_json::to_value(&op).unwrap();
        assert_eq!(value["type"], "delete-circuit");
        assert_eq!(value["certificateId"], id.to_string());
        assert_eq!(op.entity_id(), Some("circuit-1"));

        let parsed: SyncOperation = serde_json::from_value(value).unwrap();
        assert_eq!(parsed, op);
    }

    #[test]
    fn queue_item_due_respects_backoff_and_dead_letter() {
        let mut item = SyncQueueItem {
            seq: 1,
            operation: SyncOperation::full_sync(CertificateId::new()),
            retries: 0,
            created_at: 0,
            last_error: None,
            next_attempt_at: None,
            dead_lettered: false,
        };
        assert!(item.is_due(0));

        item.next_attempt_at = Some(100);
        assert!(!item.is_due(99));
        assert!(item.is_due(100));

        item.dead_lettered = true;
        assert!(!item.is_due(1_000));
    }
}
