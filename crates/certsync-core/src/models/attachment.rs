//! Queued attachment model

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::{Error, Result};

use super::certificate::CertificateId;

/// Reserved prefix marking a reference as provisional.
pub const OFFLINE_KEY_PREFIX: &str = "offline:";

/// Whether a stored reference still points at a not-yet-uploaded blob.
pub fn is_offline_key(key: &str) -> bool {
    key.starts_with(OFFLINE_KEY_PREFIX)
}

/// Generate a fresh provisional reference.
#[must_use]
pub fn new_offline_key() -> String {
    format!("{OFFLINE_KEY_PREFIX}{}", Uuid::now_v7())
}

/// Collect every provisional reference stored anywhere inside `value`.
pub fn collect_offline_keys(value: &Value, keys: &mut BTreeSet<String>) {
    match value {
        Value::String(text) if is_offline_key(text) => {
            keys.insert(text.clone());
        }
        Value::Array(items) => {
            for item in items {
                collect_offline_keys(item, keys);
            }
        }
        Value::Object(map) => {
            for item in map.values() {
                collect_offline_keys(item, keys);
            }
        }
        _ => {}
    }
}

/// Replace every string equal to `from` with `to`, returning the number of
/// replacements made.
pub fn replace_reference(value: &mut Value, from: &str, to: &str) -> usize {
    match value {
        Value::String(text) if text == from => {
            *text = to.to_string();
            1
        }
        Value::Array(items) => items
            .iter_mut()
            .map(|item| replace_reference(item, from, to))
            .sum(),
        Value::Object(map) => map
            .values_mut()
            .map(|item| replace_reference(item, from, to))
            .sum(),
        _ => 0,
    }
}

/// Binary attachment category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttachmentKind {
    Photo,
    Signature,
}

impl AttachmentKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Photo => "photo",
            Self::Signature => "signature",
        }
    }
}

impl fmt::Display for AttachmentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AttachmentKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "photo" => Ok(Self::Photo),
            "signature" => Ok(Self::Signature),
            other => Err(Error::InvalidInput(format!(
                "Unknown attachment kind: {other}"
            ))),
        }
    }
}

/// A blob waiting for connectivity before it can be uploaded.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueuedAttachment {
    /// Provisional reference, always prefixed with [`OFFLINE_KEY_PREFIX`].
    pub temp_key: String,
    pub certificate_id: CertificateId,
    pub kind: AttachmentKind,
    #[serde(skip)]
    pub bytes: Vec<u8>,
    pub content_type: String,
    pub filename: String,
    /// Creation timestamp (Unix ms)
    pub created_at: i64,
}

impl QueuedAttachment {
    /// Create a queued attachment under a fresh provisional reference.
    pub fn new(
        certificate_id: CertificateId,
        kind: AttachmentKind,
        bytes: Vec<u8>,
        content_type: impl Into<String>,
        filename: impl Into<String>,
    ) -> Result<Self> {
        let content_type = content_type.into().trim().to_string();
        let filename = filename.into().trim().to_string();

        if filename.is_empty() {
            return Err(Error::InvalidInput(
                "Attachment filename cannot be empty".to_string(),
            ));
        }
        if content_type.is_empty() {
            return Err(Error::InvalidInput(
                "Attachment content type cannot be empty".to_string(),
            ));
        }

        Ok(Self {
            temp_key: new_offline_key(),
            certificate_id,
            kind,
            bytes,
            content_type,
            filename,
            created_at: chrono::Utc::now().timestamp_millis(),
        })
    }

    /// Blob size in bytes.
    pub fn size(&self) -> u64 {
        self.bytes.len() as u64
    }
}

impl fmt::Debug for QueuedAttachment {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("QueuedAttachment")
            .field("temp_key", &self.temp_key)
            .field("certificate_id", &self.certificate_id)
            .field("kind", &self.kind)
            .field("bytes", &self.bytes.len())
            .field("content_type", &self.content_type)
            .field("filename", &self.filename)
            .field("created_at", &self.created_at)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn offline_keys_carry_reserved_prefix() {
        let key = new_offline_key();
        assert!(is_offline_key(&key));
        assert!(!is_offline_key("engineers/e1/certificates/c1/photo/a.jpg"));
        assert_ne!(new_offline_key(), key);
    }

    #[test]
    fn collect_and_replace_nested_references() {
        let mut value = serde_json::json!({
            "declaration": {"signature": "offline:sig"},
            "observations": [
                {"photos": ["offline:p1", "engineers/e/photo/1.jpg"]},
                {"photos": ["offline:p1"]},
            ],
        });

        let mut keys = BTreeSet::new();
        collect_offline_keys(&value, &mut keys);
        assert_eq!(
            keys.into_iter().collect::<Vec<_>>(),
            vec!["offline:p1".to_string(), "offline:sig".to_string()]
        );

        assert_eq!(replace_reference(&mut value, "offline:p1", "perm/p1.jpg"), 2);
        assert_eq!(value["observations"][1]["photos"][0], "perm/p1.jpg");
        assert_eq!(value["declaration"]["signature"], "offline:sig");
    }

    #[test]
    fn queued_attachment_validation() {
        let id = CertificateId::new();
        assert!(QueuedAttachment::new(id, AttachmentKind::Photo, vec![1], "image/png", "").is_err());
        assert!(QueuedAttachment::new(id, AttachmentKind::Photo, vec![1], " ", "a.png").is_err());

        let queued =
            QueuedAttachment::new(id, AttachmentKind::Signature, vec![1, 2, 3], "image/png", "sig.png")
                .unwrap();
        assert!(is_offline_key(&queued.temp_key));
        assert_eq!(queued.size(), 3);
    }

    #[test]
    fn attachment_kind_round_trips_labels() {
        assert_eq!("photo".parse::<AttachmentKind>().unwrap(), AttachmentKind::Photo);
        assert_eq!(AttachmentKind::Signature.to_string(), "signature");
        assert!("video".parse::<AttachmentKind>().is_err());
    }
}
