//! Wire types shared by the sync client and the API server

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

use crate::error::{Error, Result};

use super::assessment::ClassificationCode;
use super::certificate::{CertificateSnapshot, BOARDS_KEY, CIRCUITS_KEY, OBSERVATIONS_KEY};

/// Full nested snapshot for one certificate.
///
/// A collection left as `None` is not touched by the server; a present
/// collection is authoritative for that certificate.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub distribution_boards: Option<Vec<BoardPayload>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub circuits: Option<Vec<CircuitPayload>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observations: Option<Vec<ObservationPayload>>,
}

impl SyncPayload {
    /// Build the bulk payload from a local snapshot.
    pub fn from_snapshot(snapshot: &CertificateSnapshot) -> Result<Self> {
        Ok(Self {
            distribution_boards: parse_collection(&snapshot.data, BOARDS_KEY)?,
            circuits: parse_collection(&snapshot.data, CIRCUITS_KEY)?,
            observations: parse_collection(&snapshot.data, OBSERVATIONS_KEY)?,
        })
    }

    pub fn is_empty(&self) -> bool {
        self.distribution_boards.is_none() && self.circuits.is_none() && self.observations.is_none()
    }
}

fn parse_collection<T: serde::de::DeserializeOwned>(
    data: &Map<String, Value>,
    key: &str,
) -> Result<Option<Vec<T>>> {
    let Some(value) = data.get(key) else {
        return Ok(None);
    };
    let Some(entries) = value.as_array() else {
        return Err(Error::InvalidInput(format!("`{key}` must be an array")));
    };

    entries
        .iter()
        .enumerate()
        .map(|(index, entry)| {
            serde_json::from_value(entry.clone()).map_err(|error| {
                Error::InvalidInput(format!("`{key}[{index}]` is malformed: {error}"))
            })
        })
        .collect::<Result<Vec<T>>>()
        .map(Some)
}

/// Distribution board keyed by its human-chosen reference (e.g. "DB1").
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BoardPayload {
    #[serde(deserialize_with = "text_or_number")]
    pub db_reference: String,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CircuitPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// Server-assigned board id, when the client already knows it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub db_id: Option<String>,
    /// Board reference used when the board id is not yet known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub db_reference: Option<String>,
    #[serde(deserialize_with = "text_or_number")]
    pub circuit_number: String,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObservationPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub item_number: Option<i64>,
    pub observation_text: String,
    pub classification_code: ClassificationCode,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncStats {
    pub boards_upserted: u32,
    pub circuits_upserted: u32,
    pub observations_upserted: u32,
}

/// Acknowledgment returned by the bulk sync endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncResponse {
    pub synced: bool,
    pub stats: SyncStats,
    pub request_id: String,
}

fn text_or_number<'de, D>(deserializer: D) -> std::result::Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    match Value::deserialize(deserializer)? {
        Value::String(text) => Ok(text),
        Value::Number(number) => Ok(number.to_string()),
        other => Err(serde::de::Error::custom(format!(
            "expected string or number, got {other}"
        ))),
    }
}
