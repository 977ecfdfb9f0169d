//! Sync queue producer.
//!
//! Every editor mutation lands here: the snapshot is updated and a semantic
//! operation describing the change is queued in the same local transaction.
//! Nothing in this module touches the network.

use serde_json::{Map, Value};
use uuid::Uuid;

use crate::db::LocalStore;
use crate::error::{Error, Result};
use crate::models::{
    is_collection_key, CertificateData, CertificateId, CertificateSnapshot, ClassificationCode,
    SyncOperation, SyncOperationKind, BOARDS_KEY, CIRCUITS_KEY, OBSERVATIONS_KEY,
};

#[derive(Clone)]
pub struct SyncProducer {
    store: LocalStore,
}

impl SyncProducer {
    pub const fn new(store: LocalStore) -> Self {
        Self { store }
    }

    /// Start a new certificate with its header fields.
    pub async fn create_certificate(&self, header: CertificateData) -> Result<CertificateId> {
        reject_collections(&header)?;
        let id = CertificateId::new();
        let operation = SyncOperation::new(SyncOperationKind::UpdateCertificate, id, header.clone());
        self.store.save_and_queue(&id, header, &operation).await?;
        tracing::info!("Created certificate {id}");
        Ok(id)
    }

    /// Change header fields of an existing certificate.
    pub async fn update_certificate(
        &self,
        id: &CertificateId,
        fields: CertificateData,
    ) -> Result<CertificateSnapshot> {
        reject_collections(&fields)?;
        let (snapshot, _) = self
            .store
            .update_and_queue(id, |data| {
                for (key, value) in &fields {
                    data.insert(key.clone(), value.clone());
                }
                Ok(SyncOperation::new(
                    SyncOperationKind::UpdateCertificate,
                    *id,
                    fields,
                ))
            })
            .await?;
        Ok(snapshot)
    }

    /// Add a distribution board; its `dbReference` must be unique.
    pub async fn add_board(&self, id: &CertificateId, board: Map<String, Value>) -> Result<String> {
        let reference = required_text(&board, "dbReference")?;
        self.store
            .update_and_queue(id, |data| {
                let boards = collection_mut(data, BOARDS_KEY)?;
                if find_board(boards, &reference).is_some() {
                    return Err(Error::InvalidInput(format!(
                        "board `{reference}` already exists"
                    )));
                }
                boards.push(Value::Object(board.clone()));
                Ok(SyncOperation::new(SyncOperationKind::AddBoard, *id, board))
            })
            .await?;
        Ok(reference)
    }

    /// Change fields of the board identified by `db_reference`.
    pub async fn update_board(
        &self,
        id: &CertificateId,
        db_reference: &str,
        fields: Map<String, Value>,
    ) -> Result<CertificateSnapshot> {
        if let Some(renamed) = fields.get("dbReference") {
            if reference_text(renamed).as_deref() != Some(db_reference) {
                return Err(Error::InvalidInput(
                    "dbReference cannot be changed once the board exists".to_string(),
                ));
            }
        }
        let (snapshot, _) = self
            .store
            .update_and_queue(id, |data| {
                let boards = collection_mut(data, BOARDS_KEY)?;
                let index = find_board(boards, db_reference)
                    .ok_or_else(|| Error::NotFound(format!("board {db_reference}")))?;
                let merged = merge_entity(&mut boards[index], fields)?;
                Ok(SyncOperation::new(SyncOperationKind::UpdateBoard, *id, merged))
            })
            .await?;
        Ok(snapshot)
    }

    /// Add a circuit, assigning it a stable id when it has none.
    ///
    /// Without a `dbId` the `dbReference` must name a board of this
    /// certificate.
    pub async fn add_circuit(
        &self,
        id: &CertificateId,
        mut circuit: Map<String, Value>,
    ) -> Result<String> {
        required_text(&circuit, "circuitNumber")?;
        let board_reference = if circuit.contains_key("dbId") {
            None
        } else if circuit.contains_key("dbReference") {
            Some(required_text(&circuit, "dbReference")?)
        } else {
            return Err(Error::InvalidInput(
                "circuit needs a dbId or dbReference".to_string(),
            ));
        };
        let circuit_id = assign_id(&mut circuit);

        self.store
            .update_and_queue(id, |data| {
                if let Some(reference) = &board_reference {
                    let boards = data
                        .get(BOARDS_KEY)
                        .and_then(Value::as_array)
                        .map_or(&[][..], Vec::as_slice);
                    if find_board(boards, reference).is_none() {
                        return Err(Error::InvalidInput(format!(
                            "circuit references unknown board `{reference}`"
                        )));
                    }
                }
                let circuits = collection_mut(data, CIRCUITS_KEY)?;
                if find_by_id(circuits, &circuit_id).is_some() {
                    return Err(Error::InvalidInput(format!(
                        "circuit `{circuit_id}` already exists"
                    )));
                }
                circuits.push(Value::Object(circuit.clone()));
                Ok(SyncOperation::new(SyncOperationKind::AddCircuit, *id, circuit))
            })
            .await?;
        Ok(circuit_id)
    }

    pub async fn update_circuit(
        &self,
        id: &CertificateId,
        circuit_id: &str,
        fields: Map<String, Value>,
    ) -> Result<CertificateSnapshot> {
        self.update_entity(id, CIRCUITS_KEY, circuit_id, fields, SyncOperationKind::UpdateCircuit)
            .await
    }

    pub async fn delete_circuit(
        &self,
        id: &CertificateId,
        circuit_id: &str,
    ) -> Result<CertificateSnapshot> {
        self.delete_entity(id, CIRCUITS_KEY, circuit_id, SyncOperationKind::DeleteCircuit)
            .await
    }

    /// Add an observation, assigning it a stable id when it has none.
    pub async fn add_observation(
        &self,
        id: &CertificateId,
        mut observation: Map<String, Value>,
    ) -> Result<String> {
        required_text(&observation, "observationText")?;
        validate_code(&observation)?;
        let observation_id = assign_id(&mut observation);

        self.store
            .update_and_queue(id, |data| {
                let observations = collection_mut(data, OBSERVATIONS_KEY)?;
                if find_by_id(observations, &observation_id).is_some() {
                    return Err(Error::InvalidInput(format!(
                        "observation `{observation_id}` already exists"
                    )));
                }
                observations.push(Value::Object(observation.clone()));
                Ok(SyncOperation::new(
                    SyncOperationKind::AddObservation,
                    *id,
                    observation,
                ))
            })
            .await?;
        Ok(observation_id)
    }

    pub async fn update_observation(
        &self,
        id: &CertificateId,
        observation_id: &str,
        fields: Map<String, Value>,
    ) -> Result<CertificateSnapshot> {
        validate_code(&fields)?;
        self.update_entity(
            id,
            OBSERVATIONS_KEY,
            observation_id,
            fields,
            SyncOperationKind::UpdateObservation,
        )
        .await
    }

    pub async fn delete_observation(
        &self,
        id: &CertificateId,
        observation_id: &str,
    ) -> Result<CertificateSnapshot> {
        self.delete_entity(
            id,
            OBSERVATIONS_KEY,
            observation_id,
            SyncOperationKind::DeleteObservation,
        )
        .await
    }

    /// Ask the next drain to push the whole snapshot in one request.
    pub async fn request_full_sync(&self, id: &CertificateId) -> Result<i64> {
        if self.store.get_certificate(id).await?.is_none() {
            return Err(Error::NotFound(format!("certificate {id}")));
        }
        self.store.queue_sync(&SyncOperation::full_sync(*id)).await
    }

    async fn update_entity(
        &self,
        id: &CertificateId,
        key: &str,
        entity_id: &str,
        fields: Map<String, Value>,
        kind: SyncOperationKind,
    ) -> Result<CertificateSnapshot> {
        if fields
            .get("id")
            .is_some_and(|value| value.as_str() != Some(entity_id))
        {
            return Err(Error::InvalidInput("entity id cannot be changed".to_string()));
        }
        let (snapshot, _) = self
            .store
            .update_and_queue(id, |data| {
                let entries = collection_mut(data, key)?;
                let index = find_by_id(entries, entity_id)
                    .ok_or_else(|| Error::NotFound(format!("{key} entry {entity_id}")))?;
                // Full entity, so a row missing on the server can be recreated.
                let merged = merge_entity(&mut entries[index], fields)?;
                Ok(SyncOperation::new(kind, *id, merged))
            })
            .await?;
        Ok(snapshot)
    }

    async fn delete_entity(
        &self,
        id: &CertificateId,
        key: &str,
        entity_id: &str,
        kind: SyncOperationKind,
    ) -> Result<CertificateSnapshot> {
        let (snapshot, _) = self
            .store
            .update_and_queue(id, |data| {
                let entries = collection_mut(data, key)?;
                let index = find_by_id(entries, entity_id)
                    .ok_or_else(|| Error::NotFound(format!("{key} entry {entity_id}")))?;
                entries.remove(index);

                let mut payload = Map::new();
                payload.insert("id".to_string(), Value::String(entity_id.to_string()));
                Ok(SyncOperation::new(kind, *id, payload))
            })
            .await?;
        Ok(snapshot)
    }
}

fn reject_collections(fields: &CertificateData) -> Result<()> {
    match fields.keys().find(|key| is_collection_key(key)) {
        Some(key) => Err(Error::InvalidInput(format!(
            "`{key}` is edited through its own operations"
        ))),
        None => Ok(()),
    }
}

fn collection_mut<'a>(data: &'a mut CertificateData, key: &str) -> Result<&'a mut Vec<Value>> {
    data.entry(key.to_string())
        .or_insert_with(|| Value::Array(Vec::new()))
        .as_array_mut()
        .ok_or_else(|| Error::InvalidInput(format!("`{key}` must be an array")))
}

fn find_by_id(entries: &[Value], entity_id: &str) -> Option<usize> {
    entries
        .iter()
        .position(|entry| entry.get("id").and_then(Value::as_str) == Some(entity_id))
}

fn find_board(boards: &[Value], reference: &str) -> Option<usize> {
    boards.iter().position(|board| {
        board
            .get("dbReference")
            .and_then(reference_text)
            .as_deref()
            == Some(reference)
    })
}

fn reference_text(value: &Value) -> Option<String> {
    match value {
        Value::String(text) => Some(text.trim().to_string()),
        Value::Number(number) => Some(number.to_string()),
        _ => None,
    }
}

fn merge_entity(entry: &mut Value, fields: Map<String, Value>) -> Result<Map<String, Value>> {
    let object = entry
        .as_object_mut()
        .ok_or_else(|| Error::InvalidInput("collection entries must be objects".to_string()))?;
    for (key, value) in fields {
        object.insert(key, value);
    }
    Ok(object.clone())
}

fn assign_id(entity: &mut Map<String, Value>) -> String {
    if let Some(existing) = entity
        .get("id")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|id| !id.is_empty())
    {
        return existing.to_string();
    }
    let id = Uuid::now_v7().to_string();
    entity.insert("id".to_string(), Value::String(id.clone()));
    id
}

fn required_text(entity: &Map<String, Value>, field: &str) -> Result<String> {
    entity
        .get(field)
        .and_then(reference_text)
        .filter(|text| !text.is_empty())
        .ok_or_else(|| Error::InvalidInput(format!("`{field}` is required")))
}

fn validate_code(entity: &Map<String, Value>) -> Result<()> {
    match entity.get("classificationCode") {
        None => Ok(()),
        Some(Value::String(code)) => code.parse::<ClassificationCode>().map(|_| ()),
        Some(other) => Err(Error::InvalidInput(format!(
            "classificationCode must be a string, got {other}"
        ))),
    }
}
