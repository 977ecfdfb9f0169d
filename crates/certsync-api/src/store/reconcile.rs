//! Bulk reconciliation of one certificate's nested collections.
//!
//! Runs inside the caller's transaction. The payload is validated up front so
//! a malformed entry aborts before anything is written.

use std::collections::{HashMap, HashSet};

use certsync_core::models::{
    compute_overall_assessment, BoardPayload, CircuitPayload, ClassificationCode,
    ObservationPayload, SyncPayload, SyncStats,
};
use certsync_core::util::now_millis;
use certsync_core::CertificateId;
use libsql::Connection;
use serde_json::{Map, Value};

use super::{claim_certificate, nullable_i64, sort_index};
use crate::error::AppError;

/// Board reference to server board id, scoped to one reconciliation call.
pub(super) type BoardLookup = HashMap<String, String>;

pub(super) async fn reconcile(
    conn: &Connection,
    engineer_id: &str,
    id: &CertificateId,
    payload: &SyncPayload,
) -> Result<SyncStats, AppError> {
    claim_certificate(conn, engineer_id, id, true).await?;
    let mut lookup = load_board_lookup(conn, id).await?;
    validate(payload, &lookup)?;

    let mut stats = SyncStats::default();
    if let Some(boards) = &payload.distribution_boards {
        stats.boards_upserted = apply_boards(conn, id, boards, &mut lookup).await?;
    }
    if let Some(circuits) = &payload.circuits {
        stats.circuits_upserted = apply_circuits(conn, id, circuits, &lookup).await?;
    }
    if let Some(observations) = &payload.observations {
        stats.observations_upserted = apply_observations(conn, id, observations).await?;
    }
    recalculate_assessment(conn, id).await?;

    tracing::debug!(
        certificate = %id,
        boards = stats.boards_upserted,
        circuits = stats.circuits_upserted,
        observations = stats.observations_upserted,
        "Reconciled certificate"
    );
    Ok(stats)
}

pub(super) async fn load_board_lookup(
    conn: &Connection,
    id: &CertificateId,
) -> Result<BoardLookup, AppError> {
    let mut rows = conn
        .query(
            "SELECT db_reference, id FROM distribution_boards WHERE certificate_id = ?",
            [id.as_str()],
        )
        .await?;
    let mut lookup = BoardLookup::new();
    while let Some(row) = rows.next().await? {
        lookup.insert(row.get::<String>(0)?, row.get::<String>(1)?);
    }
    Ok(lookup)
}

fn validate(payload: &SyncPayload, existing: &BoardLookup) -> Result<(), AppError> {
    let board_refs: HashSet<&str> = match &payload.distribution_boards {
        Some(boards) => {
            let mut refs = HashSet::new();
            for (index, board) in boards.iter().enumerate() {
                let reference = board.db_reference.trim();
                if reference.is_empty() {
                    return Err(AppError::bad_request(format!(
                        "distributionBoards[{index}].dbReference is required"
                    )));
                }
                if !refs.insert(reference) {
                    return Err(AppError::bad_request(format!(
                        "distributionBoards[{index}].dbReference `{reference}` is duplicated"
                    )));
                }
            }
            refs
        }
        None => existing.keys().map(String::as_str).collect(),
    };
    let board_ids: HashSet<&str> = existing
        .iter()
        .filter(|(reference, _)| board_refs.contains(reference.as_str()))
        .map(|(_, id)| id.as_str())
        .collect();

    if let Some(circuits) = &payload.circuits {
        let mut seen = HashSet::new();
        for (index, circuit) in circuits.iter().enumerate() {
            if circuit.circuit_number.trim().is_empty() {
                return Err(AppError::bad_request(format!(
                    "circuits[{index}].circuitNumber is required"
                )));
            }
            let by_id = circuit
                .db_id
                .as_deref()
                .is_some_and(|db_id| board_ids.contains(db_id));
            let by_reference = circuit
                .db_reference
                .as_deref()
                .is_some_and(|reference| board_refs.contains(reference.trim()));
            if !by_id && !by_reference {
                return Err(AppError::bad_request(format!(
                    "circuits[{index}] does not reference a known distribution board"
                )));
            }
            check_unique(&mut seen, circuit.id.as_deref(), "circuits", index)?;
        }
    }

    if let Some(observations) = &payload.observations {
        let mut seen = HashSet::new();
        for (index, observation) in observations.iter().enumerate() {
            if observation.observation_text.trim().is_empty() {
                return Err(AppError::bad_request(format!(
                    "observations[{index}].observationText is required"
                )));
            }
            check_unique(&mut seen, observation.id.as_deref(), "observations", index)?;
        }
    }
    Ok(())
}

fn check_unique<'a>(
    seen: &mut HashSet<&'a str>,
    id: Option<&'a str>,
    collection: &str,
    index: usize,
) -> Result<(), AppError> {
    match id.map(str::trim).filter(|id| !id.is_empty()) {
        Some(id) if !seen.insert(id) => Err(AppError::bad_request(format!(
            "{collection}[{index}].id `{id}` is duplicated"
        ))),
        _ => Ok(()),
    }
}

async fn apply_boards(
    conn: &Connection,
    id: &CertificateId,
    boards: &[BoardPayload],
    lookup: &mut BoardLookup,
) -> Result<u32, AppError> {
    let now = now_millis();
    let mut kept = HashSet::new();
    for (index, board) in boards.iter().enumerate() {
        let reference = board.db_reference.trim().to_string();
        let board_id = upsert_board(conn, id, &reference, &board.fields, sort_index(index), now).await?;
        lookup.insert(reference.clone(), board_id);
        kept.insert(reference);
    }

    let stale: Vec<String> = lookup
        .keys()
        .filter(|reference| !kept.contains(*reference))
        .cloned()
        .collect();
    for reference in stale {
        conn.execute(
            "DELETE FROM distribution_boards WHERE certificate_id = ? AND db_reference = ?",
            libsql::params![id.as_str(), reference.as_str()],
        )
        .await?;
        lookup.remove(&reference);
    }
    Ok(count(boards.len()))
}

/// Insert or update one board by reference; returns the server board id.
pub(super) async fn upsert_board(
    conn: &Connection,
    id: &CertificateId,
    reference: &str,
    fields: &Map<String, Value>,
    sort_order: i64,
    now: i64,
) -> Result<String, AppError> {
    let fields = stored_fields(fields);
    conn.execute(
        "INSERT INTO distribution_boards
            (id, certificate_id, db_reference, fields, sort_order, updated_at)
         VALUES (?, ?, ?, ?, ?, ?)
         ON CONFLICT(certificate_id, db_reference) DO UPDATE SET
            fields = excluded.fields,
            sort_order = excluded.sort_order,
            updated_at = excluded.updated_at",
        libsql::params![
            uuid::Uuid::now_v7().to_string(),
            id.as_str(),
            reference,
            serde_json::to_string(&fields)?,
            sort_order,
            now
        ],
    )
    .await?;

    let mut rows = conn
        .query(
            "SELECT id FROM distribution_boards WHERE certificate_id = ? AND db_reference = ?",
            libsql::params![id.as_str(), reference],
        )
        .await?;
    match rows.next().await? {
        Some(row) => Ok(row.get::<String>(0)?),
        None => Err(AppError::internal("board row vanished after upsert")),
    }
}

async fn apply_circuits(
    conn: &Connection,
    id: &CertificateId,
    circuits: &[CircuitPayload],
    lookup: &BoardLookup,
) -> Result<u32, AppError> {
    let now = now_millis();
    let mut kept = HashSet::new();
    for (index, circuit) in circuits.iter().enumerate() {
        let db_id = resolve_board(lookup, circuit).ok_or_else(|| {
            AppError::bad_request(format!(
                "circuits[{index}] does not reference a known distribution board"
            ))
        })?;
        let circuit_id = entity_id(conn, "circuits", id, circuit.id.as_deref()).await?;
        upsert_circuit(conn, id, &circuit_id, &db_id, circuit, sort_index(index), now).await?;
        kept.insert(circuit_id);
    }
    prune(conn, "circuits", id, &kept).await?;
    Ok(count(circuits.len()))
}

/// Board id for a circuit: a surviving `dbId` wins, then the reference.
pub(super) fn resolve_board(lookup: &BoardLookup, circuit: &CircuitPayload) -> Option<String> {
    if let Some(db_id) = circuit.db_id.as_deref() {
        if lookup.values().any(|known| known == db_id) {
            return Some(db_id.to_string());
        }
    }
    circuit
        .db_reference
        .as_deref()
        .and_then(|reference| lookup.get(reference.trim()))
        .cloned()
}

pub(super) async fn upsert_circuit(
    conn: &Connection,
    id: &CertificateId,
    circuit_id: &str,
    db_id: &str,
    circuit: &CircuitPayload,
    sort_order: i64,
    now: i64,
) -> Result<(), AppError> {
    let fields = stored_fields(&circuit.fields);
    conn.execute(
        "INSERT INTO circuits
            (id, certificate_id, db_id, circuit_number, fields, sort_order, updated_at)
         VALUES (?, ?, ?, ?, ?, ?, ?)
         ON CONFLICT(id) DO UPDATE SET
            db_id = excluded.db_id,
            circuit_number = excluded.circuit_number,
            fields = excluded.fields,
            sort_order = excluded.sort_order,
            updated_at = excluded.updated_at",
        libsql::params![
            circuit_id,
            id.as_str(),
            db_id,
            circuit.circuit_number.trim(),
            serde_json::to_string(&fields)?,
            sort_order,
            now
        ],
    )
    .await?;
    Ok(())
}

async fn apply_observations(
    conn: &Connection,
    id: &CertificateId,
    observations: &[ObservationPayload],
) -> Result<u32, AppError> {
    let now = now_millis();
    let mut kept = HashSet::new();
    for (index, observation) in observations.iter().enumerate() {
        let observation_id = entity_id(conn, "observations", id, observation.id.as_deref()).await?;
        upsert_observation(conn, id, &observation_id, observation, sort_index(index), now).await?;
        kept.insert(observation_id);
    }
    prune(conn, "observations", id, &kept).await?;
    Ok(count(observations.len()))
}

pub(super) async fn upsert_observation(
    conn: &Connection,
    id: &CertificateId,
    observation_id: &str,
    observation: &ObservationPayload,
    sort_order: i64,
    now: i64,
) -> Result<(), AppError> {
    let fields = stored_fields(&observation.fields);
    conn.execute(
        "INSERT INTO observations
            (id, certificate_id, item_number, observation_text, classification_code,
             fields, sort_order, updated_at)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?)
         ON CONFLICT(id) DO UPDATE SET
            item_number = excluded.item_number,
            observation_text = excluded.observation_text,
            classification_code = excluded.classification_code,
            fields = excluded.fields,
            sort_order = excluded.sort_order,
            updated_at = excluded.updated_at",
        libsql::params![
            observation_id,
            id.as_str(),
            nullable_i64(observation.item_number),
            observation.observation_text.trim(),
            observation.classification_code.as_str(),
            serde_json::to_string(&fields)?,
            sort_order,
            now
        ],
    )
    .await?;
    Ok(())
}

/// Row id to store an entity under.
///
/// A client id already used by another certificate is never taken over; the
/// entity gets a fresh id instead.
pub(super) async fn entity_id(
    conn: &Connection,
    table: &str,
    id: &CertificateId,
    requested: Option<&str>,
) -> Result<String, AppError> {
    let Some(requested) = requested
        .map(str::trim)
        .filter(|text| !text.is_empty())
        .map(str::to_string)
    else {
        return Ok(uuid::Uuid::now_v7().to_string());
    };

    match entity_id_owner(conn, table, &requested).await? {
        Some(owner) if owner != id.as_str() => {
            tracing::warn!(table, "Client entity id belongs to another certificate, reassigning");
            Ok(uuid::Uuid::now_v7().to_string())
        }
        _ => Ok(requested),
    }
}

/// Certificate currently holding the row `entity_id` in `table`.
pub(super) async fn entity_id_owner(
    conn: &Connection,
    table: &str,
    entity_id: &str,
) -> Result<Option<String>, AppError> {
    let mut rows = conn
        .query(
            &format!("SELECT certificate_id FROM {table} WHERE id = ?"),
            [entity_id],
        )
        .await?;
    match rows.next().await? {
        Some(row) => Ok(Some(row.get::<String>(0)?)),
        None => Ok(None),
    }
}

async fn prune(
    conn: &Connection,
    table: &str,
    id: &CertificateId,
    kept: &HashSet<String>,
) -> Result<(), AppError> {
    let mut rows = conn
        .query(
            &format!("SELECT id FROM {table} WHERE certificate_id = ?"),
            [id.as_str()],
        )
        .await?;
    let mut stale = Vec::new();
    while let Some(row) = rows.next().await? {
        let row_id = row.get::<String>(0)?;
        if !kept.contains(&row_id) {
            stale.push(row_id);
        }
    }
    for row_id in stale {
        conn.execute(
            &format!("DELETE FROM {table} WHERE id = ?"),
            [row_id.as_str()],
        )
        .await?;
    }
    Ok(())
}

/// Recompute the overall assessment from the committed observations.
pub(super) async fn recalculate_assessment(
    conn: &Connection,
    id: &CertificateId,
) -> Result<(), AppError> {
    let mut rows = conn
        .query(
            "SELECT classification_code FROM observations WHERE certificate_id = ?",
            [id.as_str()],
        )
        .await?;
    let mut codes = Vec::new();
    while let Some(row) = rows.next().await? {
        let raw = row.get::<String>(0)?;
        let code = raw.parse::<ClassificationCode>().map_err(|error| {
            AppError::internal(format!("Stored classification code is invalid: {error}"))
        })?;
        codes.push(code);
    }

    let assessment = compute_overall_assessment(codes);
    conn.execute(
        "UPDATE certificates SET overall_assessment = ?, updated_at = ? WHERE id = ?",
        libsql::params![assessment.as_str(), now_millis(), id.as_str()],
    )
    .await?;
    Ok(())
}

/// Domain fields persisted as JSON; columns and ordering keys are dropped.
fn stored_fields(fields: &Map<String, Value>) -> Map<String, Value> {
    let mut stored = fields.clone();
    for key in ["id", "dbId", "dbReference", "sortOrder", "certificateId"] {
        stored.remove(key);
    }
    stored
}

fn count(len: usize) -> u32 {
    u32::try_from(len).unwrap_or(u32::MAX)
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use serde_json::json;

    use super::super::ServerStore;
    use super::*;

    fn payload(value: Value) -> SyncPayload {
        serde_json::from_value(value).unwrap()
    }

    async fn store_with_engineer() -> (ServerStore, String) {
        let store = ServerStore::open_in_memory().await.unwrap();
        let engineer = store.resolve_engineer("alice").await.unwrap();
        (store, engineer)
    }

    fn scenario_payload() -> SyncPayload {
        payload(json!({
            "distributionBoards": [
                {"dbReference": "DB1", "dbLocation": "Kitchen"},
                {"dbReference": "DB2", "dbLocation": "Garage"},
            ],
            "circuits": [
                {"id": "c-1", "dbReference": "DB1", "circuitNumber": 1, "description": "Lights"},
                {"id": "c-2", "dbReference": "DB2", "circuitNumber": "2"},
            ],
            "observations": [
                {"id": "o-1", "itemNumber": 1, "observationText": "Loose cover", "classificationCode": "C3"},
            ],
        }))
    }

    #[tokio::test]
    async fn replaying_the_same_payload_is_idempotent() {
        let (store, engineer) = store_with_engineer().await;
        let id = CertificateId::new();
        let payload = scenario_payload();

        let first = store.reconcile(&engineer, &id, &payload).await.unwrap();
        let once = store.get_certificate(&engineer, &id).await.unwrap();
        let second = store.reconcile(&engineer, &id, &payload).await.unwrap();
        let twice = store.get_certificate(&engineer, &id).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(first.boards_upserted, 2);
        assert_eq!(first.circuits_upserted, 2);
        assert_eq!(first.observations_upserted, 1);
        assert_eq!(once, twice);
        assert_eq!(twice["circuits"].as_array().unwrap().len(), 2);
        assert_eq!(twice["overallAssessment"], "SATISFACTORY");
    }

    #[tokio::test]
    async fn circuits_resolve_boards_through_the_reference_lookup() {
        let (store, engineer) = store_with_engineer().await;
        let id = CertificateId::new();
        store
            .reconcile(&engineer, &id, &scenario_payload())
            .await
            .unwrap();

        let record = store.get_certificate(&engineer, &id).await.unwrap();
        let boards = record["distributionBoards"].as_array().unwrap();
        let circuits = record["circuits"].as_array().unwrap();
        assert_eq!(boards[0]["dbReference"], "DB1");
        assert_eq!(circuits[0]["dbId"], boards[0]["id"]);
        assert_eq!(circuits[0]["dbReference"], "DB1");
        assert_eq!(circuits[0]["circuitNumber"], "1");
        assert_eq!(circuits[0]["description"], "Lights");
        assert_eq!(circuits[1]["dbId"], boards[1]["id"]);
        assert!(circuits[0].get("sortOrder").is_none());
    }

    #[tokio::test]
    async fn later_payloads_follow_board_ids_and_remove_missing_rows() {
        let (store, engineer) = store_with_engineer().await;
        let id = CertificateId::new();
        store
            .reconcile(&engineer, &id, &scenario_payload())
            .await
            .unwrap();
        let record = store.get_certificate(&engineer, &id).await.unwrap();
        let db1 = record["distributionBoards"][0]["id"].clone();

        let next = payload(json!({
            "circuits": [
                {"id": "c-2", "dbId": db1, "circuitNumber": "2"},
                {"dbReference": "DB2", "circuitNumber": "3"},
            ],
        }));
        let stats = store.reconcile(&engineer, &id, &next).await.unwrap();
        assert_eq!(stats.boards_upserted, 0);
        assert_eq!(stats.circuits_upserted, 2);

        let record = store.get_certificate(&engineer, &id).await.unwrap();
        let circuits = record["circuits"].as_array().unwrap();
        assert_eq!(circuits.len(), 2);
        assert_eq!(circuits[0]["id"], "c-2");
        assert_eq!(circuits[0]["dbId"], db1);
        assert_ne!(circuits[1]["id"], "c-1");
        assert_eq!(record["observations"].as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn unsatisfactory_codes_flip_the_assessment_both_ways() {
        let (store, engineer) = store_with_engineer().await;
        let id = CertificateId::new();
        let with_c2 = payload(json!({
            "observations": [
                {"observationText": "Exposed live parts", "classificationCode": "C2"},
            ],
        }));
        store.reconcile(&engineer, &id, &with_c2).await.unwrap();
        let record = store.get_certificate(&engineer, &id).await.unwrap();
        assert_eq!(record["overallAssessment"], "UNSATISFACTORY");

        store
            .reconcile(&engineer, &id, &payload(json!({"observations": []})))
            .await
            .unwrap();
        let record = store.get_certificate(&engineer, &id).await.unwrap();
        assert_eq!(record["overallAssessment"], "SATISFACTORY");
    }

    #[tokio::test]
    async fn invalid_payload_rolls_back_everything() {
        let (store, engineer) = store_with_engineer().await;
        let id = CertificateId::new();
        store
            .reconcile(&engineer, &id, &scenario_payload())
            .await
            .unwrap();

        let broken = payload(json!({
            "distributionBoards": [{"dbReference": "DB9"}],
            "circuits": [{"dbReference": "DB1", "circuitNumber": "1"}],
        }));
        let result = store.reconcile(&engineer, &id, &broken).await;
        assert!(matches!(result, Err(AppError::BadRequest(_))));

        let record = store.get_certificate(&engineer, &id).await.unwrap();
        assert_eq!(record["distributionBoards"].as_array().unwrap().len(), 2);
        assert_eq!(record["circuits"].as_array().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn entity_ids_owned_by_another_certificate_are_not_taken_over() {
        let (store, engineer) = store_with_engineer().await;
        let first = CertificateId::new();
        let second = CertificateId::new();
        store
            .reconcile(&engineer, &first, &scenario_payload())
            .await
            .unwrap();
        store
            .reconcile(&engineer, &second, &scenario_payload())
            .await
            .unwrap();

        let first_record = store.get_certificate(&engineer, &first).await.unwrap();
        let second_record = store.get_certificate(&engineer, &second).await.unwrap();
        assert_eq!(first_record["circuits"][0]["id"], "c-1");
        assert_ne!(second_record["circuits"][0]["id"], "c-1");
        assert_eq!(second_record["circuits"].as_array().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn foreign_certificate_is_not_found() {
        let (store, engineer) = store_with_engineer().await;
        let intruder = store.resolve_engineer("mallory").await.unwrap();
        let id = CertificateId::new();
        store
            .reconcile(&engineer, &id, &scenario_payload())
            .await
            .unwrap();

        let result = store.reconcile(&intruder, &id, &scenario_payload()).await;
        assert!(matches!(result, Err(AppError::NotFound(_))));
    }
}
