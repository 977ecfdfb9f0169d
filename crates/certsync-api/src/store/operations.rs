//! Apply one queued client operation with upsert semantics.

use certsync_core::models::{
    CircuitPayload, ObservationPayload, SyncOperationKind, SyncPayload,
};
use certsync_core::util::now_millis;
use certsync_core::{CertificateId, SyncOperation};
use libsql::Connection;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};

use super::reconcile::{
    entity_id_owner, load_board_lookup, recalculate_assessment, resolve_board, upsert_board,
    upsert_circuit, upsert_observation,
};
use super::{
    circuit_json, claim_certificate, header_fields, observation_json, parse_fields,
    CIRCUIT_SELECT, OBSERVATION_SELECT,
};
use crate::error::AppError;

#[derive(Clone, Copy)]
enum Entity {
    Circuit,
    Observation,
}

impl Entity {
    const fn table(self) -> &'static str {
        match self {
            Self::Circuit => "circuits",
            Self::Observation => "observations",
        }
    }
}

pub(super) async fn apply(
    conn: &Connection,
    engineer_id: &str,
    operation: &SyncOperation,
) -> Result<(), AppError> {
    let id = &operation.certificate_id;
    if operation.kind == SyncOperationKind::FullSync {
        let payload: SyncPayload = parse_payload(&operation.payload, operation.kind)?;
        super::reconcile::reconcile(conn, engineer_id, id, &payload).await?;
        return Ok(());
    }

    claim_certificate(conn, engineer_id, id, true).await?;
    match operation.kind {
        SyncOperationKind::UpdateCertificate => merge_header(conn, id, &operation.payload).await?,
        SyncOperationKind::AddBoard | SyncOperationKind::UpdateBoard => {
            apply_board(conn, id, &operation.payload).await?;
        }
        SyncOperationKind::AddCircuit | SyncOperationKind::UpdateCircuit => {
            apply_entity(conn, id, Entity::Circuit, operation).await?;
        }
        SyncOperationKind::AddObservation | SyncOperationKind::UpdateObservation => {
            apply_entity(conn, id, Entity::Observation, operation).await?;
        }
        SyncOperationKind::DeleteCircuit => delete_entity(conn, id, Entity::Circuit, operation).await?,
        SyncOperationKind::DeleteObservation => {
            delete_entity(conn, id, Entity::Observation, operation).await?;
        }
        SyncOperationKind::FullSync => {}
    }

    if operation.kind.touches_observations() {
        recalculate_assessment(conn, id).await?;
    }
    tracing::debug!(certificate = %id, operation = %operation.kind, "Applied operation");
    Ok(())
}

async fn merge_header(
    conn: &Connection,
    id: &CertificateId,
    payload: &Map<String, Value>,
) -> Result<(), AppError> {
    let mut rows = conn
        .query("SELECT fields FROM certificates WHERE id = ?", [id.as_str()])
        .await?;
    let mut fields = match rows.next().await? {
        Some(row) => parse_fields(&row.get::<String>(0)?)?,
        None => return Err(AppError::not_found(format!("certificate {id}"))),
    };
    fields.extend(header_fields(payload.clone()));

    conn.execute(
        "UPDATE certificates SET fields = ?, updated_at = ? WHERE id = ?",
        libsql::params![serde_json::to_string(&fields)?, now_millis(), id.as_str()],
    )
    .await?;
    Ok(())
}

async fn apply_board(
    conn: &Connection,
    id: &CertificateId,
    payload: &Map<String, Value>,
) -> Result<(), AppError> {
    let reference = match payload.get("dbReference") {
        Some(Value::String(text)) => text.trim().to_string(),
        Some(Value::Number(number)) => number.to_string(),
        _ => String::new(),
    };
    if reference.is_empty() {
        return Err(AppError::bad_request("board operation requires dbReference"));
    }

    let mut rows = conn
        .query(
            "SELECT fields, sort_order FROM distribution_boards
             WHERE certificate_id = ? AND db_reference = ?",
            libsql::params![id.as_str(), reference.as_str()],
        )
        .await?;
    let (mut fields, sort_order) = match rows.next().await? {
        Some(row) => (parse_fields(&row.get::<String>(0)?)?, row.get::<i64>(1)?),
        None => (Map::new(), next_sort_order(conn, "distribution_boards", id).await?),
    };
    fields.extend(payload.clone());
    fields.remove("dbReference");

    upsert_board(conn, id, &reference, &fields, sort_order, now_millis()).await?;
    Ok(())
}

async fn apply_entity(
    conn: &Connection,
    id: &CertificateId,
    entity: Entity,
    operation: &SyncOperation,
) -> Result<(), AppError> {
    let entity_id = required_entity_id(operation)?;
    if entity_id_owner(conn, entity.table(), entity_id)
        .await?
        .is_some_and(|owner| owner != id.as_str())
    {
        return Err(AppError::not_found(format!("{} {entity_id}", entity.table())));
    }

    let existing = load_entity(conn, id, entity, entity_id).await?;
    let found = existing.is_some();
    let (mut merged, sort_order) = match existing {
        Some((object, sort_order)) => (object, sort_order),
        None => (Map::new(), next_sort_order(conn, entity.table(), id).await?),
    };
    merged.extend(operation.payload.clone());
    merged.insert("id".to_string(), Value::String(entity_id.to_string()));

    let incomplete = |error: AppError| {
        if !found && !is_add(operation.kind) {
            AppError::not_found(format!("{} {entity_id}", entity.table()))
        } else {
            error
        }
    };
    let now = now_millis();
    match entity {
        Entity::Circuit => {
            let circuit: CircuitPayload =
                parse_payload(&merged, operation.kind).map_err(incomplete)?;
            // An explicit reference without a dbId moves the circuit to that board.
            let circuit = if operation.payload.contains_key("dbReference")
                && !operation.payload.contains_key("dbId")
            {
                CircuitPayload { db_id: None, ..circuit }
            } else {
                circuit
            };
            let lookup = load_board_lookup(conn, id).await?;
            let db_id = resolve_board(&lookup, &circuit).ok_or_else(|| {
                AppError::bad_request("circuit does not reference a known distribution board")
            })?;
            upsert_circuit(conn, id, entity_id, &db_id, &circuit, sort_order, now).await
        }
        Entity::Observation => {
            let observation: ObservationPayload =
                parse_payload(&merged, operation.kind).map_err(incomplete)?;
            if observation.observation_text.trim().is_empty() {
                return Err(AppError::bad_request("observationText is required"));
            }
            upsert_observation(conn, id, entity_id, &observation, sort_order, now).await
        }
    }
}

async fn delete_entity(
    conn: &Connection,
    id: &CertificateId,
    entity: Entity,
    operation: &SyncOperation,
) -> Result<(), AppError> {
    let entity_id = required_entity_id(operation)?;
    let removed = conn
        .execute(
            &format!("DELETE FROM {} WHERE id = ? AND certificate_id = ?", entity.table()),
            libsql::params![entity_id, id.as_str()],
        )
        .await?;
    if removed == 0 {
        tracing::debug!(table = entity.table(), "Delete of missing row ignored");
    }
    Ok(())
}

async fn load_entity(
    conn: &Connection,
    id: &CertificateId,
    entity: Entity,
    entity_id: &str,
) -> Result<Option<(Map<String, Value>, i64)>, AppError> {
    let (sql, to_json): (String, fn(&libsql::Row) -> Result<Value, AppError>) = match entity {
        Entity::Circuit => (
            format!("{CIRCUIT_SELECT} WHERE c.id = ? AND c.certificate_id = ?"),
            circuit_json,
        ),
        Entity::Observation => (
            format!("{OBSERVATION_SELECT} WHERE id = ? AND certificate_id = ?"),
            observation_json,
        ),
    };
    let mut rows = conn
        .query(&sql, libsql::params![entity_id, id.as_str()])
        .await?;
    let Some(row) = rows.next().await? else {
        return Ok(None);
    };
    let Value::Object(object) = to_json(&row)? else {
        return Ok(None);
    };

    let mut rows = conn
        .query(
            &format!("SELECT sort_order FROM {} WHERE id = ?", entity.table()),
            [entity_id],
        )
        .await?;
    let sort_order = match rows.next().await? {
        Some(row) => row.get::<i64>(0)?,
        None => 0,
    };
    Ok(Some((object, sort_order)))
}

async fn next_sort_order(
    conn: &Connection,
    table: &str,
    id: &CertificateId,
) -> Result<i64, AppError> {
    let mut rows = conn
        .query(
            &format!("SELECT COALESCE(MAX(sort_order) + 1, 0) FROM {table} WHERE certificate_id = ?"),
            [id.as_str()],
        )
        .await?;
    match rows.next().await? {
        Some(row) => Ok(row.get::<i64>(0)?),
        None => Ok(0),
    }
}

fn required_entity_id(operation: &SyncOperation) -> Result<&str, AppError> {
    operation
        .entity_id()
        .map(str::trim)
        .filter(|id| !id.is_empty())
        .ok_or_else(|| AppError::bad_request(format!("{} requires an id", operation.kind)))
}

const fn is_add(kind: SyncOperationKind) -> bool {
    matches!(
        kind,
        SyncOperationKind::AddCircuit | SyncOperationKind::AddObservation | SyncOperationKind::AddBoard
    )
}

fn parse_payload<T: DeserializeOwned>(
    payload: &Map<String, Value>,
    kind: SyncOperationKind,
) -> Result<T, AppError> {
    serde_json::from_value(Value::Object(payload.clone()))
        .map_err(|error| AppError::bad_request(format!("Invalid {kind} payload: {error}")))
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use serde_json::json;

    use super::super::ServerStore;
    use super::*;

    fn op(kind: SyncOperationKind, id: CertificateId, payload: Value) -> SyncOperation {
        SyncOperation::new(kind, id, payload.as_object().cloned().unwrap_or_default())
    }

    async fn seeded() -> (ServerStore, String, CertificateId) {
        let store = ServerStore::open_in_memory().await.unwrap();
        let engineer = store.resolve_engineer("alice").await.unwrap();
        let id = CertificateId::new();
        store
            .apply_operation(
                &engineer,
                &id,
                &op(SyncOperationKind::AddBoard, id, json!({"dbReference": "DB1"})),
            )
            .await
            .unwrap();
        (store, engineer, id)
    }

    #[tokio::test]
    async fn add_update_delete_circuit_in_order() {
        let (store, engineer, id) = seeded().await;
        let ops = [
            op(
                SyncOperationKind::AddCircuit,
                id,
                json!({"id": "c-1", "dbReference": "DB1", "circuitNumber": "1", "rating": 32}),
            ),
            op(SyncOperationKind::UpdateCircuit, id, json!({"id": "c-1", "rating": 40})),
        ];
        for operation in &ops {
            store.apply_operation(&engineer, &id, operation).await.unwrap();
        }

        let record = store.get_certificate(&engineer, &id).await.unwrap();
        assert_eq!(record["circuits"][0]["rating"], 40);
        assert_eq!(record["circuits"][0]["circuitNumber"], "1");
        assert_eq!(record["circuits"][0]["dbReference"], "DB1");

        let delete = op(SyncOperationKind::DeleteCircuit, id, json!({"id": "c-1"}));
        store.apply_operation(&engineer, &id, &delete).await.unwrap();
        store.apply_operation(&engineer, &id, &delete).await.unwrap();
        let record = store.get_certificate(&engineer, &id).await.unwrap();
        assert_eq!(record["circuits"], json!([]));
    }

    #[tokio::test]
    async fn partial_update_of_missing_circuit_is_not_found() {
        let (store, engineer, id) = seeded().await;
        let update = op(SyncOperationKind::UpdateCircuit, id, json!({"id": "ghost", "rating": 6}));
        assert!(matches!(
            store.apply_operation(&engineer, &id, &update).await,
            Err(AppError::NotFound(_))
        ));

        let complete = op(
            SyncOperationKind::UpdateCircuit,
            id,
            json!({"id": "ghost", "dbReference": "DB1", "circuitNumber": "7"}),
        );
        store.apply_operation(&engineer, &id, &complete).await.unwrap();
    }

    #[tokio::test]
    async fn observation_operations_recompute_assessment() {
        let (store, engineer, id) = seeded().await;
        let add = op(
            SyncOperationKind::AddObservation,
            id,
            json!({"id": "o-1", "observationText": "No RCD", "classificationCode": "C2"}),
        );
        store.apply_operation(&engineer, &id, &add).await.unwrap();
        let record = store.get_certificate(&engineer, &id).await.unwrap();
        assert_eq!(record["overallAssessment"], "UNSATISFACTORY");

        let downgrade = op(
            SyncOperationKind::UpdateObservation,
            id,
            json!({"id": "o-1", "classificationCode": "C3"}),
        );
        store.apply_operation(&engineer, &id, &downgrade).await.unwrap();
        let record = store.get_certificate(&engineer, &id).await.unwrap();
        assert_eq!(record["overallAssessment"], "SATISFACTORY");
        assert_eq!(record["observations"][0]["observationText"], "No RCD");
    }

    #[tokio::test]
    async fn header_and_board_updates_merge_fields() {
        let (store, engineer, id) = seeded().await;
        for operation in [
            op(SyncOperationKind::UpdateCertificate, id, json!({"clientName": "Acme"})),
            op(SyncOperationKind::UpdateCertificate, id, json!({"siteAddress": "1 High St"})),
            op(SyncOperationKind::UpdateBoard, id, json!({"dbReference": "DB1", "zdb": "0.3"})),
            op(SyncOperationKind::AddBoard, id, json!({"dbReference": "DB2"})),
        ] {
            store.apply_operation(&engineer, &id, &operation).await.unwrap();
        }

        let record = store.get_certificate(&engineer, &id).await.unwrap();
        assert_eq!(record["clientName"], "Acme");
        assert_eq!(record["siteAddress"], "1 High St");
        assert_eq!(record["distributionBoards"][0]["zdb"], "0.3");
        assert_eq!(record["distributionBoards"][1]["dbReference"], "DB2");
    }

    #[tokio::test]
    async fn full_sync_operation_reconciles_payload() {
        let (store, engineer, id) = seeded().await;
        let full = op(
            SyncOperationKind::FullSync,
            id,
            json!({"circuits": [{"id": "c-9", "dbReference": "DB1", "circuitNumber": 9}]}),
        );
        store.apply_operation(&engineer, &id, &full).await.unwrap();
        let record = store.get_certificate(&engineer, &id).await.unwrap();
        assert_eq!(record["circuits"][0]["id"], "c-9");
    }

    #[tokio::test]
    async fn entity_of_another_certificate_cannot_be_updated() {
        let (store, engineer, id) = seeded().await;
        let add = op(
            SyncOperationKind::AddCircuit,
            id,
            json!({"id": "c-1", "dbReference": "DB1", "circuitNumber": "1"}),
        );
        store.apply_operation(&engineer, &id, &add).await.unwrap();

        let other = CertificateId::new();
        store
            .apply_operation(
                &engineer,
                &other,
                &op(SyncOperationKind::AddBoard, other, json!({"dbReference": "DB1"})),
            )
            .await
            .unwrap();
        let hijack = op(
            SyncOperationKind::UpdateCircuit,
            other,
            json!({"id": "c-1", "dbReference": "DB1", "circuitNumber": "2"}),
        );
        assert!(matches!(
            store.apply_operation(&engineer, &other, &hijack).await,
            Err(AppError::NotFound(_))
        ));
    }
}
