//! Server-side certificate store.
//!
//! One libSQL connection behind an async mutex; every request that writes runs
//! inside a single explicit transaction.

mod migrations;
mod operations;
mod reconcile;

use std::path::Path;
use std::sync::Arc;

use certsync_core::models::{CertificateData, SyncPayload, SyncStats};
use certsync_core::util::now_millis;
use certsync_core::{CertificateId, SyncOperation};
use libsql::{Builder, Connection, Database, Row, Value as SqlValue};
use serde_json::{Map, Value};
use tokio::sync::Mutex;

use crate::error::AppError;

const HEADER_RESERVED_KEYS: [&str; 5] = [
    "id",
    "overallAssessment",
    "distributionBoards",
    "circuits",
    "observations",
];

const BOARD_SELECT: &str =
    "SELECT id, db_reference, fields FROM distribution_boards WHERE certificate_id = ?";
const CIRCUIT_SELECT: &str = "SELECT c.id, c.db_id, b.db_reference, c.circuit_number, c.fields
     FROM circuits c LEFT JOIN distribution_boards b ON b.id = c.db_id";
const OBSERVATION_SELECT: &str =
    "SELECT id, item_number, observation_text, classification_code, fields FROM observations";

#[derive(Clone)]
pub struct ServerStore {
    inner: Arc<Mutex<StoreInner>>,
}

struct StoreInner {
    _db: Database,
    conn: Connection,
}

impl ServerStore {
    pub async fn open(path: &Path) -> Result<Self, AppError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|error| {
                    AppError::internal(format!("Failed to create database directory: {error}"))
                })?;
            }
        }
        let db = Builder::new_local(path.to_string_lossy().as_ref())
            .build()
            .await?;
        Self::from_database(db).await
    }

    pub async fn open_in_memory() -> Result<Self, AppError> {
        let db = Builder::new_local(":memory:").build().await?;
        Self::from_database(db).await
    }

    async fn from_database(db: Database) -> Result<Self, AppError> {
        let conn = db.connect()?;
        conn.execute("PRAGMA journal_mode = WAL;", ()).await.ok();
        conn.execute("PRAGMA foreign_keys = ON;", ()).await?;
        migrations::run(&conn).await?;
        Ok(Self {
            inner: Arc::new(Mutex::new(StoreInner { _db: db, conn })),
        })
    }

    /// Internal engineer id for an identity provider subject, created on
    /// first sight.
    pub async fn resolve_engineer(&self, subject: &str) -> Result<String, AppError> {
        let inner = self.inner.lock().await;
        let conn = &inner.conn;
        if let Some(id) = engineer_by_subject(conn, subject).await? {
            return Ok(id);
        }

        let id = uuid::Uuid::now_v7().to_string();
        conn.execute(
            "INSERT INTO engineers (id, subject, created_at) VALUES (?, ?, ?)
             ON CONFLICT(subject) DO NOTHING",
            libsql::params![id.as_str(), subject, now_millis()],
        )
        .await?;
        engineer_by_subject(conn, subject)
            .await?
            .ok_or_else(|| AppError::internal("engineer row vanished after insert"))
    }

    /// Create the certificate for `engineer_id` or replace its header fields.
    pub async fn upsert_certificate(
        &self,
        engineer_id: &str,
        id: &CertificateId,
        header: &CertificateData,
    ) -> Result<(), AppError> {
        let inner = self.inner.lock().await;
        let conn = &inner.conn;
        begin(conn).await?;
        let result = async {
            claim_certificate(conn, engineer_id, id, true).await?;
            let fields = header_fields(header.clone());
            conn.execute(
                "UPDATE certificates SET fields = ?, updated_at = ? WHERE id = ?",
                libsql::params![serde_json::to_string(&fields)?, now_millis(), id.as_str()],
            )
            .await?;
            Ok(())
        }
        .await;
        finish(conn, result).await
    }

    /// Full nested record of a certificate owned by `engineer_id`.
    pub async fn get_certificate(
        &self,
        engineer_id: &str,
        id: &CertificateId,
    ) -> Result<Value, AppError> {
        let inner = self.inner.lock().await;
        let conn = &inner.conn;
        claim_certificate(conn, engineer_id, id, false).await?;

        let mut rows = conn
            .query(
                "SELECT fields, overall_assessment FROM certificates WHERE id = ?",
                [id.as_str()],
            )
            .await?;
        let Some(row) = rows.next().await? else {
            return Err(AppError::not_found(format!("certificate {id}")));
        };
        let mut record = parse_fields(&row.get::<String>(0)?)?;
        record.insert("id".to_string(), Value::String(id.to_string()));
        record.insert(
            "overallAssessment".to_string(),
            Value::String(row.get::<String>(1)?),
        );

        let boards = collect_rows(
            conn,
            &format!("{BOARD_SELECT} ORDER BY sort_order"),
            id,
            board_json,
        )
        .await?;
        let circuits = collect_rows(
            conn,
            &format!("{CIRCUIT_SELECT} WHERE c.certificate_id = ? ORDER BY c.sort_order"),
            id,
            circuit_json,
        )
        .await?;
        let observations = collect_rows(
            conn,
            &format!("{OBSERVATION_SELECT} WHERE certificate_id = ? ORDER BY sort_order"),
            id,
            observation_json,
        )
        .await?;
        record.insert("distributionBoards".to_string(), Value::Array(boards));
        record.insert("circuits".to_string(), Value::Array(circuits));
        record.insert("observations".to_string(), Value::Array(observations));
        Ok(Value::Object(record))
    }

    /// Reconcile the nested collections in one transaction.
    pub async fn reconcile(
        &self,
        engineer_id: &str,
        id: &CertificateId,
        payload: &SyncPayload,
    ) -> Result<SyncStats, AppError> {
        let inner = self.inner.lock().await;
        let conn = &inner.conn;
        begin(conn).await?;
        let result = reconcile::reconcile(conn, engineer_id, id, payload).await;
        finish(conn, result).await
    }

    /// Apply one queued client operation in its own transaction.
    pub async fn apply_operation(
        &self,
        engineer_id: &str,
        id: &CertificateId,
        operation: &SyncOperation,
    ) -> Result<(), AppError> {
        if operation.certificate_id != *id {
            return Err(AppError::bad_request(
                "operation certificateId does not match the request path",
            ));
        }
        let inner = self.inner.lock().await;
        let conn = &inner.conn;
        begin(conn).await?;
        let result = operations::apply(conn, engineer_id, operation).await;
        finish(conn, result).await
    }

    /// Claim the certificate for `engineer_id`, creating an empty one when
    /// the server has never seen it. Fails with not-found when another
    /// engineer owns it.
    pub async fn claim_owner(&self, engineer_id: &str, id: &CertificateId) -> Result<(), AppError> {
        let inner = self.inner.lock().await;
        claim_certificate(&inner.conn, engineer_id, id, true).await
    }
}

async fn engineer_by_subject(conn: &Connection, subject: &str) -> Result<Option<String>, AppError> {
    let mut rows = conn
        .query("SELECT id FROM engineers WHERE subject = ?", [subject])
        .await?;
    match rows.next().await? {
        Some(row) => Ok(Some(row.get::<String>(0)?)),
        None => Ok(None),
    }
}

/// Ensure `engineer_id` owns the certificate, optionally creating it.
///
/// A certificate owned by someone else is reported exactly like a missing one.
pub(super) async fn claim_certificate(
    conn: &Connection,
    engineer_id: &str,
    id: &CertificateId,
    create: bool,
) -> Result<(), AppError> {
    let mut rows = conn
        .query(
            "SELECT engineer_id FROM certificates WHERE id = ?",
            [id.as_str()],
        )
        .await?;
    match rows.next().await? {
        Some(row) if row.get::<String>(0)? == engineer_id => Ok(()),
        Some(_) => Err(AppError::not_found(format!("certificate {id}"))),
        None if create => {
            let now = now_millis();
            conn.execute(
                "INSERT INTO certificates (id, engineer_id, created_at, updated_at)
                 VALUES (?, ?, ?, ?)",
                libsql::params![id.as_str(), engineer_id, now, now],
            )
            .await?;
            Ok(())
        }
        None => Err(AppError::not_found(format!("certificate {id}"))),
    }
}

fn header_fields(mut fields: CertificateData) -> CertificateData {
    for key in HEADER_RESERVED_KEYS {
        fields.remove(key);
    }
    fields
}

pub(super) async fn begin(conn: &Connection) -> Result<(), AppError> {
    conn.execute("BEGIN IMMEDIATE", ()).await?;
    Ok(())
}

pub(super) async fn finish<T>(
    conn: &Connection,
    result: Result<T, AppError>,
) -> Result<T, AppError> {
    match result {
        Ok(value) => {
            if let Err(error) = conn.execute("COMMIT", ()).await {
                conn.execute("ROLLBACK", ()).await.ok();
                return Err(error.into());
            }
            Ok(value)
        }
        Err(error) => {
            conn.execute("ROLLBACK", ()).await.ok();
            Err(error)
        }
    }
}

async fn collect_rows(
    conn: &Connection,
    sql: &str,
    id: &CertificateId,
    to_json: fn(&Row) -> Result<Value, AppError>,
) -> Result<Vec<Value>, AppError> {
    let mut rows = conn.query(sql, [id.as_str()]).await?;
    let mut out = Vec::new();
    while let Some(row) = rows.next().await? {
        out.push(to_json(&row)?);
    }
    Ok(out)
}

pub(super) fn parse_fields(raw: &str) -> Result<Map<String, Value>, AppError> {
    match serde_json::from_str::<Value>(raw)? {
        Value::Object(map) => Ok(map),
        _ => Ok(Map::new()),
    }
}

pub(super) fn board_json(row: &Row) -> Result<Value, AppError> {
    let mut object = parse_fields(&row.get::<String>(2)?)?;
    object.insert("id".to_string(), Value::String(row.get::<String>(0)?));
    object.insert("dbReference".to_string(), Value::String(row.get::<String>(1)?));
    Ok(Value::Object(object))
}

pub(super) fn circuit_json(row: &Row) -> Result<Value, AppError> {
    let mut object = parse_fields(&row.get::<String>(4)?)?;
    object.insert("id".to_string(), Value::String(row.get::<String>(0)?));
    if let Some(db_id) = optional_text(row, 1)? {
        object.insert("dbId".to_string(), Value::String(db_id));
    }
    if let Some(reference) = optional_text(row, 2)? {
        object.insert("dbReference".to_string(), Value::String(reference));
    }
    object.insert(
        "circuitNumber".to_string(),
        Value::String(row.get::<String>(3)?),
    );
    Ok(Value::Object(object))
}

pub(super) fn observation_json(row: &Row) -> Result<Value, AppError> {
    let mut object = parse_fields(&row.get::<String>(4)?)?;
    object.insert("id".to_string(), Value::String(row.get::<String>(0)?));
    if let Some(item_number) = optional_i64(row, 1)? {
        object.insert("itemNumber".to_string(), Value::from(item_number));
    }
    object.insert(
        "observationText".to_string(),
        Value::String(row.get::<String>(2)?),
    );
    object.insert(
        "classificationCode".to_string(),
        Value::String(row.get::<String>(3)?),
    );
    Ok(Value::Object(object))
}

fn optional_text(row: &Row, index: i32) -> Result<Option<String>, AppError> {
    match row.get_value(index)? {
        SqlValue::Text(value) => Ok(Some(value)),
        SqlValue::Null => Ok(None),
        other => Err(AppError::internal(format!(
            "expected text in column {index}, got {other:?}"
        ))),
    }
}

fn optional_i64(row: &Row, index: i32) -> Result<Option<i64>, AppError> {
    match row.get_value(index)? {
        SqlValue::Integer(value) => Ok(Some(value)),
        SqlValue::Null => Ok(None),
        other => Err(AppError::internal(format!(
            "expected integer in column {index}, got {other:?}"
        ))),
    }
}

pub(super) fn nullable_i64(value: Option<i64>) -> SqlValue {
    value.map_or(SqlValue::Null, SqlValue::Integer)
}

pub(super) fn sort_index(index: usize) -> i64 {
    i64::try_from(index).unwrap_or(i64::MAX)
}
