//! Snapshot and pending-operation store

use std::path::{Path, PathBuf};
use std::sync::Arc;

use libsql::{Connection, Row};
use tokio::sync::Mutex;

use crate::error::{Error, Result};
use crate::models::{
    merge_fields, replace_reference, CertificateData, CertificateId, CertificateSnapshot,
    SyncOperation, SyncOperationKind, SyncQueueItem,
};
use crate::util::now_millis;

use super::attachment_queue::AttachmentQueue;
use super::connection::{begin, finish, nullable_i64, optional_i64, optional_text, Database};

const SNAPSHOT_COLUMNS: &str = "id, data, last_modified, last_synced, is_dirty";
const QUEUE_COLUMNS: &str =
    "seq, operation, retries, created_at, last_error, next_attempt_at, dead_lettered";

/// Durable per-device store shared by every client component.
///
/// Cloning is cheap; every clone talks to the same connection and every
/// operation runs as one transaction while holding the store lock.
#[derive(Clone)]
pub struct LocalStore {
    db: Arc<Mutex<Database>>,
    db_path: Option<PathBuf>,
}

impl LocalStore {
    /// Open (or create) the store at `db_path`.
    pub async fn open_path(db_path: impl Into<PathBuf>) -> Result<Self> {
        let db_path = db_path.into();
        let db = Database::open(&db_path).await?;
        tracing::info!("Opened local store at {}", db_path.display());
        Ok(Self {
            db: Arc::new(Mutex::new(db)),
            db_path: Some(db_path),
        })
    }

    /// Open an in-memory store (primarily for tests).
    pub async fn open_in_memory() -> Result<Self> {
        let db = Database::open_in_memory().await?;
        Ok(Self {
            db: Arc::new(Mutex::new(db)),
            db_path: None,
        })
    }

    /// Path of the backing database file, if any.
    pub fn db_path(&self) -> Option<&Path> {
        self.db_path.as_deref()
    }

    /// Attachment queue sharing this store's database.
    pub fn attachments(&self) -> AttachmentQueue {
        AttachmentQueue::new(Arc::clone(&self.db))
    }

    /// Wait for in-flight operations and release this handle.
    pub async fn close(self) {
        drop(self.db.lock().await);
        tracing::debug!("Closed local store handle");
    }

    /// Merge `partial` into the snapshot for `id`, creating it when absent.
    ///
    /// `mark_dirty` flags the snapshot as pending and clears `last_synced`;
    /// otherwise the snapshot is stored as acknowledged. A dirty write that
    /// changes the data queues a full sync unless a live one is already
    /// queued, since no individual operation describes the change.
    pub async fn save_certificate(
        &self,
        id: &CertificateId,
        partial: CertificateData,
        mark_dirty: bool,
    ) -> Result<CertificateSnapshot> {
        let db = self.db.lock().await;
        let conn = db.connection();
        begin(conn).await?;
        let result: Result<CertificateSnapshot> = async {
            let existing = load_snapshot(conn, id).await?;
            let previous = existing.as_ref().map(|snapshot| snapshot.data.clone());
            let snapshot = next_snapshot(*id, existing, partial, mark_dirty);
            write_snapshot(conn, &snapshot).await?;
            if mark_dirty
                && previous.as_ref() != Some(&snapshot.data)
                && !has_live_full_sync(conn, id).await?
            {
                insert_operation(conn, &SyncOperation::full_sync(*id)).await?;
            }
            Ok(snapshot)
        }
        .await;
        finish(conn, result).await
    }

    /// Get one snapshot.
    pub async fn get_certificate(&self, id: &CertificateId) -> Result<Option<CertificateSnapshot>> {
        let db = self.db.lock().await;
        load_snapshot(db.connection(), id).await
    }

    /// All snapshots, most recently modified first.
    pub async fn list_local_certificates(&self) -> Result<Vec<CertificateSnapshot>> {
        let db = self.db.lock().await;
        query_snapshots(
            db.connection(),
            &format!("SELECT {SNAPSHOT_COLUMNS} FROM certificates ORDER BY last_modified DESC"),
        )
        .await
    }

    /// Snapshots holding work the server has not acknowledged.
    pub async fn get_dirty_certificates(&self) -> Result<Vec<CertificateSnapshot>> {
        let db = self.db.lock().await;
        query_snapshots(
            db.connection(),
            &format!(
                "SELECT {SNAPSHOT_COLUMNS} FROM certificates WHERE is_dirty = 1 ORDER BY last_modified ASC"
            ),
        )
        .await
    }

    /// Clear the dirty flag and stamp `last_synced`.
    pub async fn mark_synced(&self, id: &CertificateId) -> Result<()> {
        let db = self.db.lock().await;
        let updated = db
            .connection()
            .execute(
                "UPDATE certificates SET is_dirty = 0, last_synced = MAX(?, last_modified) WHERE id = ?",
                libsql::params![now_millis(), id.as_str()],
            )
            .await?;

        if updated == 0 {
            return Err(Error::NotFound(format!("certificate {id}")));
        }
        Ok(())
    }

    /// Clear the dirty flag only if no write landed after `observed_modified`.
    ///
    /// Returns `false` when the snapshot changed (or vanished) in the meantime.
    pub async fn mark_synced_if_unmodified(
        &self,
        id: &CertificateId,
        observed_modified: i64,
    ) -> Result<bool> {
        let db = self.db.lock().await;
        let updated = db
            .connection()
            .execute(
                "UPDATE certificates
                 SET is_dirty = 0, last_synced = MAX(?, last_modified)
                 WHERE id = ? AND last_modified = ?",
                libsql::params![now_millis(), id.as_str(), observed_modified],
            )
            .await?;
        Ok(updated > 0)
    }

    /// Remove a snapshot together with its queued operations and attachments.
    pub async fn delete_local_certificate(&self, id: &CertificateId) -> Result<bool> {
        let db = self.db.lock().await;
        let conn = db.connection();
        begin(conn).await?;
        let result: Result<bool> = async {
            let removed = conn
                .execute("DELETE FROM certificates WHERE id = ?", [id.as_str()])
                .await?;
            let operations = conn
                .execute("DELETE FROM sync_queue WHERE certificate_id = ?", [id.as_str()])
                .await?;
            let attachments = conn
                .execute(
                    "DELETE FROM queued_attachments WHERE certificate_id = ?",
                    [id.as_str()],
                )
                .await?;
            tracing::debug!(
                "Deleted local certificate {id} ({operations} queued operations, {attachments} attachments)"
            );
            Ok(removed > 0)
        }
        .await;
        finish(conn, result).await
    }

    /// Append an operation to the queue and flag its snapshot dirty.
    ///
    /// The snapshot must exist: the drain only visits dirty snapshots, so an
    /// item without one would never be sent.
    pub async fn queue_sync(&self, operation: &SyncOperation) -> Result<i64> {
        let db = self.db.lock().await;
        let conn = db.connection();
        begin(conn).await?;
        let result: Result<i64> = async {
            let seq = insert_operation(conn, operation).await?;
            let updated = conn
                .execute(
                    "UPDATE certificates
                     SET is_dirty = 1, last_synced = NULL, last_modified = MAX(last_modified + 1, ?)
                     WHERE id = ?",
                    libsql::params![now_millis(), operation.certificate_id.as_str()],
                )
                .await?;
            if updated == 0 {
                return Err(Error::NotFound(format!(
                    "certificate {}",
                    operation.certificate_id
                )));
            }
            Ok(seq)
        }
        .await;
        finish(conn, result).await
    }

    /// Every queued item, dead-lettered ones included, in creation order.
    pub async fn get_pending_syncs(&self) -> Result<Vec<SyncQueueItem>> {
        let db = self.db.lock().await;
        query_items(
            db.connection(),
            &format!("SELECT {QUEUE_COLUMNS} FROM sync_queue ORDER BY seq ASC"),
            (),
        )
        .await
    }

    /// Queued items for one certificate in creation order.
    pub async fn pending_syncs_for(&self, id: &CertificateId) -> Result<Vec<SyncQueueItem>> {
        let db = self.db.lock().await;
        query_items(
            db.connection(),
            &format!(
                "SELECT {QUEUE_COLUMNS} FROM sync_queue WHERE certificate_id = ? ORDER BY seq ASC"
            ),
            [id.as_str()],
        )
        .await
    }

    pub async fn remove_sync_item(&self, seq: i64) -> Result<bool> {
        let db = self.db.lock().await;
        let removed = db
            .connection()
            .execute("DELETE FROM sync_queue WHERE seq = ?", [seq])
            .await?;
        Ok(removed > 0)
    }

    /// Record one failed attempt and return the new retry count.
    pub async fn increment_retry(&self, seq: i64) -> Result<u32> {
        let db = self.db.lock().await;
        let conn = db.connection();
        begin(conn).await?;
        let result: Result<u32> = async {
            let updated = conn
                .execute(
                    "UPDATE sync_queue SET retries = retries + 1 WHERE seq = ?",
                    [seq],
                )
                .await?;
            if updated == 0 {
                return Err(Error::NotFound(format!("sync queue item {seq}")));
            }
            let mut rows = conn
                .query("SELECT retries FROM sync_queue WHERE seq = ?", [seq])
                .await?;
            let retries = match rows.next().await? {
                Some(row) => row.get::<i64>(0)?,
                None => return Err(Error::NotFound(format!("sync queue item {seq}"))),
            };
            Ok(u32::try_from(retries).unwrap_or(u32::MAX))
        }
        .await;
        finish(conn, result).await
    }

    /// Number of queued items, dead-lettered ones included.
    pub async fn pending_sync_count(&self) -> Result<u64> {
        let db = self.db.lock().await;
        let mut rows = db
            .connection()
            .query("SELECT COUNT(*) FROM sync_queue", ())
            .await?;
        let count = match rows.next().await? {
            Some(row) => row.get::<i64>(0)?,
            None => 0,
        };
        Ok(u64::try_from(count).unwrap_or_default())
    }

    /// Defer the next attempt of `seq` and remember why it failed.
    pub async fn schedule_retry(&self, seq: i64, next_attempt_at: i64, error: &str) -> Result<()> {
        let db = self.db.lock().await;
        db.connection()
            .execute(
                "UPDATE sync_queue SET next_attempt_at = ?, last_error = ? WHERE seq = ?",
                libsql::params![next_attempt_at, error, seq],
            )
            .await?;
        Ok(())
    }

    /// Stop retrying `seq`; it stays queued until requeued or superseded.
    pub async fn dead_letter(&self, seq: i64, error: &str) -> Result<()> {
        let db = self.db.lock().await;
        db.connection()
            .execute(
                "UPDATE sync_queue
                 SET dead_lettered = 1, last_error = ?, next_attempt_at = NULL
                 WHERE seq = ?",
                libsql::params![error, seq],
            )
            .await?;
        tracing::warn!("Dead-lettered sync queue item {seq}: {error}");
        Ok(())
    }

    pub async fn dead_lettered_syncs(&self) -> Result<Vec<SyncQueueItem>> {
        let db = self.db.lock().await;
        query_items(
            db.connection(),
            &format!(
                "SELECT {QUEUE_COLUMNS} FROM sync_queue WHERE dead_lettered = 1 ORDER BY seq ASC"
            ),
            (),
        )
        .await
    }

    /// Give a dead-lettered item a fresh set of attempts.
    pub async fn requeue_sync(&self, seq: i64) -> Result<bool> {
        let db = self.db.lock().await;
        let conn = db.connection();
        begin(conn).await?;
        let result: Result<bool> = async {
            let updated = conn
                .execute(
                    "UPDATE sync_queue
                     SET dead_lettered = 0, retries = 0, last_error = NULL, next_attempt_at = NULL
                     WHERE seq = ?",
                    [seq],
                )
                .await?;
            if updated > 0 {
                conn.execute(
                    "UPDATE certificates
                     SET is_dirty = 1, last_synced = NULL, last_modified = MAX(last_modified + 1, ?)
                     WHERE id = (SELECT certificate_id FROM sync_queue WHERE seq = ?)",
                    libsql::params![now_millis(), seq],
                )
                .await?;
            }
            Ok(updated > 0)
        }
        .await;
        finish(conn, result).await
    }

    /// Drop every item of `id` up to and including `seq`.
    pub async fn remove_syncs_through(&self, id: &CertificateId, seq: i64) -> Result<u64> {
        let db = self.db.lock().await;
        let removed = db
            .connection()
            .execute(
                "DELETE FROM sync_queue WHERE certificate_id = ? AND seq <= ?",
                libsql::params![id.as_str(), seq],
            )
            .await?;
        Ok(removed)
    }

    /// Merge `partial` into the snapshot and queue `operation` atomically.
    pub async fn save_and_queue(
        &self,
        id: &CertificateId,
        partial: CertificateData,
        operation: &SyncOperation,
    ) -> Result<(CertificateSnapshot, i64)> {
        check_owner(id, operation)?;
        let db = self.db.lock().await;
        let conn = db.connection();
        begin(conn).await?;
        let result: Result<(CertificateSnapshot, i64)> = async {
            let existing = load_snapshot(conn, id).await?;
            let snapshot = next_snapshot(*id, existing, partial, true);
            write_snapshot(conn, &snapshot).await?;
            let seq = insert_operation(conn, operation).await?;
            Ok((snapshot, seq))
        }
        .await;
        finish(conn, result).await
    }

    /// Read-modify-write an existing snapshot and queue the operation `edit`
    /// returns, atomically. Nothing is written when `edit` fails.
    pub async fn update_and_queue<F>(
        &self,
        id: &CertificateId,
        edit: F,
    ) -> Result<(CertificateSnapshot, i64)>
    where
        F: FnOnce(&mut CertificateData) -> Result<SyncOperation>,
    {
        let db = self.db.lock().await;
        let conn = db.connection();
        begin(conn).await?;
        let result: Result<(CertificateSnapshot, i64)> = async {
            let Some(existing) = load_snapshot(conn, id).await? else {
                return Err(Error::NotFound(format!("certificate {id}")));
            };
            let mut data = existing.data.clone();
            let operation = edit(&mut data)?;
            check_owner(id, &operation)?;

            let snapshot = CertificateSnapshot {
                id: *id,
                data,
                last_modified: next_modified(Some(existing.last_modified)),
                last_synced: None,
                is_dirty: true,
            };
            write_snapshot(conn, &snapshot).await?;
            let seq = insert_operation(conn, &operation).await?;
            Ok((snapshot, seq))
        }
        .await;
        finish(conn, result).await
    }

    /// Swap a provisional attachment reference for its permanent key.
    ///
    /// Rewrites the snapshot and every queued payload of the certificate and
    /// drops the queued blob. The dirty flag and `last_modified` are left
    /// alone. Returns the number of references rewritten.
    pub async fn apply_permanent_reference(
        &self,
        id: &CertificateId,
        temp_key: &str,
        permanent_key: &str,
    ) -> Result<usize> {
        let db = self.db.lock().await;
        let conn = db.connection();
        begin(conn).await?;
        let result: Result<usize> = async {
            let mut rewritten = 0;

            if let Some(snapshot) = load_snapshot(conn, id).await? {
                let mut data = serde_json::Value::Object(snapshot.data);
                let count = replace_reference(&mut data, temp_key, permanent_key);
                if count > 0 {
                    conn.execute(
                        "UPDATE certificates SET data = ? WHERE id = ?",
                        libsql::params![serde_json::to_string(&data)?, id.as_str()],
                    )
                    .await?;
                    rewritten += count;
                }
            }

            let items = query_items(
                conn,
                &format!(
                    "SELECT {QUEUE_COLUMNS} FROM sync_queue WHERE certificate_id = ? ORDER BY seq ASC"
                ),
                [id.as_str()],
            )
            .await?;
            for item in items {
                let mut operation = item.operation;
                let mut payload = serde_json::Value::Object(operation.payload);
                let count = replace_reference(&mut payload, temp_key, permanent_key);
                if count == 0 {
                    continue;
                }
                operation.payload = match payload {
                    serde_json::Value::Object(map) => map,
                    _ => CertificateData::new(),
                };
                conn.execute(
                    "UPDATE sync_queue SET operation = ? WHERE seq = ?",
                    libsql::params![serde_json::to_string(&operation)?, item.seq],
                )
                .await?;
                rewritten += count;
            }

            conn.execute(
                "DELETE FROM queued_attachments WHERE temp_key = ?",
                [temp_key],
            )
            .await?;
            Ok(rewritten)
        }
        .await;
        let rewritten = finish(conn, result).await?;
        tracing::debug!("Replaced {rewritten} references to {temp_key} in certificate {id}");
        Ok(rewritten)
    }
}

fn check_owner(id: &CertificateId, operation: &SyncOperation) -> Result<()> {
    if operation.certificate_id == *id {
        Ok(())
    } else {
        Err(Error::InvalidInput(format!(
            "operation for certificate {} cannot be queued against {id}",
            operation.certificate_id
        )))
    }
}

/// Strictly increasing modification stamp for one snapshot.
fn next_modified(previous: Option<i64>) -> i64 {
    let now = now_millis();
    previous.map_or(now, |previous| now.max(previous + 1))
}

fn next_snapshot(
    id: CertificateId,
    existing: Option<CertificateSnapshot>,
    partial: CertificateData,
    mark_dirty: bool,
) -> CertificateSnapshot {
    let (mut data, previous) = existing.map_or_else(
        || (CertificateData::new(), None),
        |snapshot| (snapshot.data, Some(snapshot.last_modified)),
    );
    merge_fields(&mut data, partial);

    let last_modified = next_modified(previous);
    CertificateSnapshot {
        id,
        data,
        last_modified,
        last_synced: (!mark_dirty).then_some(last_modified),
        is_dirty: mark_dirty,
    }
}

async fn load_snapshot(conn: &Connection, id: &CertificateId) -> Result<Option<CertificateSnapshot>> {
    let mut rows = conn
        .query(
            &format!("SELECT {SNAPSHOT_COLUMNS} FROM certificates WHERE id = ?"),
            [id.as_str()],
        )
        .await?;
    match rows.next().await? {
        Some(row) => Ok(Some(parse_snapshot(&row)?)),
        None => Ok(None),
    }
}

async fn write_snapshot(conn: &Connection, snapshot: &CertificateSnapshot) -> Result<()> {
    conn.execute(
        "INSERT INTO certificates (id, data, last_modified, last_synced, is_dirty)
         VALUES (?, ?, ?, ?, ?)
         ON CONFLICT(id) DO UPDATE SET
             data = excluded.data,
             last_modified = excluded.last_modified,
             last_synced = excluded.last_synced,
             is_dirty = excluded.is_dirty",
        libsql::params![
            snapshot.id.as_str(),
            serde_json::to_string(&snapshot.data)?,
            snapshot.last_modified,
            nullable_i64(snapshot.last_synced),
            i64::from(snapshot.is_dirty),
        ],
    )
    .await?;
    Ok(())
}

async fn has_live_full_sync(conn: &Connection, id: &CertificateId) -> Result<bool> {
    let mut rows = conn
        .query(
            "SELECT 1 FROM sync_queue WHERE certificate_id = ? AND kind = ? AND dead_lettered = 0 LIMIT 1",
            libsql::params![id.as_str(), SyncOperationKind::FullSync.label()],
        )
        .await?;
    Ok(rows.next().await?.is_some())
}

async fn insert_operation(conn: &Connection, operation: &SyncOperation) -> Result<i64> {
    conn.execute(
        "INSERT INTO sync_queue (certificate_id, kind, operation, retries, created_at)
         VALUES (?, ?, ?, 0, ?)",
        libsql::params![
            operation.certificate_id.as_str(),
            operation.kind.label(),
            serde_json::to_string(operation)?,
            now_millis(),
        ],
    )
    .await?;
    let seq = conn.last_insert_rowid();
    tracing::debug!(
        "Queued {} for certificate {} as #{seq}",
        operation.kind,
        operation.certificate_id
    );
    Ok(seq)
}

async fn query_snapshots(conn: &Connection, sql: &str) -> Result<Vec<CertificateSnapshot>> {
    let mut rows = conn.query(sql, ()).await?;
    let mut snapshots = Vec::new();
    while let Some(row) = rows.next().await? {
        snapshots.push(parse_snapshot(&row)?);
    }
    Ok(snapshots)
}

async fn query_items(
    conn: &Connection,
    sql: &str,
    params: impl libsql::params::IntoParams,
) -> Result<Vec<SyncQueueItem>> {
    let mut rows = conn.query(sql, params).await?;
    let mut items = Vec::new();
    while let Some(row) = rows.next().await? {
        items.push(parse_item(&row)?);
    }
    Ok(items)
}

fn parse_snapshot(row: &Row) -> Result<CertificateSnapshot> {
    let id: String = row.get(0)?;
    let data: String = row.get(1)?;
    Ok(CertificateSnapshot {
        id: id
            .parse()
            .map_err(|_| Error::Database(format!("invalid certificate id `{id}`")))?,
        data: serde_json::from_str(&data)?,
        last_modified: row.get(2)?,
        last_synced: optional_i64(row, 3)?,
        is_dirty: row.get::<i64>(4)? != 0,
    })
}

fn parse_item(row: &Row) -> Result<SyncQueueItem> {
    let operation: String = row.get(1)?;
    Ok(SyncQueueItem {
        seq: row.get(0)?,
        operation: serde_json::from_str(&operation)?,
        retries: u32::try_from(row.get::<i64>(2)?).unwrap_or(u32::MAX),
        created_at: row.get(3)?,
        last_error: optional_text(row, 4)?,
        next_attempt_at: optional_i64(row, 5)?,
        dead_lettered: row.get::<i64>(6)? != 0,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{AttachmentKind, QueuedAttachment};
    use pretty_assertions::assert_eq;
    use serde_json::{json, Value};
    use tempfile::tempdir;

    fn fields(value: Value) -> CertificateData {
        value.as_object().cloned().unwrap_or_default()
    }

    fn operation(kind: SyncOperationKind, id: CertificateId, payload: Value) -> SyncOperation {
        SyncOperation::new(kind, id, fields(payload))
    }

    #[tokio::test]
    async fn save_certificate_merges_and_marks_dirty() {
        let store = LocalStore::open_in_memory().await.unwrap();
        let id = CertificateId::new();

        let first = store
            .save_certificate(&id, fields(json!({"clientName": "Acme", "address": "1 High St"})), true)
            .await
            .unwrap();
        assert!(first.is_dirty);
        assert_eq!(first.last_synced, None);

        let second = store
            .save_certificate(&id, fields(json!({"clientName": "Acme Ltd"})), true)
            .await
            .unwrap();
        assert!(second.last_modified > first.last_modified);
        assert_eq!(second.data["clientName"], "Acme Ltd");
        assert_eq!(second.data["address"], "1 High St");

        let loaded = store.get_certificate(&id).await.unwrap().unwrap();
        assert_eq!(loaded, second);
    }

    #[tokio::test]
    async fn dirty_save_queues_a_single_full_sync() {
        let store = LocalStore::open_in_memory().await.unwrap();
        let id = CertificateId::new();
        store.save_certificate(&id, fields(json!({"clientName": "Acme"})), false).await.unwrap();
        assert_eq!(store.pending_sync_count().await.unwrap(), 0);

        let boards = fields(json!({
            "distributionBoards": [{"dbReference": "DB1"}],
            "circuits": [{"id": "c1", "dbReference": "DB1", "circuitNumber": "1"}],
        }));
        store.save_certificate(&id, boards.clone(), true).await.unwrap();
        store
            .save_certificate(&id, fields(json!({"address": "1 High St"})), true)
            .await
            .unwrap();
        store.save_certificate(&id, boards, true).await.unwrap();

        let items = store.pending_syncs_for(&id).await.unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].operation.kind, SyncOperationKind::FullSync);

        store.dead_letter(items[0].seq, "rejected").await.unwrap();
        store
            .save_certificate(&id, fields(json!({"address": "2 High St"})), true)
            .await
            .unwrap();
        assert_eq!(store.pending_syncs_for(&id).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn queue_sync_requires_a_snapshot() {
        let store = LocalStore::open_in_memory().await.unwrap();
        let orphan = SyncOperation::full_sync(CertificateId::new());

        assert!(matches!(store.queue_sync(&orphan).await, Err(Error::NotFound(_))));
        assert_eq!(store.pending_sync_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn clean_save_stamps_last_synced() {
        let store = LocalStore::open_in_memory().await.unwrap();
        let id = CertificateId::new();

        let snapshot = store
            .save_certificate(&id, fields(json!({"clientName": "Acme"})), false)
            .await
            .unwrap();
        assert!(!snapshot.is_dirty);
        assert_eq!(snapshot.last_synced, Some(snapshot.last_modified));
        assert!(store.get_dirty_certificates().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn dirty_listing_and_mark_synced() {
        let store = LocalStore::open_in_memory().await.unwrap();
        let dirty = CertificateId::new();
        let clean = CertificateId::new();
        store.save_certificate(&dirty, CertificateData::new(), true).await.unwrap();
        store.save_certificate(&clean, CertificateData::new(), false).await.unwrap();

        assert_eq!(store.list_local_certificates().await.unwrap().len(), 2);
        let pending = store.get_dirty_certificates().await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, dirty);

        store.mark_synced(&dirty).await.unwrap();
        let synced = store.get_certificate(&dirty).await.unwrap().unwrap();
        assert!(!synced.is_dirty);
        assert!(synced.last_synced.unwrap() >= synced.last_modified);

        assert!(matches!(
            store.mark_synced(&CertificateId::new()).await,
            Err(Error::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn mark_synced_if_unmodified_detects_concurrent_edit() {
        let store = LocalStore::open_in_memory().await.unwrap();
        let id = CertificateId::new();
        let observed = store
            .save_certificate(&id, fields(json!({"a": 1})), true)
            .await
            .unwrap();
        store.save_certificate(&id, fields(json!({"a": 2})), true).await.unwrap();

        assert!(!store.mark_synced_if_unmodified(&id, observed.last_modified).await.unwrap());
        assert!(store.get_certificate(&id).await.unwrap().unwrap().is_dirty);

        let latest = store.get_certificate(&id).await.unwrap().unwrap();
        assert!(store.mark_synced_if_unmodified(&id, latest.last_modified).await.unwrap());
        assert!(!store.get_certificate(&id).await.unwrap().unwrap().is_dirty);
    }

    #[tokio::test]
    async fn queue_is_fifo_and_tracks_retries() {
        let store = LocalStore::open_in_memory().await.unwrap();
        let id = CertificateId::new();
        store.save_certificate(&id, CertificateData::new(), false).await.unwrap();

        let first = store
            .queue_sync(&operation(SyncOperationKind::UpdateCircuit, id, json!({"id": "c1"})))
            .await
            .unwrap();
        let second = store
            .queue_sync(&operation(SyncOperationKind::DeleteCircuit, id, json!({"id": "c1"})))
            .await
            .unwrap();
        assert!(second > first);
        assert!(store.get_certificate(&id).await.unwrap().unwrap().is_dirty);

        let pending = store.get_pending_syncs().await.unwrap();
        let kinds: Vec<_> = pending.iter().map(|item| item.operation.kind).collect();
        assert_eq!(
            kinds,
            vec![SyncOperationKind::UpdateCircuit, SyncOperationKind::DeleteCircuit]
        );
        assert_eq!(store.pending_sync_count().await.unwrap(), 2);

        assert_eq!(store.increment_retry(first).await.unwrap(), 1);
        assert_eq!(store.increment_retry(first).await.unwrap(), 2);
        assert!(matches!(store.increment_retry(999).await, Err(Error::NotFound(_))));

        assert!(store.remove_sync_item(first).await.unwrap());
        assert!(!store.remove_sync_item(first).await.unwrap());
        assert_eq!(store.pending_syncs_for(&id).await.unwrap()[0].seq, second);
    }

    #[tokio::test]
    async fn dead_letter_and_requeue() {
        let store = LocalStore::open_in_memory().await.unwrap();
        let id = CertificateId::new();
        store.save_certificate(&id, CertificateData::new(), false).await.unwrap();
        let seq = store.queue_sync(&SyncOperation::full_sync(id)).await.unwrap();

        store.increment_retry(seq).await.unwrap();
        store.schedule_retry(seq, 42, "offline").await.unwrap();
        let item = store.pending_syncs_for(&id).await.unwrap().remove(0);
        assert_eq!(item.next_attempt_at, Some(42));
        assert_eq!(item.last_error.as_deref(), Some("offline"));

        store.dead_letter(seq, "bad payload").await.unwrap();
        let dead = store.dead_lettered_syncs().await.unwrap();
        assert_eq!(dead.len(), 1);
        assert!(dead[0].dead_lettered);
        assert_eq!(store.pending_sync_count().await.unwrap(), 1);

        store.mark_synced(&id).await.unwrap();
        assert!(store.requeue_sync(seq).await.unwrap());
        let item = store.pending_syncs_for(&id).await.unwrap().remove(0);
        assert_eq!(item.retries, 0);
        assert!(!item.dead_lettered);
        assert_eq!(item.last_error, None);
        assert!(store.get_certificate(&id).await.unwrap().unwrap().is_dirty);
    }

    #[tokio::test]
    async fn remove_syncs_through_only_touches_one_certificate() {
        let store = LocalStore::open_in_memory().await.unwrap();
        let a = CertificateId::new();
        let b = CertificateId::new();
        store.save_certificate(&a, CertificateData::new(), false).await.unwrap();
        store.save_certificate(&b, CertificateData::new(), false).await.unwrap();
        let a1 = store.queue_sync(&SyncOperation::full_sync(a)).await.unwrap();
        let b1 = store.queue_sync(&SyncOperation::full_sync(b)).await.unwrap();
        let a2 = store.queue_sync(&SyncOperation::full_sync(a)).await.unwrap();
        let a3 = store.queue_sync(&SyncOperation::full_sync(a)).await.unwrap();

        assert_eq!(store.remove_syncs_through(&a, a2).await.unwrap(), 2);
        let remaining: Vec<_> = store
            .get_pending_syncs()
            .await
            .unwrap()
            .into_iter()
            .map(|item| item.seq)
            .collect();
        assert_eq!(remaining, vec![b1, a3]);
        assert!(a1 < b1);
    }

    #[tokio::test]
    async fn save_and_queue_rejects_foreign_operation() {
        let store = LocalStore::open_in_memory().await.unwrap();
        let id = CertificateId::new();
        let other = SyncOperation::full_sync(CertificateId::new());

        assert!(store
            .save_and_queue(&id, fields(json!({"a": 1})), &other)
            .await
            .is_err());
        assert!(store.get_certificate(&id).await.unwrap().is_none());
        assert_eq!(store.pending_sync_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn failed_edit_writes_nothing() {
        let store = LocalStore::open_in_memory().await.unwrap();
        let id = CertificateId::new();
        store.save_certificate(&id, fields(json!({"a": 1})), false).await.unwrap();

        let result = store
            .update_and_queue(&id, |data| {
                data.insert("a".to_string(), json!(2));
                Err(Error::InvalidInput("rejected".to_string()))
            })
            .await;
        assert!(result.is_err());

        let snapshot = store.get_certificate(&id).await.unwrap().unwrap();
        assert_eq!(snapshot.data["a"], 1);
        assert!(!snapshot.is_dirty);
        assert_eq!(store.pending_sync_count().await.unwrap(), 0);

        let missing = store
            .update_and_queue(&CertificateId::new(), |_| unreachable!())
            .await;
        assert!(matches!(missing, Err(Error::NotFound(_))));
    }

    #[tokio::test]
    async fn permanent_reference_rewrites_snapshot_and_queue() {
        let store = LocalStore::open_in_memory().await.unwrap();
        let id = CertificateId::new();
        let queued = QueuedAttachment::new(id, AttachmentKind::Signature, vec![7; 4], "image/png", "sig.png")
            .unwrap();
        store.attachments().queue_photo(&queued).await.unwrap();

        let op = operation(
            SyncOperationKind::UpdateCertificate,
            id,
            json!({"declarationSignature": queued.temp_key}),
        );
        let (before, _) = store
            .save_and_queue(&id, fields(json!({"declarationSignature": queued.temp_key})), &op)
            .await
            .unwrap();

        let rewritten = store
            .apply_permanent_reference(&id, &queued.temp_key, "engineers/e1/signature/sig.png")
            .await
            .unwrap();
        assert_eq!(rewritten, 2);

        let after = store.get_certificate(&id).await.unwrap().unwrap();
        assert_eq!(after.data["declarationSignature"], "engineers/e1/signature/sig.png");
        assert_eq!(after.last_modified, before.last_modified);
        assert!(after.is_dirty);

        let item = store.pending_syncs_for(&id).await.unwrap().remove(0);
        assert_eq!(
            item.operation.payload["declarationSignature"],
            "engineers/e1/signature/sig.png"
        );
        assert!(store
            .attachments()
            .get_queued_photo_by_key(&queued.temp_key)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn delete_removes_queue_and_attachments() {
        let store = LocalStore::open_in_memory().await.unwrap();
        let id = CertificateId::new();
        store
            .save_and_queue(&id, CertificateData::new(), &SyncOperation::full_sync(id))
            .await
            .unwrap();
        let queued = QueuedAttachment::new(id, AttachmentKind::Photo, vec![1], "image/jpeg", "a.jpg")
            .unwrap();
        store.attachments().queue_photo(&queued).await.unwrap();

        assert!(store.delete_local_certificate(&id).await.unwrap());
        assert!(store.get_certificate(&id).await.unwrap().is_none());
        assert_eq!(store.pending_sync_count().await.unwrap(), 0);
        assert_eq!(store.attachments().queued_photo_count().await.unwrap(), 0);
        assert!(!store.delete_local_certificate(&id).await.unwrap());
    }

    #[tokio::test]
    async fn store_survives_reopen() {
        let tmp = tempdir().unwrap();
        let path = tmp.path().join("device.db");
        let id = CertificateId::new();

        let store = LocalStore::open_path(&path).await.unwrap();
        store
            .save_and_queue(&id, fields(json!({"clientName": "Acme"})), &SyncOperation::full_sync(id))
            .await
            .unwrap();
        store.close().await;

        let reopened = LocalStore::open_path(&path).await.unwrap();
        assert_eq!(reopened.db_path(), Some(path.as_path()));
        let snapshot = reopened.get_certificate(&id).await.unwrap().unwrap();
        assert_eq!(snapshot.data["clientName"], "Acme");
        assert_eq!(reopened.pending_sync_count().await.unwrap(), 1);
    }
}
