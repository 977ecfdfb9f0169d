//! Offline queue for attachment blobs

use std::sync::Arc;

use libsql::Row;
use tokio::sync::Mutex;

use crate::error::{Error, Result};
use crate::models::{is_offline_key, CertificateId, QueuedAttachment};

use super::connection::{blob, Database};

const ATTACHMENT_COLUMNS: &str =
    "temp_key, certificate_id, kind, bytes, content_type, filename, created_at";

/// Blobs captured while offline, keyed by their provisional reference.
#[derive(Clone)]
pub struct AttachmentQueue {
    db: Arc<Mutex<Database>>,
}

impl AttachmentQueue {
    pub(crate) const fn new(db: Arc<Mutex<Database>>) -> Self {
        Self { db }
    }

    /// Persist a blob under its provisional reference.
    pub async fn queue_photo(&self, record: &QueuedAttachment) -> Result<()> {
        if !is_offline_key(&record.temp_key) {
            return Err(Error::InvalidInput(format!(
                "`{}` is not a provisional attachment reference",
                record.temp_key
            )));
        }

        let db = self.db.lock().await;
        db.connection()
            .execute(
                "INSERT INTO queued_attachments
                     (temp_key, certificate_id, kind, bytes, content_type, filename, created_at)
                 VALUES (?, ?, ?, ?, ?, ?, ?)",
                libsql::params![
                    record.temp_key.as_str(),
                    record.certificate_id.as_str(),
                    record.kind.as_str(),
                    record.bytes.clone(),
                    record.content_type.as_str(),
                    record.filename.as_str(),
                    record.created_at,
                ],
            )
            .await?;

        tracing::info!(
            "Queued {} `{}` ({} bytes) for certificate {}",
            record.kind,
            record.temp_key,
            record.size(),
            record.certificate_id
        );
        Ok(())
    }

    /// Look up a queued blob for local preview.
    pub async fn get_queued_photo_by_key(&self, temp_key: &str) -> Result<Option<QueuedAttachment>> {
        let db = self.db.lock().await;
        let mut rows = db
            .connection()
            .query(
                &format!("SELECT {ATTACHMENT_COLUMNS} FROM queued_attachments WHERE temp_key = ?"),
                [temp_key],
            )
            .await?;

        match rows.next().await? {
            Some(row) => Ok(Some(parse_attachment(&row)?)),
            None => Ok(None),
        }
    }

    /// Drop a blob once a permanent reference supersedes it.
    pub async fn remove_photo_by_temp_key(&self, temp_key: &str) -> Result<bool> {
        let db = self.db.lock().await;
        let removed = db
            .connection()
            .execute("DELETE FROM queued_attachments WHERE temp_key = ?", [temp_key])
            .await?;
        Ok(removed > 0)
    }

    /// Queued blobs for one certificate, oldest first.
    pub async fn list_queued_photos(
        &self,
        certificate_id: &CertificateId,
    ) -> Result<Vec<QueuedAttachment>> {
        let db = self.db.lock().await;
        let mut rows = db
            .connection()
            .query(
                &format!(
                    "SELECT {ATTACHMENT_COLUMNS} FROM queued_attachments
                     WHERE certificate_id = ? ORDER BY created_at ASC, temp_key ASC"
                ),
                [certificate_id.as_str()],
            )
            .await?;

        let mut attachments = Vec::new();
        while let Some(row) = rows.next().await? {
            attachments.push(parse_attachment(&row)?);
        }
        Ok(attachments)
    }

    pub async fn queued_photo_count(&self) -> Result<u64> {
        let db = self.db.lock().await;
        let mut rows = db
            .connection()
            .query("SELECT COUNT(*) FROM queued_attachments", ())
            .await?;
        let count = match rows.next().await? {
            Some(row) => row.get::<i64>(0)?,
            None => 0,
        };
        Ok(u64::try_from(count).unwrap_or_default())
    }
}

fn parse_attachment(row: &Row) -> Result<QueuedAttachment> {
    let certificate_id: String = row.get(1)?;
    let kind: String = row.get(2)?;
    Ok(QueuedAttachment {
        temp_key: row.get(0)?,
        certificate_id: certificate_id
            .parse()
            .map_err(|_| Error::Database(format!("invalid certificate id `{certificate_id}`")))?,
        kind: kind.parse()?,
        bytes: blob(row, 3)?,
        content_type: row.get(4)?,
        filename: row.get(5)?,
        created_at: row.get(6)?,
    })
}
