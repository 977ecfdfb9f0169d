//! Database connection management

use crate::error::{Error, Result};
use libsql::{Builder, Connection, Database as LibSqlDatabase, Row, Value};
use std::path::Path;

use super::migrations;

/// Database wrapper for the on-device libSQL file
pub struct Database {
    _db: LibSqlDatabase,
    conn: Connection,
}

impl Database {
    /// Open the local database at the given path, creating it if it doesn't exist
    ///
    /// Runs migrations automatically.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        if let Some(parent) = path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let path_str = path.as_ref().to_string_lossy().to_string();
        let db = Builder::new_local(&path_str).build().await?;
        Self::from_database(db).await
    }

    /// Open an in-memory database (useful for testing)
    pub async fn open_in_memory() -> Result<Self> {
        let db = Builder::new_local(":memory:").build().await?;
        Self::from_database(db).await
    }

    async fn from_database(db: LibSqlDatabase) -> Result<Self> {
        let conn = db.connect()?;
        let database = Self { _db: db, conn };
        database.configure().await?;
        migrations::run(&database.conn).await?;
        Ok(database)
    }

    /// Configure `SQLite` for a single-writer device store
    async fn configure(&self) -> Result<()> {
        self.conn
            .execute("PRAGMA journal_mode = WAL;", ())
            .await
            .ok(); // In-memory databases reject WAL
        self.conn
            .execute("PRAGMA synchronous = NORMAL;", ())
            .await
            .ok();
        self.conn.execute("PRAGMA foreign_keys = ON;", ()).await?;
        Ok(())
    }

    /// Get a reference to the underlying connection
    pub const fn connection(&self) -> &Connection {
        &self.conn
    }
}

/// Start an explicit write transaction.
pub(crate) async fn begin(conn: &Connection) -> Result<()> {
    conn.execute("BEGIN IMMEDIATE", ()).await?;
    Ok(())
}

/// Commit on success, roll back on failure.
pub(crate) async fn finish<T>(conn: &Connection, result: Result<T>) -> Result<T> {
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

pub(crate) fn optional_i64(row: &Row, index: i32) -> Result<Option<i64>> {
    match row.get_value(index)? {
        Value::Null => Ok(None),
        Value::Integer(value) => Ok(Some(value)),
        other => Err(Error::Database(format!(
            "expected integer in column {index}, got {other:?}"
        ))),
    }
}

pub(crate) fn optional_text(row: &Row, index: i32) -> Result<Option<String>> {
    match row.get_value(index)? {
        Value::Null => Ok(None),
        Value::Text(value) => Ok(Some(value)),
        other => Err(Error::Database(format!(
            "expected text in column {index}, got {other:?}"
        ))),
    }
}

pub(crate) fn blob(row: &Row, index: i32) -> Result<Vec<u8>> {
    match row.get_value(index)? {
        Value::Blob(bytes) => Ok(bytes),
        Value::Null => Ok(Vec::new()),
        other => Err(Error::Database(format!(
            "expected blob in column {index}, got {other:?}"
        ))),
    }
}

pub(crate) fn nullable_i64(value: Option<i64>) -> Value {
    value.map_or(Value::Null, Value::Integer)
}

pub(crate) fn nullable_text(value: Option<&str>) -> Value {
    value.map_or(Value::Null, |text| Value::Text(text.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_open_in_memory() {
        let db = Database::open_in_memory().await.unwrap();
        let mut rows = db.connection().query("SELECT 1", ()).await.unwrap();
        let row = rows.next().await.unwrap().unwrap();
        assert_eq!(row.get::<i64>(0).unwrap(), 1);
    }

    #[tokio::test]
    async fn open_creates_missing_parent_directory() {
        let tmp = tempdir().unwrap();
        let db_path = tmp.path().join("nested").join("certsync.db");

        Database::open(&db_path).await.unwrap();
        assert!(db_path.exists());
    }

    #[tokio::test]
    async fn failed_transaction_rolls_back() {
        let db = Database::open_in_memory().await.unwrap();
        let conn = db.connection();

        begin(conn).await.unwrap();
        let result: Result<()> = async {
            conn.execute(
                "INSERT INTO certificates (id, data, last_modified, is_dirty) VALUES ('a', '{}', 1, 1)",
                (),
            )
            .await?;
            Err(Error::InvalidInput("boom".to_string()))
        }
        .await;
        assert!(finish(conn, result).await.is_err());

        let mut rows = conn
            .query("SELECT COUNT(*) FROM certificates", ())
            .await
            .unwrap();
        let row = rows.next().await.unwrap().unwrap();
        assert_eq!(row.get::<i64>(0).unwrap(), 0);
    }
}
