//! Server schema migrations

use libsql::Connection;

use crate::error::AppError;

pub async fn run(conn: &Connection) -> Result<(), AppError> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at INTEGER NOT NULL DEFAULT (CAST(strftime('%s', 'now') AS INTEGER) * 1000)
        )",
        (),
    )
    .await?;

    let mut rows = conn
        .query("SELECT COALESCE(MAX(version), 0) FROM schema_version", ())
        .await?;
    let version = match rows.next().await? {
        Some(row) => row.get::<i64>(0)?,
        None => 0,
    };

    if version < 1 {
        apply(conn, 1, V1).await?;
    }
    Ok(())
}

const V1: &[&str] = &[
    "CREATE TABLE engineers (
        id TEXT PRIMARY KEY,
        subject TEXT NOT NULL UNIQUE,
        created_at INTEGER NOT NULL
    )",
    "CREATE TABLE certificates (
        id TEXT PRIMARY KEY,
        engineer_id TEXT NOT NULL REFERENCES engineers(id),
        fields TEXT NOT NULL DEFAULT '{}',
        overall_assessment TEXT NOT NULL DEFAULT 'SATISFACTORY',
        created_at INTEGER NOT NULL,
        updated_at INTEGER NOT NULL
    )",
    "CREATE INDEX idx_certificates_engineer ON certificates(engineer_id)",
    "CREATE TABLE distribution_boards (
        id TEXT PRIMARY KEY,
        certificate_id TEXT NOT NULL REFERENCES certificates(id) ON DELETE CASCADE,
        db_reference TEXT NOT NULL,
        fields TEXT NOT NULL DEFAULT '{}',
        sort_order INTEGER NOT NULL DEFAULT 0,
        updated_at INTEGER NOT NULL,
        UNIQUE (certificate_id, db_reference)
    )",
    "CREATE TABLE circuits (
        id TEXT PRIMARY KEY,
        certificate_id TEXT NOT NULL REFERENCES certificates(id) ON DELETE CASCADE,
        db_id TEXT REFERENCES distribution_boards(id) ON DELETE SET NULL,
        circuit_number TEXT NOT NULL,
        fields TEXT NOT NULL DEFAULT '{}',
        sort_order INTEGER NOT NULL DEFAULT 0,
        updated_at INTEGER NOT NULL
    )",
    "CREATE INDEX idx_circuits_certificate ON circuits(certificate_id, sort_order)",
    "CREATE TABLE observations (
        id TEXT PRIMARY KEY,
        certificate_id TEXT NOT NULL REFERENCES certificates(id) ON DELETE CASCADE,
        item_number INTEGER,
        observation_text TEXT NOT NULL,
        classification_code TEXT NOT NULL,
        fields TEXT NOT NULL DEFAULT '{}',
        sort_order INTEGER NOT NULL DEFAULT 0,
        updated_at INTEGER NOT NULL
    )",
    "CREATE INDEX idx_observations_certificate ON observations(certificate_id, sort_order)",
];

async fn apply(conn: &Connection, version: i64, statements: &[&str]) -> Result<(), AppError> {
    conn.execute("BEGIN TRANSACTION", ()).await?;

    for stmt in statements {
        if let Err(e) = conn.execute(*stmt, ()).await {
            conn.execute("ROLLBACK", ()).await.ok();
            return Err(e.into());
        }
    }

    if let Err(e) = conn
        .execute(
            "INSERT INTO schema_version (version) VALUES (?)",
            [version],
        )
        .await
    {
        conn.execute("ROLLBACK", ()).await.ok();
        return Err(e.into());
    }

    if let Err(e) = conn.execute("COMMIT", ()).await {
        conn.execute("ROLLBACK", ()).await.ok();
        return Err(e.into());
    }

    tracing::info!("Applied server schema migration v{version}");
    Ok(())
}
