//! Versioned schema for the record store.

use libsql::Connection;

use crate::error::DatabaseError;

struct Migration {
    version: i64,
    name: &'static str,
    sql: &'static str,
}

/// Append only; versions must increase.
static MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        name: "image_records",
        sql: r#"
            CREATE TABLE IF NOT EXISTS image_records (
                partition_key TEXT NOT NULL,
                row_key TEXT NOT NULL UNIQUE,
                captured_at TEXT NOT NULL,
                blob_url TEXT NOT NULL,
                is_processed INTEGER NOT NULL DEFAULT 0,
                contains_wildboar INTEGER,
                confidence_score REAL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                PRIMARY KEY (partition_key, row_key),
                CHECK (
                    (is_processed = 0 AND contains_wildboar IS NULL AND confidence_score IS NULL)
                    OR
                    (is_processed = 1 AND contains_wildboar IS NOT NULL AND confidence_score IS NOT NULL)
                ),
                CHECK (confidence_score IS NULL OR (confidence_score >= 0.0 AND confidence_score <= 1.0))
            );
            CREATE INDEX IF NOT EXISTS idx_image_records_captured_at ON image_records(captured_at);
            CREATE INDEX IF NOT EXISTS idx_image_records_unprocessed
                ON image_records(is_processed, captured_at);
        "#,
    },
];

const LEDGER_DDL: &str = "CREATE TABLE IF NOT EXISTS _migrations (
    version INTEGER PRIMARY KEY,
    name TEXT NOT NULL,
    applied_at TEXT NOT NULL DEFAULT (datetime('now'))
)";

/// Bring the schema up to the latest version.
///
/// Each step's DDL and its ledger row commit together, so an interrupted
/// upgrade resumes at the failed step.
pub async fn run_migrations(conn: &Connection) -> Result<(), DatabaseError> {
    conn.execute(LEDGER_DDL, ())
        .await
        .map_err(|e| DatabaseError::Migration(format!("ledger table: {e}")))?;

    let applied = schema_version(conn).await?;
    let pending: Vec<&Migration> = MIGRATIONS.iter().filter(|m| m.version > applied).collect();
    if pending.is_empty() {
        tracing::debug!(version = applied, "Schema up to date");
        return Ok(());
    }

    for step in pending {
        tracing::info!(version = step.version, name = step.name, "Upgrading schema");
        let tx = conn
            .transaction()
            .await
            .map_err(|e| DatabaseError::Migration(format!("V{} begin: {e}", step.version)))?;
        tx.execute_batch(step.sql)
            .await
            .map_err(|e| DatabaseError::Migration(format!("V{} {}: {e}", step.version, step.name)))?;
        tx.execute(
            "INSERT INTO _migrations (version, name) VALUES (?1, ?2)",
            libsql::params![step.version, step.name],
        )
        .await
        .map_err(|e| DatabaseError::Migration(format!("V{} ledger: {e}", step.version)))?;
        tx.commit()
            .await
            .map_err(|e| DatabaseError::Migration(format!("V{} commit: {e}", step.version)))?;
    }

    Ok(())
}

/// Highest applied version; 0 on a fresh database.
async fn schema_version(conn: &Connection) -> Result<i64, DatabaseError> {
    let mut rows = conn
        .query("SELECT MAX(version) FROM _migrations", ())
        .await
        .map_err(|e| DatabaseError::Migration(format!("schema version: {e}")))?;

    match rows.next().await {
        Ok(Some(row)) => Ok(row.get::<i64>(0).unwrap_or(0)),
        Ok(None) => Ok(0),
        Err(e) => Err(DatabaseError::Migration(format!("schema version: {e}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn test_conn() -> Connection {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .unwrap();
        db.connect().unwrap()
    }

    #[tokio::test]
    async fn fresh_database_has_image_table() {
        let conn = test_conn().await;
        run_migrations(&conn).await.unwrap();

        for table in &["image_records", "_migrations"] {
            let mut rows = conn
                .query(
                    "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name=?1",
                    libsql::params![*table],
                )
                .await
                .unwrap();
            let row = rows.next().await.unwrap().unwrap();
            let count: i64 = row.get(0).unwrap();
            assert_eq!(count, 1, "missing table {table}");
        }
    }

    #[tokio::test]
    async fn rerunning_is_a_no_op() {
        let conn = test_conn().await;
        run_migrations(&conn).await.unwrap();
        run_migrations(&conn).await.unwrap();

        assert_eq!(schema_version(&conn).await.unwrap(), 1);

        let mut rows = conn.query("SELECT COUNT(*) FROM _migrations", ()).await.unwrap();
        let ledger_rows: i64 = rows.next().await.unwrap().unwrap().get(0).unwrap();
        assert_eq!(ledger_rows, 1);
    }

    #[tokio::test]
    async fn half_processed_rows_are_rejected() {
        let conn = test_conn().await;
        run_migrations(&conn).await.unwrap();

        let result = conn
            .execute(
                "INSERT INTO image_records (partition_key, row_key, captured_at, blob_url,
                    is_processed, contains_wildboar, confidence_score, created_at, updated_at)
                 VALUES ('2024-01-02', 'r1', '2024-01-02T10:00:00.000000Z', 'u', 1, 1, NULL, 'x', 'x')",
                (),
            )
            .await;
        assert!(result.is_err());
    }
}
