//! Version-tracked database migrations for the libSQL backend.
//!
//! Each migration has a version number and SQL. `run_migrations()` checks
//! the current version and applies only the new ones sequentially.

use libsql::{Connection, TransactionBehavior};

use crate::error::DatabaseError;

/// A single migration step.
struct Migration {
    version: i64,
    name: &'static str,
    sql: &'static str,
}

/// All migrations in order. Add new versions to the end.
static MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        name: "records",
        sql: r#"
            CREATE TABLE IF NOT EXISTS records (
                id TEXT PRIMARY KEY,
                payload TEXT NOT NULL,
                created_at TEXT NOT NULL,
                result TEXT,
                result_version TEXT,
                result_updated_at TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_records_pending ON records(result, created_at);
            CREATE INDEX IF NOT EXISTS idx_records_created ON records(created_at);
        "#,
    },
    Migration {
        version: 2,
        name: "claim_leases",
        sql: r#"
            ALTER TABLE records ADD COLUMN claim_token TEXT;
            ALTER TABLE records ADD COLUMN claimed_until TEXT;
            CREATE INDEX IF NOT EXISTS idx_records_claim_token ON records(claim_token);
        "#,
    },
];

/// Run all pending migrations against the given connection.
///
/// Creates the `_migrations` table if it doesn't exist. The version check and
/// every pending step run in one immediate transaction, so connections that
/// open the same fresh file at once apply each migration exactly once.
pub async fn run_migrations(conn: &Connection) -> Result<(), DatabaseError> {
    let tx = conn
        .transaction_with_behavior(TransactionBehavior::Immediate)
        .await
        .map_err(|e| DatabaseError::Migration(format!("Failed to begin migration: {e}")))?;

    let version = match apply_pending(&tx).await {
        Ok(version) => version,
        Err(e) => {
            if let Err(rollback_err) = tx.rollback().await {
                tracing::warn!(error = %rollback_err, "Migration rollback failed");
            }
            return Err(e);
        }
    };

    tx.commit()
        .await
        .map_err(|e| DatabaseError::Migration(format!("Failed to commit migrations: {e}")))?;

    tracing::debug!(version, "Database migrations complete");
    Ok(())
}

/// Apply every migration newer than the recorded version. Returns the new version.
async fn apply_pending(conn: &Connection) -> Result<i64, DatabaseError> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS _migrations (
            version INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        )",
        (),
    )
    .await
    .map_err(|e| DatabaseError::Migration(format!("Failed to create _migrations table: {e}")))?;

    // Read under the write lock: another connection may have just finished.
    let mut current_version = get_current_version(conn).await?;

    for migration in MIGRATIONS {
        if migration.version > current_version {
            tracing::info!(
                version = migration.version,
                name = migration.name,
                "Applying migration"
            );
            conn.execute_batch(migration.sql).await.map_err(|e| {
                DatabaseError::Migration(format!(
                    "Migration V{} ({}) failed: {e}",
                    migration.version, migration.name
                ))
            })?;
            seed_version(conn, migration.version, migration.name).await?;
            current_version = migration.version;
        }
    }

    Ok(current_version)
}

/// Get the highest applied migration version, or 0 if none.
async fn get_current_version(conn: &Connection) -> Result<i64, DatabaseError> {
    let mut rows = conn
        .query("SELECT COALESCE(MAX(version), 0) FROM _migrations", ())
        .await
        .map_err(|e| DatabaseError::Migration(format!("Failed to query migration version: {e}")))?;

    let row = rows
        .next()
        .await
        .map_err(|e| DatabaseError::Migration(format!("Failed to read migration version: {e}")))?;

    match row {
        Some(row) => {
            let version: i64 = row.get(0).map_err(|e| {
                DatabaseError::Migration(format!("Failed to parse migration version: {e}"))
            })?;
            Ok(version)
        }
        None => Ok(0),
    }
}

/// Insert a version record into `_migrations`.
async fn seed_version(conn: &Connection, version: i64, name: &str) -> Result<(), DatabaseError> {
    conn.execute(
        "INSERT OR IGNORE INTO _migrations (version, name) VALUES (?1, ?2)",
        libsql::params![version, name],
    )
    .await
    .map_err(|e| DatabaseError::Migration(format!("Failed to record migration V{version}: {e}")))?;
    Ok(())
}
