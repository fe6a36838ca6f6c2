//! libSQL backend — async `WorkStore` implementation.
//!
//! SQLite has no `SELECT ... FOR UPDATE SKIP LOCKED`, so claims are leases:
//! inside one immediate write transaction the oldest unclaimed Pending rows
//! are stamped with a `claim_token` and a `claimed_until` deadline. Other
//! claimers see the stamp and move past those rows. Commit is a
//! compare-and-swap on the token, so a claim whose lease was taken over by
//! someone else can never publish.
//!
//! All timestamps are written as fixed-width RFC 3339 UTC strings, which keeps
//! string comparison in SQL equal to chronological comparison.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use libsql::{Connection, Database as LibSqlDatabase, Transaction, TransactionBehavior, params};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::classifier::Classification;
use crate::error::DatabaseError;
use crate::store::migrations;
use crate::store::traits::{Claim, Record, RecordPage, WorkStore, clamp_paging};

/// How long a statement waits on another connection's write lock.
const BUSY_TIMEOUT_MS: u64 = 5_000;

/// libSQL database backend.
///
/// Owns a single connection. Every operation takes `lock` first so that a
/// claim or commit transaction never interleaves with other statements on
/// the same connection. Run one backend per processing loop to get real
/// parallelism between loops.
pub struct LibSqlBackend {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
    lock: Mutex<()>,
}

impl LibSqlBackend {
    /// Open (or create) a local database file and run migrations.
    ///
    /// Safe to call from several processes or threads against the same fresh
    /// file. The returned future is not `Send`: open stores on the task that
    /// will hand them out, then spawn the loops that use them.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Pool(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {e}")))?;

        let backend = Self::from_database(db, true).await?;
        info!(path = %path.display(), "Database opened");
        Ok(backend)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Pool(format!("Failed to create in-memory database: {e}"))
            })?;

        Self::from_database(db, false).await
    }

    async fn from_database(db: LibSqlDatabase, wal: bool) -> Result<Self, DatabaseError> {
        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        let backend = Self {
            db: Arc::new(db),
            conn,
            lock: Mutex::new(()),
        };
        backend
            .pragma(&format!("PRAGMA busy_timeout = {BUSY_TIMEOUT_MS}"))
            .await?;
        if wal {
            backend.pragma("PRAGMA journal_mode = WAL").await?;
        }
        migrations::run_migrations(&backend.conn).await?;
        Ok(backend)
    }

    /// Run a PRAGMA that may return a row.
    async fn pragma(&self, sql: &str) -> Result<(), DatabaseError> {
        let mut rows = self
            .conn
            .query(sql, ())
            .await
            .map_err(|e| DatabaseError::Pool(format!("{sql}: {e}")))?;
        while rows
            .next()
            .await
            .map_err(|e| DatabaseError::Pool(format!("{sql}: {e}")))?
            .is_some()
        {}
        Ok(())
    }

    async fn begin_immediate(&self) -> Result<Transaction, DatabaseError> {
        self.conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .await
            .map_err(|e| DatabaseError::Query(format!("begin transaction: {e}")))
    }
}

// ── Helper functions ────────────────────────────────────────────────

/// Canonical timestamp format: RFC 3339, UTC, microseconds, `Z` suffix.
fn format_datetime(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Parse an RFC 3339 or SQLite datetime string into DateTime<Utc>.
fn parse_datetime(s: &str) -> DateTime<Utc> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return dt.with_timezone(&Utc);
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
        return ndt.and_utc();
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
        return ndt.and_utc();
    }
    DateTime::<Utc>::MIN_UTC
}

fn lease_deadline(now: DateTime<Utc>, lease: Duration) -> Result<DateTime<Utc>, DatabaseError> {
    let lease = chrono::Duration::from_std(lease)
        .map_err(|e| DatabaseError::Query(format!("lease out of range: {e}")))?;
    now.checked_add_signed(lease)
        .ok_or_else(|| DatabaseError::Query("lease deadline overflows".to_string()))
}

/// Map a libsql Row to a Record.
///
/// Column order matches RECORD_COLUMNS:
/// 0:id, 1:payload, 2:created_at, 3:result, 4:result_version, 5:result_updated_at
fn row_to_record(row: &libsql::Row) -> Result<Record, DatabaseError> {
    let id_str: String = row
        .get(0)
        .map_err(|e| DatabaseError::Serialization(format!("record id: {e}")))?;
    let id = Uuid::parse_str(&id_str)
        .map_err(|e| DatabaseError::Serialization(format!("record id '{id_str}': {e}")))?;
    let payload: String = row
        .get(1)
        .map_err(|e| DatabaseError::Serialization(format!("record {id} payload: {e}")))?;
    let created_str: String = row
        .get(2)
        .map_err(|e| DatabaseError::Serialization(format!("record {id} created_at: {e}")))?;

    let result = match optional_text(row, 3, id, "result")? {
        Some(json) => Some(serde_json::from_str::<Classification>(&json).map_err(|e| {
            DatabaseError::Serialization(format!("record {id} result: {e}"))
        })?),
        None => None,
    };
    let result_version = optional_text(row, 4, id, "result_version")?;
    let result_updated_at =
        optional_text(row, 5, id, "result_updated_at")?.map(|s| parse_datetime(&s));

    Ok(Record {
        id,
        payload,
        created_at: parse_datetime(&created_str),
        result,
        result_version,
        result_updated_at,
    })
}

/// Read a nullable TEXT column. Only SQL NULL maps to `None`.
fn optional_text(
    row: &libsql::Row,
    idx: i32,
    id: Uuid,
    column: &str,
) -> Result<Option<String>, DatabaseError> {
    match row
        .get_value(idx)
        .map_err(|e| DatabaseError::Serialization(format!("record {id} {column}: {e}")))?
    {
        libsql::Value::Null => Ok(None),
        libsql::Value::Text(s) => Ok(Some(s)),
        other => Err(DatabaseError::Serialization(format!(
            "record {id} {column}: expected text, got {other:?}"
        ))),
    }
}

async fn collect_records(mut rows: libsql::Rows) -> Result<Vec<Record>, DatabaseError> {
    let mut records = Vec::new();
    while let Some(row) = rows
        .next()
        .await
        .map_err(|e| DatabaseError::Query(format!("read row: {e}")))?
    {
        records.push(row_to_record(&row)?);
    }
    Ok(records)
}

async fn query_count(conn: &Connection, sql: &str) -> Result<u64, DatabaseError> {
    let mut rows = conn
        .query(sql, ())
        .await
        .map_err(|e| DatabaseError::Query(format!("{sql}: {e}")))?;
    let count: i64 = match rows
        .next()
        .await
        .map_err(|e| DatabaseError::Query(format!("{sql}: {e}")))?
    {
        Some(row) => row.get(0).unwrap_or(0),
        None => 0,
    };
    Ok(count.max(0) as u64)
}

async fn rollback_quietly(tx: Transaction, claim_id: Uuid) {
    if let Err(e) = tx.rollback().await {
        warn!(claim = %claim_id, error = %e, "Rollback failed");
    }
}

const RECORD_COLUMNS: &str = "id, payload, created_at, result, result_version, result_updated_at";

/// Stamp the oldest unclaimed Pending rows with `claim_id` and read them back.
async fn claim_in_tx(
    conn: &Connection,
    claim_id: Uuid,
    now: DateTime<Utc>,
    expires_at: DateTime<Utc>,
    limit: usize,
) -> Result<Vec<Record>, DatabaseError> {
    let token = claim_id.to_string();

    conn.execute(
        "UPDATE records SET claim_token = ?1, claimed_until = ?2
         WHERE id IN (
             SELECT id FROM records
             WHERE result IS NULL
               AND (claimed_until IS NULL OR claimed_until < ?3)
             ORDER BY created_at ASC, rowid ASC
             LIMIT ?4
         )",
        params![
            token.clone(),
            format_datetime(expires_at),
            format_datetime(now),
            limit as i64
        ],
    )
    .await
    .map_err(|e| DatabaseError::Query(format!("claim_batch: {e}")))?;

    let rows = conn
        .query(
            &format!(
                "SELECT {RECORD_COLUMNS} FROM records WHERE claim_token = ?1
                 ORDER BY created_at ASC, rowid ASC"
            ),
            params![token],
        )
        .await
        .map_err(|e| DatabaseError::Query(format!("claim_batch read-back: {e}")))?;

    collect_records(rows).await
}

/// Apply every staged result with a token check, then release the rest.
async fn commit_in_tx(conn: &Connection, claim: &Claim) -> Result<usize, DatabaseError> {
    let token = claim.id().to_string();
    let now = format_datetime(Utc::now());

    for staged in claim.staged() {
        let json = serde_json::to_string(&staged.result)
            .map_err(|e| DatabaseError::Serialization(format!("result: {e}")))?;

        let updated = conn
            .execute(
                "UPDATE records
                 SET result = ?1, result_version = ?2, result_updated_at = ?3,
                     claim_token = NULL, claimed_until = NULL
                 WHERE id = ?4 AND claim_token = ?5 AND result IS NULL",
                params![
                    json,
                    staged.version.clone(),
                    now.clone(),
                    staged.record_id.to_string(),
                    token.clone()
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("write_result: {e}")))?;

        if updated == 0 {
            return Err(DatabaseError::ClaimLost {
                claim: claim.id(),
                record: staged.record_id,
            });
        }
    }

    // Records the caller did not write go straight back to Pending.
    conn.execute(
        "UPDATE records SET claim_token = NULL, claimed_until = NULL WHERE claim_token = ?1",
        params![token],
    )
    .await
    .map_err(|e| DatabaseError::Query(format!("release claim: {e}")))?;

    Ok(claim.staged().len())
}

// ── Trait implementation ────────────────────────────────────────────

#[async_trait]
impl WorkStore for LibSqlBackend {
    async fn count_pending(&self) -> Result<u64, DatabaseError> {
        let _guard = self.lock.lock().await;
        query_count(&self.conn, "SELECT COUNT(*) FROM records WHERE result IS NULL").await
    }

    async fn claim_batch(&self, limit: usize, lease: Duration) -> Result<Claim, DatabaseError> {
        let claim_id = Uuid::new_v4();
        let now = Utc::now();
        let expires_at = lease_deadline(now, lease)?;
        if limit == 0 {
            return Ok(Claim::new(claim_id, Vec::new(), expires_at));
        }

        let _guard = self.lock.lock().await;
        let tx = self.begin_immediate().await?;
        match claim_in_tx(&tx, claim_id, now, expires_at, limit).await {
            Ok(records) => {
                tx.commit()
                    .await
                    .map_err(|e| DatabaseError::Query(format!("commit claim: {e}")))?;
                if !records.is_empty() {
                    debug!(claim = %claim_id, claimed = records.len(), "Claimed batch");
                }
                Ok(Claim::new(claim_id, records, expires_at))
            }
            Err(e) => {
                rollback_quietly(tx, claim_id).await;
                Err(e)
            }
        }
    }

    async fn commit(&self, claim: &Claim) -> Result<usize, DatabaseError> {
        if claim.is_empty() {
            return Ok(0);
        }

        let _guard = self.lock.lock().await;
        let tx = self.begin_immediate().await?;
        match commit_in_tx(&tx, claim).await {
            Ok(written) => {
                tx.commit()
                    .await
                    .map_err(|e| DatabaseError::Query(format!("commit results: {e}")))?;
                debug!(claim = %claim.id(), written, "Committed batch");
                Ok(written)
            }
            Err(e) => {
                rollback_quietly(tx, claim.id()).await;
                Err(e)
            }
        }
    }

    async fn abort(&self, claim: &Claim) -> Result<(), DatabaseError> {
        if claim.is_empty() {
            return Ok(());
        }

        let _guard = self.lock.lock().await;
        let released = self
            .conn
            .execute(
                "UPDATE records SET claim_token = NULL, claimed_until = NULL WHERE claim_token = ?1",
                params![claim.id().to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("abort claim: {e}")))?;
        debug!(claim = %claim.id(), released, "Aborted claim");
        Ok(())
    }

    async fn release_expired_claims(&self) -> Result<usize, DatabaseError> {
        let _guard = self.lock.lock().await;
        let released = self
            .conn
            .execute(
                "UPDATE records SET claim_token = NULL, claimed_until = NULL
                 WHERE claim_token IS NOT NULL AND claimed_until < ?1",
                params![format_datetime(Utc::now())],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("release_expired_claims: {e}")))?;
        Ok(released as usize)
    }

    async fn insert_record_at(
        &self,
        payload: &str,
        created_at: DateTime<Utc>,
    ) -> Result<Uuid, DatabaseError> {
        let id = Uuid::new_v4();
        let _guard = self.lock.lock().await;
        self.conn
            .execute(
                "INSERT INTO records (id, payload, created_at) VALUES (?1, ?2, ?3)",
                params![id.to_string(), payload, format_datetime(created_at)],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("insert_record: {e}")))?;

        debug!(id = %id, "Record inserted into DB");
        Ok(id)
    }

    async fn get_record(&self, id: Uuid) -> Result<Option<Record>, DatabaseError> {
        let _guard = self.lock.lock().await;
        let rows = self
            .conn
            .query(
                &format!("SELECT {RECORD_COLUMNS} FROM records WHERE id = ?1"),
                params![id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_record: {e}")))?;

        Ok(collect_records(rows).await?.into_iter().next())
    }

    async fn list_recent(&self, page: u32, page_size: u32) -> Result<RecordPage, DatabaseError> {
        let (page, page_size) = clamp_paging(page, page_size);
        let offset = (page as i64 - 1) * page_size as i64;

        let _guard = self.lock.lock().await;
        let total = query_count(&self.conn, "SELECT COUNT(*) FROM records").await?;

        let rows = self
            .conn
            .query(
                &format!(
                    "SELECT {RECORD_COLUMNS} FROM records
                     ORDER BY created_at DESC, rowid DESC
                     LIMIT ?1 OFFSET ?2"
                ),
                params![page_size as i64, offset],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_recent: {e}")))?;

        let records = collect_records(rows).await?;

        Ok(RecordPage {
            page,
            page_size,
            total,
            records,
        })
    }
}
