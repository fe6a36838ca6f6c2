//! `WorkStore` trait — the claim/commit interface the processing loop talks to.
//!
//! A claim is taken in one atomic step (`claim_batch`), results are staged on
//! the returned [`Claim`] with [`Claim::write_result`], and `commit` publishes
//! every staged result and releases the claim in a single transaction. Any
//! record of the claim that was not written goes back to Pending.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::classifier::Classification;
use crate::error::DatabaseError;

/// Largest page `list_recent` will return.
pub const MAX_PAGE_SIZE: u32 = 50;

/// One unit of work.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Record {
    pub id: Uuid,
    pub payload: String,
    pub created_at: DateTime<Utc>,
    /// `None` while the record is Pending.
    pub result: Option<Classification>,
    pub result_version: Option<String>,
    pub result_updated_at: Option<DateTime<Utc>>,
}

impl Record {
    /// A record is Pending until a result has been committed for it.
    pub fn is_pending(&self) -> bool {
        self.result.is_none()
    }
}

/// A result waiting for its claim to commit.
#[derive(Debug, Clone, PartialEq)]
pub struct StagedResult {
    pub record_id: Uuid,
    pub result: Classification,
    pub version: String,
}

/// An exclusive, time-bounded hold on a batch of Pending records.
///
/// Holding a `Claim` guarantees no other claimer was handed the same rows
/// until `expires_at`. Dropping it without calling `commit` or `abort` is
/// safe: the store releases the rows once the lease runs out.
#[derive(Debug)]
#[must_use = "a claim must be committed or aborted"]
pub struct Claim {
    id: Uuid,
    records: Vec<Record>,
    expires_at: DateTime<Utc>,
    staged: Vec<StagedResult>,
}

impl Claim {
    pub fn new(id: Uuid, records: Vec<Record>, expires_at: DateTime<Utc>) -> Self {
        Self {
            id,
            records,
            expires_at,
            staged: Vec::new(),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Claimed records, oldest `created_at` first.
    pub fn records(&self) -> &[Record] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn expires_at(&self) -> DateTime<Utc> {
        self.expires_at
    }

    pub fn staged(&self) -> &[StagedResult] {
        &self.staged
    }

    /// Stage a result for one of this claim's records.
    ///
    /// Nothing is visible to other readers until the claim commits. Writing
    /// the same record twice keeps the last result.
    pub fn write_result(
        &mut self,
        record_id: Uuid,
        result: Classification,
        version: impl Into<String>,
    ) -> Result<(), DatabaseError> {
        if !self.records.iter().any(|r| r.id == record_id) {
            return Err(DatabaseError::NotFound {
                entity: format!("record in claim {}", self.id),
                id: record_id.to_string(),
            });
        }

        let staged = StagedResult {
            record_id,
            result,
            version: version.into(),
        };
        match self.staged.iter_mut().find(|s| s.record_id == record_id) {
            Some(existing) => *existing = staged,
            None => self.staged.push(staged),
        }
        Ok(())
    }
}

/// One page of records, newest first.
#[derive(Debug, Clone, Serialize)]
pub struct RecordPage {
    pub page: u32,
    pub page_size: u32,
    pub total: u64,
    pub records: Vec<Record>,
}

/// Clamp user-supplied paging to `page >= 1` and `1..=MAX_PAGE_SIZE`.
pub fn clamp_paging(page: u32, page_size: u32) -> (u32, u32) {
    (page.max(1), page_size.clamp(1, MAX_PAGE_SIZE))
}

/// Backend-agnostic store for the records table.
#[async_trait]
pub trait WorkStore: Send + Sync {
    // ── Claim protocol ──────────────────────────────────────────────

    /// Number of Pending records right now. A racy snapshot, for logging only.
    async fn count_pending(&self) -> Result<u64, DatabaseError>;

    /// Claim up to `limit` Pending records that nobody else holds, oldest
    /// first. Rows held by another live claim are skipped, never waited on.
    /// Returns an empty claim when there is nothing to do.
    async fn claim_batch(&self, limit: usize, lease: Duration) -> Result<Claim, DatabaseError>;

    /// Atomically write every staged result and release the claim.
    ///
    /// All or nothing: on error no record of the claim has changed.
    /// Returns the number of records that moved to Done.
    async fn commit(&self, claim: &Claim) -> Result<usize, DatabaseError>;

    /// Release the claim without writing anything.
    async fn abort(&self, claim: &Claim) -> Result<(), DatabaseError>;

    /// Clear leases whose deadline has passed. Returns how many were cleared.
    async fn release_expired_claims(&self) -> Result<usize, DatabaseError>;

    // ── Producer / read side ────────────────────────────────────────

    /// Insert a new Pending record stamped with the current time.
    async fn insert_record(&self, payload: &str) -> Result<Uuid, DatabaseError> {
        self.insert_record_at(payload, Utc::now()).await
    }

    /// Insert a new Pending record with an explicit `created_at`.
    async fn insert_record_at(
        &self,
        payload: &str,
        created_at: DateTime<Utc>,
    ) -> Result<Uuid, DatabaseError>;

    async fn get_record(&self, id: Uuid) -> Result<Option<Record>, DatabaseError>;

    /// Newest-first listing with a total count. Paging is clamped.
    async fn list_recent(&self, page: u32, page_size: u32) -> Result<RecordPage, DatabaseError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pending(payload: &str) -> Record {
        Record {
            id: Uuid::new_v4(),
            payload: payload.to_string(),
            created_at: Utc::now(),
            result: None,
            result_version: None,
            result_updated_at: None,
        }
    }

    #[test]
    fn write_result_rejects_foreign_record() {
        let mut claim = Claim::new(Uuid::new_v4(), vec![pending("a")], Utc::now());
        let err = claim
            .write_result(Uuid::new_v4(), Classification::neutral("m"), "m")
            .unwrap_err();
        assert!(matches!(err, DatabaseError::NotFound { .. }));
        assert!(claim.staged().is_empty());
    }

    #[test]
    fn write_result_overwrites_same_record() {
        let record = pending("a");
        let id = record.id;
        let mut claim = Claim::new(Uuid::new_v4(), vec![record], Utc::now());

        claim
            .write_result(id, Classification::from_score(0.5, "m1"), "m1")
            .unwrap();
        claim
            .write_result(id, Classification::from_score(-0.5, "m2"), "m2")
            .unwrap();

        assert_eq!(claim.staged().len(), 1);
        assert_eq!(claim.staged()[0].version, "m2");
    }

    #[test]
    fn paging_is_clamped() {
        assert_eq!(clamp_paging(0, 0), (1, 1));
        assert_eq!(clamp_paging(3, 500), (3, MAX_PAGE_SIZE));
        assert_eq!(clamp_paging(2, 10), (2, 10));
    }
}
