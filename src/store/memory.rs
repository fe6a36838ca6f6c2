//! In-memory `WorkStore` for tests and embedding.
//!
//! Implements the same lease protocol as the libSQL backend behind a single
//! async mutex, plus switches for injecting store failures.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::error::DatabaseError;
use crate::store::traits::{Claim, Record, RecordPage, WorkStore, clamp_paging};

#[derive(Debug, Clone)]
struct Row {
    record: Record,
    /// Insertion order; breaks `created_at` ties like SQLite's rowid.
    seq: u64,
    claim_token: Option<Uuid>,
    claimed_until: Option<DateTime<Utc>>,
}

impl Row {
    fn claimable(&self, now: DateTime<Utc>) -> bool {
        self.record.is_pending() && self.claimed_until.is_none_or(|until| until < now)
    }

    fn release(&mut self) {
        self.claim_token = None;
        self.claimed_until = None;
    }
}

#[derive(Debug, Default)]
struct State {
    rows: Vec<Row>,
    next_seq: u64,
}

/// Store backed by a `Vec` behind a mutex.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<State>,
    failing_claims: AtomicUsize,
    failing_commits: AtomicUsize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` calls to `claim_batch` fail.
    pub fn fail_next_claims(&self, n: usize) {
        self.failing_claims.store(n, Ordering::SeqCst);
    }

    /// Make the next `n` calls to `commit` fail without writing anything.
    pub fn fail_next_commits(&self, n: usize) {
        self.failing_commits.store(n, Ordering::SeqCst);
    }

    /// Number of rows currently held by an unexpired claim.
    pub async fn held_count(&self) -> usize {
        let now = Utc::now();
        self.state
            .lock()
            .await
            .rows
            .iter()
            .filter(|r| r.claimed_until.is_some_and(|until| until >= now))
            .count()
    }

    fn take_failure(counter: &AtomicUsize) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl WorkStore for MemoryStore {
    async fn count_pending(&self) -> Result<u64, DatabaseError> {
        let state = self.state.lock().await;
        Ok(state.rows.iter().filter(|r| r.record.is_pending()).count() as u64)
    }

    async fn claim_batch(&self, limit: usize, lease: Duration) -> Result<Claim, DatabaseError> {
        if Self::take_failure(&self.failing_claims) {
            return Err(DatabaseError::Pool("injected claim failure".to_string()));
        }

        let claim_id = Uuid::new_v4();
        let now = Utc::now();
        let lease = chrono::Duration::from_std(lease)
            .map_err(|e| DatabaseError::Query(format!("lease out of range: {e}")))?;
        let expires_at = now + lease;

        let mut state = self.state.lock().await;
        let mut candidates: Vec<&mut Row> =
            state.rows.iter_mut().filter(|r| r.claimable(now)).collect();
        candidates.sort_by_key(|r| (r.record.created_at, r.seq));

        let records = candidates
            .into_iter()
            .take(limit)
            .map(|row| {
                row.claim_token = Some(claim_id);
                row.claimed_until = Some(expires_at);
                row.record.clone()
            })
            .collect();

        Ok(Claim::new(claim_id, records, expires_at))
    }

    async fn commit(&self, claim: &Claim) -> Result<usize, DatabaseError> {
        if claim.is_empty() {
            return Ok(0);
        }
        if Self::take_failure(&self.failing_commits) {
            return Err(DatabaseError::Query("injected commit failure".to_string()));
        }

        let mut state = self.state.lock().await;

        // Validate every write before touching anything.
        for staged in claim.staged() {
            let held = state.rows.iter().any(|r| {
                r.record.id == staged.record_id
                    && r.claim_token == Some(claim.id())
                    && r.record.is_pending()
            });
            if !held {
                return Err(DatabaseError::ClaimLost {
                    claim: claim.id(),
                    record: staged.record_id,
                });
            }
        }

        let now = Utc::now();
        for staged in claim.staged() {
            if let Some(row) = state
                .rows
                .iter_mut()
                .find(|r| r.record.id == staged.record_id)
            {
                row.record.result = Some(staged.result.clone());
                row.record.result_version = Some(staged.version.clone());
                row.record.result_updated_at = Some(now);
            }
        }
        for row in state
            .rows
            .iter_mut()
            .filter(|r| r.claim_token == Some(claim.id()))
        {
            row.release();
        }

        Ok(claim.staged().len())
    }

    async fn abort(&self, claim: &Claim) -> Result<(), DatabaseError> {
        let mut state = self.state.lock().await;
        for row in state
            .rows
            .iter_mut()
            .filter(|r| r.claim_token == Some(claim.id()))
        {
            row.release();
        }
        Ok(())
    }

    async fn release_expired_claims(&self) -> Result<usize, DatabaseError> {
        let now = Utc::now();
        let mut state = self.state.lock().await;
        let mut released = 0;
        for row in state
            .rows
            .iter_mut()
            .filter(|r| r.claim_token.is_some() && r.claimed_until.is_some_and(|u| u < now))
        {
            row.release();
            released += 1;
        }
        Ok(released)
    }

    async fn insert_record_at(
        &self,
        payload: &str,
        created_at: DateTime<Utc>,
    ) -> Result<Uuid, DatabaseError> {
        let id = Uuid::new_v4();
        let mut state = self.state.lock().await;
        let seq = state.next_seq;
        state.next_seq += 1;
        state.rows.push(Row {
            record: Record {
                id,
                payload: payload.to_string(),
                created_at,
                result: None,
                result_version: None,
                result_updated_at: None,
            },
            seq,
            claim_token: None,
            claimed_until: None,
        });
        Ok(id)
    }

    async fn get_record(&self, id: Uuid) -> Result<Option<Record>, DatabaseError> {
        let state = self.state.lock().await;
        Ok(state
            .rows
            .iter()
            .find(|r| r.record.id == id)
            .map(|r| r.record.clone()))
    }

    async fn list_recent(&self, page: u32, page_size: u32) -> Result<RecordPage, DatabaseError> {
        let (page, page_size) = clamp_paging(page, page_size);
        let state = self.state.lock().await;

        let mut rows: Vec<&Row> = state.rows.iter().collect();
        rows.sort_by_key(|r| std::cmp::Reverse((r.record.created_at, r.seq)));

        let records = rows
            .into_iter()
            .skip((page as usize - 1).saturating_mul(page_size as usize))
            .take(page_size as usize)
            .map(|r| r.record.clone())
            .collect();

        Ok(RecordPage {
            page,
            page_size,
            total: state.rows.len() as u64,
            records,
        })
    }
}
