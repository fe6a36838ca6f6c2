//! Bounded batch claiming.

use std::sync::Arc;
use std::time::Duration;

use crate::config::MAX_BATCH_SIZE;
use crate::error::DatabaseError;
use crate::store::{Claim, WorkStore};

/// Claims at most `capacity` records per call.
///
/// The capacity bounds how long a single claim holds rows and how much the
/// loop keeps in memory. An empty claim is the normal "nothing to do" answer.
#[derive(Clone)]
pub struct BatchClaimer {
    store: Arc<dyn WorkStore>,
    capacity: usize,
    lease: Duration,
}

impl BatchClaimer {
    /// `capacity` is clamped to `1..=MAX_BATCH_SIZE`.
    pub fn new(store: Arc<dyn WorkStore>, capacity: usize, lease: Duration) -> Self {
        Self {
            store,
            capacity: capacity.clamp(1, MAX_BATCH_SIZE),
            lease,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn lease(&self) -> Duration {
        self.lease
    }

    /// Claim the next batch, oldest records first.
    pub async fn claim(&self) -> Result<Claim, DatabaseError> {
        let claim = self.store.claim_batch(self.capacity, self.lease).await?;
        debug_assert!(claim.len() <= self.capacity);
        Ok(claim)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    #[test]
    fn capacity_is_clamped() {
        let store: Arc<dyn WorkStore> = Arc::new(MemoryStore::new());
        assert_eq!(BatchClaimer::new(store.clone(), 0, Duration::from_secs(1)).capacity(), 1);
        assert_eq!(
            BatchClaimer::new(store, 1_000_000, Duration::from_secs(1)).capacity(),
            MAX_BATCH_SIZE
        );
    }

    #[tokio::test]
    async fn empty_store_yields_empty_claim() {
        let store: Arc<dyn WorkStore> = Arc::new(MemoryStore::new());
        let claimer = BatchClaimer::new(store, 10, Duration::from_secs(60));
        let claim = claimer.claim().await.unwrap();
        assert!(claim.is_empty());
    }

    #[tokio::test]
    async fn never_exceeds_capacity() {
        let store = Arc::new(MemoryStore::new());
        for i in 0..7 {
            store.insert_record(&format!("r{i}")).await.unwrap();
        }
        let claimer = BatchClaimer::new(store, 3, Duration::from_secs(60));

        assert_eq!(claimer.claim().await.unwrap().len(), 3);
        assert_eq!(claimer.claim().await.unwrap().len(), 3);
        assert_eq!(claimer.claim().await.unwrap().len(), 1);
        assert!(claimer.claim().await.unwrap().is_empty());
    }
}
