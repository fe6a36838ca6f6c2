//! Claim → classify → commit loop.
//!
//! Each iteration:
//! 1. Counts Pending records (logged only, never used for control)
//! 2. Claims a bounded batch, oldest first
//! 3. Classifies every record independently, under a per-record timeout
//! 4. Stages each successful result on the claim and commits the claim
//!
//! A record whose classification fails is left out of the commit and goes
//! back to Pending; the rest of its batch is still committed. A failed claim
//! or commit abandons the whole batch, which is retried from scratch on a
//! later poll.
//!
//! After a non-empty batch the loop is Draining and polls again after the
//! short delay; after an empty batch or a store error it is Idle and waits
//! the long delay. Shutdown is only observed between iterations, so an
//! in-flight claim always ends in a commit or an abort.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::classifier::{Classifier, classify_with_timeout};
use crate::config::WorkerConfig;
use crate::store::{Claim, WorkStore};
use crate::worker::claimer::BatchClaimer;
use crate::worker::pacer::Pacer;
use crate::worker::state::{Cadence, LoopState, WorkerStats};

/// What a single iteration did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IterationOutcome {
    /// Pending snapshot taken before claiming; `None` if counting failed.
    pub pending: Option<u64>,
    pub claimed: usize,
    /// Records moved to Done by this iteration's commit.
    pub written: usize,
    /// Records whose classification failed and were left Pending.
    pub failed: usize,
    /// The claim or the commit failed and the batch was abandoned.
    pub aborted: bool,
    /// State the loop is in after this iteration.
    pub state: LoopState,
}

/// One worker's processing loop.
pub struct ProcessingLoop {
    name: String,
    store: Arc<dyn WorkStore>,
    claimer: BatchClaimer,
    classifier: Arc<dyn Classifier>,
    cadence: Cadence,
    classify_timeout: Duration,
    state: LoopState,
    stats: Arc<WorkerStats>,
}

impl ProcessingLoop {
    pub fn new(
        name: impl Into<String>,
        store: Arc<dyn WorkStore>,
        classifier: Arc<dyn Classifier>,
        config: &WorkerConfig,
    ) -> Self {
        Self {
            name: name.into(),
            claimer: BatchClaimer::new(Arc::clone(&store), config.batch_size, config.claim_ttl),
            store,
            classifier,
            cadence: Cadence {
                drain_delay: config.drain_delay,
                idle_delay: config.idle_delay,
            },
            classify_timeout: config.classify_timeout,
            // Nothing is known before the first poll.
            state: LoopState::Idle,
            stats: Arc::new(WorkerStats::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> LoopState {
        self.state
    }

    pub fn stats(&self) -> Arc<WorkerStats> {
        Arc::clone(&self.stats)
    }

    /// Delay to wait before the next iteration, given the current state.
    pub fn next_delay(&self) -> Duration {
        self.cadence.delay_for(self.state)
    }

    /// Run a single claim → classify → commit pass.
    pub async fn run_once(&mut self) -> IterationOutcome {
        self.stats.record_iteration();

        let pending = match self.store.count_pending().await {
            Ok(n) => Some(n),
            Err(e) => {
                warn!(worker = %self.name, error = %e, "Failed to count pending records");
                None
            }
        };

        let mut claim = match self.claimer.claim().await {
            Ok(claim) => claim,
            Err(e) => {
                warn!(worker = %self.name, error = %e, "Claim failed, will retry next poll");
                self.stats.record_aborted();
                return self.finish(IterationOutcome {
                    pending,
                    claimed: 0,
                    written: 0,
                    failed: 0,
                    aborted: true,
                    state: LoopState::Idle,
                });
            }
        };

        if claim.is_empty() {
            debug!(worker = %self.name, pending, "No pending records");
            return self.finish(IterationOutcome {
                pending,
                claimed: 0,
                written: 0,
                failed: 0,
                aborted: false,
                state: LoopState::Idle,
            });
        }

        let claimed = claim.len();
        self.stats.record_claimed(claimed);

        let failed = self.classify_batch(&mut claim).await;
        self.stats.record_failed(failed);

        match self.store.commit(&claim).await {
            Ok(written) => {
                self.stats.record_processed(written);
                info!(
                    worker = %self.name,
                    claim = %claim.id(),
                    pending,
                    claimed,
                    written,
                    failed,
                    "Batch committed"
                );
                self.finish(IterationOutcome {
                    pending,
                    claimed,
                    written,
                    failed,
                    aborted: false,
                    state: LoopState::after_batch(claimed),
                })
            }
            Err(e) => {
                warn!(
                    worker = %self.name,
                    claim = %claim.id(),
                    claimed,
                    error = %e,
                    "Batch commit failed, records stay pending"
                );
                if let Err(release_err) = self.store.abort(&claim).await {
                    warn!(
                        worker = %self.name,
                        claim = %claim.id(),
                        error = %release_err,
                        "Failed to release claim, rows free up when the lease expires"
                    );
                }
                self.stats.record_aborted();
                self.finish(IterationOutcome {
                    pending,
                    claimed,
                    written: 0,
                    failed,
                    aborted: true,
                    state: LoopState::Idle,
                })
            }
        }
    }

    /// Classify every claimed record and stage the successes.
    ///
    /// Returns the number of records left unwritten.
    async fn classify_batch(&self, claim: &mut Claim) -> usize {
        let mut results = Vec::with_capacity(claim.len());
        let mut failed = 0;

        for record in claim.records() {
            match classify_with_timeout(
                self.classifier.as_ref(),
                &record.payload,
                self.classify_timeout,
            )
            .await
            {
                Ok(classification) => results.push((record.id, classification)),
                Err(e) => {
                    warn!(
                        worker = %self.name,
                        record = %record.id,
                        error = %e,
                        "Classification failed, record stays pending"
                    );
                    failed += 1;
                }
            }
        }

        for (id, classification) in results {
            let version = classification.model.clone();
            if let Err(e) = claim.write_result(id, classification, version) {
                warn!(worker = %self.name, record = %id, error = %e, "Failed to stage result");
                failed += 1;
            }
        }

        failed
    }

    fn finish(&mut self, outcome: IterationOutcome) -> IterationOutcome {
        if outcome.state != self.state {
            debug!(worker = %self.name, from = %self.state, to = %outcome.state, "Loop state changed");
        }
        self.state = outcome.state;
        outcome
    }

    /// Run until `shutdown` is raised.
    pub async fn run(mut self, pacer: Arc<dyn Pacer>, shutdown: Arc<AtomicBool>) {
        info!(
            worker = %self.name,
            capacity = self.claimer.capacity(),
            classifier = self.classifier.model(),
            "Processing loop started"
        );

        loop {
            if shutdown.load(Ordering::Acquire) {
                let stats = self.stats.snapshot();
                info!(
                    worker = %self.name,
                    iterations = stats.iterations,
                    processed = stats.processed,
                    "Processing loop shutting down"
                );
                return;
            }

            self.run_once().await;
            pacer.pause(self.next_delay()).await;
        }
    }
}

/// Spawn a processing loop on the tokio runtime.
///
/// Returns a `JoinHandle` and a shutdown flag. Set the flag to stop the loop
/// after its current iteration.
pub fn spawn_processing_loop(
    processing_loop: ProcessingLoop,
    pacer: Arc<dyn Pacer>,
) -> (JoinHandle<()>, Arc<AtomicBool>) {
    let shutdown = Arc::new(AtomicBool::new(false));
    let shutdown_flag = Arc::clone(&shutdown);

    let handle = tokio::spawn(processing_loop.run(pacer, shutdown));

    (handle, shutdown_flag)
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use async_trait::async_trait;
    use chrono::{DateTime, Utc};
    use uuid::Uuid;

    use super::*;
    use crate::classifier::{Classification, LexiconClassifier};
    use crate::error::ClassifierError;
    use crate::store::MemoryStore;

    const DRAIN: Duration = Duration::from_millis(10);
    const IDLE: Duration = Duration::from_millis(50);

    fn test_config(batch_size: usize) -> WorkerConfig {
        WorkerConfig {
            batch_size,
            drain_delay: DRAIN,
            idle_delay: IDLE,
            ..WorkerConfig::default()
        }
    }

    fn at(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(1_760_000_000 + secs, 0).unwrap()
    }

    fn lexicon() -> Arc<dyn Classifier> {
        Arc::new(LexiconClassifier::new())
    }

    /// Fails on any payload containing "poison".
    struct PickyClassifier;

    #[async_trait]
    impl Classifier for PickyClassifier {
        fn model(&self) -> &str {
            "picky-1"
        }

        async fn classify(&self, text: &str) -> Result<Classification, ClassifierError> {
            if text.contains("poison") {
                return Err(ClassifierError::Failed {
                    model: "picky-1".into(),
                    reason: "refused".into(),
                });
            }
            Ok(Classification::from_score(0.5, "picky-1"))
        }
    }

    /// Records delays and raises shutdown after `stop_after` pauses.
    struct ScriptedPacer {
        delays: Mutex<Vec<Duration>>,
        stop_after: usize,
        shutdown: Arc<AtomicBool>,
    }

    #[async_trait]
    impl Pacer for ScriptedPacer {
        async fn pause(&self, delay: Duration) {
            let mut delays = self.delays.lock().unwrap();
            delays.push(delay);
            if delays.len() >= self.stop_after {
                self.shutdown.store(true, Ordering::Release);
            }
        }
    }

    #[tokio::test]
    async fn three_records_limit_two() {
        let store = Arc::new(MemoryStore::new());
        let t1 = store.insert_record_at("good", at(1)).await.unwrap();
        let t2 = store.insert_record_at("bad", at(2)).await.unwrap();
        let t3 = store.insert_record_at("meh", at(3)).await.unwrap();

        let mut lp = ProcessingLoop::new("w0", store.clone(), lexicon(), &test_config(2));

        let first = lp.run_once().await;
        assert_eq!(first.claimed, 2);
        assert_eq!(first.written, 2);
        assert_eq!(first.pending, Some(3));
        assert_eq!(lp.state(), LoopState::Draining);
        assert_eq!(lp.next_delay(), DRAIN);
        assert!(!store.get_record(t1).await.unwrap().unwrap().is_pending());
        assert!(!store.get_record(t2).await.unwrap().unwrap().is_pending());
        assert!(store.get_record(t3).await.unwrap().unwrap().is_pending());

        let second = lp.run_once().await;
        assert_eq!(second.claimed, 1);
        assert!(!store.get_record(t3).await.unwrap().unwrap().is_pending());

        let third = lp.run_once().await;
        assert_eq!(third.claimed, 0);
        assert_eq!(third.pending, Some(0));
        assert_eq!(lp.state(), LoopState::Idle);
        assert_eq!(lp.next_delay(), IDLE);
    }

    #[tokio::test]
    async fn result_version_is_model_id() {
        let store = Arc::new(MemoryStore::new());
        let id = store.insert_record("I love this").await.unwrap();

        let mut lp = ProcessingLoop::new("w0", store.clone(), lexicon(), &test_config(10));
        lp.run_once().await;

        let record = store.get_record(id).await.unwrap().unwrap();
        let result = record.result.unwrap();
        assert_eq!(record.result_version.as_deref(), Some(result.model.as_str()));
        assert_eq!(result.model, "lexicon-0.1");
    }

    #[tokio::test]
    async fn classifier_failure_skips_only_that_record() {
        let store = Arc::new(MemoryStore::new());
        let ok1 = store.insert_record_at("fine", at(1)).await.unwrap();
        let bad = store.insert_record_at("poison pill", at(2)).await.unwrap();
        let ok2 = store.insert_record_at("also fine", at(3)).await.unwrap();

        let mut lp = ProcessingLoop::new("w0", store.clone(), Arc::new(PickyClassifier), &test_config(10));
        let outcome = lp.run_once().await;

        assert_eq!(outcome.claimed, 3);
        assert_eq!(outcome.written, 2);
        assert_eq!(outcome.failed, 1);
        assert!(!outcome.aborted);
        assert!(!store.get_record(ok1).await.unwrap().unwrap().is_pending());
        assert!(!store.get_record(ok2).await.unwrap().unwrap().is_pending());
        assert!(store.get_record(bad).await.unwrap().unwrap().is_pending());

        // The failed record was released, not left locked.
        assert_eq!(store.held_count().await, 0);
        let retry = lp.run_once().await;
        assert_eq!(retry.claimed, 1);
        assert_eq!(retry.failed, 1);
    }

    #[tokio::test]
    async fn commit_failure_aborts_whole_batch() {
        let store = Arc::new(MemoryStore::new());
        let ids = [
            store.insert_record_at("a", at(1)).await.unwrap(),
            store.insert_record_at("b", at(2)).await.unwrap(),
        ];

        let mut lp = ProcessingLoop::new("w0", store.clone(), lexicon(), &test_config(10));
        store.fail_next_commits(1);

        let outcome = lp.run_once().await;
        assert!(outcome.aborted);
        assert_eq!(outcome.written, 0);
        assert_eq!(lp.state(), LoopState::Idle);
        for id in ids {
            assert!(store.get_record(id).await.unwrap().unwrap().is_pending());
        }
        // Claim was released so the retry can pick the rows up immediately.
        assert_eq!(store.held_count().await, 0);

        let retry = lp.run_once().await;
        assert_eq!(retry.written, 2);
        assert_eq!(lp.stats().snapshot().aborted_batches, 1);
    }

    #[tokio::test]
    async fn claim_failure_is_transient() {
        let store = Arc::new(MemoryStore::new());
        store.insert_record("x").await.unwrap();

        let mut lp = ProcessingLoop::new("w0", store.clone(), lexicon(), &test_config(10));
        store.fail_next_claims(1);

        let outcome = lp.run_once().await;
        assert!(outcome.aborted);
        assert_eq!(outcome.state, LoopState::Idle);

        let outcome = lp.run_once().await;
        assert_eq!(outcome.written, 1);
        assert_eq!(outcome.state, LoopState::Draining);
    }

    #[tokio::test]
    async fn run_uses_drain_then_idle_delay() {
        let store = Arc::new(MemoryStore::new());
        for i in 0..3 {
            store.insert_record_at("r", at(i)).await.unwrap();
        }

        let shutdown = Arc::new(AtomicBool::new(false));
        let pacer = Arc::new(ScriptedPacer {
            delays: Mutex::new(Vec::new()),
            stop_after: 4,
            shutdown: Arc::clone(&shutdown),
        });

        let lp = ProcessingLoop::new("w0", store.clone(), lexicon(), &test_config(2));
        let stats = lp.stats();
        lp.run(pacer.clone(), shutdown).await;

        let delays = pacer.delays.lock().unwrap().clone();
        assert_eq!(delays, vec![DRAIN, DRAIN, IDLE, IDLE]);
        assert_eq!(stats.snapshot().processed, 3);
        assert_eq!(stats.snapshot().iterations, 4);
        assert_eq!(store.count_pending().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn shutdown_before_start_does_nothing() {
        let store = Arc::new(MemoryStore::new());
        store.insert_record("x").await.unwrap();

        let shutdown = Arc::new(AtomicBool::new(true));
        let pacer = Arc::new(ScriptedPacer {
            delays: Mutex::new(Vec::new()),
            stop_after: 1,
            shutdown: Arc::clone(&shutdown),
        });

        let lp = ProcessingLoop::new("w0", store.clone(), lexicon(), &test_config(2));
        lp.run(pacer.clone(), shutdown).await;

        assert!(pacer.delays.lock().unwrap().is_empty());
        assert_eq!(store.count_pending().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn spawned_loop_stops_on_flag() {
        let store = Arc::new(MemoryStore::new());
        let id = store.insert_record("great").await.unwrap();

        let config = WorkerConfig {
            drain_delay: Duration::from_millis(1),
            idle_delay: Duration::from_millis(5),
            ..WorkerConfig::default()
        };
        let lp = ProcessingLoop::new(format!("w-{}", Uuid::new_v4()), store.clone(), lexicon(), &config);
        let (handle, shutdown) = spawn_processing_loop(lp, Arc::new(crate::worker::SleepPacer));

        for _ in 0..200 {
            if !store.get_record(id).await.unwrap().unwrap().is_pending() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        shutdown.store(true, Ordering::Release);
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();

        assert!(!store.get_record(id).await.unwrap().unwrap().is_pending());
    }
}
