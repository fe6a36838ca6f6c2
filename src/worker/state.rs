//! Loop state machine and counters.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Cadence state of a processing loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoopState {
    /// The last batch had work; more is probably waiting.
    Draining,
    /// The last poll found nothing (or the store failed).
    Idle,
}

impl LoopState {
    /// State after a batch of `claimed` records.
    pub fn after_batch(claimed: usize) -> Self {
        if claimed > 0 { Self::Draining } else { Self::Idle }
    }
}

impl std::fmt::Display for LoopState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Draining => "draining",
            Self::Idle => "idle",
        };
        write!(f, "{s}")
    }
}

/// Delays between iterations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cadence {
    pub drain_delay: Duration,
    pub idle_delay: Duration,
}

impl Cadence {
    pub fn delay_for(&self, state: LoopState) -> Duration {
        match state {
            LoopState::Draining => self.drain_delay,
            LoopState::Idle => self.idle_delay,
        }
    }
}

/// Cumulative counters for one processing loop.
#[derive(Debug, Default)]
pub struct WorkerStats {
    iterations: AtomicU64,
    claimed: AtomicU64,
    processed: AtomicU64,
    failed_records: AtomicU64,
    aborted_batches: AtomicU64,
}

/// Point-in-time copy of [`WorkerStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub iterations: u64,
    pub claimed: u64,
    pub processed: u64,
    pub failed_records: u64,
    pub aborted_batches: u64,
}

impl WorkerStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_iteration(&self) {
        self.iterations.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_claimed(&self, n: usize) {
        self.claimed.fetch_add(n as u64, Ordering::Relaxed);
    }

    pub(crate) fn record_processed(&self, n: usize) {
        self.processed.fetch_add(n as u64, Ordering::Relaxed);
    }

    pub(crate) fn record_failed(&self, n: usize) {
        self.failed_records.fetch_add(n as u64, Ordering::Relaxed);
    }

    pub(crate) fn record_aborted(&self) {
        self.aborted_batches.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            iterations: self.iterations.load(Ordering::Relaxed),
            claimed: self.claimed.load(Ordering::Relaxed),
            processed: self.processed.load(Ordering::Relaxed),
            failed_records: self.failed_records.load(Ordering::Relaxed),
            aborted_batches: self.aborted_batches.load(Ordering::Relaxed),
        }
    }
}
