//! Worker system — batch claiming and the processing loop.
//!
//! Core components:
//! - `claimer` — bounded batch claims against a `WorkStore`
//! - `processing_loop` — claim → classify → commit, with adaptive cadence
//! - `pacer` — how the loop waits between iterations
//! - `state` — Draining/Idle state machine and counters

pub mod claimer;
pub mod pacer;
pub mod processing_loop;
pub mod state;

pub use claimer::BatchClaimer;
pub use pacer::{Pacer, SleepPacer};
pub use processing_loop::{IterationOutcome, ProcessingLoop, spawn_processing_loop};
pub use state::{Cadence, LoopState, StatsSnapshot, WorkerStats};
