//! Loop pacing.
//!
//! The processing loop never sleeps directly; it asks a [`Pacer`] to wait.
//! Production uses [`SleepPacer`]; tests plug in a pacer that records the
//! requested delays and returns immediately.

use std::time::Duration;

use async_trait::async_trait;

/// Waits between loop iterations.
#[async_trait]
pub trait Pacer: Send + Sync {
    async fn pause(&self, delay: Duration);
}

/// Wall-clock pacer backed by `tokio::time::sleep`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SleepPacer;

#[async_trait]
impl Pacer for SleepPacer {
    async fn pause(&self, delay: Duration) {
        tokio::time::sleep(delay).await;
    }
}
