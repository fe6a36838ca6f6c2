//! Configuration types.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::error::ConfigError;

/// Upper bound on the batch capacity. Keeps per-claim lock hold time short.
pub const MAX_BATCH_SIZE: usize = 1000;

/// Worker configuration, read once at startup.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Path to the libSQL database file.
    pub db_path: PathBuf,
    /// Maximum number of records claimed per batch.
    pub batch_size: usize,
    /// Delay before the next poll after a non-empty batch.
    pub drain_delay: Duration,
    /// Delay before the next poll after an empty batch or a store error.
    pub idle_delay: Duration,
    /// How long a claim stays valid before another worker may take the rows.
    pub claim_ttl: Duration,
    /// Per-record classifier deadline.
    pub classify_timeout: Duration,
    /// Number of processing loops to run in this process.
    pub concurrency: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("./data/feedback.db"),
            batch_size: 50,
            drain_delay: Duration::from_secs(1),
            idle_delay: Duration::from_secs(5),
            claim_ttl: Duration::from_secs(300), // 5 minutes
            classify_timeout: Duration::from_millis(2000),
            concurrency: 1,
        }
    }
}

impl WorkerConfig {
    /// Load from `FEEDBACK_WORKER_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load from an arbitrary key lookup. Unset keys fall back to defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let db_path = lookup("FEEDBACK_WORKER_DB_PATH")
            .map(PathBuf::from)
            .unwrap_or(defaults.db_path);

        let config = Self {
            db_path,
            batch_size: parse_or(&lookup, "FEEDBACK_WORKER_BATCH_SIZE", defaults.batch_size)?,
            drain_delay: Duration::from_millis(parse_or(
                &lookup,
                "FEEDBACK_WORKER_DRAIN_DELAY_MS",
                defaults.drain_delay.as_millis() as u64,
            )?),
            idle_delay: Duration::from_millis(parse_or(
                &lookup,
                "FEEDBACK_WORKER_IDLE_DELAY_MS",
                defaults.idle_delay.as_millis() as u64,
            )?),
            claim_ttl: Duration::from_secs(parse_or(
                &lookup,
                "FEEDBACK_WORKER_CLAIM_TTL_SECS",
                defaults.claim_ttl.as_secs(),
            )?),
            classify_timeout: Duration::from_millis(parse_or(
                &lookup,
                "FEEDBACK_WORKER_CLASSIFY_TIMEOUT_MS",
                defaults.classify_timeout.as_millis() as u64,
            )?),
            concurrency: parse_or(&lookup, "FEEDBACK_WORKER_CONCURRENCY", defaults.concurrency)?,
        };

        config.validate()?;
        Ok(config)
    }

    /// Check cross-field constraints.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.batch_size == 0 || self.batch_size > MAX_BATCH_SIZE {
            return Err(invalid(
                "FEEDBACK_WORKER_BATCH_SIZE",
                format!("must be between 1 and {MAX_BATCH_SIZE}, got {}", self.batch_size),
            ));
        }
        if self.idle_delay < self.drain_delay {
            return Err(invalid(
                "FEEDBACK_WORKER_IDLE_DELAY_MS",
                format!(
                    "idle delay ({:?}) must not be shorter than drain delay ({:?})",
                    self.idle_delay, self.drain_delay
                ),
            ));
        }
        if self.claim_ttl.is_zero() {
            return Err(invalid("FEEDBACK_WORKER_CLAIM_TTL_SECS", "must be positive".into()));
        }
        if self.classify_timeout.is_zero() {
            return Err(invalid(
                "FEEDBACK_WORKER_CLASSIFY_TIMEOUT_MS",
                "must be positive".into(),
            ));
        }
        // A lease that can expire mid-batch lets another loop take the rows,
        // and the original commit is then thrown away.
        let worst_case_batch = self.classify_timeout.saturating_mul(self.batch_size as u32);
        if self.claim_ttl <= worst_case_batch {
            return Err(invalid(
                "FEEDBACK_WORKER_CLAIM_TTL_SECS",
                format!(
                    "lease ({:?}) must outlast a full batch ({} records x {:?} = {:?})",
                    self.claim_ttl, self.batch_size, self.classify_timeout, worst_case_batch
                ),
            ));
        }
        if self.concurrency == 0 {
            return Err(invalid("FEEDBACK_WORKER_CONCURRENCY", "must be at least 1".into()));
        }
        Ok(())
    }
}

fn parse_or<F, T>(lookup: &F, key: &str, default: T) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|e: T::Err| invalid(key, format!("'{raw}': {e}"))),
        None => Ok(default),
    }
}

fn invalid(key: &str, message: String) -> ConfigError {
    ConfigError::InvalidValue {
        key: key.to_string(),
        message,
    }
}
