//! Resilience utilities: retry backoff and per-call timeouts.
//!
//! - [`RetryConfig`]: exponential backoff for transient ledger contention
//! - [`with_timeout`]: bound a collaborator call by its configured timeout
//!
//! # Example
//!
//! ```rust,no_run
//! # async fn example() -> relay_replicator::Result<()> {
//! use relay_replicator::resilience::with_timeout;
//! use std::time::Duration;
//!
//! let rows = with_timeout("capture_changes", Duration::from_secs(30), async {
//!     Ok::<u64, relay_replicator::ReplicationError>(42)
//! })
//! .await?;
//! # Ok(())
//! # }
//! ```

use crate::error::{ReplicationError, Result};
use std::future::Future;
use std::time::Duration;

/// Configuration for retry behavior.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of attempts, including the first.
    pub max_attempts: usize,

    /// Initial delay before first retry.
    pub initial_delay: Duration,

    /// Maximum delay between retries (ceiling for exponential backoff).
    pub max_delay: Duration,

    /// Backoff multiplier (e.g., 2.0 = double delay each retry).
    pub backoff_factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            backoff_factor: 2.0,
        }
    }
}

impl RetryConfig {
    /// Retry schedule for SQLITE_BUSY / SQLITE_LOCKED on the ledger.
    ///
    /// ```text
    /// Attempt  Delay
    /// -------  -----
    /// 1        10ms
    /// 2        20ms
    /// 3        40ms
    /// 4        80ms
    /// 5        give up
    /// ```
    pub fn ledger() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(500),
            backoff_factor: 2.0,
        }
    }

    /// Fast-fail retry for tests.
    pub fn testing() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(10),
            backoff_factor: 2.0,
        }
    }

    /// Calculate delay for a given attempt number (1-indexed).
    pub fn delay_for_attempt(&self, attempt: usize) -> Duration {
        if attempt == 0 {
            return self.initial_delay;
        }

        let multiplier = self.backoff_factor.powi((attempt - 1) as i32);
        let delay_secs = self.initial_delay.as_secs_f64() * multiplier;
        let delay = Duration::from_secs_f64(delay_secs);

        std::cmp::min(delay, self.max_delay)
    }
}

/// Run `fut`, failing with [`ReplicationError::Timeout`] once `timeout` elapses.
///
/// The inner future is dropped on timeout; the caller must not persist the
/// stage bit of the stage it was running.
pub async fn with_timeout<T, F>(operation: &str, timeout: Duration, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout(timeout, fut).await {
        Ok(result) => result,
        Err(_) => {
            tracing::warn!(operation, timeout_ms = timeout.as_millis() as u64, "Operation timed out");
            Err(ReplicationError::Timeout {
                operation: operation.to_string(),
                timeout,
            })
        }
    }
}
