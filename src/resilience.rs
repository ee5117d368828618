//! Resilience utilities: retry with backoff, and the exclusive backup lock.
//!
//! - [`RetryConfig`]: backoff schedules for an engine that is still starting
//!   and for peers that may not be up yet
//! - [`retry_with_backoff`]: drives an operation through a schedule
//! - [`Bulkhead`]: single-permit semaphore used as the per-node backup lock
//!
//! # Example
//!
//! ```rust,no_run
//! use mysql_sidecar::resilience::Bulkhead;
//!
//! let lock = Bulkhead::exclusive();
//! let first = lock.try_acquire();
//! assert!(first.is_some());
//! assert!(lock.try_acquire().is_none()); // second trigger is rejected
//! drop(first); // lock released
//! ```

use crate::error::{Result, SidecarError};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Exponential backoff schedule.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Attempts in total, the first included.
    pub max_attempts: usize,
    pub initial_delay: Duration,
    /// Ceiling for any single delay.
    pub max_delay: Duration,
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
    /// Retry schedule for engine administration while the engine starts.
    ///
    /// # Backoff Schedule
    ///
    /// ```text
    /// Attempt  Delay     Cumulative
    /// -------  -----     ----------
    /// 1        500ms     500ms
    /// 2        750ms     1.25s
    /// 3        1.12s     2.37s
    /// ...
    /// 20       10s       ~2m (total)
    /// ```
    pub fn engine() -> Self {
        Self {
            max_attempts: 20,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(10),
            backoff_factor: 1.5,
        }
    }

    /// Short schedule for probing a peer during donor discovery.
    pub fn peer_probe() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(2),
            backoff_factor: 2.0,
        }
    }

    /// Millisecond delays, for tests.
    pub fn testing() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(100),
            backoff_factor: 2.0,
        }
    }

    /// Delay after failed attempt `attempt` (1-based).
    pub fn delay_for_attempt(&self, attempt: usize) -> Duration {
        if attempt == 0 {
            return self.initial_delay;
        }

        let multiplier = self.backoff_factor.powi((attempt - 1) as i32);
        let delay_secs = self.initial_delay.as_secs_f64() * multiplier;
        // Large exponents overflow to inf; from_secs_f64 would panic on it.
        if !delay_secs.is_finite() || delay_secs >= self.max_delay.as_secs_f64() {
            return self.max_delay;
        }

        std::cmp::min(Duration::from_secs_f64(delay_secs), self.max_delay)
    }
}

/// Run `f` until it succeeds, fails with a non-retryable error, exhausts
/// `config.max_attempts`, or `cancel` fires.
///
/// Only errors whose [`SidecarError::is_retryable`] is true are retried.
pub async fn retry_with_backoff<F, Fut, T>(
    operation_name: &str,
    config: &RetryConfig,
    cancel: &CancellationToken,
    mut f: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempts = 0;

    loop {
        if cancel.is_cancelled() {
            return Err(SidecarError::Shutdown);
        }
        attempts += 1;
        match f().await {
            Ok(result) => {
                if attempts > 1 {
                    debug!(operation = operation_name, attempts, "Operation succeeded after retry");
                }
                return Ok(result);
            }
            Err(e) if e.is_retryable() && attempts < config.max_attempts => {
                let delay = config.delay_for_attempt(attempts);
                warn!(
                    operation = operation_name,
                    attempts,
                    max_attempts = config.max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Transient failure, retrying"
                );
                crate::metrics::record_retry(operation_name);
                tokio::select! {
                    _ = cancel.cancelled() => return Err(SidecarError::Shutdown),
                    _ = tokio::time::sleep(delay) => {}
                }
            }
            Err(e) => {
                if e.is_retryable() {
                    warn!(operation = operation_name, attempts, "Max retries exceeded");
                }
                return Err(e);
            }
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Backup lock
// ═══════════════════════════════════════════════════════════════════════════════

/// Semaphore-backed limit on concurrent operations.
///
/// The Backup Server uses [`Bulkhead::exclusive`]: the permit is taken when a
/// trigger is accepted and moves into the response body, so it is released
/// when the stream ends, fails, or the client disconnects.
#[derive(Debug, Clone)]
pub struct Bulkhead {
    semaphore: Arc<Semaphore>,
    max_concurrent: usize,
}

impl Bulkhead {
    pub fn exclusive() -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(1)),
            max_concurrent: 1,
        }
    }

    /// `None` when every permit is held.
    pub fn try_acquire(&self) -> Option<OwnedSemaphorePermit> {
        self.semaphore.clone().try_acquire_owned().ok()
    }

    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent
    }

    pub fn is_full(&self) -> bool {
        self.semaphore.available_permits() == 0
    }
}
