//! Bounded asynchronous downstream work, joined at commit boundaries.
//!
//! [`AsyncFlushCoordinator`] gates per-record async side effects (remote
//! writes, lookups) behind a fixed permit pool and joins everything
//! outstanding at flush. Permit acquisition is the backpressure mechanism;
//! the flush join is the only point where completion is awaited, bounded by
//! the flush timeout.
//!
//! Failures are captured, not swallowed: the first failure is stored and
//! re-raised on the next [`AsyncFlushCoordinator::add_future`] call or at
//! flush, making async errors fatal to the task. Cancellation is not
//! supported; a timed-out flush leaves the work detached.

use parking_lot::Mutex;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;
use tokio::task::JoinHandle;

use super::OperatorError;

/// Errors surfaced by the flush coordinator.
#[derive(Debug, thiserror::Error)]
pub enum FlushError {
    /// An async unit of work failed; fatal to the task.
    #[error("Async work failed: {0}")]
    AsyncWork(String),

    /// Outstanding work did not complete within the flush timeout.
    #[error("Flush timed out after {timeout:?} with {outstanding} futures outstanding")]
    Timeout {
        /// The configured flush timeout.
        timeout: Duration,
        /// Futures still outstanding when the timeout hit.
        outstanding: usize,
    },
}

/// Tracks outstanding async completions for one stream task.
pub struct AsyncFlushCoordinator {
    semaphore: Arc<Semaphore>,
    max_outstanding: usize,
    flush_timeout: Duration,
    in_flight: Vec<JoinHandle<()>>,
    failure: Arc<Mutex<Option<String>>>,
}

impl AsyncFlushCoordinator {
    /// Creates a coordinator with the given permit pool and flush timeout.
    ///
    /// # Panics
    ///
    /// Panics if `max_outstanding` is zero.
    #[must_use]
    pub fn new(max_outstanding: usize, flush_timeout: Duration) -> Self {
        assert!(max_outstanding > 0, "max_outstanding must be positive");
        Self {
            semaphore: Arc::new(Semaphore::new(max_outstanding)),
            max_outstanding,
            flush_timeout,
            in_flight: Vec::new(),
            failure: Arc::new(Mutex::new(None)),
        }
    }

    /// Submits one unit of async work, waiting for a permit if the pool is
    /// exhausted.
    ///
    /// The permit is released when the future completes, success or
    /// failure. A prior stored failure is re-raised before anything is
    /// submitted.
    ///
    /// # Errors
    ///
    /// Returns `FlushError::AsyncWork` for a previously captured failure.
    pub async fn add_future<F>(&mut self, label: &str, future: F) -> Result<(), FlushError>
    where
        F: Future<Output = Result<(), OperatorError>> + Send + 'static,
    {
        self.raise_if_failed()?;

        let permit = Arc::clone(&self.semaphore)
            .acquire_owned()
            .await
            .map_err(|_| FlushError::AsyncWork("permit pool closed".to_string()))?;
        let failure = Arc::clone(&self.failure);
        let label = label.to_string();

        self.in_flight.push(tokio::spawn(async move {
            if let Err(e) = future.await {
                let mut slot = failure.lock();
                if slot.is_none() {
                    *slot = Some(format!("{label}: {e}"));
                }
            }
            drop(permit);
        }));
        Ok(())
    }

    /// Gauge: futures submitted but not yet complete.
    #[must_use]
    pub fn outstanding(&self) -> usize {
        self.max_outstanding - self.semaphore.available_permits()
    }

    /// Re-raises a captured async failure, if any.
    ///
    /// # Errors
    ///
    /// Returns `FlushError::AsyncWork` with the first captured failure.
    pub fn raise_if_failed(&self) -> Result<(), FlushError> {
        match &*self.failure.lock() {
            Some(message) => Err(FlushError::AsyncWork(message.clone())),
            None => Ok(()),
        }
    }

    /// Joins all outstanding work, bounded by the flush timeout.
    ///
    /// # Errors
    ///
    /// Returns `FlushError::Timeout` if the join exceeds the timeout, and
    /// `FlushError::AsyncWork` if any joined unit failed.
    pub async fn on_flush(&mut self) -> Result<(), FlushError> {
        let handles = std::mem::take(&mut self.in_flight);
        let join_all = async {
            for handle in handles {
                handle
                    .await
                    .map_err(|e| FlushError::AsyncWork(format!("join failed: {e}")))?;
            }
            Ok::<(), FlushError>(())
        };

        match tokio::time::timeout(self.flush_timeout, join_all).await {
            Ok(joined) => joined?,
            Err(_) => {
                return Err(FlushError::Timeout {
                    timeout: self.flush_timeout,
                    outstanding: self.outstanding(),
                })
            }
        }
        self.raise_if_failed()
    }
}
