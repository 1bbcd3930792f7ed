//! Blocking-poll execution for sensor tasks.
//!
//! A sensor evaluates a predicate immediately, then again every poll
//! interval, until it holds or the timeout elapses. The runner takes a
//! worker slot only for the duration of each evaluation; between polls the
//! sensor is just a sleeping tokio task.

use crate::error::TaskError;
use crate::orchestration::pool::WorkerPool;
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// How a sensor run ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SensorOutcome {
    /// The predicate held.
    Satisfied { polls: u32 },
    /// The deadline passed with the predicate never holding.
    TimedOut { polls: u32 },
    /// Cancelled at a poll boundary.
    Cancelled,
    /// Too many consecutive predicate errors.
    FailureLimit { failures: u32, last_error: String },
}

/// Drives a predicate on a fixed interval against a deadline.
#[derive(Debug, Clone)]
pub struct SensorRunner {
    pool: WorkerPool,
    max_consecutive_failures: Option<u32>,
}

impl SensorRunner {
    pub fn new(pool: WorkerPool) -> Self {
        Self {
            pool,
            max_consecutive_failures: None,
        }
    }

    /// Give up once `limit` predicate evaluations in a row return an error.
    pub fn with_max_consecutive_failures(mut self, limit: Option<u32>) -> Self {
        self.max_consecutive_failures = limit;
        self
    }

    /// Poll `predicate` every `poll_interval` until it returns `Ok(true)`
    /// or `timeout` has elapsed.
    ///
    /// Predicate errors count as "not yet satisfied". The final sleep is
    /// shortened so the last evaluation happens at the deadline.
    pub async fn run<F, Fut>(
        &self,
        mut predicate: F,
        poll_interval: Duration,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> SensorOutcome
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<bool, TaskError>>,
    {
        let started = Instant::now();
        let mut polls = 0u32;
        let mut failures = 0u32;

        loop {
            if cancel.is_cancelled() {
                return SensorOutcome::Cancelled;
            }

            let result = {
                let _slot = match self.pool.acquire_until(cancel).await {
                    Ok(slot) => slot,
                    Err(_) => return SensorOutcome::Cancelled,
                };
                tokio::select! {
                    result = predicate() => result,
                    _ = cancel.cancelled() => return SensorOutcome::Cancelled,
                }
            };
            polls += 1;

            match result {
                Ok(true) => {
                    debug!(polls, elapsed = ?started.elapsed(), "sensor satisfied");
                    return SensorOutcome::Satisfied { polls };
                }
                Ok(false) => failures = 0,
                Err(e) => {
                    failures += 1;
                    warn!(polls, failures, error = %e, "sensor predicate failed");
                    if let Some(limit) = self.max_consecutive_failures {
                        if failures >= limit {
                            return SensorOutcome::FailureLimit {
                                failures,
                                last_error: e.to_string(),
                            };
                        }
                    }
                }
            }

            let elapsed = started.elapsed();
            if elapsed >= timeout {
                debug!(polls, ?elapsed, "sensor timed out");
                return SensorOutcome::TimedOut { polls };
            }

            let nap = poll_interval.min(timeout - elapsed);
            tokio::select! {
                _ = tokio::time::sleep(nap) => {}
                _ = cancel.cancelled() => return SensorOutcome::Cancelled,
            }
        }
    }
}
