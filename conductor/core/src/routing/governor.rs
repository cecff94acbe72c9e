//! Concurrency Governor
//!
//! Bounds the number of provider calls in flight across the whole process.
//! Calls over the bound wait in FIFO order (tokio's semaphore is fair).
//!
//! Deadlines are measured from when the caller asked to run, not from when a
//! slot was granted. A call whose deadline passes while queued fails with
//! [`GovernorError::QueueTimeout`] and its work is never started; a call
//! that gets a slot only runs for whatever budget is left.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::time::Instant;

/// Governor configuration
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GovernorConfig {
    /// Maximum concurrent provider calls
    pub max_in_flight: usize,
    /// Default per-call budget
    pub call_timeout: Duration,
}

impl Default for GovernorConfig {
    fn default() -> Self {
        Self {
            max_in_flight: 4,
            call_timeout: Duration::from_secs(30),
        }
    }
}

/// Governor failures
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum GovernorError {
    /// Deadline passed before a slot was granted; the work never ran
    #[error("deadline expired after {}ms in queue", .waited.as_millis())]
    QueueTimeout {
        /// Time spent waiting
        waited: Duration,
    },

    /// The work ran past the deadline and was cancelled
    #[error("call cancelled after {}ms", .elapsed.as_millis())]
    Timeout {
        /// Time spent running
        elapsed: Duration,
    },

    /// The governor was closed
    #[error("governor closed")]
    Closed,
}

/// Governor statistics snapshot
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct GovernorStats {
    /// Configured bound
    pub max_in_flight: usize,
    /// Calls currently running
    pub in_flight: u64,
    /// Calls currently waiting for a slot
    pub queued: u64,
    /// Highest concurrent in-flight count seen
    pub peak_in_flight: u64,
    /// Calls that finished within their deadline
    pub completed: u64,
    /// Calls cancelled at their deadline
    pub timeouts: u64,
    /// Calls whose deadline passed before they got a slot
    pub queue_timeouts: u64,
    /// Total time spent queued, in milliseconds
    pub total_wait_ms: u64,
}

#[derive(Default)]
struct StatsAtomic {
    in_flight: AtomicU64,
    queued: AtomicU64,
    peak_in_flight: AtomicU64,
    completed: AtomicU64,
    timeouts: AtomicU64,
    queue_timeouts: AtomicU64,
    total_wait_ms: AtomicU64,
}

/// Increments a gauge for as long as it lives; cancellation-safe
struct GaugeGuard<'a> {
    gauge: &'a AtomicU64,
}

impl<'a> GaugeGuard<'a> {
    fn enter(gauge: &'a AtomicU64) -> (Self, u64) {
        let now = gauge.fetch_add(1, Ordering::AcqRel) + 1;
        (Self { gauge }, now)
    }
}

impl Drop for GaugeGuard<'_> {
    fn drop(&mut self) {
        self.gauge.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Process-wide bound on concurrent provider calls
pub struct ConcurrencyGovernor {
    semaphore: Semaphore,
    config: GovernorConfig,
    stats: StatsAtomic,
}

impl ConcurrencyGovernor {
    /// Create a governor
    ///
    /// A `max_in_flight` of zero is raised to one.
    #[must_use]
    pub fn new(config: GovernorConfig) -> Self {
        let config = GovernorConfig {
            max_in_flight: config.max_in_flight.max(1),
            ..config
        };
        Self {
            semaphore: Semaphore::new(config.max_in_flight),
            config,
            stats: StatsAtomic::default(),
        }
    }

    /// Default per-call budget
    pub fn call_timeout(&self) -> Duration {
        self.config.call_timeout
    }

    /// Run `work` within `timeout` of now
    ///
    /// # Errors
    ///
    /// See [`run_until`](Self::run_until).
    pub async fn run<F, Fut, T>(&self, timeout: Duration, work: F) -> Result<T, GovernorError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        self.run_until(Instant::now() + timeout, work).await
    }

    /// Run `work` once a slot is free, cancelling it at `deadline`
    ///
    /// `work` is only called after a slot has been granted.
    ///
    /// # Errors
    ///
    /// - [`GovernorError::QueueTimeout`] if the deadline passes first
    /// - [`GovernorError::Timeout`] if the work runs past the deadline
    /// - [`GovernorError::Closed`] after [`close`](Self::close)
    pub async fn run_until<F, Fut, T>(&self, deadline: Instant, work: F) -> Result<T, GovernorError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let requested_at = Instant::now();
        if requested_at >= deadline {
            self.stats.queue_timeouts.fetch_add(1, Ordering::Relaxed);
            return Err(GovernorError::QueueTimeout {
                waited: Duration::ZERO,
            });
        }

        let permit = {
            let _queued = GaugeGuard::enter(&self.stats.queued);
            match tokio::time::timeout_at(deadline, self.semaphore.acquire()).await {
                Ok(Ok(permit)) => permit,
                Ok(Err(_)) => return Err(GovernorError::Closed),
                Err(_) => {
                    let waited = requested_at.elapsed();
                    self.record_wait(waited);
                    self.stats.queue_timeouts.fetch_add(1, Ordering::Relaxed);
                    tracing::debug!(
                        waited_ms = waited.as_millis() as u64,
                        "Deadline expired while queued"
                    );
                    return Err(GovernorError::QueueTimeout { waited });
                }
            }
        };

        let waited = requested_at.elapsed();
        self.record_wait(waited);
        if Instant::now() >= deadline {
            drop(permit);
            self.stats.queue_timeouts.fetch_add(1, Ordering::Relaxed);
            return Err(GovernorError::QueueTimeout { waited });
        }

        let (_running, now_in_flight) = GaugeGuard::enter(&self.stats.in_flight);
        self.stats
            .peak_in_flight
            .fetch_max(now_in_flight, Ordering::Relaxed);

        let started = Instant::now();
        let outcome = tokio::time::timeout_at(deadline, work()).await;
        drop(permit);

        match outcome {
            Ok(value) => {
                self.stats.completed.fetch_add(1, Ordering::Relaxed);
                Ok(value)
            }
            Err(_) => {
                self.stats.timeouts.fetch_add(1, Ordering::Relaxed);
                Err(GovernorError::Timeout {
                    elapsed: started.elapsed(),
                })
            }
        }
    }

    fn record_wait(&self, waited: Duration) {
        self.stats
            .total_wait_ms
            .fetch_add(waited.as_millis() as u64, Ordering::Relaxed);
    }

    /// Free slots right now
    pub fn available_slots(&self) -> usize {
        self.semaphore.available_permits()
    }

    /// Stop granting slots; queued and future calls fail with `Closed`
    pub fn close(&self) {
        self.semaphore.close();
    }

    /// Statistics snapshot
    pub fn stats(&self) -> GovernorStats {
        GovernorStats {
            max_in_flight: self.config.max_in_flight,
            in_flight: self.stats.in_flight.load(Ordering::Relaxed),
            queued: self.stats.queued.load(Ordering::Relaxed),
            peak_in_flight: self.stats.peak_in_flight.load(Ordering::Relaxed),
            completed: self.stats.completed.load(Ordering::Relaxed),
            timeouts: self.stats.timeouts.load(Ordering::Relaxed),
            queue_timeouts: self.stats.queue_timeouts.load(Ordering::Relaxed),
            total_wait_ms: self.stats.total_wait_ms.load(Ordering::Relaxed),
        }
    }
}

impl Default for ConcurrencyGovernor {
    fn default() -> Self {
        Self::new(GovernorConfig::default())
    }
}
