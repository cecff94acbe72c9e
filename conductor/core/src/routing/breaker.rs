//! Circuit Breaker Bank
//!
//! One breaker per provider identity, created lazily on first failure and
//! kept for the life of the process (breakers are never persisted).
//!
//! ```text
//!                 N consecutive failures
//!                 or windowed failure rate
//! +--------+  ------------------------------>  +------+
//! | Closed |                                   | Open |
//! +--------+  <---+                      +---> +------+
//!                 | trial success        |        |
//!                 |                      |        | cooldown elapsed
//!                 |        trial failure |        v
//!                 +-------------------  +-------------+
//!                                       |  Half-Open  |
//!                                       +-------------+
//! ```
//!
//! In half-open, [`CircuitBreaker::try_half_open_trial`] grants exactly one
//! trial. Further calls return `false` until the trial resolves through
//! `record_success`/`record_failure` or is handed back with `abandon_trial`.
//! Callers must always do one of the three; the executor holds a guard that
//! abandons the grant if its request is dropped mid-call.
//!
//! Each breaker has its own lock; the bank is a `DashMap`, so contention is
//! per provider.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;

// ============================================================================
// Configuration
// ============================================================================

/// Breaker thresholds
#[derive(Clone, Debug, PartialEq)]
pub struct BreakerConfig {
    /// Consecutive failures that open the circuit
    pub failure_threshold: u32,
    /// Failure rate within the window that opens the circuit (0.0, 1.0]
    pub failure_rate_threshold: f64,
    /// Number of most recent outcomes kept in the sliding window
    pub window_size: usize,
    /// Outcomes required in the window before the rate rule applies
    pub minimum_calls: usize,
    /// Time spent open before a trial is allowed
    pub cooldown: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            failure_rate_threshold: 0.5,
            window_size: 20,
            minimum_calls: 10,
            cooldown: Duration::from_secs(30),
        }
    }
}

/// Circuit breaker state
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Normal operation
    #[default]
    Closed,
    /// Rejecting calls
    Open,
    /// Cooldown elapsed, one trial call permitted
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::Open => write!(f, "open"),
            Self::HalfOpen => write!(f, "half-open"),
        }
    }
}

// ============================================================================
// Circuit Breaker
// ============================================================================

#[derive(Debug, Default)]
struct BreakerInner {
    state: CircuitState,
    consecutive_failures: u32,
    window: VecDeque<bool>,
    opened_at: Option<Instant>,
    trial_granted_at: Option<Instant>,
    total_successes: u64,
    total_failures: u64,
}

impl BreakerInner {
    fn push_outcome(&mut self, failed: bool, window_size: usize) {
        self.window.push_back(failed);
        while self.window.len() > window_size {
            self.window.pop_front();
        }
    }

    fn failure_rate(&self) -> f64 {
        if self.window.is_empty() {
            return 0.0;
        }
        let failures = self.window.iter().filter(|failed| **failed).count();
        failures as f64 / self.window.len() as f64
    }
}

/// Per-provider breaker
#[derive(Debug)]
pub struct CircuitBreaker {
    identity: String,
    config: BreakerConfig,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    /// Create a closed breaker
    pub fn new(identity: impl Into<String>, config: BreakerConfig) -> Self {
        Self {
            identity: identity.into(),
            config,
            inner: Mutex::new(BreakerInner::default()),
        }
    }

    /// Provider identity
    pub fn identity(&self) -> &str {
        &self.identity
    }

    /// Current state, applying the open -> half-open transition if due
    pub fn state(&self) -> CircuitState {
        let mut inner = self.inner.lock();
        self.advance(&mut inner);
        inner.state
    }

    /// Whether calls are currently rejected
    pub fn is_open(&self) -> bool {
        self.state() == CircuitState::Open
    }

    fn advance(&self, inner: &mut BreakerInner) {
        if inner.state != CircuitState::Open {
            return;
        }
        let cooled = inner
            .opened_at
            .map_or(true, |at| at.elapsed() >= self.config.cooldown);
        if cooled {
            inner.state = CircuitState::HalfOpen;
            inner.trial_granted_at = None;
            tracing::info!(
                provider = %self.identity,
                "Circuit breaker half-open, allowing one trial"
            );
        }
    }

    /// Ask for permission to send the half-open trial call
    pub fn try_half_open_trial(&self) -> bool {
        let mut inner = self.inner.lock();
        self.advance(&mut inner);
        if inner.state != CircuitState::HalfOpen {
            return false;
        }
        if inner.trial_granted_at.is_some() {
            return false;
        }
        inner.trial_granted_at = Some(Instant::now());
        true
    }

    /// Give back a granted trial that never reached the provider
    pub fn abandon_trial(&self) {
        let mut inner = self.inner.lock();
        if inner.state == CircuitState::HalfOpen {
            inner.trial_granted_at = None;
        }
    }

    /// Record a successful call
    pub fn record_success(&self) {
        let mut inner = self.inner.lock();
        self.advance(&mut inner);
        inner.total_successes += 1;
        inner.consecutive_failures = 0;
        inner.push_outcome(false, self.config.window_size);

        if inner.state == CircuitState::HalfOpen {
            inner.state = CircuitState::Closed;
            inner.opened_at = None;
            inner.trial_granted_at = None;
            inner.window.clear();
            tracing::info!(provider = %self.identity, "Circuit breaker closed, provider recovered");
        }
    }

    /// Record a failed or timed-out call
    pub fn record_failure(&self) {
        let mut inner = self.inner.lock();
        self.advance(&mut inner);
        inner.total_failures += 1;
        inner.consecutive_failures += 1;
        inner.push_outcome(true, self.config.window_size);

        let should_open = match inner.state {
            CircuitState::Closed => {
                inner.consecutive_failures >= self.config.failure_threshold
                    || (inner.window.len() >= self.config.minimum_calls
                        && inner.failure_rate() >= self.config.failure_rate_threshold)
            }
            CircuitState::HalfOpen => true,
            CircuitState::Open => false,
        };

        if should_open {
            inner.state = CircuitState::Open;
            inner.opened_at = Some(Instant::now());
            inner.trial_granted_at = None;
            tracing::warn!(
                provider = %self.identity,
                consecutive_failures = inner.consecutive_failures,
                failure_rate = inner.failure_rate(),
                "Circuit breaker opened"
            );
        }
    }

    /// Force a state (operator override and tests)
    pub fn force_state(&self, state: CircuitState) {
        let mut inner = self.inner.lock();
        inner.state = state;
        inner.trial_granted_at = None;
        match state {
            CircuitState::Open => inner.opened_at = Some(Instant::now()),
            CircuitState::Closed => {
                inner.opened_at = None;
                inner.consecutive_failures = 0;
                inner.window.clear();
            }
            CircuitState::HalfOpen => {}
        }
    }

    /// Point-in-time view
    pub fn snapshot(&self) -> BreakerSnapshot {
        let mut inner = self.inner.lock();
        self.advance(&mut inner);
        BreakerSnapshot {
            identity: self.identity.clone(),
            state: inner.state,
            consecutive_failures: inner.consecutive_failures,
            failure_rate: inner.failure_rate(),
            trial_outstanding: inner.trial_granted_at.is_some(),
            total_successes: inner.total_successes,
            total_failures: inner.total_failures,
        }
    }
}

/// Breaker state for introspection
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct BreakerSnapshot {
    /// Provider identity
    pub identity: String,
    /// Current state
    pub state: CircuitState,
    /// Failures since the last success
    pub consecutive_failures: u32,
    /// Failure share of the sliding window
    pub failure_rate: f64,
    /// Whether a half-open trial is currently granted
    pub trial_outstanding: bool,
    /// Lifetime successes
    pub total_successes: u64,
    /// Lifetime failures
    pub total_failures: u64,
}

// ============================================================================
// Breaker Bank
// ============================================================================

/// All breakers, keyed by provider identity
///
/// Identities without a breaker are treated as closed.
#[derive(Debug, Default)]
pub struct BreakerBank {
    breakers: DashMap<String, Arc<CircuitBreaker>>,
    config: BreakerConfig,
}

impl BreakerBank {
    /// Create an empty bank
    #[must_use]
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            breakers: DashMap::new(),
            config,
        }
    }

    /// Existing breaker for an identity
    pub fn get(&self, identity: &str) -> Option<Arc<CircuitBreaker>> {
        self.breakers.get(identity).map(|b| b.clone())
    }

    fn get_or_create(&self, identity: &str) -> Arc<CircuitBreaker> {
        if let Some(breaker) = self.get(identity) {
            return breaker;
        }
        self.breakers
            .entry(identity.to_string())
            .or_insert_with(|| Arc::new(CircuitBreaker::new(identity, self.config.clone())))
            .clone()
    }

    /// Record a success; no breaker is created for a healthy provider
    pub fn record_success(&self, identity: &str) {
        if let Some(breaker) = self.get(identity) {
            breaker.record_success();
        }
    }

    /// Record a failure, creating the breaker if needed
    pub fn record_failure(&self, identity: &str) {
        self.get_or_create(identity).record_failure();
    }

    /// Whether the identity's circuit is open
    pub fn is_open(&self, identity: &str) -> bool {
        self.get(identity).is_some_and(|b| b.is_open())
    }

    /// Current state (closed if no breaker exists)
    pub fn state(&self, identity: &str) -> CircuitState {
        self.get(identity)
            .map(|b| b.state())
            .unwrap_or(CircuitState::Closed)
    }

    /// Ask for the half-open trial; `false` for unknown identities
    pub fn try_half_open_trial(&self, identity: &str) -> bool {
        self.get(identity).is_some_and(|b| b.try_half_open_trial())
    }

    /// Return an unused trial grant
    pub fn abandon_trial(&self, identity: &str) {
        if let Some(breaker) = self.get(identity) {
            breaker.abandon_trial();
        }
    }

    /// Force a state, creating the breaker if needed
    pub fn force_state(&self, identity: &str, state: CircuitState) {
        self.get_or_create(identity).force_state(state);
    }

    /// Snapshot of one breaker
    pub fn snapshot(&self, identity: &str) -> Option<BreakerSnapshot> {
        self.get(identity).map(|b| b.snapshot())
    }

    /// Snapshots of every breaker, sorted by identity
    pub fn snapshots(&self) -> Vec<BreakerSnapshot> {
        let breakers: Vec<Arc<CircuitBreaker>> =
            self.breakers.iter().map(|e| e.value().clone()).collect();
        let mut snapshots: Vec<_> = breakers.iter().map(|b| b.snapshot()).collect();
        snapshots.sort_by(|a, b| a.identity.cmp(&b.identity));
        snapshots
    }

    /// Drop every breaker
    pub fn reset(&self) {
        self.breakers.clear();
    }

    /// Number of breakers created so far
    pub fn len(&self) -> usize {
        self.breakers.len()
    }

    /// Whether no breaker exists yet
    pub fn is_empty(&self) -> bool {
        self.breakers.is_empty()
    }
}
