//! Provider Routing
//!
//! Everything between "run this operation on this document" and a provider
//! call: eligibility, ranking, failure isolation, bounded concurrency and
//! the fallback chain itself.
//!
//! # Architecture
//!
//! ```text
//! +------------------+
//! |     Executor     |  <-- Entry point: cache first, then fallback chain
//! +--------+---------+
//!          |
//!          v
//! +------------------+      +--------------------+
//! |     Selector     | <--- | CapabilityRegistry |  <-- who can take the document
//! +--------+---------+      +--------------------+
//!          |                +--------------------+
//!          |          <---  |    BreakerBank     |  <-- who is healthy
//!          v                +--------------------+
//! +------------------+
//! |    Governor      |  <-- Bounded in-flight calls, FIFO queue, deadlines
//! +--------+---------+
//!          |
//!    +-----+------+
//!    |     |      |
//!    v     v      v
//! +-----+ +----+ +------+
//! | Cmd | |HTTP| | ...  |  <-- Provider implementations
//! +-----+ +----+ +------+
//! ```
//!
//! # Design Principles
//!
//! 1. **Cache before providers**: a hit never touches a provider or breaker
//! 2. **Isolation**: one failing provider trips only its own breaker
//! 3. **Graceful degradation**: candidates are tried in rank order, once each
//! 4. **Observability**: every attempt lands in [`metrics::OrchestratorMetrics`]

pub mod breaker;
pub mod coalesce;
pub mod executor;
pub mod governor;
pub mod metrics;
pub mod registry;
pub mod selector;

#[cfg(test)]
pub(crate) mod test_utils;

pub use breaker::{BreakerBank, BreakerConfig, BreakerSnapshot, CircuitBreaker, CircuitState};
pub use coalesce::{CoalescerStats, RequestCoalescer};
pub use executor::{ExecutionRequest, ExecutionResult, Executor, ExecutorConfig, ServedFrom};
pub use governor::{ConcurrencyGovernor, GovernorConfig, GovernorError, GovernorStats};
pub use metrics::{MetricsSummary, OrchestratorMetrics};
pub use registry::{CapabilityRegistry, ProviderSnapshot, RegisteredProvider};
pub use selector::{ScoredCandidate, ScoringWeights, Selector, SelectorConfig, AUTO_PREFERENCE};
