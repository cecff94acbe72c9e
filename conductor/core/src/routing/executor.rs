//! Executor
//!
//! The single entry point for running a document operation:
//!
//! 1. derive the cache key (malformed options fail here)
//! 2. reject documents no registered provider could ever take
//! 3. answer from cache when possible, with no provider or breaker activity
//! 4. otherwise walk the ranked candidates under the concurrency governor,
//!    skipping open breakers, until one succeeds
//! 5. write the first success through to the cache and return it
//!
//! Providers are never retried within one request; only exhausting every
//! candidate surfaces an error.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::time::Instant;
use tracing::Instrument;
use uuid::Uuid;

use super::breaker::{BreakerBank, CircuitState};
use super::coalesce::{Registration, RequestCoalescer};
use super::governor::{ConcurrencyGovernor, GovernorError};
use super::metrics::{Gauge, OrchestratorMetrics};
use super::registry::CapabilityRegistry;
use super::selector::{Selector, SelectorConfig};
use crate::cache::{CacheKey, CacheStore};
use crate::document::DocumentDescriptor;
use crate::error::{
    AttemptFailure, FailureReason, NoEligibleReason, OrchestratorError, ProviderTimeout,
};
use crate::provider::ProviderError;

// ============================================================================
// Request / Result
// ============================================================================

/// One unit of work submitted to the executor
#[derive(Clone, Debug)]
pub struct ExecutionRequest {
    /// Correlation id carried in logs
    pub request_id: Uuid,
    /// Document to process
    pub document: DocumentDescriptor,
    /// Operation name, e.g. `extract-text`
    pub operation: String,
    /// Operation options; must be a JSON object or null
    pub options: Value,
    /// Provider to try first, or `auto`
    pub preference: Option<String>,
    /// Budget for the whole request, measured from submission
    pub deadline: Option<Duration>,
}

impl ExecutionRequest {
    /// Request with no options, no preference and no overall deadline
    pub fn new(document: DocumentDescriptor, operation: impl Into<String>) -> Self {
        Self {
            request_id: Uuid::new_v4(),
            document,
            operation: operation.into(),
            options: Value::Null,
            preference: None,
            deadline: None,
        }
    }

    /// Set options
    #[must_use]
    pub fn with_options(mut self, options: Value) -> Self {
        self.options = options;
        self
    }

    /// Set a provider preference
    #[must_use]
    pub fn with_preference(mut self, preference: impl Into<String>) -> Self {
        self.preference = Some(preference.into());
        self
    }

    /// Bound the whole request
    #[must_use]
    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }
}

/// Where a result came from
#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ServedFrom {
    /// A provider ran for this request
    Provider,
    /// Stored result
    Cache,
    /// Shared from a concurrent identical request
    Coalesced,
}

/// Successful execution
#[derive(Clone, Debug, PartialEq)]
pub struct ExecutionResult {
    /// Correlation id of the request
    pub request_id: Uuid,
    /// Provider payload
    pub payload: Value,
    /// Identity of the provider that produced the payload
    pub produced_by: String,
    /// Cache fingerprint of the request
    pub cache_key: String,
    /// How the result was obtained
    pub served_from: ServedFrom,
    /// Candidates tried or skipped before the one that succeeded
    pub failed_attempts: Vec<AttemptFailure>,
}

/// Executor options
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ExecutorConfig {
    /// Share one execution between concurrent identical misses
    pub coalesce_requests: bool,
}

#[derive(Clone, Debug)]
struct Produced {
    payload: Value,
    produced_by: String,
    failed_attempts: Vec<AttemptFailure>,
}

type SharedOutcome = Result<Produced, OrchestratorError>;

struct ActiveRequest<'a>(&'a Gauge);

impl<'a> ActiveRequest<'a> {
    fn enter(gauge: &'a Gauge) -> Self {
        gauge.inc();
        Self(gauge)
    }
}

impl Drop for ActiveRequest<'_> {
    fn drop(&mut self) {
        self.0.dec();
    }
}

/// A granted half-open trial; handed back on drop unless resolved
struct TrialGrant<'a> {
    breakers: &'a BreakerBank,
    identity: &'a str,
    resolved: bool,
}

impl<'a> TrialGrant<'a> {
    fn new(breakers: &'a BreakerBank, identity: &'a str) -> Self {
        Self {
            breakers,
            identity,
            resolved: false,
        }
    }

    /// The outcome was recorded on the breaker
    fn resolve(mut self) {
        self.resolved = true;
    }
}

impl Drop for TrialGrant<'_> {
    fn drop(&mut self) {
        if !self.resolved {
            tracing::debug!(provider = %self.identity, "Releasing unresolved half-open trial");
            self.breakers.abandon_trial(self.identity);
        }
    }
}

// ============================================================================
// Executor
// ============================================================================

/// Cache-first, fallback-chain executor
pub struct Executor {
    registry: Arc<CapabilityRegistry>,
    breakers: Arc<BreakerBank>,
    cache: Arc<CacheStore>,
    governor: Arc<ConcurrencyGovernor>,
    metrics: Arc<OrchestratorMetrics>,
    selector: Selector,
    coalescer: Option<RequestCoalescer<SharedOutcome>>,
}

impl Executor {
    /// Assemble an executor from shared components
    pub fn new(
        registry: Arc<CapabilityRegistry>,
        breakers: Arc<BreakerBank>,
        cache: Arc<CacheStore>,
        governor: Arc<ConcurrencyGovernor>,
        selector_config: SelectorConfig,
    ) -> Self {
        Self {
            selector: Selector::new(registry.clone(), breakers.clone(), selector_config),
            registry,
            breakers,
            cache,
            governor,
            metrics: Arc::new(OrchestratorMetrics::new()),
            coalescer: None,
        }
    }

    /// Report into shared metrics
    #[must_use]
    pub fn with_metrics(mut self, metrics: Arc<OrchestratorMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Apply executor options
    #[must_use]
    pub fn with_config(mut self, config: ExecutorConfig) -> Self {
        self.coalescer = config.coalesce_requests.then(RequestCoalescer::new);
        self
    }

    /// Selector ranking candidates for this executor
    pub fn selector(&self) -> &Selector {
        &self.selector
    }

    /// Metrics this executor reports into
    pub fn metrics(&self) -> &Arc<OrchestratorMetrics> {
        &self.metrics
    }

    /// Run `operation` on `document`
    ///
    /// # Errors
    ///
    /// - [`OrchestratorError::InvalidOptions`] if `options` cannot be keyed
    /// - [`OrchestratorError::NoEligibleProvider`] if no candidate exists
    /// - [`OrchestratorError::AllProvidersFailed`] if every candidate failed
    pub async fn execute(
        &self,
        document: &DocumentDescriptor,
        operation: &str,
        options: Value,
        preference: Option<&str>,
    ) -> Result<ExecutionResult, OrchestratorError> {
        let mut request = ExecutionRequest::new(document.clone(), operation).with_options(options);
        request.preference = preference.map(str::to_string);
        self.execute_request(request).await
    }

    /// Run a fully specified request
    ///
    /// # Errors
    ///
    /// See [`execute`](Self::execute).
    pub async fn execute_request(
        &self,
        request: ExecutionRequest,
    ) -> Result<ExecutionResult, OrchestratorError> {
        let span = tracing::info_span!(
            "execute",
            request_id = %request.request_id,
            operation = %request.operation,
            content_hash = %request.document.content_hash(),
        );
        self.execute_inner(request).instrument(span).await
    }

    async fn execute_inner(
        &self,
        request: ExecutionRequest,
    ) -> Result<ExecutionResult, OrchestratorError> {
        let started = std::time::Instant::now();
        let deadline = request.deadline.map(|d| Instant::now() + d);
        self.metrics.requests.inc();
        let _active = ActiveRequest::enter(&self.metrics.active_requests);

        let key = CacheKey::new(&request.document, &request.operation, &request.options)?;

        // Unsupported input fails before touching the cache
        if !self.registry.supports(&request.document) {
            self.metrics.no_eligible.inc();
            tracing::debug!(format = request.document.format(), "No provider supports document");
            return Err(OrchestratorError::NoEligibleProvider {
                format: request.document.format().to_string(),
                size_bytes: request.document.size_bytes(),
                reason: NoEligibleReason::Unsupported,
            });
        }

        if let Some(hit) = self.cache.get(&key) {
            self.metrics.cache_hits.inc();
            tracing::debug!(cache_key = %key, produced_by = %hit.produced_by, "Cache hit");
            return Ok(ExecutionResult {
                request_id: request.request_id,
                payload: hit.payload,
                produced_by: hit.produced_by,
                cache_key: key.fingerprint().to_string(),
                served_from: ServedFrom::Cache,
                failed_attempts: Vec::new(),
            });
        }
        self.metrics.cache_misses.inc();

        let outcome = match &self.coalescer {
            Some(coalescer) => self.run_coalesced(coalescer, &request, &key, deadline).await,
            None => self
                .run_candidates(&request, &key, deadline)
                .await
                .map(|p| (p, ServedFrom::Provider)),
        };
        self.metrics.request_latency.record(started.elapsed());

        let (produced, served_from) = outcome?;
        Ok(ExecutionResult {
            request_id: request.request_id,
            payload: produced.payload,
            produced_by: produced.produced_by,
            cache_key: key.fingerprint().to_string(),
            served_from,
            failed_attempts: produced.failed_attempts,
        })
    }

    async fn run_coalesced(
        &self,
        coalescer: &RequestCoalescer<SharedOutcome>,
        request: &ExecutionRequest,
        key: &CacheKey,
        deadline: Option<Instant>,
    ) -> Result<(Produced, ServedFrom), OrchestratorError> {
        match coalescer.register(key.fingerprint()) {
            Registration::Leader(lease) => {
                // A previous leader may have finished between our miss and registering
                if let Some(hit) = self.cache.get(key) {
                    let produced = Produced {
                        payload: hit.payload,
                        produced_by: hit.produced_by,
                        failed_attempts: Vec::new(),
                    };
                    lease.complete(Ok(produced.clone()));
                    return Ok((produced, ServedFrom::Cache));
                }
                let outcome = self.run_candidates(request, key, deadline).await;
                lease.complete(outcome.clone());
                outcome.map(|p| (p, ServedFrom::Provider))
            }
            Registration::Follower(mut receiver) => {
                self.metrics.coalesced.inc();
                let received = match deadline {
                    Some(deadline) => tokio::time::timeout_at(deadline, receiver.recv())
                        .await
                        .ok(),
                    None => Some(receiver.recv().await),
                };
                match received {
                    Some(Ok(outcome)) => outcome.map(|p| (p, ServedFrom::Coalesced)),
                    // Leader went away without an outcome, or our deadline passed
                    _ => self
                        .run_candidates(request, key, deadline)
                        .await
                        .map(|p| (p, ServedFrom::Provider)),
                }
            }
        }
    }

    async fn run_candidates(
        &self,
        request: &ExecutionRequest,
        key: &CacheKey,
        deadline: Option<Instant>,
    ) -> Result<Produced, OrchestratorError> {
        let candidates = self
            .selector
            .select(
                &request.document,
                &request.operation,
                request.preference.as_deref(),
            )
            .inspect_err(|_| self.metrics.no_eligible.inc())?;

        let mut failures: Vec<AttemptFailure> = Vec::new();

        for (rank, identity) in candidates.iter().enumerate() {
            if rank > 0 {
                self.metrics.fallbacks.inc();
                tracing::debug!(
                    provider = %identity,
                    previous = %candidates[rank - 1],
                    "Falling back to next provider"
                );
            }

            // Dropped unresolved (queue timeout, cancelled request) hands the trial back
            let trial = match self.breakers.state(identity) {
                CircuitState::Open => {
                    self.metrics.record_skip(identity);
                    failures.push(AttemptFailure::new(identity, FailureReason::CircuitOpen));
                    continue;
                }
                CircuitState::HalfOpen => {
                    if !self.breakers.try_half_open_trial(identity) {
                        self.metrics.record_skip(identity);
                        failures.push(AttemptFailure::new(
                            identity,
                            FailureReason::TrialInProgress,
                        ));
                        continue;
                    }
                    tracing::info!(provider = %identity, "Sending half-open trial call");
                    Some(TrialGrant::new(&self.breakers, identity))
                }
                CircuitState::Closed => None,
            };

            let Some(entry) = self.registry.get(identity) else {
                failures.push(AttemptFailure::new(
                    identity,
                    ProviderError::Unavailable("no longer registered".to_string()),
                ));
                continue;
            };
            let provider = entry.provider().clone();

            let now = Instant::now();
            let call_deadline = match deadline {
                Some(deadline) => deadline.min(now + self.governor.call_timeout()),
                None => now + self.governor.call_timeout(),
            };
            let budget = call_deadline.saturating_duration_since(now);
            let attempt_started = std::time::Instant::now();

            let result = self
                .governor
                .run_until(call_deadline, || {
                    provider.invoke(
                        &request.operation,
                        &request.document,
                        &request.options,
                        call_deadline,
                    )
                })
                .await;
            let elapsed = attempt_started.elapsed();

            match result {
                Ok(Ok(payload)) => {
                    self.breakers.record_success(identity);
                    if let Some(trial) = trial {
                        trial.resolve();
                    }
                    self.metrics.record_attempt_success(identity, elapsed);
                    if let Err(e) = self.cache.put(key, &payload, identity, None) {
                        tracing::warn!(cache_key = %key, error = %e, "Cache write failed");
                    }
                    tracing::debug!(
                        provider = %identity,
                        elapsed_ms = elapsed.as_millis() as u64,
                        skipped_or_failed = failures.len(),
                        "Provider succeeded"
                    );
                    return Ok(Produced {
                        payload,
                        produced_by: identity.clone(),
                        failed_attempts: failures,
                    });
                }
                Ok(Err(error)) => {
                    self.breakers.record_failure(identity);
                    if let Some(trial) = trial {
                        trial.resolve();
                    }
                    self.metrics.record_attempt_failure(
                        identity,
                        elapsed,
                        error == ProviderError::Timeout,
                    );
                    tracing::debug!(provider = %identity, error = %error, "Provider failed");
                    failures.push(AttemptFailure::new(identity, error));
                }
                Err(GovernorError::Timeout { .. }) => {
                    self.breakers.record_failure(identity);
                    if let Some(trial) = trial {
                        trial.resolve();
                    }
                    self.metrics.record_attempt_failure(identity, elapsed, true);
                    tracing::debug!(
                        provider = %identity,
                        budget_ms = budget.as_millis() as u64,
                        "Provider timed out"
                    );
                    failures.push(AttemptFailure::new(
                        identity,
                        ProviderTimeout {
                            provider: identity.clone(),
                            timeout: budget,
                        },
                    ));
                }
                Err(GovernorError::QueueTimeout { waited }) => {
                    // Never reached the provider; not its fault
                    drop(trial);
                    self.metrics.record_skip(identity);
                    failures.push(AttemptFailure::new(
                        identity,
                        FailureReason::QueueTimeout { waited },
                    ));
                }
                Err(GovernorError::Closed) => {
                    drop(trial);
                    failures.push(AttemptFailure::new(identity, FailureReason::Closed));
                }
            }
        }

        self.metrics.exhausted.inc();
        tracing::warn!(
            attempts = failures.len(),
            providers = ?failures.iter().map(|f| f.provider.as_str()).collect::<Vec<_>>(),
            "All providers failed"
        );
        Err(OrchestratorError::AllProvidersFailed { attempts: failures })
    }
}
