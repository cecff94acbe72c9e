//! Chaos Tests for Orchestration Resilience
//!
//! These tests verify system behavior under adverse conditions:
//! - Providers that hang or fail under concurrent load
//! - Breakers opening and recovering while requests race
//! - Bursts of identical requests
//! - Damaged persistent cache records
//!
//! # Running
//!
//! The storm tests are ignored by default due to their long-running nature:
//! ```bash
//! cargo test --test chaos_tests -- --ignored --nocapture
//! ```

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::json;
use tokio::task::JoinSet;

use common::{
    deep_remote_record, fast_local_record, sample_document, test_config, two_provider_context,
    Behavior, MockProvider,
};
use docconductor_core::{
    CircuitState, DocumentDescriptor, DocumentSource, ExecutionRequest, ExecutionResult,
    ExecutorConfig, FailureReason, NoEligibleReason, OrchestrationContext, OrchestratorError,
    ProviderError, ServedFrom,
};

// =============================================================================
// Chaos Test Infrastructure
// =============================================================================

/// Configuration for chaos test scenarios
#[derive(Clone, Debug)]
pub struct ChaosConfig {
    /// Duration to run chaos scenario
    pub duration: Duration,
    /// Number of concurrent request loops
    pub concurrency: usize,
    /// Every n-th provider call fails
    pub fail_every: usize,
    /// Enable verbose logging
    pub verbose: bool,
}

impl ChaosConfig {
    /// Create a shorter config for faster tests
    pub fn quick() -> Self {
        Self {
            duration: Duration::from_secs(3),
            concurrency: 20,
            fail_every: 3,
            verbose: false,
        }
    }
}

/// Tallies request outcomes during a chaos run
#[derive(Debug, Default)]
pub struct OutcomeTracker {
    /// Requests answered
    pub succeeded: AtomicUsize,
    /// Requests that failed with an expected, typed error
    pub graceful_failures: AtomicUsize,
    /// Requests that failed in a way the scenario does not allow
    pub unexpected_errors: AtomicUsize,
}

impl OutcomeTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, outcome: &Result<ExecutionResult, OrchestratorError>) {
        let counter = match outcome {
            Ok(_) => &self.succeeded,
            Err(
                OrchestratorError::AllProvidersFailed { .. }
                | OrchestratorError::NoEligibleProvider {
                    reason: NoEligibleReason::CircuitOpen,
                    ..
                },
            ) => &self.graceful_failures,
            Err(_) => &self.unexpected_errors,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn total(&self) -> usize {
        self.succeeded.load(Ordering::Relaxed)
            + self.graceful_failures.load(Ordering::Relaxed)
            + self.unexpected_errors.load(Ordering::Relaxed)
    }

    pub fn summary(&self) -> String {
        format!(
            "Requests: {} total, {} success, {} graceful fail, {} unexpected",
            self.total(),
            self.succeeded.load(Ordering::Relaxed),
            self.graceful_failures.load(Ordering::Relaxed),
            self.unexpected_errors.load(Ordering::Relaxed),
        )
    }
}

fn document(hash: &str) -> DocumentDescriptor {
    DocumentDescriptor::from_parts(hash, "pdf", 1_000, DocumentSource::Inline)
}

// =============================================================================
// Governor
// =============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn chaos_governor_bounds_in_flight_calls() {
    let mut config = test_config();
    config.governor.max_in_flight = 2;
    config.governor.call_timeout = Duration::from_secs(5);
    let context = Arc::new(OrchestrationContext::new(&config));
    let provider = MockProvider::new(
        fast_local_record(),
        Behavior::SucceedAfter(Duration::from_millis(30)),
    );
    context.register(provider.clone());

    let mut tasks = JoinSet::new();
    for i in 0..12 {
        let context = context.clone();
        tasks.spawn(async move {
            context
                .execute(&document("abc"), "extract-text", json!({ "page": i }), None)
                .await
        });
    }
    while let Some(joined) = tasks.join_next().await {
        joined.unwrap().unwrap();
    }

    assert_eq!(provider.calls(), 12);
    assert!(provider.peak_running() <= 2, "peak {}", provider.peak_running());
    let stats = context.governor().stats();
    assert!(stats.peak_in_flight <= 2);
    assert_eq!(stats.in_flight, 0);
    assert_eq!(stats.queued, 0);
    assert_eq!(stats.completed, 12);
}

#[tokio::test]
async fn chaos_caller_deadline_expires_in_queue_without_penalty() {
    let mut config = test_config();
    config.governor.max_in_flight = 1;
    let (context, fast_local, deep_remote) = two_provider_context(
        &config,
        Behavior::SucceedAfter(Duration::from_millis(200)),
        Behavior::Succeed,
    );
    let context = Arc::new(context);

    // Occupy the only slot
    let holder = {
        let context = context.clone();
        tokio::spawn(async move {
            context
                .execute(&document("slow"), "extract-text", json!({}), None)
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;

    let request = ExecutionRequest::new(document("abc"), "extract-text")
        .with_deadline(Duration::from_millis(50));
    let err = context.execute_request(request).await.unwrap_err();

    let OrchestratorError::AllProvidersFailed { attempts } = &err else {
        panic!("expected aggregate failure, got {err:?}");
    };
    assert!(!attempts.is_empty());
    assert!(attempts
        .iter()
        .all(|a| matches!(a.reason, FailureReason::QueueTimeout { .. })));
    assert_eq!(deep_remote.calls(), 0);

    holder.await.unwrap().unwrap();
    assert_eq!(fast_local.calls(), 1);
    for snapshot in context.breakers().snapshots() {
        assert_eq!(snapshot.total_failures, 0, "{} was penalized", snapshot.identity);
    }
    assert!(context.governor().stats().queue_timeouts >= 1);
}

// =============================================================================
// Hanging providers and breakers
// =============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn chaos_hanging_provider_opens_breaker() {
    let mut config = test_config();
    config.governor.max_in_flight = 16;
    config.governor.call_timeout = Duration::from_millis(50);
    config.breaker.cooldown = Duration::from_secs(60);
    let (context, fast_local, deep_remote) =
        two_provider_context(&config, Behavior::Succeed, Behavior::Hang);
    let context = Arc::new(context);

    let run_wave = |wave: usize| {
        let mut tasks = JoinSet::new();
        for i in 0..12 {
            let context = context.clone();
            tasks.spawn(async move {
                context
                    .execute(
                        &document("abc"),
                        "deep-analysis",
                        json!({ "wave": wave, "n": i }),
                        None,
                    )
                    .await
            });
        }
        tasks
    };

    let started = Instant::now();
    let mut first = run_wave(0);
    while let Some(joined) = first.join_next().await {
        let result = joined.unwrap().unwrap();
        assert_eq!(result.produced_by, "fast-local");
        assert!(matches!(result.failed_attempts[0].reason, FailureReason::Timeout(_)));
    }
    assert!(started.elapsed() < Duration::from_secs(2));
    assert_eq!(context.breakers().state("deep-remote"), CircuitState::Open);
    assert_eq!(deep_remote.calls(), 12);

    // Open circuit: the hanging provider is no longer attempted
    let mut second = run_wave(1);
    while let Some(joined) = second.join_next().await {
        let result = joined.unwrap().unwrap();
        assert_eq!(result.produced_by, "fast-local");
        assert!(result.failed_attempts.is_empty());
    }
    assert_eq!(deep_remote.calls(), 12);
    assert_eq!(fast_local.calls(), 24);
    assert_eq!(context.governor().stats().in_flight, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn chaos_half_open_admits_single_trial() {
    let mut config = test_config();
    config.breaker.failure_threshold = 1;
    config.breaker.cooldown = Duration::from_millis(50);
    let (context, _, deep_remote) = two_provider_context(
        &config,
        Behavior::Succeed,
        Behavior::SucceedAfter(Duration::from_millis(100)),
    );
    let context = Arc::new(context);

    context.breakers().record_failure("deep-remote");
    assert!(context.breakers().is_open("deep-remote"));
    tokio::time::sleep(Duration::from_millis(80)).await;

    let mut tasks = JoinSet::new();
    for i in 0..6 {
        let context = context.clone();
        tasks.spawn(async move {
            context
                .execute(&document("abc"), "deep-analysis", json!({ "n": i }), None)
                .await
        });
    }

    let mut trial_results = 0;
    let mut skipped = 0;
    while let Some(joined) = tasks.join_next().await {
        let result = joined.unwrap().unwrap();
        if result.produced_by == "deep-remote" {
            trial_results += 1;
        } else {
            assert_eq!(result.produced_by, "fast-local");
            assert_eq!(result.failed_attempts[0].reason, FailureReason::TrialInProgress);
            skipped += 1;
        }
    }

    assert_eq!(trial_results, 1);
    assert_eq!(skipped, 5);
    assert_eq!(deep_remote.calls(), 1);
    assert_eq!(context.breakers().state("deep-remote"), CircuitState::Closed);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn chaos_trial_slower_than_cooldown_stays_single() {
    let mut config = test_config();
    config.breaker.cooldown = Duration::from_millis(50);
    config.governor.call_timeout = Duration::from_secs(1);
    let (context, fast_local, deep_remote) = two_provider_context(
        &config,
        Behavior::Succeed,
        Behavior::SucceedAfter(Duration::from_millis(300)),
    );
    let context = Arc::new(context);
    context
        .breakers()
        .force_state("deep-remote", CircuitState::HalfOpen);

    let trial = {
        let context = context.clone();
        tokio::spawn(async move {
            context
                .execute(&sample_document(), "deep-analysis", json!({ "n": 1 }), None)
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(80)).await;
    let late = context
        .execute(&sample_document(), "deep-analysis", json!({ "n": 2 }), None)
        .await
        .unwrap();

    assert_eq!(late.produced_by, "fast-local");
    assert_eq!(late.failed_attempts[0].reason, FailureReason::TrialInProgress);
    assert_eq!(trial.await.unwrap().unwrap().produced_by, "deep-remote");
    assert_eq!(deep_remote.calls(), 1);
    assert_eq!(deep_remote.peak_running(), 1);
    assert_eq!(fast_local.calls(), 1);
    assert_eq!(context.breakers().state("deep-remote"), CircuitState::Closed);
}

#[tokio::test]
async fn chaos_failed_trial_reopens_circuit() {
    let mut config = test_config();
    config.breaker.failure_threshold = 1;
    config.breaker.cooldown = Duration::from_millis(50);
    let (context, _, deep_remote) = two_provider_context(
        &config,
        Behavior::Succeed,
        Behavior::Fail(ProviderError::Unavailable("still down".to_string())),
    );

    context.breakers().record_failure("deep-remote");
    tokio::time::sleep(Duration::from_millis(80)).await;
    assert_eq!(context.breakers().state("deep-remote"), CircuitState::HalfOpen);

    let result = context
        .execute(&sample_document(), "deep-analysis", json!({}), None)
        .await
        .unwrap();
    assert_eq!(result.produced_by, "fast-local");
    assert_eq!(deep_remote.calls(), 1);
    assert_eq!(context.breakers().state("deep-remote"), CircuitState::Open);
}

// =============================================================================
// Coalescing
// =============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn chaos_identical_burst_makes_one_call() {
    let mut config = test_config();
    config.executor = ExecutorConfig {
        coalesce_requests: true,
    };
    let context = Arc::new(OrchestrationContext::new(&config));
    let provider = MockProvider::new(
        fast_local_record(),
        Behavior::SucceedAfter(Duration::from_millis(100)),
    );
    context.register(provider.clone());

    let mut tasks = JoinSet::new();
    for _ in 0..20 {
        let context = context.clone();
        tasks.spawn(async move {
            context
                .execute(&sample_document(), "extract-text", json!({"lang": "en"}), None)
                .await
        });
    }

    let mut from_provider = 0;
    let mut payloads = Vec::new();
    while let Some(joined) = tasks.join_next().await {
        let result = joined.unwrap().unwrap();
        if result.served_from == ServedFrom::Provider {
            from_provider += 1;
        }
        payloads.push(result.payload);
    }

    assert_eq!(provider.calls(), 1);
    assert_eq!(from_provider, 1);
    assert!(payloads.windows(2).all(|w| w[0] == w[1]));
    assert_eq!(context.cache().len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn chaos_coalesced_failure_reaches_every_waiter() {
    let mut config = test_config();
    config.executor = ExecutorConfig {
        coalesce_requests: true,
    };
    config.breaker.failure_threshold = 100;
    let context = Arc::new(OrchestrationContext::new(&config));
    let provider = MockProvider::new(
        deep_remote_record(),
        Behavior::Fail(ProviderError::Rejected("encrypted document".to_string())),
    );
    context.register(provider.clone());

    let mut tasks = JoinSet::new();
    for _ in 0..8 {
        let context = context.clone();
        tasks.spawn(async move {
            context
                .execute(&sample_document(), "extract-text", json!({}), None)
                .await
        });
    }
    while let Some(joined) = tasks.join_next().await {
        let err = joined.unwrap().unwrap_err();
        assert_eq!(err.failed_providers(), vec!["deep-remote"]);
    }

    // Failures are not cached; followers that missed the leader may retry
    assert!(context.cache().is_empty());
    assert!(provider.calls() >= 1);
}

// =============================================================================
// Persistent cache damage
// =============================================================================

#[tokio::test]
async fn chaos_damaged_cache_records_are_dropped_on_open() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config();
    config.cache.directory = Some(dir.path().to_path_buf());

    let hashes: Vec<String> = (0..10).map(|i| format!("doc{i}")).collect();
    {
        let context = OrchestrationContext::from_config(&config).unwrap();
        context.register(MockProvider::new(fast_local_record(), Behavior::Succeed));
        for hash in &hashes {
            context
                .execute(&document(hash), "extract-text", json!({}), None)
                .await
                .unwrap();
        }
    }

    // Truncate every other record
    let mut entries: Vec<_> = std::fs::read_dir(dir.path())
        .unwrap()
        .map(|e| e.unwrap().path())
        .collect();
    entries.sort();
    assert_eq!(entries.len(), 10);
    for path in entries.iter().step_by(2) {
        std::fs::write(path, b"DC").unwrap();
    }

    let context = OrchestrationContext::from_config(&config).unwrap();
    let provider = MockProvider::new(fast_local_record(), Behavior::Succeed);
    context.register(provider.clone());
    assert_eq!(context.cache().len(), 5);
    assert_eq!(context.cache().stats().corruptions, 5);

    let mut from_cache = 0;
    for hash in &hashes {
        let result = context
            .execute(&document(hash), "extract-text", json!({}), None)
            .await
            .unwrap();
        if result.served_from == ServedFrom::Cache {
            from_cache += 1;
        }
    }
    assert_eq!(from_cache, 5);
    assert_eq!(provider.calls(), 5);
    assert_eq!(context.cache().len(), 10);
}

// =============================================================================
// Storm
// =============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[ignore] // Intentional (chaos) - Long-running test, run manually
async fn chaos_mixed_failure_storm() {
    let chaos = ChaosConfig::quick();
    let mut config = test_config();
    config.governor.max_in_flight = 4;
    config.governor.call_timeout = Duration::from_millis(100);
    config.breaker.cooldown = Duration::from_millis(200);
    let (context, fast_local, deep_remote) = two_provider_context(
        &config,
        Behavior::SucceedAfter(Duration::from_millis(5)),
        Behavior::SucceedAfter(Duration::from_millis(5)),
    );
    let context = Arc::new(context);
    let tracker = Arc::new(OutcomeTracker::new());
    let deadline = Instant::now() + chaos.duration;

    let mut loops = JoinSet::new();
    for worker in 0..chaos.concurrency {
        let context = context.clone();
        let tracker = tracker.clone();
        let fast_local = fast_local.clone();
        let deep_remote = deep_remote.clone();
        let fail_every = chaos.fail_every;
        loops.spawn(async move {
            let mut n = 0usize;
            while Instant::now() < deadline {
                n += 1;
                // Flip behaviors from inside the storm
                if worker == 0 && n % fail_every == 0 {
                    deep_remote.set_behavior(Behavior::Hang);
                    fast_local.set_behavior(Behavior::Fail(ProviderError::Failed(
                        "injected".to_string(),
                    )));
                } else if worker == 0 {
                    deep_remote.set_behavior(Behavior::SucceedAfter(Duration::from_millis(5)));
                    fast_local.set_behavior(Behavior::SucceedAfter(Duration::from_millis(5)));
                }

                let hash = format!("doc{}", n % 7);
                let operation = if n % 2 == 0 { "deep-analysis" } else { "extract-text" };
                let outcome = context
                    .execute(&document(&hash), operation, json!({ "worker": worker % 3 }), None)
                    .await;
                tracker.record(&outcome);
            }
        });
    }
    while let Some(joined) = loops.join_next().await {
        joined.unwrap();
    }

    if chaos.verbose {
        println!("{}", tracker.summary());
    }
    assert!(tracker.total() > 0);
    assert_eq!(tracker.unexpected_errors.load(Ordering::Relaxed), 0, "{}", tracker.summary());

    let stats = context.governor().stats();
    assert!(stats.peak_in_flight <= 4);
    assert_eq!(stats.in_flight, 0);
    assert_eq!(stats.queued, 0);
    assert_eq!(context.metrics().summary().active_requests, 0);
}

#[tokio::test]
async fn chaos_infrastructure_sanity() {
    let tracker = OutcomeTracker::new();
    tracker.record(&Err(OrchestratorError::AllProvidersFailed {
        attempts: Vec::new(),
    }));
    tracker.record(&Err(OrchestratorError::InvalidOptions("x".to_string())));
    assert_eq!(tracker.total(), 2);
    assert_eq!(tracker.graceful_failures.load(Ordering::Relaxed), 1);
    assert_eq!(tracker.unexpected_errors.load(Ordering::Relaxed), 1);
    assert!(tracker.summary().contains("2 total"));
}
