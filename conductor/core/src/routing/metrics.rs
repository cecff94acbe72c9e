//! Orchestration Metrics
//!
//! Counters, gauges and latency histograms for the execute path. Purely
//! observational: nothing here feeds back into routing decisions.

use std::collections::HashMap;
use std::fmt::Write as _;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use serde::Serialize;

// ============================================================================
// Primitives
// ============================================================================

/// Fixed-bucket histogram of millisecond latencies
#[derive(Debug)]
pub struct Histogram {
    bounds: Vec<f64>,
    counts: Vec<AtomicU64>,
    total: AtomicU64,
    sum_ms: AtomicU64,
    max_ms: AtomicU64,
}

impl Histogram {
    /// Histogram with explicit upper bounds; values above the last bound
    /// land in the last bucket
    pub fn new(bounds: Vec<f64>) -> Self {
        let counts = bounds.iter().map(|_| AtomicU64::new(0)).collect();
        Self {
            bounds,
            counts,
            total: AtomicU64::new(0),
            sum_ms: AtomicU64::new(0),
            max_ms: AtomicU64::new(0),
        }
    }

    /// Buckets suited to provider calls (10ms .. 2min)
    pub fn provider_latency() -> Self {
        Self::new(vec![
            10.0, 50.0, 100.0, 250.0, 500.0, 1_000.0, 2_500.0, 5_000.0, 10_000.0, 30_000.0,
            120_000.0,
        ])
    }

    /// Record one observation
    pub fn record(&self, elapsed: Duration) {
        let ms = elapsed.as_secs_f64() * 1_000.0;
        let idx = self
            .bounds
            .iter()
            .position(|b| ms <= *b)
            .unwrap_or(self.bounds.len().saturating_sub(1));
        if let Some(count) = self.counts.get(idx) {
            count.fetch_add(1, Ordering::Relaxed);
        }
        self.total.fetch_add(1, Ordering::Relaxed);
        self.sum_ms.fetch_add(ms as u64, Ordering::Relaxed);
        self.max_ms.fetch_max(ms as u64, Ordering::Relaxed);
    }

    /// Point-in-time copy
    pub fn snapshot(&self) -> HistogramSnapshot {
        let total = self.total.load(Ordering::Relaxed);
        let sum_ms = self.sum_ms.load(Ordering::Relaxed);
        HistogramSnapshot {
            bounds: self.bounds.clone(),
            counts: self
                .counts
                .iter()
                .map(|c| c.load(Ordering::Relaxed))
                .collect(),
            total,
            sum_ms,
            max_ms: self.max_ms.load(Ordering::Relaxed),
            mean_ms: if total == 0 {
                0.0
            } else {
                sum_ms as f64 / total as f64
            },
        }
    }
}

/// Histogram copy
#[derive(Clone, Debug, Serialize)]
pub struct HistogramSnapshot {
    /// Bucket upper bounds in milliseconds
    pub bounds: Vec<f64>,
    /// Observations per bucket
    pub counts: Vec<u64>,
    /// Observations overall
    pub total: u64,
    /// Sum of all observations
    pub sum_ms: u64,
    /// Largest observation
    pub max_ms: u64,
    /// Mean observation, 0 when empty
    pub mean_ms: f64,
}

impl HistogramSnapshot {
    /// Upper bound of the bucket containing the `p` quantile
    pub fn percentile(&self, p: f64) -> f64 {
        if self.total == 0 {
            return 0.0;
        }
        let target = ((self.total as f64) * p).ceil().max(1.0) as u64;
        let mut seen = 0;
        for (count, bound) in self.counts.iter().zip(&self.bounds) {
            seen += count;
            if seen >= target {
                return *bound;
            }
        }
        self.bounds.last().copied().unwrap_or(0.0)
    }
}

/// Monotonic counter
#[derive(Debug, Default)]
pub struct Counter(AtomicU64);

impl Counter {
    /// Add one
    pub fn inc(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    /// Current value
    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// Up/down gauge
#[derive(Debug, Default)]
pub struct Gauge(AtomicU64);

impl Gauge {
    /// Add one
    pub fn inc(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    /// Subtract one; every `dec` pairs with an earlier `inc`
    pub fn dec(&self) {
        self.0.fetch_sub(1, Ordering::Relaxed);
    }

    /// Current value
    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

// ============================================================================
// Per-Provider Metrics
// ============================================================================

/// Metrics for one provider
#[derive(Debug)]
pub struct ProviderMetrics {
    /// Provider identity
    pub identity: String,
    /// Calls started
    pub attempts: Counter,
    /// Calls that returned a payload
    pub successes: Counter,
    /// Calls that returned an error
    pub failures: Counter,
    /// Calls cut off by the call timeout
    pub timeouts: Counter,
    /// Times the provider was passed over without a call
    pub skipped: Counter,
    /// Call latency
    pub latency: Histogram,
}

impl ProviderMetrics {
    fn new(identity: &str) -> Self {
        Self {
            identity: identity.to_string(),
            attempts: Counter::default(),
            successes: Counter::default(),
            failures: Counter::default(),
            timeouts: Counter::default(),
            skipped: Counter::default(),
            latency: Histogram::provider_latency(),
        }
    }

    /// Summary for reporting
    pub fn summary(&self) -> ProviderMetricsSummary {
        let latency = self.latency.snapshot();
        let attempts = self.attempts.get();
        ProviderMetricsSummary {
            identity: self.identity.clone(),
            attempts,
            successes: self.successes.get(),
            failures: self.failures.get(),
            timeouts: self.timeouts.get(),
            skipped: self.skipped.get(),
            failure_rate: if attempts == 0 {
                0.0
            } else {
                (self.failures.get() + self.timeouts.get()) as f64 / attempts as f64
            },
            latency_p50_ms: latency.percentile(0.5),
            latency_p99_ms: latency.percentile(0.99),
            latency_mean_ms: latency.mean_ms,
        }
    }
}

/// Per-provider summary
#[derive(Clone, Debug, Serialize)]
pub struct ProviderMetricsSummary {
    /// Provider identity
    pub identity: String,
    /// Calls started
    pub attempts: u64,
    /// Calls that returned a payload
    pub successes: u64,
    /// Calls that returned an error
    pub failures: u64,
    /// Calls cut off by the call timeout
    pub timeouts: u64,
    /// Times the provider was passed over
    pub skipped: u64,
    /// Failures and timeouts over attempts
    pub failure_rate: f64,
    /// Median call latency (bucket bound)
    pub latency_p50_ms: f64,
    /// 99th percentile call latency (bucket bound)
    pub latency_p99_ms: f64,
    /// Mean call latency
    pub latency_mean_ms: f64,
}

// ============================================================================
// Orchestrator Metrics
// ============================================================================

/// All metrics for one orchestration context
#[derive(Debug)]
pub struct OrchestratorMetrics {
    providers: RwLock<HashMap<String, Arc<ProviderMetrics>>>,
    /// Execute calls
    pub requests: Counter,
    /// Execute calls in progress
    pub active_requests: Gauge,
    /// Requests answered from cache
    pub cache_hits: Counter,
    /// Requests that missed the cache
    pub cache_misses: Counter,
    /// Requests that joined an in-flight execution
    pub coalesced: Counter,
    /// Advances to a lower-ranked provider
    pub fallbacks: Counter,
    /// Requests where every candidate failed
    pub exhausted: Counter,
    /// Requests with no eligible provider
    pub no_eligible: Counter,
    /// End-to-end execute latency
    pub request_latency: Histogram,
    started_at: Instant,
}

impl Default for OrchestratorMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl OrchestratorMetrics {
    /// Empty metrics; uptime counts from now
    pub fn new() -> Self {
        Self {
            providers: RwLock::new(HashMap::new()),
            requests: Counter::default(),
            active_requests: Gauge::default(),
            cache_hits: Counter::default(),
            cache_misses: Counter::default(),
            coalesced: Counter::default(),
            fallbacks: Counter::default(),
            exhausted: Counter::default(),
            no_eligible: Counter::default(),
            request_latency: Histogram::provider_latency(),
            started_at: Instant::now(),
        }
    }

    /// Metrics for a provider, created on first use
    pub fn provider(&self, identity: &str) -> Arc<ProviderMetrics> {
        if let Some(existing) = self.providers.read().get(identity) {
            return existing.clone();
        }
        self.providers
            .write()
            .entry(identity.to_string())
            .or_insert_with(|| Arc::new(ProviderMetrics::new(identity)))
            .clone()
    }

    /// A provider call returned a payload
    pub fn record_attempt_success(&self, identity: &str, elapsed: Duration) {
        let provider = self.provider(identity);
        provider.attempts.inc();
        provider.successes.inc();
        provider.latency.record(elapsed);
    }

    /// A provider call failed or timed out
    pub fn record_attempt_failure(&self, identity: &str, elapsed: Duration, timed_out: bool) {
        let provider = self.provider(identity);
        provider.attempts.inc();
        if timed_out {
            provider.timeouts.inc();
        } else {
            provider.failures.inc();
        }
        provider.latency.record(elapsed);
    }

    /// A provider was passed over without being called
    pub fn record_skip(&self, identity: &str) {
        self.provider(identity).skipped.inc();
    }

    /// Summary of everything, providers sorted by identity
    pub fn summary(&self) -> MetricsSummary {
        let mut providers: Vec<ProviderMetricsSummary> =
            self.providers.read().values().map(|p| p.summary()).collect();
        providers.sort_by(|a, b| a.identity.cmp(&b.identity));
        let latency = self.request_latency.snapshot();

        MetricsSummary {
            uptime_seconds: self.started_at.elapsed().as_secs(),
            requests: self.requests.get(),
            active_requests: self.active_requests.get(),
            cache_hits: self.cache_hits.get(),
            cache_misses: self.cache_misses.get(),
            coalesced: self.coalesced.get(),
            fallbacks: self.fallbacks.get(),
            exhausted: self.exhausted.get(),
            no_eligible: self.no_eligible.get(),
            request_p50_ms: latency.percentile(0.5),
            request_p99_ms: latency.percentile(0.99),
            providers,
        }
    }

    /// Prometheus text exposition
    pub fn to_prometheus(&self) -> String {
        let summary = self.summary();
        let mut out = String::new();

        let globals: [(&str, &str, &str, u64); 9] = [
            ("docconductor_requests_total", "counter", "Execute calls", summary.requests),
            (
                "docconductor_active_requests",
                "gauge",
                "Execute calls in progress",
                summary.active_requests,
            ),
            (
                "docconductor_cache_hits_total",
                "counter",
                "Requests answered from cache",
                summary.cache_hits,
            ),
            (
                "docconductor_cache_misses_total",
                "counter",
                "Requests that missed the cache",
                summary.cache_misses,
            ),
            (
                "docconductor_coalesced_total",
                "counter",
                "Requests that joined an in-flight execution",
                summary.coalesced,
            ),
            (
                "docconductor_fallbacks_total",
                "counter",
                "Advances to a lower-ranked provider",
                summary.fallbacks,
            ),
            (
                "docconductor_exhausted_total",
                "counter",
                "Requests where every provider failed",
                summary.exhausted,
            ),
            (
                "docconductor_no_eligible_total",
                "counter",
                "Requests with no eligible provider",
                summary.no_eligible,
            ),
            (
                "docconductor_uptime_seconds",
                "gauge",
                "Seconds since metrics started",
                summary.uptime_seconds,
            ),
        ];
        for (name, kind, help, value) in globals {
            let _ = writeln!(out, "# HELP {name} {help}\n# TYPE {name} {kind}\n{name} {value}\n");
        }

        for p in &summary.providers {
            let label = format!("{{provider=\"{}\"}}", p.identity);
            let _ = writeln!(out, "docconductor_provider_attempts_total{label} {}", p.attempts);
            let _ = writeln!(out, "docconductor_provider_successes_total{label} {}", p.successes);
            let _ = writeln!(out, "docconductor_provider_failures_total{label} {}", p.failures);
            let _ = writeln!(out, "docconductor_provider_timeouts_total{label} {}", p.timeouts);
            let _ = writeln!(
                out,
                "docconductor_provider_latency_p50_ms{label} {}",
                p.latency_p50_ms
            );
            let _ = writeln!(
                out,
                "docconductor_provider_latency_p99_ms{label} {}\n",
                p.latency_p99_ms
            );
        }

        out
    }
}

/// Global summary
#[derive(Clone, Debug, Serialize)]
pub struct MetricsSummary {
    /// Seconds since the metrics were created
    pub uptime_seconds: u64,
    /// Execute calls
    pub requests: u64,
    /// Execute calls in progress
    pub active_requests: u64,
    /// Requests answered from cache
    pub cache_hits: u64,
    /// Requests that missed the cache
    pub cache_misses: u64,
    /// Requests that joined an in-flight execution
    pub coalesced: u64,
    /// Advances to a lower-ranked provider
    pub fallbacks: u64,
    /// Requests where every candidate failed
    pub exhausted: u64,
    /// Requests with no eligible provider
    pub no_eligible: u64,
    /// Median execute latency (bucket bound)
    pub request_p50_ms: f64,
    /// 99th percentile execute latency (bucket bound)
    pub request_p99_ms: f64,
    /// Per-provider summaries, sorted by identity
    pub providers: Vec<ProviderMetricsSummary>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_histogram_buckets() {
        let hist = Histogram::new(vec![10.0, 100.0, 1_000.0]);
        hist.record(Duration::from_millis(5));
        hist.record(Duration::from_millis(50));
        hist.record(Duration::from_millis(60));
        hist.record(Duration::from_secs(5));

        let snap = hist.snapshot();
        assert_eq!(snap.counts, vec![1, 2, 1]);
        assert_eq!(snap.total, 4);
        assert_eq!(snap.max_ms, 5_000);
        assert_eq!(snap.percentile(0.5), 100.0);
        assert_eq!(snap.percentile(1.0), 1_000.0);
    }

    #[test]
    fn test_provider_summary() {
        let metrics = OrchestratorMetrics::new();
        metrics.record_attempt_success("fast-local", Duration::from_millis(20));
        metrics.record_attempt_failure("fast-local", Duration::from_millis(20), false);
        metrics.record_attempt_failure("fast-local", Duration::from_millis(30_000), true);
        metrics.record_skip("deep-remote");

        let summary = metrics.summary();
        assert_eq!(summary.providers.len(), 2);
        let fast = &summary.providers[1];
        assert_eq!(fast.identity, "fast-local");
        assert_eq!(fast.attempts, 3);
        assert_eq!(fast.timeouts, 1);
        assert!((fast.failure_rate - 2.0 / 3.0).abs() < 1e-9);
        assert_eq!(summary.providers[0].skipped, 1);
    }

    #[test]
    fn test_prometheus_output() {
        let metrics = OrchestratorMetrics::new();
        metrics.requests.inc();
        metrics.cache_hits.inc();
        metrics.record_attempt_success("fast-local", Duration::from_millis(5));

        let text = metrics.to_prometheus();
        assert!(text.contains("# TYPE docconductor_requests_total counter"));
        assert!(text.contains("docconductor_cache_hits_total 1"));
        assert!(text.contains("docconductor_provider_attempts_total{provider=\"fast-local\"} 1"));
    }
}
