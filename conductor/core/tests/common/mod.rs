//! Shared fixtures for integration tests

#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::time::Instant;

use docconductor_core::{
    BreakerConfig, CacheConfig, CapabilityRecord, DocumentDescriptor, DocumentSource, Feature,
    GovernorConfig, OrchestrationContext, OrchestratorConfig, Provider, ProviderError,
    ResourceClass,
};

/// How a mock provider answers
#[derive(Clone, Debug)]
pub enum Behavior {
    /// Answer `{"provider": id, "operation": op}` immediately
    Succeed,
    /// Answer after a delay
    SucceedAfter(Duration),
    /// Fail with this error
    Fail(ProviderError),
    /// Never answer
    Hang,
}

/// Provider with switchable behavior that records every call
pub struct MockProvider {
    record: CapabilityRecord,
    behavior: Mutex<Behavior>,
    calls: AtomicUsize,
    running: AtomicUsize,
    peak_running: AtomicUsize,
    options_seen: Mutex<Vec<Value>>,
}

impl MockProvider {
    pub fn new(record: CapabilityRecord, behavior: Behavior) -> Arc<Self> {
        Arc::new(Self {
            record,
            behavior: Mutex::new(behavior),
            calls: AtomicUsize::new(0),
            running: AtomicUsize::new(0),
            peak_running: AtomicUsize::new(0),
            options_seen: Mutex::new(Vec::new()),
        })
    }

    pub fn set_behavior(&self, behavior: Behavior) {
        *self.behavior.lock() = behavior;
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn peak_running(&self) -> usize {
        self.peak_running.load(Ordering::SeqCst)
    }

    pub fn options_seen(&self) -> Vec<Value> {
        self.options_seen.lock().clone()
    }
}

struct Running<'a>(&'a AtomicUsize);

impl Drop for Running<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl Provider for MockProvider {
    fn identity(&self) -> &str {
        &self.record.identity
    }

    fn capabilities(&self) -> CapabilityRecord {
        self.record.clone()
    }

    async fn invoke(
        &self,
        operation: &str,
        _document: &DocumentDescriptor,
        options: &Value,
        _deadline: Instant,
    ) -> Result<Value, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.options_seen.lock().push(options.clone());
        let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_running.fetch_max(now, Ordering::SeqCst);
        let _running = Running(&self.running);

        let behavior = self.behavior.lock().clone();
        let payload = json!({ "provider": self.record.identity, "operation": operation });
        match behavior {
            Behavior::Succeed => Ok(payload),
            Behavior::SucceedAfter(delay) => {
                tokio::time::sleep(delay).await;
                Ok(payload)
            }
            Behavior::Fail(error) => Err(error),
            Behavior::Hang => std::future::pending().await,
        }
    }
}

/// `fast-local`: pdf only, no OCR, local
pub fn fast_local_record() -> CapabilityRecord {
    CapabilityRecord::new("fast-local")
        .with_formats(["pdf"])
        .with_speed(50.0)
}

/// `deep-remote`: pdf with OCR and custom instructions, metered
pub fn deep_remote_record() -> CapabilityRecord {
    CapabilityRecord::new("deep-remote")
        .with_formats(["pdf"])
        .with_feature(Feature::Ocr)
        .with_feature(Feature::CustomInstructions)
        .with_speed(500.0)
        .with_resource_class(ResourceClass::Metered)
}

/// `{hash: "abc", format: "pdf", size: 1000}`
pub fn sample_document() -> DocumentDescriptor {
    DocumentDescriptor::from_parts("abc", "pdf", 1_000, DocumentSource::Inline)
}

/// Configuration with short timings suitable for tests
pub fn test_config() -> OrchestratorConfig {
    let mut config = OrchestratorConfig::default();
    config.cache = CacheConfig {
        default_ttl: Duration::from_secs(60),
        max_entries: 100,
        directory: None,
    };
    config.governor = GovernorConfig {
        max_in_flight: 4,
        call_timeout: Duration::from_millis(500),
    };
    config.breaker = BreakerConfig {
        failure_threshold: 5,
        cooldown: Duration::from_millis(100),
        ..BreakerConfig::default()
    };
    config
}

/// Context with `fast-local` and `deep-remote` registered in that order
pub fn two_provider_context(
    config: &OrchestratorConfig,
    local: Behavior,
    remote: Behavior,
) -> (OrchestrationContext, Arc<MockProvider>, Arc<MockProvider>) {
    let context = OrchestrationContext::new(config);
    let fast_local = MockProvider::new(fast_local_record(), local);
    let deep_remote = MockProvider::new(deep_remote_record(), remote);
    context.register(fast_local.clone());
    context.register(deep_remote.clone());
    (context, fast_local, deep_remote)
}
