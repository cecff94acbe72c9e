//! Orchestration Context
//!
//! The one object that owns every shared component: registry, breaker bank,
//! cache, governor, metrics and the executor wired over them. There is no
//! global state; construct a context at startup and pass it (or an `Arc` of
//! it) to whatever serves requests.
//!
//! ```ignore
//! let config = load_config()?;
//! let context = OrchestrationContext::from_config(&config)?;
//! let result = context
//!     .execute(&document, "extract-text", serde_json::json!({}), None)
//!     .await?;
//! ```

use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

use crate::cache::{CacheError, CacheStats, CacheStore, DiskBackend};
use crate::config::OrchestratorConfig;
use crate::document::DocumentDescriptor;
use crate::error::OrchestratorError;
use crate::provider::{create_provider, Provider, ProviderError};
use crate::routing::{
    BreakerBank, BreakerSnapshot, CapabilityRegistry, ConcurrencyGovernor, ExecutionRequest,
    ExecutionResult, Executor, GovernorStats, MetricsSummary, OrchestratorMetrics,
    ProviderSnapshot,
};

/// Failures while assembling a context
#[derive(Debug, Error)]
pub enum ContextError {
    /// The cache backend could not be opened
    #[error("failed to open cache: {0}")]
    Cache(#[from] CacheError),

    /// A configured provider could not be constructed
    #[error("failed to create provider '{id}': {source}")]
    Provider {
        /// Provider identity
        id: String,
        /// Underlying failure
        source: ProviderError,
    },
}

/// Point-in-time view of every component
#[derive(Clone, Debug, Serialize)]
pub struct ContextStatus {
    /// Registered providers and their availability
    pub providers: Vec<ProviderSnapshot>,
    /// Breakers created so far
    pub breakers: Vec<BreakerSnapshot>,
    /// Governor counters
    pub governor: GovernorStats,
    /// Cache counters
    pub cache: CacheStats,
    /// Request metrics
    pub metrics: MetricsSummary,
}

/// Shared orchestration components
pub struct OrchestrationContext {
    registry: Arc<CapabilityRegistry>,
    breakers: Arc<BreakerBank>,
    cache: Arc<CacheStore>,
    governor: Arc<ConcurrencyGovernor>,
    metrics: Arc<OrchestratorMetrics>,
    executor: Executor,
}

impl OrchestrationContext {
    /// Context with an in-memory cache and no providers
    #[must_use]
    pub fn new(config: &OrchestratorConfig) -> Self {
        Self::with_cache(config, CacheStore::in_memory(config.cache.clone()))
    }

    /// Context over a prepared cache store and no providers
    #[must_use]
    pub fn with_cache(config: &OrchestratorConfig, cache: CacheStore) -> Self {
        let registry = Arc::new(CapabilityRegistry::new());
        let breakers = Arc::new(BreakerBank::new(config.breaker.clone()));
        let cache = Arc::new(cache);
        let governor = Arc::new(ConcurrencyGovernor::new(config.governor.clone()));
        let metrics = Arc::new(OrchestratorMetrics::new());

        let executor = Executor::new(
            registry.clone(),
            breakers.clone(),
            cache.clone(),
            governor.clone(),
            config.selector.clone(),
        )
        .with_metrics(metrics.clone())
        .with_config(config.executor.clone());

        Self {
            registry,
            breakers,
            cache,
            governor,
            metrics,
            executor,
        }
    }

    /// Build everything a configuration describes
    ///
    /// Opens the on-disk cache when a directory is configured and registers
    /// every `[[providers]]` entry. Disabled entries, and providers that
    /// report they are not ready, are registered but marked unavailable.
    ///
    /// # Errors
    ///
    /// Returns [`ContextError`] if the cache cannot be opened or a provider
    /// cannot be constructed.
    pub fn from_config(config: &OrchestratorConfig) -> Result<Self, ContextError> {
        let cache = match &config.cache.directory {
            Some(directory) => {
                let backend = Arc::new(DiskBackend::open(directory)?);
                let store = CacheStore::open(backend, config.cache.clone())?;
                tracing::info!(
                    directory = %directory.display(),
                    entries = store.len(),
                    "Opened persistent cache"
                );
                store
            }
            None => CacheStore::in_memory(config.cache.clone()),
        };

        let context = Self::with_cache(config, cache);
        for entry in &config.providers {
            let provider = create_provider(entry).map_err(|source| ContextError::Provider {
                id: entry.id.clone(),
                source,
            })?;
            let ready = provider.is_ready();
            context.register(provider);

            if !entry.enabled || !ready {
                context.registry.mark_availability(&entry.id, false);
                tracing::info!(
                    provider = %entry.id,
                    enabled = entry.enabled,
                    ready,
                    "Provider registered as unavailable"
                );
            }
        }

        tracing::info!(
            providers = context.registry.len(),
            max_in_flight = config.governor.max_in_flight,
            coalesce = config.executor.coalesce_requests,
            "Orchestration context ready"
        );
        Ok(context)
    }

    /// Register (or replace) a provider
    pub fn register(&self, provider: Arc<dyn Provider>) {
        self.registry.register(provider);
    }

    /// See [`Executor::execute`]
    ///
    /// # Errors
    ///
    /// See [`Executor::execute`].
    pub async fn execute(
        &self,
        document: &DocumentDescriptor,
        operation: &str,
        options: Value,
        preference: Option<&str>,
    ) -> Result<ExecutionResult, OrchestratorError> {
        self.executor
            .execute(document, operation, options, preference)
            .await
    }

    /// See [`Executor::execute_request`]
    ///
    /// # Errors
    ///
    /// See [`Executor::execute`].
    pub async fn execute_request(
        &self,
        request: ExecutionRequest,
    ) -> Result<ExecutionResult, OrchestratorError> {
        self.executor.execute_request(request).await
    }

    /// Drop every cached result for a document
    pub fn invalidate(&self, content_hash: &str) -> usize {
        self.cache.invalidate(content_hash)
    }

    /// Capability registry
    pub fn registry(&self) -> &Arc<CapabilityRegistry> {
        &self.registry
    }

    /// Breaker bank
    pub fn breakers(&self) -> &Arc<BreakerBank> {
        &self.breakers
    }

    /// Result cache
    pub fn cache(&self) -> &Arc<CacheStore> {
        &self.cache
    }

    /// Concurrency governor
    pub fn governor(&self) -> &Arc<ConcurrencyGovernor> {
        &self.governor
    }

    /// Request metrics
    pub fn metrics(&self) -> &Arc<OrchestratorMetrics> {
        &self.metrics
    }

    /// Executor wired over these components
    pub fn executor(&self) -> &Executor {
        &self.executor
    }

    /// Snapshot every component
    #[must_use]
    pub fn status(&self) -> ContextStatus {
        ContextStatus {
            providers: self.registry.snapshot(),
            breakers: self.breakers.snapshots(),
            governor: self.governor.stats(),
            cache: self.cache.stats(),
            metrics: self.metrics.summary(),
        }
    }
}
