//! docconductor Core - Provider Orchestration & Caching for Document Processing
//!
//! This crate decides which document-processing backend handles a request,
//! avoids repeating work for documents it has already seen, and keeps
//! working when individual backends are slow or failing. It has no opinion
//! about how requests arrive: a CLI, an RPC server or a test harness all
//! drive the same [`OrchestrationContext`].
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                          Callers                                  │
//! │        CLI  /  RPC surface  /  batch jobs  /  tests               │
//! └────────────────────────────┬─────────────────────────────────────┘
//!                              │ execute(document, operation, options, preference)
//! ┌────────────────────────────┼─────────────────────────────────────┐
//! │                  ORCHESTRATION CONTEXT                            │
//! │  ┌─────────────────────────┴──────────────────────────────────┐  │
//! │  │                        Executor                             │  │
//! │  │  ┌──────────┐  ┌──────────┐  ┌──────────┐  ┌─────────────┐  │  │
//! │  │  │  Cache   │  │ Selector │  │ Breakers │  │  Governor   │  │  │
//! │  │  │  Store   │  │+Registry │  │   Bank   │  │ (in-flight) │  │  │
//! │  │  └──────────┘  └──────────┘  └──────────┘  └─────────────┘  │  │
//! │  └─────────────────────────────────────────────────────────────┘  │
//! └────────────────────────────┬─────────────────────────────────────┘
//!                              │ invoke
//!              ┌───────────────┼────────────────┐
//!              ▼               ▼                ▼
//!        CommandProvider  HttpProvider   custom Provider impls
//! ```
//!
//! # Key Types
//!
//! - [`OrchestrationContext`]: owns every shared component
//! - [`DocumentDescriptor`]: content hash, format and size of an input
//! - [`Provider`] / [`CapabilityRecord`]: a backend and what it declares
//! - [`Executor`]: cache-first fallback chain
//! - [`OrchestratorError`]: everything a caller can see go wrong
//!
//! # Module Overview
//!
//! - [`document`]: document descriptors and format/URL normalization
//! - [`provider`]: provider trait, capability records, command and HTTP providers
//! - [`routing`]: registry, selector, breakers, governor, coalescing, executor, metrics
//! - [`cache`]: cache keys, TTL/LRU store, memory and disk backends
//! - [`config`]: TOML + environment configuration
//! - [`context`]: the explicitly constructed context object
//! - [`error`]: error taxonomy

#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod cache;
pub mod config;
pub mod context;
pub mod document;
pub mod error;
pub mod provider;
pub mod routing;

// Document exports
pub use document::{DocumentDescriptor, DocumentError, DocumentSource};

// Error exports
pub use error::{
    AttemptFailure, CacheCorruption, FailureReason, NoEligibleReason, OrchestratorError,
    ProviderTimeout,
};

// Provider exports
pub use provider::{
    create_provider, CapabilityRecord, CommandProvider, Feature, HttpProvider, Provider,
    ProviderError, ResourceClass,
};

// Cache exports
pub use cache::{CacheConfig, CacheKey, CacheStats, CacheStore, CachedResult};

// Routing exports
pub use routing::{
    BreakerBank, BreakerConfig, CapabilityRegistry, CircuitState, ConcurrencyGovernor,
    ExecutionRequest, ExecutionResult, Executor, ExecutorConfig, GovernorConfig, Selector,
    SelectorConfig, ServedFrom,
};

// Context exports
pub use context::{ContextError, ContextStatus, OrchestrationContext};

// Config exports
pub use config::{
    default_config_path, load_config, load_config_from_path, ConfigError, ConfigOverrides,
    ConfigSource, OrchestratorConfig, OrchestratorToml, ProviderConfig, ProviderKind,
};
