//! Provider Interface
//!
//! A provider is an opaque backend that performs one document operation:
//! a local subprocess, a remote HTTP API, or anything else implementing
//! [`Provider`]. The orchestration layer only sees its identity, its declared
//! [`CapabilityRecord`], and the result or error of `invoke`.
//!
//! Concrete variants:
//! - [`CommandProvider`]: runs a local program per request
//! - [`HttpProvider`]: POSTs the request to a remote endpoint

pub mod command;
pub mod http;

use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::time::Instant;

use crate::config::{ProviderConfig, ProviderKind};
use crate::document::{normalize_format, DocumentDescriptor};

pub use command::CommandProvider;
pub use http::HttpProvider;

// ============================================================================
// Capability Record
// ============================================================================

/// Optional capabilities a provider may declare
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Feature {
    /// Optical character recognition for scanned pages
    Ocr,
    /// Table structure extraction
    Tables,
    /// Embedded image extraction
    Images,
    /// Form field extraction
    Forms,
    /// Accepts free-form instructions alongside the document
    CustomInstructions,
    /// Can stream partial results
    Streaming,
}

/// Ordinal cost hint used as a ranking tie-breaker
///
/// Lower is cheaper. Local and free providers are preferred over metered
/// ones when they are equally capable.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum ResourceClass {
    /// Runs on this machine
    #[default]
    Local,
    /// Remote but not billed per call
    Free,
    /// Remote and billed per call
    Metered,
    /// Remote, billed at a premium rate
    Premium,
}

impl ResourceClass {
    /// Numeric rank (0 = cheapest)
    #[must_use]
    pub fn rank(self) -> u8 {
        self as u8
    }
}

/// Declared performance characteristics (not measured)
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Performance {
    /// Largest document the provider accepts
    pub max_file_size_bytes: u64,
    /// Declared throughput in provider-defined units (pages, KiB) per second
    pub average_units_per_second: f64,
}

impl Default for Performance {
    fn default() -> Self {
        Self {
            max_file_size_bytes: 100 * 1024 * 1024,
            average_units_per_second: 1.0,
        }
    }
}

/// What a provider declares it can do
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CapabilityRecord {
    /// Stable provider name
    pub identity: String,
    /// Lowercase format tokens
    pub supported_formats: BTreeSet<String>,
    /// Declared features
    pub features: BTreeSet<Feature>,
    /// Declared limits and speed
    pub performance: Performance,
    /// Cost hint
    pub resource_class: ResourceClass,
}

impl CapabilityRecord {
    /// Create a record with no formats, no features and default limits
    pub fn new(identity: impl Into<String>) -> Self {
        Self {
            identity: identity.into(),
            supported_formats: BTreeSet::new(),
            features: BTreeSet::new(),
            performance: Performance::default(),
            resource_class: ResourceClass::default(),
        }
    }

    /// Add supported formats (normalized)
    #[must_use]
    pub fn with_formats<I, S>(mut self, formats: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.supported_formats
            .extend(formats.into_iter().map(|f| normalize_format(f.as_ref())));
        self
    }

    /// Declare a feature
    #[must_use]
    pub fn with_feature(mut self, feature: Feature) -> Self {
        self.features.insert(feature);
        self
    }

    /// Set the maximum accepted document size
    #[must_use]
    pub fn with_max_file_size(mut self, bytes: u64) -> Self {
        self.performance.max_file_size_bytes = bytes;
        self
    }

    /// Set the declared throughput
    #[must_use]
    pub fn with_speed(mut self, units_per_second: f64) -> Self {
        self.performance.average_units_per_second = units_per_second;
        self
    }

    /// Set the cost hint
    #[must_use]
    pub fn with_resource_class(mut self, class: ResourceClass) -> Self {
        self.resource_class = class;
        self
    }

    /// Whether the format token is supported
    #[must_use]
    pub fn supports_format(&self, format: &str) -> bool {
        self.supported_formats.contains(format)
    }

    /// Whether a feature is declared
    #[must_use]
    pub fn has(&self, feature: Feature) -> bool {
        self.features.contains(&feature)
    }

    /// Static capability check: format supported and size within limit
    #[must_use]
    pub fn accepts(&self, document: &DocumentDescriptor) -> bool {
        self.supports_format(document.format())
            && self.performance.max_file_size_bytes >= document.size_bytes()
    }
}

// ============================================================================
// Provider Trait
// ============================================================================

/// A backend that performs document operations
#[async_trait]
pub trait Provider: Send + Sync {
    /// Stable identity, equal to `capabilities().identity`
    fn identity(&self) -> &str;

    /// Declared capabilities
    fn capabilities(&self) -> CapabilityRecord;

    /// Run `operation` on `document`
    ///
    /// Implementations should give up by `deadline`; the executor also
    /// cancels the returned future once the deadline passes.
    async fn invoke(
        &self,
        operation: &str,
        document: &DocumentDescriptor,
        options: &Value,
        deadline: Instant,
    ) -> Result<Value, ProviderError>;

    /// Whether the provider has everything it needs to run (credentials, binaries)
    fn is_ready(&self) -> bool {
        true
    }
}

/// Provider failures
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ProviderError {
    /// Backend could not be reached
    #[error("provider unavailable: {0}")]
    Unavailable(String),

    /// Backend reported or caused a timeout
    #[error("provider timed out")]
    Timeout,

    /// Backend is throttling
    #[error(
        "rate limited{}",
        .retry_after_ms.map(|ms| format!(", retry after {ms}ms")).unwrap_or_default()
    )]
    RateLimited {
        /// Suggested wait, when the backend supplied one
        retry_after_ms: Option<u64>,
    },

    /// Credentials missing or refused
    #[error("authentication failed")]
    AuthenticationFailed,

    /// Backend refused this input
    #[error("provider rejected request: {0}")]
    Rejected(String),

    /// Backend failed while processing
    #[error("provider failed: {0}")]
    Failed(String),

    /// Backend answered with something that is not a result
    #[error("invalid provider response: {0}")]
    InvalidResponse(String),
}

// ============================================================================
// Provider Factory
// ============================================================================

/// Build the capability record described by a provider configuration entry
#[must_use]
pub fn capabilities_from_config(config: &ProviderConfig) -> CapabilityRecord {
    let mut record = CapabilityRecord::new(&config.id)
        .with_formats(&config.formats)
        .with_max_file_size(config.max_file_size_bytes)
        .with_speed(config.average_units_per_second)
        .with_resource_class(config.resource_class);
    record.features.extend(config.features.iter().copied());
    record
}

/// Create a provider from configuration
///
/// # Errors
///
/// Returns [`ProviderError::Unavailable`] if the underlying client cannot be
/// constructed.
pub fn create_provider(config: &ProviderConfig) -> Result<Arc<dyn Provider>, ProviderError> {
    let record = capabilities_from_config(config);
    match &config.kind {
        ProviderKind::Command { program, args } => Ok(Arc::new(CommandProvider::new(
            record,
            program.clone(),
            args.clone(),
        ))),
        ProviderKind::Http {
            endpoint,
            api_key_env,
        } => {
            let api_key = api_key_env
                .as_deref()
                .and_then(|var| std::env::var(var).ok())
                .filter(|key| !key.is_empty());
            let provider = HttpProvider::new(record, endpoint.clone(), api_key)?
                .requires_credentials(api_key_env.is_some());
            Ok(Arc::new(provider))
        }
    }
}
