//! TOML Configuration File Support
//!
//! Centralized configuration loading for the orchestration layer, read once
//! at startup from `~/.config/docconductor/conductor.toml`.
//!
//! # Configuration Priority
//!
//! Configuration values are loaded with the following priority (highest first):
//! 1. CLI arguments ([`ConfigOverrides`])
//! 2. Environment variables (`DOCCONDUCTOR_*`)
//! 3. TOML configuration file
//! 4. Default values
//!
//! # Example Configuration
//!
//! ```toml
//! [cache]
//! ttl_secs = 86400
//! max_entries = 10000
//! directory = "/var/cache/docconductor"
//!
//! [governor]
//! max_in_flight = 4
//! call_timeout_ms = 30000
//!
//! [breaker]
//! failure_threshold = 5
//! cooldown_ms = 30000
//!
//! [executor]
//! coalesce_requests = true
//!
//! [[providers]]
//! id = "pdftotext"
//! kind = "command"
//! program = "pdftotext"
//! args = ["{source}", "-"]
//! formats = ["pdf"]
//!
//! [[providers]]
//! id = "deep-remote"
//! kind = "http"
//! endpoint = "https://api.example.com/v1/analyze"
//! api_key_env = "DEEP_REMOTE_API_KEY"
//! formats = ["pdf", "docx"]
//! features = ["ocr", "custom_instructions"]
//! resource_class = "metered"
//! ```

use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::cache::CacheConfig;
use crate::provider::{Feature, Performance, ResourceClass};
use crate::routing::{BreakerConfig, ExecutorConfig, GovernorConfig, ScoringWeights, SelectorConfig};

// =============================================================================
// Error Types
// =============================================================================

/// Errors that can occur when loading configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read config file
    #[error("Failed to read config file at {path}: {source}")]
    ReadError {
        /// The path that was attempted
        path: PathBuf,
        /// The underlying IO error
        source: std::io::Error,
    },

    /// Failed to parse TOML
    #[error("Failed to parse TOML config: {0}")]
    ParseError(#[from] toml::de::Error),

    /// Invalid configuration value
    #[error("Invalid configuration: {0}")]
    ValidationError(String),

    /// Failed to render configuration as TOML
    #[error("Failed to render TOML config: {0}")]
    RenderError(#[from] toml::ser::Error),
}

// =============================================================================
// Configuration Source Tracking
// =============================================================================

/// Tracks where a configuration value came from
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConfigSource {
    /// Value from command-line argument
    Cli,
    /// Value from environment variable
    Env,
    /// Value from TOML configuration file
    File,
    /// Default value
    Default,
}

impl std::fmt::Display for ConfigSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Cli => write!(f, "CLI"),
            Self::Env => write!(f, "environment"),
            Self::File => write!(f, "config file"),
            Self::Default => write!(f, "default"),
        }
    }
}

// =============================================================================
// Provider Entries
// =============================================================================

/// How a configured provider is reached
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ProviderKind {
    /// Local program run once per request
    Command {
        /// Executable name or path
        program: String,
        /// Argument template; `{source}`, `{operation}`, `{format}` and `{hash}` are substituted
        #[serde(default)]
        args: Vec<String>,
    },
    /// Remote endpoint receiving a JSON POST
    Http {
        /// Request URL
        endpoint: String,
        /// Environment variable holding the bearer credential
        #[serde(default)]
        api_key_env: Option<String>,
    },
}

impl Default for ProviderKind {
    fn default() -> Self {
        Self::Command {
            program: String::new(),
            args: Vec::new(),
        }
    }
}

/// One `[[providers]]` entry
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ProviderConfig {
    /// Provider identity
    pub id: String,

    /// Disabled providers are registered but never selected
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// Supported format tokens
    #[serde(default)]
    pub formats: Vec<String>,

    /// Declared features
    #[serde(default)]
    pub features: Vec<Feature>,

    /// Largest accepted document
    #[serde(default = "default_max_file_size")]
    pub max_file_size_bytes: u64,

    /// Declared throughput
    #[serde(default = "default_speed")]
    pub average_units_per_second: f64,

    /// Cost hint
    #[serde(default)]
    pub resource_class: ResourceClass,

    /// Transport
    #[serde(flatten)]
    pub kind: ProviderKind,
}

fn default_enabled() -> bool {
    true
}

fn default_max_file_size() -> u64 {
    Performance::default().max_file_size_bytes
}

fn default_speed() -> f64 {
    Performance::default().average_units_per_second
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            id: String::new(),
            enabled: true,
            formats: Vec::new(),
            features: Vec::new(),
            max_file_size_bytes: default_max_file_size(),
            average_units_per_second: default_speed(),
            resource_class: ResourceClass::default(),
            kind: ProviderKind::default(),
        }
    }
}

// =============================================================================
// TOML Configuration Structures
// =============================================================================

/// Cache section of the TOML configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheToml {
    /// Default entry lifetime in seconds
    pub ttl_secs: Option<u64>,

    /// Maximum live entries
    pub max_entries: Option<usize>,

    /// Persist entries under this directory
    pub directory: Option<PathBuf>,
}

/// Governor section of the TOML configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GovernorToml {
    /// Maximum concurrent provider calls
    pub max_in_flight: Option<usize>,

    /// Per-call budget in milliseconds
    pub call_timeout_ms: Option<u64>,
}

/// Breaker section of the TOML configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerToml {
    /// Consecutive failures that open a circuit
    pub failure_threshold: Option<u32>,

    /// Windowed failure rate that opens a circuit
    pub failure_rate_threshold: Option<f64>,

    /// Outcomes kept in the window
    pub window_size: Option<usize>,

    /// Outcomes required before the rate rule applies
    pub minimum_calls: Option<usize>,

    /// Open duration before a trial, in milliseconds
    pub cooldown_ms: Option<u64>,
}

/// Selector section of the TOML configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SelectorToml {
    /// Base score for a format match
    pub format_match: Option<f64>,
    /// Bonus for custom-instruction support
    pub custom_instructions: Option<f64>,
    /// Bonus for OCR on scanned documents
    pub ocr: Option<f64>,
    /// Units/second per speed bonus point
    pub speed_divisor: Option<f64>,
    /// Penalty per resource-class step
    pub resource_class_penalty: Option<f64>,

    /// Documents above this size get the speed bonus
    pub large_document_bytes: Option<u64>,

    /// Operations that benefit from custom instructions
    pub custom_instruction_operations: Option<Vec<String>>,
}

/// Executor section of the TOML configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorToml {
    /// Share one execution between concurrent identical misses
    pub coalesce_requests: Option<bool>,
}

/// Top-level TOML configuration structure
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorToml {
    /// Cache configuration section
    pub cache: CacheToml,

    /// Governor configuration section
    pub governor: GovernorToml,

    /// Breaker configuration section
    pub breaker: BreakerToml,

    /// Selector configuration section
    pub selector: SelectorToml,

    /// Executor configuration section
    pub executor: ExecutorToml,

    /// Provider entries
    pub providers: Vec<ProviderConfig>,
}

// =============================================================================
// Main Configuration Struct
// =============================================================================

/// Effective configuration for the orchestration layer
///
/// Consolidates every source and records which one was applied last. Use
/// [`load_config`] to load with proper priority handling.
#[derive(Clone, Debug)]
pub struct OrchestratorConfig {
    /// Cache configuration
    pub cache: CacheConfig,

    /// Concurrency governor configuration
    pub governor: GovernorConfig,

    /// Circuit breaker thresholds
    pub breaker: BreakerConfig,

    /// Ranking configuration
    pub selector: SelectorConfig,

    /// Executor options
    pub executor: ExecutorConfig,

    /// Configured providers, in registration order
    pub providers: Vec<ProviderConfig>,

    /// Path to the config file that was loaded (if any)
    pub config_file_path: Option<PathBuf>,

    source: ConfigSource,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            cache: CacheConfig::default(),
            governor: GovernorConfig::default(),
            breaker: BreakerConfig::default(),
            selector: SelectorConfig::default(),
            executor: ExecutorConfig::default(),
            providers: Vec::new(),
            config_file_path: None,
            source: ConfigSource::Default,
        }
    }
}

impl OrchestratorConfig {
    /// Create a new configuration with default values
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the primary source of this configuration
    #[must_use]
    pub fn source(&self) -> ConfigSource {
        self.source
    }

    /// Set the configuration source
    pub fn set_source(&mut self, source: ConfigSource) {
        self.source = source;
    }

    /// Check values that would make the layer unusable
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::ValidationError`] describing the first problem found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.governor.max_in_flight == 0 {
            return Err(invalid("governor.max_in_flight must be at least 1"));
        }
        if self.governor.call_timeout.is_zero() {
            return Err(invalid("governor.call_timeout_ms must be positive"));
        }
        if self.cache.max_entries == 0 {
            return Err(invalid("cache.max_entries must be at least 1"));
        }
        let rate = self.breaker.failure_rate_threshold;
        if !(rate > 0.0 && rate <= 1.0) {
            return Err(invalid(format!(
                "breaker.failure_rate_threshold must be in (0, 1], got {rate}"
            )));
        }
        if self.breaker.failure_threshold == 0 {
            return Err(invalid("breaker.failure_threshold must be at least 1"));
        }
        if self.breaker.window_size == 0 {
            return Err(invalid("breaker.window_size must be at least 1"));
        }
        // The window never holds more than window_size outcomes
        if self.breaker.minimum_calls > self.breaker.window_size {
            return Err(invalid(format!(
                "breaker.minimum_calls ({}) must not exceed breaker.window_size ({})",
                self.breaker.minimum_calls, self.breaker.window_size
            )));
        }

        let mut seen = HashSet::new();
        for provider in &self.providers {
            if provider.id.trim().is_empty() {
                return Err(invalid("provider id must not be empty"));
            }
            if !seen.insert(provider.id.as_str()) {
                return Err(invalid(format!("duplicate provider id '{}'", provider.id)));
            }
            if provider.formats.is_empty() {
                return Err(invalid(format!(
                    "provider '{}' declares no formats",
                    provider.id
                )));
            }
        }
        Ok(())
    }

    /// Render the effective configuration in file form
    #[must_use]
    pub fn to_toml(&self) -> OrchestratorToml {
        let weights = &self.selector.weights;
        OrchestratorToml {
            cache: CacheToml {
                ttl_secs: Some(self.cache.default_ttl.as_secs()),
                max_entries: Some(self.cache.max_entries),
                directory: self.cache.directory.clone(),
            },
            governor: GovernorToml {
                max_in_flight: Some(self.governor.max_in_flight),
                call_timeout_ms: Some(self.governor.call_timeout.as_millis() as u64),
            },
            breaker: BreakerToml {
                failure_threshold: Some(self.breaker.failure_threshold),
                failure_rate_threshold: Some(self.breaker.failure_rate_threshold),
                window_size: Some(self.breaker.window_size),
                minimum_calls: Some(self.breaker.minimum_calls),
                cooldown_ms: Some(self.breaker.cooldown.as_millis() as u64),
            },
            selector: SelectorToml {
                format_match: Some(weights.format_match),
                custom_instructions: Some(weights.custom_instructions),
                ocr: Some(weights.ocr),
                speed_divisor: Some(weights.speed_divisor),
                resource_class_penalty: Some(weights.resource_class_penalty),
                large_document_bytes: Some(self.selector.large_document_bytes),
                custom_instruction_operations: Some(
                    self.selector.custom_instruction_operations.clone(),
                ),
            },
            executor: ExecutorToml {
                coalesce_requests: Some(self.executor.coalesce_requests),
            },
            providers: self.providers.clone(),
        }
    }
}

impl OrchestratorConfig {
    /// Render the effective configuration as TOML text
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::RenderError`] if serialization fails.
    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(&self.to_toml())?)
    }
}

fn invalid(message: impl Into<String>) -> ConfigError {
    ConfigError::ValidationError(message.into())
}

// =============================================================================
// Configuration Loading
// =============================================================================

/// Get the default configuration file path
///
/// Returns `$XDG_CONFIG_HOME/docconductor/conductor.toml` or the platform
/// equivalent.
#[must_use]
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|p| p.join("docconductor").join("conductor.toml"))
}

/// Load configuration from all sources with proper priority
///
/// # Errors
///
/// Returns an error if the config file exists but cannot be parsed, or if
/// the result fails validation. A missing config file is not an error.
pub fn load_config() -> Result<OrchestratorConfig, ConfigError> {
    load_config_from_path(default_config_path())
}

/// Load configuration from a specific path
///
/// With `None`, only defaults and environment variables are used.
///
/// # Errors
///
/// Returns an error if the specified config file cannot be read or parsed,
/// or if the result fails validation.
pub fn load_config_from_path(path: Option<PathBuf>) -> Result<OrchestratorConfig, ConfigError> {
    let mut config = OrchestratorConfig::default();

    if let Some(ref config_path) = path {
        if config_path.exists() {
            let toml_content =
                std::fs::read_to_string(config_path).map_err(|e| ConfigError::ReadError {
                    path: config_path.clone(),
                    source: e,
                })?;

            let toml_config: OrchestratorToml = toml::from_str(&toml_content)?;
            apply_toml_config(&mut config, toml_config);
            config.config_file_path = Some(config_path.clone());
            config.source = ConfigSource::File;

            tracing::info!(
                path = %config_path.display(),
                providers = config.providers.len(),
                "Loaded configuration from file"
            );
        } else {
            tracing::debug!(
                path = %config_path.display(),
                "Config file not found, using defaults"
            );
        }
    }

    apply_env_config(&mut config);
    config.validate()?;

    Ok(config)
}

fn apply_toml_config(config: &mut OrchestratorConfig, toml: OrchestratorToml) {
    if let Some(secs) = toml.cache.ttl_secs {
        config.cache.default_ttl = Duration::from_secs(secs);
    }
    if let Some(max) = toml.cache.max_entries {
        config.cache.max_entries = max;
    }
    if toml.cache.directory.is_some() {
        config.cache.directory = toml.cache.directory;
    }

    if let Some(max) = toml.governor.max_in_flight {
        config.governor.max_in_flight = max;
    }
    if let Some(ms) = toml.governor.call_timeout_ms {
        config.governor.call_timeout = Duration::from_millis(ms);
    }

    if let Some(threshold) = toml.breaker.failure_threshold {
        config.breaker.failure_threshold = threshold;
    }
    if let Some(rate) = toml.breaker.failure_rate_threshold {
        config.breaker.failure_rate_threshold = rate;
    }
    if let Some(size) = toml.breaker.window_size {
        config.breaker.window_size = size;
    }
    if let Some(min) = toml.breaker.minimum_calls {
        config.breaker.minimum_calls = min;
    }
    if let Some(ms) = toml.breaker.cooldown_ms {
        config.breaker.cooldown = Duration::from_millis(ms);
    }

    let weights: &mut ScoringWeights = &mut config.selector.weights;
    if let Some(w) = toml.selector.format_match {
        weights.format_match = w;
    }
    if let Some(w) = toml.selector.custom_instructions {
        weights.custom_instructions = w;
    }
    if let Some(w) = toml.selector.ocr {
        weights.ocr = w;
    }
    if let Some(w) = toml.selector.speed_divisor {
        weights.speed_divisor = w;
    }
    if let Some(w) = toml.selector.resource_class_penalty {
        weights.resource_class_penalty = w;
    }
    if let Some(bytes) = toml.selector.large_document_bytes {
        config.selector.large_document_bytes = bytes;
    }
    if let Some(ops) = toml.selector.custom_instruction_operations {
        config.selector.custom_instruction_operations = ops;
    }

    if let Some(coalesce) = toml.executor.coalesce_requests {
        config.executor.coalesce_requests = coalesce;
    }

    config.providers = toml.providers;
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    let raw = std::env::var(name).ok()?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!(var = name, value = %raw, "Ignoring unparseable environment override");
            None
        }
    }
}

fn apply_env_config(config: &mut OrchestratorConfig) {
    if let Some(secs) = env_parse::<u64>("DOCCONDUCTOR_CACHE_TTL_SECS") {
        config.cache.default_ttl = Duration::from_secs(secs);
        config.source = ConfigSource::Env;
    }
    if let Some(max) = env_parse::<usize>("DOCCONDUCTOR_CACHE_MAX_ENTRIES") {
        config.cache.max_entries = max;
        config.source = ConfigSource::Env;
    }
    if let Ok(dir) = std::env::var("DOCCONDUCTOR_CACHE_DIR") {
        config.cache.directory = (!dir.is_empty()).then(|| PathBuf::from(dir));
        config.source = ConfigSource::Env;
    }

    if let Some(max) = env_parse::<usize>("DOCCONDUCTOR_MAX_IN_FLIGHT") {
        config.governor.max_in_flight = max;
        config.source = ConfigSource::Env;
    }
    if let Some(ms) = env_parse::<u64>("DOCCONDUCTOR_CALL_TIMEOUT_MS") {
        config.governor.call_timeout = Duration::from_millis(ms);
        config.source = ConfigSource::Env;
    }

    if let Some(threshold) = env_parse::<u32>("DOCCONDUCTOR_BREAKER_FAILURE_THRESHOLD") {
        config.breaker.failure_threshold = threshold;
        config.source = ConfigSource::Env;
    }
    if let Some(ms) = env_parse::<u64>("DOCCONDUCTOR_BREAKER_COOLDOWN_MS") {
        config.breaker.cooldown = Duration::from_millis(ms);
        config.source = ConfigSource::Env;
    }

    if let Ok(enabled) = std::env::var("DOCCONDUCTOR_COALESCE") {
        config.executor.coalesce_requests = enabled != "0" && enabled.to_lowercase() != "false";
        config.source = ConfigSource::Env;
    }

    if let Ok(disabled) = std::env::var("DOCCONDUCTOR_DISABLED_PROVIDERS") {
        let disabled: HashSet<&str> = disabled
            .split(',')
            .map(str::trim)
            .filter(|id| !id.is_empty())
            .collect();
        for provider in &mut config.providers {
            if disabled.contains(provider.id.as_str()) {
                provider.enabled = false;
            }
        }
        config.source = ConfigSource::Env;
    }
}

// =============================================================================
// CLI Override Support
// =============================================================================

/// Builder for applying CLI overrides to configuration
///
/// Use this after [`load_config`] to apply command-line argument overrides.
#[derive(Clone, Debug, Default)]
pub struct ConfigOverrides {
    /// Cache directory override
    pub cache_dir: Option<PathBuf>,

    /// Cache TTL override (seconds)
    pub cache_ttl_secs: Option<u64>,

    /// Concurrency bound override
    pub max_in_flight: Option<usize>,

    /// Per-call budget override (milliseconds)
    pub call_timeout_ms: Option<u64>,

    /// Coalescing override
    pub coalesce_requests: Option<bool>,
}

impl ConfigOverrides {
    /// Create a new empty set of overrides
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set cache directory override
    #[must_use]
    pub fn with_cache_dir(mut self, dir: PathBuf) -> Self {
        self.cache_dir = Some(dir);
        self
    }

    /// Set cache TTL override
    #[must_use]
    pub fn with_cache_ttl_secs(mut self, secs: u64) -> Self {
        self.cache_ttl_secs = Some(secs);
        self
    }

    /// Set concurrency bound override
    #[must_use]
    pub fn with_max_in_flight(mut self, max: usize) -> Self {
        self.max_in_flight = Some(max);
        self
    }

    /// Set per-call budget override
    #[must_use]
    pub fn with_call_timeout_ms(mut self, ms: u64) -> Self {
        self.call_timeout_ms = Some(ms);
        self
    }

    /// Set coalescing override
    #[must_use]
    pub fn with_coalesce_requests(mut self, enabled: bool) -> Self {
        self.coalesce_requests = Some(enabled);
        self
    }

    /// Apply overrides to a configuration
    pub fn apply(&self, config: &mut OrchestratorConfig) {
        if self.cache_dir.is_some()
            || self.cache_ttl_secs.is_some()
            || self.max_in_flight.is_some()
            || self.call_timeout_ms.is_some()
            || self.coalesce_requests.is_some()
        {
            config.source = ConfigSource::Cli;
        }

        if let Some(ref dir) = self.cache_dir {
            config.cache.directory = Some(dir.clone());
        }
        if let Some(secs) = self.cache_ttl_secs {
            config.cache.default_ttl = Duration::from_secs(secs);
        }
        if let Some(max) = self.max_in_flight {
            config.governor.max_in_flight = max;
        }
        if let Some(ms) = self.call_timeout_ms {
            config.governor.call_timeout = Duration::from_millis(ms);
        }
        if let Some(enabled) = self.coalesce_requests {
            config.executor.coalesce_requests = enabled;
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
