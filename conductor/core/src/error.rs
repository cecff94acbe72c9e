//! Error taxonomy
//!
//! Only [`OrchestratorError`] reaches callers of the executor. Per-provider
//! failures are collected as [`AttemptFailure`]s and surface together once
//! every candidate is exhausted; cache corruption is healed inside the cache
//! store and never surfaces at all.

use std::fmt;
use std::time::Duration;

use thiserror::Error;

use crate::provider::ProviderError;

/// A single provider exceeded its deadline
#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("provider {provider} timed out after {}ms", .timeout.as_millis())]
pub struct ProviderTimeout {
    /// Provider identity
    pub provider: String,
    /// Time budget the call was given
    pub timeout: Duration,
}

/// A stored cache entry could not be decoded
#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("cache entry {key} is corrupt: {reason}")]
pub struct CacheCorruption {
    /// Backend key of the entry
    pub key: String,
    /// Decoder or integrity-check message
    pub reason: String,
}

/// Why no candidate list could be produced
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NoEligibleReason {
    /// No registered provider handles this format and size
    Unsupported,
    /// Capable providers exist but all are marked unavailable
    Unavailable,
    /// Every available capable provider has an open circuit
    CircuitOpen,
}

impl fmt::Display for NoEligibleReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unsupported => write!(f, "no registered provider supports it"),
            Self::Unavailable => write!(f, "all capable providers are unavailable"),
            Self::CircuitOpen => write!(f, "all capable providers have open circuits"),
        }
    }
}

/// Why one ranked candidate produced no result
#[derive(Clone, Debug, Error, PartialEq)]
pub enum FailureReason {
    /// The call ran past its deadline and was cancelled
    #[error(transparent)]
    Timeout(#[from] ProviderTimeout),

    /// The deadline was spent before an execution slot was granted
    #[error("deadline expired after waiting {}ms for an execution slot", .waited.as_millis())]
    QueueTimeout {
        /// Time spent queued
        waited: Duration,
    },

    /// The provider returned an error
    #[error(transparent)]
    Provider(#[from] ProviderError),

    /// Skipped: circuit breaker open
    #[error("skipped, circuit breaker open")]
    CircuitOpen,

    /// Skipped: the single half-open trial is already in flight
    #[error("skipped, half-open trial already in flight")]
    TrialInProgress,

    /// The concurrency governor has been shut down
    #[error("execution slots closed")]
    Closed,
}

impl FailureReason {
    /// Whether the provider was actually invoked
    #[must_use]
    pub fn was_invoked(&self) -> bool {
        matches!(self, Self::Timeout(_) | Self::Provider(_))
    }
}

/// One entry of an aggregate failure
#[derive(Clone, Debug, PartialEq)]
pub struct AttemptFailure {
    /// Provider identity
    pub provider: String,
    /// What went wrong
    pub reason: FailureReason,
}

impl AttemptFailure {
    /// Create a new attempt failure
    pub fn new(provider: impl Into<String>, reason: impl Into<FailureReason>) -> Self {
        Self {
            provider: provider.into(),
            reason: reason.into(),
        }
    }
}

impl fmt::Display for AttemptFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.provider, self.reason)
    }
}

/// Errors surfaced by the executor
#[derive(Clone, Debug, Error, PartialEq)]
pub enum OrchestratorError {
    /// No provider can take this document; retrying with the same input is pointless
    #[error("no eligible provider for format '{format}' ({size_bytes} bytes): {reason}")]
    NoEligibleProvider {
        /// Declared document format
        format: String,
        /// Document size
        size_bytes: u64,
        /// Which filter emptied the list
        reason: NoEligibleReason,
    },

    /// Every ranked candidate was tried or skipped without success
    #[error("all providers failed: {}", join_attempts(.attempts))]
    AllProvidersFailed {
        /// One entry per ranked candidate, in the order they were considered
        attempts: Vec<AttemptFailure>,
    },

    /// Options could not be canonicalized into a cache key
    #[error("invalid options: {0}")]
    InvalidOptions(String),
}

impl OrchestratorError {
    /// Provider identities listed in an aggregate failure
    #[must_use]
    pub fn failed_providers(&self) -> Vec<&str> {
        match self {
            Self::AllProvidersFailed { attempts } => {
                attempts.iter().map(|a| a.provider.as_str()).collect()
            }
            _ => Vec::new(),
        }
    }
}

fn join_attempts(attempts: &[AttemptFailure]) -> String {
    if attempts.is_empty() {
        return "no candidates".to_string();
    }
    attempts
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_aggregate_message_lists_every_provider() {
        let err = OrchestratorError::AllProvidersFailed {
            attempts: vec![
                AttemptFailure::new(
                    "deep-remote",
                    ProviderTimeout {
                        provider: "deep-remote".to_string(),
                        timeout: Duration::from_millis(250),
                    },
                ),
                AttemptFailure::new("fast-local", ProviderError::Failed("exit status 2".into())),
                AttemptFailure::new("ocr-cloud", FailureReason::CircuitOpen),
            ],
        };

        let message = err.to_string();
        assert!(message.contains("deep-remote timed out after 250ms"));
        assert!(message.contains("fast-local: provider failed: exit status 2"));
        assert!(message.contains("ocr-cloud: skipped, circuit breaker open"));
        assert_eq!(
            err.failed_providers(),
            vec!["deep-remote", "fast-local", "ocr-cloud"]
        );
    }

    #[test]
    fn test_no_eligible_message() {
        let err = OrchestratorError::NoEligibleProvider {
            format: "pdf".to_string(),
            size_bytes: 10,
            reason: NoEligibleReason::Unsupported,
        };
        assert_eq!(
            err.to_string(),
            "no eligible provider for format 'pdf' (10 bytes): no registered provider supports it"
        );
    }

    #[test]
    fn test_was_invoked() {
        assert!(FailureReason::Provider(ProviderError::Timeout).was_invoked());
        assert!(!FailureReason::CircuitOpen.was_invoked());
        assert!(!FailureReason::QueueTimeout {
            waited: Duration::ZERO
        }
        .was_invoked());
    }
}
