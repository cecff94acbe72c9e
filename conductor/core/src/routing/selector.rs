//! Selector
//!
//! Ranks eligible providers for a (document, operation, preference) triple.
//!
//! Scoring (all weights configurable):
//!
//! | term                  | applies when                                         |
//! |-----------------------|------------------------------------------------------|
//! | `format_match`        | always (eligibility already guarantees it)           |
//! | `custom_instructions` | custom-instruction operation, provider declares it   |
//! | `ocr`                 | document hinted as scanned, provider declares OCR    |
//! | speed bonus           | document is larger than `large_document_bytes`       |
//! | resource penalty      | a cheaper candidate covers the same needed features  |
//!
//! Ties keep registration order. Open breakers are dropped, and at most one
//! half-open candidate (the best ranked) is kept.

use std::collections::BTreeSet;
use std::sync::Arc;

use serde::Serialize;

use super::breaker::{BreakerBank, CircuitState};
use super::registry::{CapabilityRegistry, RegisteredProvider};
use crate::document::DocumentDescriptor;
use crate::error::{NoEligibleReason, OrchestratorError};
use crate::provider::{CapabilityRecord, Feature};

/// Preference value that means "no preference"
pub const AUTO_PREFERENCE: &str = "auto";

/// Scoring weights
#[derive(Clone, Debug, PartialEq)]
pub struct ScoringWeights {
    /// Base score for a format match
    pub format_match: f64,
    /// Bonus for custom-instruction support on operations that use it
    pub custom_instructions: f64,
    /// Bonus for OCR on scanned documents
    pub ocr: f64,
    /// Declared units/second per bonus point on large documents
    pub speed_divisor: f64,
    /// Penalty per resource-class step above an equally capable cheaper candidate
    pub resource_class_penalty: f64,
}

impl Default for ScoringWeights {
    fn default() -> Self {
        Self {
            format_match: 10.0,
            custom_instructions: 5.0,
            ocr: 8.0,
            speed_divisor: 100.0,
            resource_class_penalty: 3.0,
        }
    }
}

/// Selector configuration
#[derive(Clone, Debug, PartialEq)]
pub struct SelectorConfig {
    /// Scoring weights
    pub weights: ScoringWeights,
    /// Documents above this size get the speed bonus
    pub large_document_bytes: u64,
    /// Operations that benefit from custom instructions
    pub custom_instruction_operations: Vec<String>,
}

impl Default for SelectorConfig {
    fn default() -> Self {
        Self {
            weights: ScoringWeights::default(),
            large_document_bytes: 50 * 1024 * 1024,
            custom_instruction_operations: vec!["deep-analysis".to_string()],
        }
    }
}

/// One ranked candidate
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ScoredCandidate {
    /// Provider identity
    pub identity: String,
    /// Total score (higher ranks first)
    pub score: f64,
    /// Breaker state at scoring time
    pub circuit: CircuitState,
    /// Placed first because the caller asked for it
    pub preferred: bool,
}

/// Ranks providers
pub struct Selector {
    registry: Arc<CapabilityRegistry>,
    breakers: Arc<BreakerBank>,
    config: SelectorConfig,
}

impl Selector {
    /// Create a selector over a registry and breaker bank
    pub fn new(
        registry: Arc<CapabilityRegistry>,
        breakers: Arc<BreakerBank>,
        config: SelectorConfig,
    ) -> Self {
        Self {
            registry,
            breakers,
            config,
        }
    }

    /// Selector configuration
    pub fn config(&self) -> &SelectorConfig {
        &self.config
    }

    /// Ordered candidate identities for a request
    ///
    /// # Errors
    ///
    /// [`OrchestratorError::NoEligibleProvider`] when nothing survives
    /// eligibility and breaker filtering. An unusable preference is ignored,
    /// never an error on its own.
    pub fn select(
        &self,
        document: &DocumentDescriptor,
        operation: &str,
        preference: Option<&str>,
    ) -> Result<Vec<String>, OrchestratorError> {
        let ranked = self.rank(document, operation, preference)?;

        let mut half_open_kept = false;
        let candidates: Vec<String> = ranked
            .into_iter()
            .filter(|c| match c.circuit {
                CircuitState::Closed => true,
                CircuitState::Open => false,
                CircuitState::HalfOpen => !std::mem::replace(&mut half_open_kept, true),
            })
            .map(|c| c.identity)
            .collect();

        if candidates.is_empty() {
            return Err(self.no_eligible(document, NoEligibleReason::CircuitOpen));
        }

        tracing::debug!(operation, candidates = ?candidates, "Ranked providers");
        Ok(candidates)
    }

    /// Every eligible provider with its score and breaker state, best first
    ///
    /// Unlike [`select`](Self::select), breaker-open candidates are included.
    ///
    /// # Errors
    ///
    /// [`OrchestratorError::NoEligibleProvider`] when no provider is eligible.
    pub fn rank(
        &self,
        document: &DocumentDescriptor,
        operation: &str,
        preference: Option<&str>,
    ) -> Result<Vec<ScoredCandidate>, OrchestratorError> {
        let eligible = self.registry.list_eligible(document);
        if eligible.is_empty() {
            let reason = if self.registry.supports(document) {
                NoEligibleReason::Unavailable
            } else {
                NoEligibleReason::Unsupported
            };
            return Err(self.no_eligible(document, reason));
        }

        let preferred = preference
            .filter(|p| !p.is_empty() && *p != AUTO_PREFERENCE)
            .filter(|p| {
                eligible.iter().any(|e| e.identity() == *p) && !self.breakers.is_open(p)
            });
        if let Some(p) = preference {
            if preferred.is_none() && p != AUTO_PREFERENCE {
                tracing::debug!(preference = p, "Ignoring unusable provider preference");
            }
        }

        let needed = self.needed_features(document, operation);
        let mut scored: Vec<ScoredCandidate> = eligible
            .iter()
            .filter(|e| Some(e.identity()) != preferred)
            .map(|e| ScoredCandidate {
                identity: e.identity().to_string(),
                score: self.score(e.record(), document, &needed, &eligible),
                circuit: self.breakers.state(e.identity()),
                preferred: false,
            })
            .collect();
        // Stable: equal scores keep registration order
        scored.sort_by(|a, b| b.score.total_cmp(&a.score));

        if let Some(p) = preferred {
            let entry = eligible.iter().find(|e| e.identity() == p);
            scored.insert(
                0,
                ScoredCandidate {
                    identity: p.to_string(),
                    score: entry.map_or(0.0, |e| {
                        self.score(e.record(), document, &needed, &eligible)
                    }),
                    circuit: self.breakers.state(p),
                    preferred: true,
                },
            );
        }

        Ok(scored)
    }

    fn needed_features(&self, document: &DocumentDescriptor, operation: &str) -> BTreeSet<Feature> {
        let mut needed = BTreeSet::new();
        if self
            .config
            .custom_instruction_operations
            .iter()
            .any(|op| op == operation)
        {
            needed.insert(Feature::CustomInstructions);
        }
        if document.is_scanned() {
            needed.insert(Feature::Ocr);
        }
        needed
    }

    fn score(
        &self,
        record: &CapabilityRecord,
        document: &DocumentDescriptor,
        needed: &BTreeSet<Feature>,
        eligible: &[Arc<RegisteredProvider>],
    ) -> f64 {
        let weights = &self.config.weights;
        let mut score = weights.format_match;

        if needed.contains(&Feature::CustomInstructions)
            && record.has(Feature::CustomInstructions)
        {
            score += weights.custom_instructions;
        }
        if needed.contains(&Feature::Ocr) && record.has(Feature::Ocr) {
            score += weights.ocr;
        }
        if document.size_bytes() > self.config.large_document_bytes && weights.speed_divisor > 0.0 {
            score += record.performance.average_units_per_second / weights.speed_divisor;
        }

        // Penalize cost only when something cheaper does the same job
        let covered = |r: &CapabilityRecord| -> BTreeSet<Feature> {
            needed.iter().copied().filter(|f| r.has(*f)).collect()
        };
        let own = covered(record);
        let cheapest_equivalent = eligible
            .iter()
            .map(|e| e.record())
            .filter(|other| other.resource_class < record.resource_class)
            .filter(|other| covered(*other).is_superset(&own))
            .map(|other| other.resource_class.rank())
            .min();
        if let Some(cheaper) = cheapest_equivalent {
            let steps = f64::from(record.resource_class.rank() - cheaper);
            score -= weights.resource_class_penalty * steps;
        }

        score
    }

    fn no_eligible(
        &self,
        document: &DocumentDescriptor,
        reason: NoEligibleReason,
    ) -> OrchestratorError {
        OrchestratorError::NoEligibleProvider {
            format: document.format().to_string(),
            size_bytes: document.size_bytes(),
            reason,
        }
    }
}
