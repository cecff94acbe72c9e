//! Capability Registry
//!
//! Catalog of registered providers and their declared capabilities.
//! Availability is a query-time filter: a provider marked unavailable stays
//! registered and keeps its registration order.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::Serialize;

use crate::document::DocumentDescriptor;
use crate::provider::{CapabilityRecord, Provider};

/// A registered provider with its runtime availability flag
pub struct RegisteredProvider {
    record: CapabilityRecord,
    provider: Arc<dyn Provider>,
    available: AtomicBool,
    order: u64,
}

impl RegisteredProvider {
    /// Declared capabilities, captured at registration
    pub fn record(&self) -> &CapabilityRecord {
        &self.record
    }

    /// The provider itself
    pub fn provider(&self) -> &Arc<dyn Provider> {
        &self.provider
    }

    /// Provider identity
    pub fn identity(&self) -> &str {
        &self.record.identity
    }

    /// Current availability flag
    pub fn is_available(&self) -> bool {
        self.available.load(Ordering::Acquire)
    }

    /// Registration sequence number (lower registered earlier)
    pub fn order(&self) -> u64 {
        self.order
    }
}

impl std::fmt::Debug for RegisteredProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegisteredProvider")
            .field("identity", &self.record.identity)
            .field("available", &self.is_available())
            .field("order", &self.order)
            .finish()
    }
}

/// Registry entry for introspection
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ProviderSnapshot {
    /// Declared capabilities
    pub record: CapabilityRecord,
    /// Availability flag
    pub available: bool,
}

/// Thread-safe provider catalog
///
/// Reads (eligibility queries) take a shared lock; availability flips only
/// need that shared lock too, since the flag is atomic.
#[derive(Default)]
pub struct CapabilityRegistry {
    providers: RwLock<Vec<Arc<RegisteredProvider>>>,
    next_order: AtomicU64,
}

impl CapabilityRegistry {
    /// Create an empty registry
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a provider, available by default
    ///
    /// Registering an identity that already exists replaces it in place and
    /// keeps its original registration order.
    pub fn register(&self, provider: Arc<dyn Provider>) {
        let record = provider.capabilities();
        let mut providers = self.providers.write();

        if let Some(slot) = providers
            .iter_mut()
            .find(|p| p.record.identity == record.identity)
        {
            tracing::debug!(provider = %record.identity, "Replacing registered provider");
            *slot = Arc::new(RegisteredProvider {
                available: AtomicBool::new(slot.is_available()),
                order: slot.order,
                record,
                provider,
            });
            return;
        }

        tracing::debug!(
            provider = %record.identity,
            formats = ?record.supported_formats,
            "Registered provider"
        );
        providers.push(Arc::new(RegisteredProvider {
            order: self.next_order.fetch_add(1, Ordering::Relaxed),
            available: AtomicBool::new(true),
            record,
            provider,
        }));
    }

    /// Remove a provider; returns whether it was registered
    pub fn unregister(&self, identity: &str) -> bool {
        let mut providers = self.providers.write();
        let before = providers.len();
        providers.retain(|p| p.record.identity != identity);
        providers.len() != before
    }

    /// Flip a provider's availability; returns whether it is registered
    pub fn mark_availability(&self, identity: &str, available: bool) -> bool {
        let providers = self.providers.read();
        match providers.iter().find(|p| p.record.identity == identity) {
            Some(entry) => {
                let previous = entry.available.swap(available, Ordering::AcqRel);
                if previous != available {
                    tracing::info!(
                        provider = %identity,
                        available,
                        "Provider availability changed"
                    );
                }
                true
            }
            None => false,
        }
    }

    /// Available providers that accept this document, in registration order
    pub fn list_eligible(&self, document: &DocumentDescriptor) -> Vec<Arc<RegisteredProvider>> {
        self.providers
            .read()
            .iter()
            .filter(|p| p.is_available() && p.record.accepts(document))
            .cloned()
            .collect()
    }

    /// Whether any registered provider accepts this document, ignoring availability
    pub fn supports(&self, document: &DocumentDescriptor) -> bool {
        self.providers
            .read()
            .iter()
            .any(|p| p.record.accepts(document))
    }

    /// Whether a specific provider is eligible for this document
    pub fn is_eligible(&self, identity: &str, document: &DocumentDescriptor) -> bool {
        self.get(identity)
            .is_some_and(|p| p.is_available() && p.record.accepts(document))
    }

    /// Look up a provider by identity
    pub fn get(&self, identity: &str) -> Option<Arc<RegisteredProvider>> {
        self.providers
            .read()
            .iter()
            .find(|p| p.record.identity == identity)
            .cloned()
    }

    /// All providers, in registration order
    pub fn snapshot(&self) -> Vec<ProviderSnapshot> {
        self.providers
            .read()
            .iter()
            .map(|p| ProviderSnapshot {
                record: p.record.clone(),
                available: p.is_available(),
            })
            .collect()
    }

    /// Number of registered providers
    pub fn len(&self) -> usize {
        self.providers.read().len()
    }

    /// Whether nothing is registered
    pub fn is_empty(&self) -> bool {
        self.providers.read().is_empty()
    }
}
