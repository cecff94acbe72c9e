//! Scripted providers for unit tests

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::time::Instant;

use crate::document::DocumentDescriptor;
use crate::provider::{CapabilityRecord, Provider, ProviderError};

/// What a scripted provider does on one call
#[derive(Clone, Debug)]
pub enum Reply {
    Ok(Value),
    Err(ProviderError),
    /// Sleep, then answer
    Slow(Duration, Value),
    /// Never answer
    Hang,
}

/// Provider that replays a script and records its calls
pub struct ScriptedProvider {
    record: CapabilityRecord,
    script: Mutex<VecDeque<Reply>>,
    fallback: Reply,
    ready: bool,
    calls: AtomicUsize,
    operations: Mutex<Vec<String>>,
}

impl ScriptedProvider {
    pub fn scripted(record: CapabilityRecord, script: Vec<Reply>, fallback: Reply) -> Arc<Self> {
        Arc::new(Self {
            record,
            script: Mutex::new(script.into()),
            fallback,
            ready: true,
            calls: AtomicUsize::new(0),
            operations: Mutex::new(Vec::new()),
        })
    }

    /// Always answers `{"provider": <identity>}`
    pub fn ok(record: CapabilityRecord) -> Arc<Self> {
        let reply = Reply::Ok(json!({ "provider": record.identity }));
        Self::scripted(record, Vec::new(), reply)
    }

    pub fn failing(record: CapabilityRecord, error: ProviderError) -> Arc<Self> {
        Self::scripted(record, Vec::new(), Reply::Err(error))
    }

    pub fn slow(record: CapabilityRecord, delay: Duration) -> Arc<Self> {
        let reply = Reply::Slow(delay, json!({ "provider": record.identity }));
        Self::scripted(record, Vec::new(), reply)
    }

    pub fn hanging(record: CapabilityRecord) -> Arc<Self> {
        Self::scripted(record, Vec::new(), Reply::Hang)
    }

    /// Reports itself as not ready (e.g. missing credentials)
    pub fn not_ready(record: CapabilityRecord) -> Arc<Self> {
        let reply = Reply::Ok(json!({ "provider": record.identity }));
        Arc::new(Self {
            record,
            script: Mutex::new(VecDeque::new()),
            fallback: reply,
            ready: false,
            calls: AtomicUsize::new(0),
            operations: Mutex::new(Vec::new()),
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn operations(&self) -> Vec<String> {
        self.operations.lock().clone()
    }
}

#[async_trait]
impl Provider for ScriptedProvider {
    fn identity(&self) -> &str {
        &self.record.identity
    }

    fn capabilities(&self) -> CapabilityRecord {
        self.record.clone()
    }

    fn is_ready(&self) -> bool {
        self.ready
    }

    async fn invoke(
        &self,
        operation: &str,
        _document: &DocumentDescriptor,
        _options: &Value,
        _deadline: Instant,
    ) -> Result<Value, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.operations.lock().push(operation.to_string());
        let reply = self
            .script
            .lock()
            .pop_front()
            .unwrap_or_else(|| self.fallback.clone());

        match reply {
            Reply::Ok(value) => Ok(value),
            Reply::Err(error) => Err(error),
            Reply::Slow(delay, value) => {
                tokio::time::sleep(delay).await;
                Ok(value)
            }
            Reply::Hang => std::future::pending().await,
        }
    }
}
