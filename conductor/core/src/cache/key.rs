//! Cache keys
//!
//! A key is derived from `(content_hash, operation, canonical(options))`.
//! Canonicalization makes semantically equal options produce the same key:
//! object keys are sorted recursively, arrays keep their order, and floats
//! with an integral value are written as integers.

use std::fmt;

use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::document::DocumentDescriptor;
use crate::error::OrchestratorError;

const SEPARATOR: &[u8] = &[0x1f];

/// Deterministic identity of one (document, operation, options) triple
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct CacheKey {
    content_hash: String,
    operation: String,
    fingerprint: String,
}

impl CacheKey {
    /// Derive the key for a request
    ///
    /// `null` options are treated as `{}`.
    ///
    /// # Errors
    ///
    /// Returns [`OrchestratorError::InvalidOptions`] if `options` is neither an
    /// object nor `null`.
    pub fn new(
        document: &DocumentDescriptor,
        operation: &str,
        options: &Value,
    ) -> Result<Self, OrchestratorError> {
        let canonical = canonical_options(options)?;

        let mut hasher = Sha256::new();
        hasher.update(document.content_hash().as_bytes());
        hasher.update(SEPARATOR);
        hasher.update(operation.as_bytes());
        hasher.update(SEPARATOR);
        hasher.update(canonical.as_bytes());

        Ok(Self {
            content_hash: document.content_hash().to_string(),
            operation: operation.to_string(),
            fingerprint: hex::encode(hasher.finalize()),
        })
    }

    /// Content hash of the document this key belongs to
    #[must_use]
    pub fn content_hash(&self) -> &str {
        &self.content_hash
    }

    /// Operation name
    #[must_use]
    pub fn operation(&self) -> &str {
        &self.operation
    }

    /// Hex digest used as the storage key
    #[must_use]
    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.fingerprint)
    }
}

/// Canonical JSON text of an options object
///
/// # Errors
///
/// Returns [`OrchestratorError::InvalidOptions`] for non-object input.
pub fn canonical_options(options: &Value) -> Result<String, OrchestratorError> {
    match options {
        Value::Null => Ok("{}".to_string()),
        Value::Object(_) => {
            let mut out = String::new();
            write_canonical(options, &mut out);
            Ok(out)
        }
        other => Err(OrchestratorError::InvalidOptions(format!(
            "options must be a JSON object, got {}",
            type_name(other)
        ))),
    }
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Null => out.push_str("null"),
        Value::Bool(b) => out.push_str(if *b { "true" } else { "false" }),
        Value::Number(n) => match n.as_f64() {
            Some(f) if n.is_f64() && f.fract() == 0.0 && f.abs() < 9.0e15 => {
                out.push_str(&format!("{}", f as i64));
            }
            _ => out.push_str(&n.to_string()),
        },
        Value::String(s) => out.push_str(&Value::String(s.clone()).to_string()),
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        Value::Object(map) => {
            let mut entries: Vec<_> = map.iter().collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));
            out.push('{');
            for (i, (key, item)) in entries.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String(key.clone()).to_string());
                out.push(':');
                write_canonical(item, out);
            }
            out.push('}');
        }
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
