//! Cache storage backends
//!
//! The [`CacheStore`](super::CacheStore) owns indexing, TTL and LRU policy;
//! a backend only persists opaque byte records under string keys.

use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use parking_lot::RwLock;
use thiserror::Error;

use crate::error::CacheCorruption;

const RECORD_MAGIC: &[u8; 4] = b"DCC1";
const HEADER_LEN: usize = 8;
const ENTRY_EXTENSION: &str = "entry";

/// Errors raised by cache storage
#[derive(Debug, Error)]
pub enum CacheError {
    /// A stored record failed its integrity check
    #[error(transparent)]
    Corrupt(#[from] CacheCorruption),

    /// Filesystem failure
    #[error("cache I/O error at {path}: {source}")]
    Io {
        /// File or directory involved
        path: PathBuf,
        /// Underlying error
        source: io::Error,
    },

    /// Key contains characters that are unsafe as a file name
    #[error("invalid cache key '{0}'")]
    InvalidKey(String),

    /// Record (de)serialization failed
    #[error("cache serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Byte-level storage for cache records
pub trait CacheBackend: Send + Sync {
    /// Backend name for logs
    fn name(&self) -> &str;

    /// Read a record
    ///
    /// # Errors
    ///
    /// [`CacheError::Corrupt`] when the record exists but is damaged.
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError>;

    /// Write or replace a record
    ///
    /// # Errors
    ///
    /// Propagates storage failures.
    fn put(&self, key: &str, record: &[u8]) -> Result<(), CacheError>;

    /// Remove a record; removing a missing key is not an error
    ///
    /// # Errors
    ///
    /// Propagates storage failures.
    fn delete(&self, key: &str) -> Result<(), CacheError>;

    /// All stored keys
    ///
    /// # Errors
    ///
    /// Propagates storage failures.
    fn keys(&self) -> Result<Vec<String>, CacheError>;
}

// ============================================================================
// Memory Backend
// ============================================================================

/// Process-local backend
#[derive(Debug, Default)]
pub struct MemoryBackend {
    records: RwLock<HashMap<String, Vec<u8>>>,
}

impl MemoryBackend {
    /// Create an empty backend
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Overwrite a record's raw bytes, bypassing any checks
    #[cfg(test)]
    pub(crate) fn put_raw(&self, key: &str, bytes: Vec<u8>) {
        self.records.write().insert(key.to_string(), bytes);
    }
}

impl CacheBackend for MemoryBackend {
    fn name(&self) -> &str {
        "memory"
    }

    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError> {
        Ok(self.records.read().get(key).cloned())
    }

    fn put(&self, key: &str, record: &[u8]) -> Result<(), CacheError> {
        self.records.write().insert(key.to_string(), record.to_vec());
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<(), CacheError> {
        self.records.write().remove(key);
        Ok(())
    }

    fn keys(&self) -> Result<Vec<String>, CacheError> {
        Ok(self.records.read().keys().cloned().collect())
    }
}

// ============================================================================
// Disk Backend
// ============================================================================

/// One file per record, framed as `magic | crc32 (LE) | payload`
#[derive(Debug)]
pub struct DiskBackend {
    directory: PathBuf,
}

impl DiskBackend {
    /// Open (and create if needed) a cache directory
    ///
    /// # Errors
    ///
    /// [`CacheError::Io`] if the directory cannot be created.
    pub fn open(directory: impl Into<PathBuf>) -> Result<Self, CacheError> {
        let directory = directory.into();
        fs::create_dir_all(&directory).map_err(|source| CacheError::Io {
            path: directory.clone(),
            source,
        })?;
        Ok(Self { directory })
    }

    /// Root directory
    #[must_use]
    pub fn directory(&self) -> &Path {
        &self.directory
    }

    fn path_for(&self, key: &str) -> Result<PathBuf, CacheError> {
        let valid = !key.is_empty()
            && key
                .bytes()
                .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_');
        if !valid {
            return Err(CacheError::InvalidKey(key.to_string()));
        }
        Ok(self.directory.join(format!("{key}.{ENTRY_EXTENSION}")))
    }
}

fn frame(record: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(HEADER_LEN + record.len());
    out.extend_from_slice(RECORD_MAGIC);
    out.extend_from_slice(&crc32fast::hash(record).to_le_bytes());
    out.extend_from_slice(record);
    out
}

fn unframe(key: &str, bytes: Vec<u8>) -> Result<Vec<u8>, CacheCorruption> {
    let corrupt = |reason: &str| CacheCorruption {
        key: key.to_string(),
        reason: reason.to_string(),
    };

    if bytes.len() < HEADER_LEN {
        return Err(corrupt("truncated header"));
    }
    if &bytes[..4] != RECORD_MAGIC {
        return Err(corrupt("bad magic"));
    }
    let mut crc = [0u8; 4];
    crc.copy_from_slice(&bytes[4..HEADER_LEN]);
    let payload = &bytes[HEADER_LEN..];
    if crc32fast::hash(payload) != u32::from_le_bytes(crc) {
        return Err(corrupt("checksum mismatch"));
    }
    Ok(payload.to_vec())
}

impl CacheBackend for DiskBackend {
    fn name(&self) -> &str {
        "disk"
    }

    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError> {
        let path = self.path_for(key)?;
        match fs::read(&path) {
            Ok(bytes) => Ok(Some(unframe(key, bytes)?)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(source) => Err(CacheError::Io { path, source }),
        }
    }

    fn put(&self, key: &str, record: &[u8]) -> Result<(), CacheError> {
        let path = self.path_for(key)?;
        // Write-then-rename so readers never observe a partial record
        let tmp = path.with_extension(format!("{ENTRY_EXTENSION}.tmp"));
        fs::write(&tmp, frame(record)).map_err(|source| CacheError::Io {
            path: tmp.clone(),
            source,
        })?;
        fs::rename(&tmp, &path).map_err(|source| CacheError::Io { path, source })
    }

    fn delete(&self, key: &str) -> Result<(), CacheError> {
        let path = self.path_for(key)?;
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(CacheError::Io { path, source }),
        }
    }

    fn keys(&self) -> Result<Vec<String>, CacheError> {
        let entries = fs::read_dir(&self.directory).map_err(|source| CacheError::Io {
            path: self.directory.clone(),
            source,
        })?;

        let mut keys = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|source| CacheError::Io {
                path: self.directory.clone(),
                source,
            })?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(ENTRY_EXTENSION) {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                keys.push(stem.to_string());
            }
        }
        Ok(keys)
    }
}
