//! Document Descriptor
//!
//! Immutable identity of one unit of work. A descriptor is built once at the
//! system boundary and then only read: the content hash drives cache keys, the
//! declared format and size drive provider eligibility.
//!
//! Two descriptors with the same `content_hash` describe the same logical
//! document, no matter which path or URL they were loaded from.

use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Domain separator so a URL's text never hashes like a document whose bytes
/// happen to equal that text.
const URL_HASH_PREFIX: &[u8] = b"url\0";

/// Errors raised while building a descriptor
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum DocumentError {
    /// The source URL could not be parsed
    #[error("invalid document URL '{url}': {reason}")]
    InvalidUrl {
        /// The rejected input
        url: String,
        /// Parser message
        reason: String,
    },

    /// No format was declared and none could be inferred
    #[error("cannot determine document format for '{0}'")]
    UnknownFormat(String),
}

/// Where the document can be fetched from, if anywhere
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "locator", rename_all = "snake_case")]
pub enum DocumentSource {
    /// Local file
    Path(PathBuf),
    /// Remote document, stored normalized
    Url(String),
    /// Bytes handed over directly with no locator
    Inline,
}

impl DocumentSource {
    /// Locator string passed to providers, if the document has one
    #[must_use]
    pub fn locator(&self) -> Option<String> {
        match self {
            Self::Path(path) => Some(path.display().to_string()),
            Self::Url(url) => Some(url.clone()),
            Self::Inline => None,
        }
    }
}

impl fmt::Display for DocumentSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Path(path) => write!(f, "{}", path.display()),
            Self::Url(url) => f.write_str(url),
            Self::Inline => f.write_str("<inline>"),
        }
    }
}

/// Immutable value object identifying a document
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentDescriptor {
    content_hash: String,
    declared_format: String,
    size_bytes: u64,
    scanned_hint: Option<bool>,
    source: DocumentSource,
}

impl DocumentDescriptor {
    /// Describe a document from its bytes
    ///
    /// The hash covers the bytes only, never the file name.
    #[must_use]
    pub fn from_bytes(bytes: &[u8], format: &str, source: DocumentSource) -> Self {
        Self {
            content_hash: sha256_hex(&[bytes]),
            declared_format: normalize_format(format),
            size_bytes: bytes.len() as u64,
            scanned_hint: None,
            source,
        }
    }

    /// Describe a remote document that has not been fetched yet
    ///
    /// The hash is computed from the normalized URL. `size_bytes` is whatever
    /// the caller knows (0 when unknown). When `format` is `None` the format
    /// is taken from the last path segment's extension.
    ///
    /// # Errors
    ///
    /// Returns [`DocumentError::InvalidUrl`] for unparseable input and
    /// [`DocumentError::UnknownFormat`] when no format can be determined.
    pub fn from_url(
        raw: &str,
        format: Option<&str>,
        size_bytes: u64,
    ) -> Result<Self, DocumentError> {
        let normalized = normalize_url(raw)?;
        let declared_format = match format {
            Some(format) => normalize_format(format),
            None => url::Url::parse(&normalized)
                .ok()
                .and_then(|u| {
                    u.path_segments()
                        .and_then(|mut segments| segments.next_back().map(str::to_string))
                })
                .and_then(|segment| format_from_path(Path::new(&segment)))
                .ok_or_else(|| DocumentError::UnknownFormat(normalized.clone()))?,
        };

        Ok(Self {
            content_hash: sha256_hex(&[URL_HASH_PREFIX, normalized.as_bytes()]),
            declared_format,
            size_bytes,
            scanned_hint: None,
            source: DocumentSource::Url(normalized),
        })
    }

    /// Build a descriptor from parts that were computed elsewhere
    #[must_use]
    pub fn from_parts(
        content_hash: impl Into<String>,
        format: &str,
        size_bytes: u64,
        source: DocumentSource,
    ) -> Self {
        Self {
            content_hash: content_hash.into(),
            declared_format: normalize_format(format),
            size_bytes,
            scanned_hint: None,
            source,
        }
    }

    /// Attach the advisory "contains scanned pages" hint
    #[must_use]
    pub fn with_scanned_hint(mut self, scanned: bool) -> Self {
        self.scanned_hint = Some(scanned);
        self
    }

    /// Stable content identity
    #[must_use]
    pub fn content_hash(&self) -> &str {
        &self.content_hash
    }

    /// Lowercase format token, e.g. `pdf`
    #[must_use]
    pub fn format(&self) -> &str {
        &self.declared_format
    }

    /// Size in bytes (0 when unknown)
    #[must_use]
    pub fn size_bytes(&self) -> u64 {
        self.size_bytes
    }

    /// Raw scanned-content hint, if one was given
    #[must_use]
    pub fn scanned_hint(&self) -> Option<bool> {
        self.scanned_hint
    }

    /// Whether the document is believed to contain scanned pages
    #[must_use]
    pub fn is_scanned(&self) -> bool {
        self.scanned_hint.unwrap_or(false)
    }

    /// Source locator
    #[must_use]
    pub fn source(&self) -> &DocumentSource {
        &self.source
    }
}

/// Normalize a declared format or MIME type to a lowercase extension token
#[must_use]
pub fn normalize_format(token: &str) -> String {
    let token = token.trim().trim_start_matches('.').to_ascii_lowercase();
    // Drop MIME parameters such as "; charset=utf-8"
    let token = token.split(';').next().unwrap_or_default().trim();

    let mapped = match token {
        "application/pdf" => "pdf",
        "application/msword" => "doc",
        "application/vnd.openxmlformats-officedocument.wordprocessingml.document" => "docx",
        "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet" => "xlsx",
        "application/vnd.openxmlformats-officedocument.presentationml.presentation" => "pptx",
        "text/plain" => "txt",
        "text/markdown" => "md",
        "text/html" => "html",
        "text/csv" => "csv",
        "image/jpeg" | "jpeg" => "jpg",
        "image/tiff" | "tif" => "tiff",
        other => match other.split_once('/') {
            Some((_, subtype)) => subtype,
            None => other,
        },
    };
    mapped.to_string()
}

/// Format token inferred from a file extension
#[must_use]
pub fn format_from_path(path: &Path) -> Option<String> {
    path.extension()
        .and_then(|ext| ext.to_str())
        .filter(|ext| !ext.is_empty())
        .map(normalize_format)
}

/// Normalize a URL so equivalent spellings hash identically
///
/// Scheme and host are lowercased, default ports removed, an empty path
/// becomes `/`, and the fragment is dropped.
///
/// # Errors
///
/// Returns [`DocumentError::InvalidUrl`] if the input is not an absolute URL.
pub fn normalize_url(raw: &str) -> Result<String, DocumentError> {
    let mut parsed = url::Url::parse(raw.trim()).map_err(|e| DocumentError::InvalidUrl {
        url: raw.to_string(),
        reason: e.to_string(),
    })?;
    parsed.set_fragment(None);
    Ok(parsed.to_string())
}

fn sha256_hex(parts: &[&[u8]]) -> String {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part);
    }
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_hash_ignores_source_path() {
        let a = DocumentDescriptor::from_bytes(
            b"%PDF-1.7 body",
            "pdf",
            DocumentSource::Path(PathBuf::from("/tmp/a.pdf")),
        );
        let b = DocumentDescriptor::from_bytes(
            b"%PDF-1.7 body",
            "PDF",
            DocumentSource::Path(PathBuf::from("/other/renamed.pdf")),
        );

        assert_eq!(a.content_hash(), b.content_hash());
        assert_eq!(a.format(), "pdf");
        assert_eq!(b.format(), "pdf");
        assert_eq!(a.size_bytes(), 13);
    }

    #[test]
    fn test_hash_changes_with_content() {
        let a = DocumentDescriptor::from_bytes(b"one", "txt", DocumentSource::Inline);
        let b = DocumentDescriptor::from_bytes(b"two", "txt", DocumentSource::Inline);
        assert_ne!(a.content_hash(), b.content_hash());
        assert_eq!(a.content_hash().len(), 64);
    }

    #[test]
    fn test_url_normalization_is_stable() {
        let raw = "HTTPS://Example.COM:443/docs/report.pdf#page=2";
        let a = DocumentDescriptor::from_url(raw, None, 0).unwrap();
        let b =
            DocumentDescriptor::from_url("https://example.com/docs/report.pdf", None, 0).unwrap();

        assert_eq!(a.content_hash(), b.content_hash());
        assert_eq!(a.format(), "pdf");
        assert_eq!(
            a.source(),
            &DocumentSource::Url("https://example.com/docs/report.pdf".to_string())
        );
    }

    #[test]
    fn test_url_hash_differs_from_bytes_hash() {
        let url = "https://example.com/a.pdf";
        let remote = DocumentDescriptor::from_url(url, None, 0).unwrap();
        let inline = DocumentDescriptor::from_bytes(url.as_bytes(), "pdf", DocumentSource::Inline);
        assert_ne!(remote.content_hash(), inline.content_hash());
    }

    #[test]
    fn test_url_without_format() {
        let err =
            DocumentDescriptor::from_url("https://example.com/download", None, 0).unwrap_err();
        assert!(matches!(err, DocumentError::UnknownFormat(_)));

        let ok = DocumentDescriptor::from_url("https://example.com/download", Some("docx"), 10)
            .unwrap();
        assert_eq!(ok.format(), "docx");
        assert_eq!(ok.size_bytes(), 10);
    }

    #[test]
    fn test_invalid_url() {
        let err = DocumentDescriptor::from_url("not a url", Some("pdf"), 0).unwrap_err();
        assert!(matches!(err, DocumentError::InvalidUrl { .. }));
    }

    #[test]
    fn test_normalize_format() {
        assert_eq!(normalize_format(".PDF"), "pdf");
        assert_eq!(normalize_format("application/pdf"), "pdf");
        assert_eq!(normalize_format("text/plain; charset=utf-8"), "txt");
        assert_eq!(
            normalize_format(
                "application/vnd.openxmlformats-officedocument.wordprocessingml.document"
            ),
            "docx"
        );
        assert_eq!(normalize_format("image/jpeg"), "jpg");
        assert_eq!(normalize_format("image/webp"), "webp");
    }

    #[test]
    fn test_format_from_path() {
        assert_eq!(format_from_path(Path::new("/a/b/Scan.TIF")), Some("tiff".to_string()));
        assert_eq!(format_from_path(Path::new("/a/b/README")), None);
    }

    #[test]
    fn test_scanned_hint() {
        let doc = DocumentDescriptor::from_bytes(b"x", "pdf", DocumentSource::Inline);
        assert!(!doc.is_scanned());
        assert_eq!(doc.scanned_hint(), None);

        let doc = doc.with_scanned_hint(true);
        assert!(doc.is_scanned());
    }
}
