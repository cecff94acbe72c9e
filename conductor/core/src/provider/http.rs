//! Remote HTTP provider
//!
//! Sends `POST <endpoint>` with a JSON body of the form
//! `{"operation": ..., "document": {...}, "options": {...}}` and expects a
//! JSON result back.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde_json::{json, Value};
use tokio::time::Instant;

use super::{CapabilityRecord, Provider, ProviderError};
use crate::document::DocumentDescriptor;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Provider backed by a remote HTTP API
pub struct HttpProvider {
    record: CapabilityRecord,
    endpoint: String,
    api_key: Option<String>,
    requires_credentials: bool,
    client: reqwest::Client,
}

impl HttpProvider {
    /// Create a new HTTP provider
    ///
    /// # Errors
    ///
    /// Returns [`ProviderError::Unavailable`] if the HTTP client cannot be built.
    pub fn new(
        record: CapabilityRecord,
        endpoint: impl Into<String>,
        api_key: Option<String>,
    ) -> Result<Self, ProviderError> {
        let client = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .map_err(|e| ProviderError::Unavailable(e.to_string()))?;

        Ok(Self {
            record,
            endpoint: endpoint.into(),
            api_key,
            requires_credentials: false,
            client,
        })
    }

    /// Mark the provider as unusable without an API key
    #[must_use]
    pub fn requires_credentials(mut self, required: bool) -> Self {
        self.requires_credentials = required;
        self
    }

    /// Target endpoint
    #[must_use]
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[async_trait]
impl Provider for HttpProvider {
    fn identity(&self) -> &str {
        &self.record.identity
    }

    fn capabilities(&self) -> CapabilityRecord {
        self.record.clone()
    }

    fn is_ready(&self) -> bool {
        !self.requires_credentials || self.api_key.is_some()
    }

    async fn invoke(
        &self,
        operation: &str,
        document: &DocumentDescriptor,
        options: &Value,
        deadline: Instant,
    ) -> Result<Value, ProviderError> {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(ProviderError::Timeout);
        }

        let body = json!({
            "operation": operation,
            "document": {
                "content_hash": document.content_hash(),
                "format": document.format(),
                "size_bytes": document.size_bytes(),
                "source": document.source().locator(),
            },
            "options": options,
        });

        let mut request = self
            .client
            .post(&self.endpoint)
            .timeout(remaining)
            .json(&body);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request.send().await.map_err(map_transport_error)?;

        let status = response.status();
        if !status.is_success() {
            let retry_after_ms = response
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.trim().parse::<u64>().ok())
                .map(|secs| secs * 1000);
            let text = response.text().await.unwrap_or_default();
            return Err(map_status(status, retry_after_ms, text));
        }

        response
            .json::<Value>()
            .await
            .map_err(|e| if e.is_timeout() {
                ProviderError::Timeout
            } else {
                ProviderError::InvalidResponse(e.to_string())
            })
    }
}

fn map_transport_error(e: reqwest::Error) -> ProviderError {
    if e.is_timeout() {
        ProviderError::Timeout
    } else if e.is_connect() {
        ProviderError::Unavailable(e.to_string())
    } else {
        ProviderError::Failed(e.to_string())
    }
}

fn map_status(status: StatusCode, retry_after_ms: Option<u64>, body: String) -> ProviderError {
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => ProviderError::AuthenticationFailed,
        StatusCode::TOO_MANY_REQUESTS => ProviderError::RateLimited { retry_after_ms },
        StatusCode::REQUEST_TIMEOUT | StatusCode::GATEWAY_TIMEOUT => ProviderError::Timeout,
        s if s.is_client_error() => ProviderError::Rejected(format!("{s}: {body}")),
        s => ProviderError::Failed(format!("{s}: {body}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_map_status() {
        assert_eq!(
            map_status(StatusCode::UNAUTHORIZED, None, String::new()),
            ProviderError::AuthenticationFailed
        );
        assert_eq!(
            map_status(StatusCode::TOO_MANY_REQUESTS, Some(2000), String::new()),
            ProviderError::RateLimited {
                retry_after_ms: Some(2000)
            }
        );
        assert!(matches!(
            map_status(StatusCode::UNPROCESSABLE_ENTITY, None, "bad pdf".into()),
            ProviderError::Rejected(msg) if msg.contains("bad pdf")
        ));
        assert!(matches!(
            map_status(StatusCode::BAD_GATEWAY, None, String::new()),
            ProviderError::Failed(_)
        ));
        assert_eq!(
            map_status(StatusCode::GATEWAY_TIMEOUT, None, String::new()),
            ProviderError::Timeout
        );
    }

    #[test]
    fn test_readiness() {
        let record = CapabilityRecord::new("remote");
        let open = HttpProvider::new(record.clone(), "http://localhost:1", None).unwrap();
        assert!(open.is_ready());

        let locked = HttpProvider::new(record.clone(), "http://localhost:1", None)
            .unwrap()
            .requires_credentials(true);
        assert!(!locked.is_ready());

        let keyed = HttpProvider::new(record, "http://localhost:1", Some("k".into()))
            .unwrap()
            .requires_credentials(true);
        assert!(keyed.is_ready());
    }

    #[tokio::test]
    async fn test_expired_deadline_fails_without_request() {
        let provider =
            HttpProvider::new(CapabilityRecord::new("remote"), "http://localhost:1", None).unwrap();
        let err = provider
            .invoke(
                "extract-text",
                &DocumentDescriptor::from_parts(
                    "h",
                    "pdf",
                    1,
                    crate::document::DocumentSource::Inline,
                ),
                &Value::Null,
                Instant::now(),
            )
            .await
            .unwrap_err();
        assert_eq!(err, ProviderError::Timeout);
    }
}
