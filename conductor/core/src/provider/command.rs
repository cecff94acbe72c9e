//! Local subprocess provider
//!
//! Each invocation spawns `program args...` with placeholders substituted:
//!
//! | placeholder   | value                                   |
//! |---------------|-----------------------------------------|
//! | `{source}`    | document path or URL                    |
//! | `{operation}` | operation name                          |
//! | `{format}`    | declared format token                   |
//! | `{hash}`      | content hash                            |
//!
//! The options object is written to stdin as JSON while stdout and stderr are
//! drained, so a program may produce output before it reads its input.
//! Stdout is parsed as JSON; anything else is returned as a JSON string.

use std::process::Stdio;

use async_trait::async_trait;
use serde_json::Value;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::time::Instant;

use super::{CapabilityRecord, Provider, ProviderError};
use crate::document::DocumentDescriptor;

/// Provider backed by a local program
pub struct CommandProvider {
    record: CapabilityRecord,
    program: String,
    args: Vec<String>,
}

impl CommandProvider {
    /// Create a new command provider
    pub fn new(record: CapabilityRecord, program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            record,
            program: program.into(),
            args,
        }
    }

    fn render_args(
        &self,
        operation: &str,
        document: &DocumentDescriptor,
        source: &str,
    ) -> Vec<String> {
        self.args
            .iter()
            .map(|arg| {
                arg.replace("{source}", source)
                    .replace("{operation}", operation)
                    .replace("{format}", document.format())
                    .replace("{hash}", document.content_hash())
            })
            .collect()
    }
}

#[async_trait]
impl Provider for CommandProvider {
    fn identity(&self) -> &str {
        &self.record.identity
    }

    fn capabilities(&self) -> CapabilityRecord {
        self.record.clone()
    }

    async fn invoke(
        &self,
        operation: &str,
        document: &DocumentDescriptor,
        options: &Value,
        deadline: Instant,
    ) -> Result<Value, ProviderError> {
        let source = document.source().locator().ok_or_else(|| {
            ProviderError::Rejected("command providers need a path or URL".to_string())
        })?;

        let args = self.render_args(operation, document, &source);
        let input = serde_json::to_vec(options)
            .map_err(|e| ProviderError::Rejected(format!("options not serializable: {e}")))?;
        tracing::debug!(
            provider = %self.record.identity,
            program = %self.program,
            ?args,
            "Spawning provider process"
        );

        let mut child = Command::new(&self.program)
            .args(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| ProviderError::Unavailable(format!("{}: {}", self.program, e)))?;

        let stdin = child.stdin.take();
        let feed = async move {
            let Some(mut stdin) = stdin else { return };
            // A program that ignores stdin may close it early
            if let Err(e) = stdin.write_all(&input).await {
                tracing::debug!(provider = %self.record.identity, error = %e, "stdin closed early");
            }
            // Dropping the handle sends EOF
        };

        let output = tokio::time::timeout_at(deadline, async {
            let ((), output) = tokio::join!(feed, child.wait_with_output());
            output
        })
        .await
        .map_err(|_| ProviderError::Timeout)?
        .map_err(|e| ProviderError::Failed(e.to_string()))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let detail = stderr.trim();
            return Err(ProviderError::Failed(if detail.is_empty() {
                output.status.to_string()
            } else {
                format!("{}: {}", output.status, detail)
            }));
        }

        parse_output(&output.stdout)
    }
}

fn parse_output(stdout: &[u8]) -> Result<Value, ProviderError> {
    let text = std::str::from_utf8(stdout)
        .map_err(|e| ProviderError::InvalidResponse(format!("stdout is not UTF-8: {e}")))?
        .trim();

    if text.is_empty() {
        return Err(ProviderError::InvalidResponse("empty output".to_string()));
    }

    Ok(serde_json::from_str(text).unwrap_or_else(|_| Value::String(text.to_string())))
}
