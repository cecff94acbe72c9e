//! docconductor - Command-line front end for the orchestration core
//!
//! Loads configuration, builds an [`OrchestrationContext`] and runs a single
//! command against it. Results are printed to stdout as JSON; logs go to
//! stderr.
//!
//! # Usage
//!
//! ```bash
//! # Extract text, letting the selector choose
//! docconductor run report.pdf --operation extract-text
//!
//! # Prefer a provider and pass options
//! docconductor run report.pdf --operation deep-analysis \
//!     --prefer deep-remote --options '{"language": "en"}'
//!
//! # Which providers could take this document, and in what order?
//! docconductor providers report.pdf
//!
//! # Forget cached results for a document
//! docconductor invalidate report.pdf
//!
//! # Verbose logging
//! RUST_LOG=docconductor_core=debug docconductor run report.pdf -o extract-text
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use serde_json::{json, Value};
use tracing::info;

use docconductor_core::document::format_from_path;
use docconductor_core::routing::AUTO_PREFERENCE;
use docconductor_core::{
    load_config_from_path, default_config_path, ConfigOverrides, DocumentDescriptor,
    DocumentSource, ExecutionRequest, OrchestrationContext, OrchestratorConfig,
};

/// docconductor - route document operations across processing backends
#[derive(Parser, Debug)]
#[command(name = "docconductor")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file path
    #[arg(short = 'c', long, env = "DOCCONDUCTOR_CONFIG", value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'l', long, env = "DOCCONDUCTOR_LOG_LEVEL", default_value = "info", global = true)]
    log_level: String,

    /// Cache directory (overrides config)
    #[arg(long, value_name = "DIR", global = true)]
    cache_dir: Option<PathBuf>,

    /// Maximum concurrent provider calls (overrides config)
    #[arg(long, value_name = "N", global = true)]
    max_in_flight: Option<usize>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run one operation on a document
    Run {
        /// File path or URL
        source: String,

        /// Operation name
        #[arg(short = 'o', long)]
        operation: String,

        /// Provider to try first
        #[arg(short = 'p', long, default_value = AUTO_PREFERENCE)]
        prefer: String,

        /// Operation options as a JSON object
        #[arg(long, value_name = "JSON")]
        options: Option<String>,

        /// Declared format (inferred from the extension when omitted)
        #[arg(short = 'f', long)]
        format: Option<String>,

        /// Hint that the document contains scanned pages
        #[arg(long)]
        scanned: bool,

        /// Budget for the whole request
        #[arg(long, value_name = "MS")]
        timeout_ms: Option<u64>,
    },

    /// List providers; with a source, show eligibility and ranking
    Providers {
        /// File path or URL
        source: Option<String>,

        /// Operation to rank for
        #[arg(short = 'o', long, default_value = "extract-text")]
        operation: String,

        /// Declared format (inferred from the extension when omitted)
        #[arg(short = 'f', long)]
        format: Option<String>,

        /// Hint that the document contains scanned pages
        #[arg(long)]
        scanned: bool,
    },

    /// Drop cached results for a document
    Invalidate {
        /// File path or URL
        source: String,

        /// Declared format (inferred from the extension when omitted)
        #[arg(short = 'f', long)]
        format: Option<String>,
    },

    /// Print the effective configuration
    Config,
}

/// Initialize logging with the specified level
fn init_logging(level: &str) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        tracing_subscriber::EnvFilter::new(format!(
            "docconductor={level},docconductor_core={level}"
        ))
    });

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .init();
}

fn load_configuration(args: &Args) -> Result<OrchestratorConfig> {
    let path = args.config.clone().or_else(default_config_path);
    let mut config = load_config_from_path(path.clone())
        .with_context(|| format!("Failed to load configuration from {path:?}"))?;

    let mut overrides = ConfigOverrides::new();
    if let Some(dir) = &args.cache_dir {
        overrides = overrides.with_cache_dir(dir.clone());
    }
    if let Some(max) = args.max_in_flight {
        overrides = overrides.with_max_in_flight(max);
    }
    overrides.apply(&mut config);
    config.validate().context("Invalid configuration")?;

    Ok(config)
}

fn looks_like_url(source: &str) -> bool {
    source.contains("://")
}

async fn describe(source: &str, format: Option<&str>, scanned: bool) -> Result<DocumentDescriptor> {
    let descriptor = if looks_like_url(source) {
        DocumentDescriptor::from_url(source, format, 0)?
    } else {
        let path = Path::new(source);
        let format = match format {
            Some(format) => format.to_string(),
            None => format_from_path(path)
                .with_context(|| format!("Cannot infer format of {source}; pass --format"))?,
        };
        let bytes = tokio::fs::read(path)
            .await
            .with_context(|| format!("Failed to read {source}"))?;
        DocumentDescriptor::from_bytes(&bytes, &format, DocumentSource::Path(path.to_path_buf()))
    };

    Ok(if scanned {
        descriptor.with_scanned_hint(true)
    } else {
        descriptor
    })
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[allow(clippy::too_many_arguments)]
async fn run(
    context: &OrchestrationContext,
    source: &str,
    operation: String,
    prefer: String,
    options: Option<String>,
    format: Option<String>,
    scanned: bool,
    timeout_ms: Option<u64>,
) -> Result<()> {
    let document = describe(source, format.as_deref(), scanned).await?;
    let options: Value = match options {
        Some(raw) => serde_json::from_str(&raw).context("--options is not valid JSON")?,
        None => Value::Null,
    };

    let mut request = ExecutionRequest::new(document, operation)
        .with_options(options)
        .with_preference(prefer);
    if let Some(ms) = timeout_ms {
        request = request.with_deadline(Duration::from_millis(ms));
    }

    let result = context.execute_request(request).await?;
    info!(
        produced_by = %result.produced_by,
        served_from = ?result.served_from,
        "Operation complete"
    );

    print_json(&json!({
        "request_id": result.request_id,
        "produced_by": result.produced_by,
        "served_from": result.served_from,
        "cache_key": result.cache_key,
        "failed_attempts": result
            .failed_attempts
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>(),
        "payload": result.payload,
    }))
}

async fn providers(
    context: &OrchestrationContext,
    source: Option<String>,
    operation: &str,
    format: Option<String>,
    scanned: bool,
) -> Result<()> {
    let registered = context.registry().snapshot();
    let Some(source) = source else {
        return print_json(&registered);
    };

    let document = describe(&source, format.as_deref(), scanned).await?;
    let ranking = context
        .executor()
        .selector()
        .rank(&document, operation, None);
    let ranking = match ranking {
        Ok(candidates) => json!(candidates),
        Err(e) => json!({ "error": e.to_string() }),
    };

    print_json(&json!({
        "document": {
            "content_hash": document.content_hash(),
            "format": document.format(),
            "size_bytes": document.size_bytes(),
        },
        "operation": operation,
        "providers": registered,
        "ranking": ranking,
    }))
}

async fn invalidate(
    context: &OrchestrationContext,
    source: &str,
    format: Option<String>,
) -> Result<()> {
    let document = describe(source, format.as_deref(), false).await?;
    let removed = context.invalidate(document.content_hash());
    info!(content_hash = document.content_hash(), removed, "Invalidated cache entries");
    print_json(&json!({
        "content_hash": document.content_hash(),
        "removed": removed,
    }))
}

fn show_config(config: &OrchestratorConfig) -> Result<()> {
    let rendered = config
        .to_toml_string()
        .context("Failed to render configuration")?;
    println!("# source: {}", config.source());
    if let Some(path) = &config.config_file_path {
        println!("# file: {}", path.display());
    }
    print!("{rendered}");
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(&args.log_level);

    let config = load_configuration(&args)?;
    if let Command::Config = args.command {
        return show_config(&config);
    }

    let context = OrchestrationContext::from_config(&config)
        .context("Failed to build orchestration context")?;

    match args.command {
        Command::Run {
            source,
            operation,
            prefer,
            options,
            format,
            scanned,
            timeout_ms,
        } => {
            run(
                &context, &source, operation, prefer, options, format, scanned, timeout_ms,
            )
            .await
        }
        Command::Providers {
            source,
            operation,
            format,
            scanned,
        } => providers(&context, source, &operation, format, scanned).await,
        Command::Invalidate { source, format } => invalidate(&context, &source, format).await,
        Command::Config => show_config(&config),
    }
}
