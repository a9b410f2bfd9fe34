//! llmapp CLI library - testable functions and modules
//!
//! The `llmapp` binary serves the demo UI, answers one-off prompts and runs
//! the model publishing workflow. Everything it needs beyond argument parsing
//! lives here so it can be exercised from tests.

pub mod api;
pub mod config;
pub mod render;
pub mod services;
pub mod workflow;

use anyhow::Result;
use tracing_subscriber::EnvFilter;

use crate::config::LoggingConfig;

/// Log filter: `RUST_LOG` when set, otherwise the configured level.
pub fn log_filter(level: &str, rust_log: Option<&str>) -> Result<EnvFilter> {
    let directives = match rust_log.map(str::trim) {
        Some(directives) if !directives.is_empty() => directives,
        _ => level,
    };
    EnvFilter::try_new(directives).map_err(|e| anyhow::anyhow!("Invalid log filter '{}': {}", directives, e))
}

/// Install the global tracing subscriber.
pub fn init_logging(config: &LoggingConfig) -> Result<()> {
    let rust_log = std::env::var("RUST_LOG").ok();
    let filter = log_filter(&config.level, rust_log.as_deref())?;

    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match config.format.to_lowercase().as_str() {
        "json" => tracing::subscriber::set_global_default(builder.json().finish())?,
        "text" => tracing::subscriber::set_global_default(builder.finish())?,
        other => anyhow::bail!("Unsupported log format: {}. Use 'text' or 'json'", other),
    }
    Ok(())
}
