//! Tracing subscriber setup.

use anyhow::{Context, Result};
use tracing_subscriber::filter::Directive;
use tracing_subscriber::EnvFilter;

/// Filter from `RUST_LOG`, falling back to `level` for anything it doesn't cover.
pub fn env_filter(level: &str) -> Result<EnvFilter> {
    let directive: Directive = level
        .parse()
        .with_context(|| format!("Invalid log level: {}", level))?;

    Ok(EnvFilter::builder()
        .with_default_directive(directive)
        .from_env_lossy())
}

/// Install the global subscriber. Output goes to stderr so stdout stays
/// free for reports.
pub fn init(level: &str) -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(env_filter(level)?)
        .with_target(true)
        .with_writer(std::io::stderr)
        .try_init()
        .map_err(|e| anyhow::anyhow!("Failed to install log subscriber: {}", e))
}
