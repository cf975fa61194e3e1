//! The `check` and `run` subcommands.

use anyhow::{Context, Result};
use kiln_mod_api::{LoadReport, ModHost, ModLoader};
use kiln_runtime::discovery::user_mods_dir;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

use crate::config::Config;
use crate::watch::ModWatcher;

/// Mod roots to use: the command line's if any were given, else the config's.
pub fn mod_roots(config: &Config, cli_mods: &[PathBuf]) -> Vec<PathBuf> {
    if cli_mods.is_empty() {
        config.loader.mod_dirs.clone()
    } else {
        cli_mods.to_vec()
    }
}

/// Host collaborators with the configured hook points defined.
pub fn build_host(config: &Config) -> ModHost {
    let host = ModHost::new();
    for (name, description) in &config.hooks {
        host.hooks().define(name.as_str(), description.as_str());
    }
    host
}

fn build_loader(config: &Config) -> Result<ModLoader> {
    let loader_config = config.loader_config()?;
    ModLoader::new(loader_config, build_host(config)).context("Failed to create mod loader")
}

/// Dry run: discovery, resolution and validation without executing anything.
pub fn check(config: &Config, roots: &[PathBuf]) -> Result<LoadReport> {
    let loader = build_loader(config)?;
    Ok(loader.dry_run(roots))
}

/// Serialize a report for stdout.
pub fn render_report(report: &LoadReport, pretty: bool) -> Result<String> {
    let rendered = if pretty {
        serde_json::to_string_pretty(report)
    } else {
        serde_json::to_string(report)
    };
    rendered.context("Failed to serialize load report")
}

fn log_report(report: &LoadReport) {
    for failure in &report.discovery_failures {
        warn!("Skipped {}: {}", failure.path.display(), failure.reason);
    }
    for issue in &report.issues {
        warn!(mod_id = %issue.mod_id, "{}", issue.message);
    }
    for m in &report.mods {
        if m.status.is_active() {
            info!(mod_id = %m.id, version = %m.version, "Mod active");
        } else {
            warn!(mod_id = %m.id, status = %m.status, "Mod not active");
        }
    }
}

/// Load every mod, reload mods as their files change, and unload everything
/// once `shutdown` completes.
///
/// Returns the ids unloaded at shutdown, in the order they were unloaded.
pub async fn run<F>(config: &Config, roots: &[PathBuf], shutdown: F) -> Result<Vec<String>>
where
    F: Future<Output = ()>,
{
    let loader = Arc::new(build_loader(config)?);

    let report = loader.load_all(roots).await;
    log_report(&report);

    let mut watch_roots = loader.roots().await;
    if config.loader.include_user_mods {
        if let Some(user_dir) = user_mods_dir() {
            if !watch_roots.contains(&user_dir) {
                watch_roots.push(user_dir);
            }
        }
    }

    let mut watcher = ModWatcher::new(Arc::clone(&loader), config.loader.watch_interval());
    let watched = watcher.start(&watch_roots).await?;

    info!(
        "Startup complete: {} active mod(s), watching {} root(s)",
        loader.active_mods().await.len(),
        watched
    );

    shutdown.await;

    info!("Shutting down...");
    watcher.shutdown().await;

    let unloaded = loader.unload_all().await;
    info!("Unloaded {} mod(s)", unloaded.len());
    Ok(unloaded)
}
