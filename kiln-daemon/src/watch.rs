//! Hot reload of mods whose files change on disk.
//!
//! The `ModWatcher` polls every mod root through the runtime's
//! `DirectoryScriptProvider` and reloads the mod that owns each changed
//! file. A change anywhere under `<root>/<mod dir>/` counts, manifest
//! included. Reloading a mod also reloads its dependents, and executions of
//! affected mods wait until the reload finishes.
//!
//! # Example
//!
//! ```no_run
//! use kiln_daemon::watch::ModWatcher;
//! use kiln_mod_api::{LoaderConfig, ModHost, ModLoader};
//! use std::path::PathBuf;
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let loader = Arc::new(ModLoader::new(LoaderConfig::default(), ModHost::new())?);
//! let roots = vec![PathBuf::from("mods")];
//! loader.load_all(&roots).await;
//!
//! let mut watcher = ModWatcher::new(Arc::clone(&loader), Duration::from_millis(500));
//! watcher.start(&roots).await?;
//!
//! // Later: stop watching
//! watcher.shutdown().await;
//! # Ok(())
//! # }
//! ```

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use kiln_mod_api::{ModLoader, ModStatus};
use kiln_runtime::source::{ChangeCallback, ScriptChange, WatchHandle};
use kiln_runtime::{DirectoryScriptProvider, ScriptProvider};
use std::collections::{BTreeSet, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Emitted after each reload triggered by a file change.
#[derive(Debug, Clone)]
pub struct ReloadEvent {
    /// Mod whose files changed.
    pub mod_id: String,
    /// Status of every reloaded mod, in load order.
    pub results: Vec<(String, ModStatus)>,
    pub timestamp: DateTime<Utc>,
}

impl ReloadEvent {
    pub fn all_active(&self) -> bool {
        self.results.iter().all(|(_, status)| status.is_active())
    }
}

/// Watches mod roots and reloads changed mods.
pub struct ModWatcher {
    loader: Arc<ModLoader>,
    interval: Duration,
    handles: Vec<WatchHandle>,
    task: Option<JoinHandle<()>>,
    shutdown_tx: Option<broadcast::Sender<()>>,
    event_tx: mpsc::Sender<ReloadEvent>,
    event_rx: Option<mpsc::Receiver<ReloadEvent>>,
}

impl ModWatcher {
    /// Create a watcher polling every `interval`.
    pub fn new(loader: Arc<ModLoader>, interval: Duration) -> Self {
        let (event_tx, event_rx) = mpsc::channel(100);

        Self {
            loader,
            interval,
            handles: Vec::new(),
            task: None,
            shutdown_tx: None,
            event_tx,
            event_rx: Some(event_rx),
        }
    }

    /// Take the receiver for reload events. Only the first call returns it.
    pub fn take_event_receiver(&mut self) -> Option<mpsc::Receiver<ReloadEvent>> {
        self.event_rx.take()
    }

    /// Start watching `roots`. Roots that don't exist are skipped.
    ///
    /// Returns the number of roots being watched.
    pub async fn start(&mut self, roots: &[PathBuf]) -> Result<usize> {
        info!("Starting mod watcher");

        let (change_tx, change_rx) = mpsc::unbounded_channel::<PathBuf>();
        for root in roots {
            if !root.is_dir() {
                debug!("Skipping missing mod root: {}", root.display());
                continue;
            }
            let root = root
                .canonicalize()
                .with_context(|| format!("Failed to resolve mod root: {}", root.display()))?;

            let tx = change_tx.clone();
            let base = root.clone();
            let on_change: ChangeCallback = Arc::new(move |change: ScriptChange| {
                if let Some(dir) = owning_dir(&base, &change.script_id) {
                    let _ = tx.send(dir);
                }
            });

            let provider = DirectoryScriptProvider::new(&root).with_poll_interval(self.interval);
            let handle = provider
                .watch(".", on_change)
                .await
                .with_context(|| format!("Failed to watch mod root: {}", root.display()))?;
            info!("Watching {}", root.display());
            self.handles.push(handle);
        }

        let (shutdown_tx, shutdown_rx) = broadcast::channel::<()>(1);
        self.shutdown_tx = Some(shutdown_tx);
        self.task = Some(self.spawn_reload_task(change_rx, shutdown_rx));

        Ok(self.handles.len())
    }

    fn spawn_reload_task(
        &self,
        mut change_rx: mpsc::UnboundedReceiver<PathBuf>,
        mut shutdown_rx: broadcast::Receiver<()>,
    ) -> JoinHandle<()> {
        let loader = Arc::clone(&self.loader);
        let event_tx = self.event_tx.clone();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    Some(dir) = change_rx.recv() => {
                        // One poll reports all its changes at once.
                        let mut dirs = BTreeSet::from([dir]);
                        while let Ok(more) = change_rx.try_recv() {
                            dirs.insert(more);
                        }
                        Self::reload_dirs(&loader, dirs, &event_tx).await;
                    }
                    _ = shutdown_rx.recv() => {
                        info!("Mod watcher received shutdown signal");
                        break;
                    }
                }
            }
        })
    }

    async fn reload_dirs(
        loader: &ModLoader,
        dirs: BTreeSet<PathBuf>,
        event_tx: &mpsc::Sender<ReloadEvent>,
    ) {
        let mut reloaded = HashSet::new();

        for dir in dirs {
            let Some(mod_id) = loader.mod_at(&dir).await else {
                info!(
                    "{} changed but is not a known mod; restart to pick up new mods",
                    dir.display()
                );
                continue;
            };
            if reloaded.contains(&mod_id) {
                continue;
            }

            let results = match loader.reload(&mod_id).await {
                Ok(results) => results,
                Err(e) => {
                    warn!(mod_id = %mod_id, "Reload failed: {}", e);
                    continue;
                }
            };

            for (id, status) in &results {
                if status.is_active() {
                    info!(mod_id = %id, "Reloaded");
                } else {
                    warn!(mod_id = %id, %status, "Reload left mod inactive");
                }
                reloaded.insert(id.clone());
            }

            let event = ReloadEvent {
                mod_id,
                results,
                timestamp: Utc::now(),
            };
            if let Err(e) = event_tx.try_send(event) {
                debug!("Dropped reload event: {}", e);
            }
        }
    }

    /// Stop watching and wait for an in-progress reload to finish.
    pub async fn shutdown(&mut self) {
        info!("Shutting down mod watcher");

        self.handles.clear();
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                warn!("Mod watcher task ended abnormally: {}", e);
            }
        }
    }
}

/// Directory of the mod owning `script_id`, a path relative to `root`.
fn owning_dir(root: &Path, script_id: &str) -> Option<PathBuf> {
    let (first, _) = script_id.split_once('/')?;
    Some(root.join(first))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_owning_dir() {
        let root = Path::new("/mods");
        assert_eq!(
            owning_dir(root, "weather/scripts/rain.lua"),
            Some(PathBuf::from("/mods/weather"))
        );
        assert_eq!(owning_dir(root, "weather/mod.json"), Some(PathBuf::from("/mods/weather")));
        assert_eq!(owning_dir(root, "README.md"), None);
    }

    #[test]
    fn test_reload_event_all_active() {
        let event = ReloadEvent {
            mod_id: "a".to_string(),
            results: vec![
                ("a".to_string(), ModStatus::Active),
                ("b".to_string(), ModStatus::Unloaded),
            ],
            timestamp: Utc::now(),
        };
        assert!(!event.all_active());
    }
}
