//! Script sources and the providers that produce them.
//!
//! A [`ScriptProvider`] enumerates scripts under a path, loads them into
//! immutable [`ScriptSource`] values and, when it can, watches for changes so
//! the host can hot-reload.

use crate::discovery::resolve_in_root;
use crate::error::{RuntimeError, RuntimeResult};
use async_trait::async_trait;
use globset::{Glob, GlobMatcher};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use walkdir::WalkDir;

/// Lowercase hex SHA-256 of script text.
pub fn content_hash(text: &str) -> String {
    hex::encode(Sha256::digest(text.as_bytes()))
}

/// A loaded script. Immutable once produced.
#[derive(Debug, Clone)]
pub struct ScriptSource {
    /// Stable identifier, unique within its provider.
    pub id: String,

    /// Raw source text.
    pub text: Arc<str>,

    /// SHA-256 of `text`, lowercase hex.
    pub content_hash: String,

    /// File the text was read from, if any.
    pub origin: Option<PathBuf>,

    /// Priority of the provider that produced it.
    pub priority: i32,
}

impl ScriptSource {
    pub fn new(id: impl Into<String>, text: impl Into<Arc<str>>) -> Self {
        let text: Arc<str> = text.into();
        Self {
            id: id.into(),
            content_hash: content_hash(&text),
            text,
            origin: None,
            priority: 0,
        }
    }

    pub fn with_origin(mut self, origin: PathBuf) -> Self {
        self.origin = Some(origin);
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Size of the source in bytes.
    pub fn len(&self) -> usize {
        self.text.len()
    }

    pub fn is_empty(&self) -> bool {
        self.text.is_empty()
    }
}

/// What happened to a watched script.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Created,
    Modified,
    Removed,
}

/// A change reported by a watcher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptChange {
    pub script_id: String,
    pub kind: ChangeKind,
}

/// Callback invoked for every observed change.
pub type ChangeCallback = Arc<dyn Fn(ScriptChange) + Send + Sync>;

/// Keeps a watch alive. Dropping it stops watching.
#[derive(Debug)]
pub struct WatchHandle {
    task: JoinHandle<()>,
}

impl WatchHandle {
    pub fn stop(self) {}
}

impl Drop for WatchHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Source of scripts.
#[async_trait]
pub trait ScriptProvider: Send + Sync {
    /// Human-readable provider name.
    fn name(&self) -> &str;

    /// Priority attached to loaded sources.
    fn priority(&self) -> i32 {
        0
    }

    /// Enumerate script ids under `path` matching the glob `pattern`.
    async fn discover(&self, path: &str, pattern: &str, recursive: bool)
        -> RuntimeResult<Vec<String>>;

    /// Load one script.
    async fn load(&self, script_id: &str) -> RuntimeResult<ScriptSource>;

    /// Whether [`ScriptProvider::watch`] is implemented.
    fn supports_watch(&self) -> bool {
        false
    }

    /// Watch `path` and report changes until the handle is dropped.
    async fn watch(&self, path: &str, on_change: ChangeCallback) -> RuntimeResult<WatchHandle> {
        let _ = (path, on_change);
        Err(RuntimeError::Unsupported(format!(
            "provider '{}' cannot watch",
            self.name()
        )))
    }
}

fn compile_pattern(pattern: &str) -> RuntimeResult<GlobMatcher> {
    Glob::new(pattern)
        .map(|g| g.compile_matcher())
        .map_err(|e| RuntimeError::Unsupported(format!("invalid pattern '{}': {}", pattern, e)))
}

fn is_within(relative: &str, recursive: bool) -> bool {
    recursive || !relative.contains('/')
}

/// Scripts read from a directory tree. Ids are `/`-separated paths relative
/// to the provider root; nothing outside the root can be read.
#[derive(Debug, Clone)]
pub struct DirectoryScriptProvider {
    root: PathBuf,
    priority: i32,
    poll_interval: Duration,
}

impl DirectoryScriptProvider {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            priority: 0,
            poll_interval: Duration::from_secs(1),
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve_dir(&self, path: &str) -> RuntimeResult<PathBuf> {
        if path.is_empty() || path == "." {
            return Ok(self.root.canonicalize()?);
        }
        resolve_in_root(&self.root, path)
    }

    fn script_id(root: &Path, file: &Path) -> Option<String> {
        let relative = file.strip_prefix(root).ok()?;
        let parts: Vec<_> = relative
            .components()
            .map(|c| c.as_os_str().to_str())
            .collect::<Option<_>>()?;
        Some(parts.join("/"))
    }

    /// Blocking scan used by both discovery and the watcher.
    fn scan(
        root: &Path,
        dir: &Path,
        matcher: &GlobMatcher,
        recursive: bool,
    ) -> BTreeMap<String, PathBuf> {
        let mut found = BTreeMap::new();
        let walker = WalkDir::new(dir)
            .follow_links(false)
            .max_depth(if recursive { usize::MAX } else { 1 });

        for entry in walker.into_iter().filter_map(|e| e.ok()) {
            if !entry.file_type().is_file() {
                continue;
            }
            let Some(under_dir) = Self::script_id(dir, entry.path()) else {
                continue;
            };
            if !is_within(&under_dir, recursive) || !matcher.is_match(&under_dir) {
                continue;
            }
            if let Some(id) = Self::script_id(root, entry.path()) {
                found.insert(id, entry.path().to_path_buf());
            }
        }
        found
    }

    fn snapshot(files: &BTreeMap<String, PathBuf>) -> BTreeMap<String, String> {
        files
            .iter()
            .filter_map(|(id, path)| {
                let text = std::fs::read_to_string(path).ok()?;
                Some((id.clone(), content_hash(&text)))
            })
            .collect()
    }
}

#[async_trait]
impl ScriptProvider for DirectoryScriptProvider {
    fn name(&self) -> &str {
        "directory"
    }

    fn priority(&self) -> i32 {
        self.priority
    }

    async fn discover(
        &self,
        path: &str,
        pattern: &str,
        recursive: bool,
    ) -> RuntimeResult<Vec<String>> {
        let matcher = compile_pattern(pattern)?;
        let root = self.root.canonicalize()?;
        let dir = self.resolve_dir(path)?;

        let found = tokio::task::spawn_blocking(move || Self::scan(&root, &dir, &matcher, recursive))
            .await
            .map_err(|e| RuntimeError::Unsupported(format!("scan task failed: {}", e)))?;

        debug!(path, pattern, count = found.len(), "Discovered scripts");
        Ok(found.into_keys().collect())
    }

    async fn load(&self, script_id: &str) -> RuntimeResult<ScriptSource> {
        let path = resolve_in_root(&self.root, script_id).map_err(|e| match e {
            RuntimeError::Io(io) if io.kind() == std::io::ErrorKind::NotFound => {
                RuntimeError::ScriptNotFound(script_id.to_string())
            }
            other => other,
        })?;
        let text = tokio::fs::read_to_string(&path).await?;

        Ok(ScriptSource::new(script_id, text)
            .with_origin(path)
            .with_priority(self.priority))
    }

    fn supports_watch(&self) -> bool {
        true
    }

    async fn watch(&self, path: &str, on_change: ChangeCallback) -> RuntimeResult<WatchHandle> {
        let root = self.root.canonicalize()?;
        let dir = self.resolve_dir(path)?;
        let matcher = compile_pattern("**")?;
        let interval = self.poll_interval;

        let initial = {
            let (root, dir, matcher) = (root.clone(), dir.clone(), matcher.clone());
            tokio::task::spawn_blocking(move || Self::snapshot(&Self::scan(&root, &dir, &matcher, true)))
                .await
                .map_err(|e| RuntimeError::Unsupported(format!("scan task failed: {}", e)))?
        };

        let task = tokio::spawn(async move {
            let mut known = initial;
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;

            loop {
                ticker.tick().await;
                let (root, dir, matcher) = (root.clone(), dir.clone(), matcher.clone());
                let current = match tokio::task::spawn_blocking(move || {
                    Self::snapshot(&Self::scan(&root, &dir, &matcher, true))
                })
                .await
                {
                    Ok(current) => current,
                    Err(e) => {
                        warn!("Watch scan failed: {}", e);
                        continue;
                    }
                };

                let ids: BTreeSet<&String> = known.keys().chain(current.keys()).collect();
                for id in ids {
                    let kind = match (known.get(id), current.get(id)) {
                        (None, Some(_)) => ChangeKind::Created,
                        (Some(_), None) => ChangeKind::Removed,
                        (Some(old), Some(new)) if old != new => ChangeKind::Modified,
                        _ => continue,
                    };
                    debug!(script = %id, ?kind, "Script changed");
                    on_change(ScriptChange {
                        script_id: id.clone(),
                        kind,
                    });
                }
                known = current;
            }
        });

        Ok(WatchHandle { task })
    }
}

/// Scripts held in memory. Useful for embedding and tests; cannot watch.
#[derive(Debug, Default)]
pub struct MemoryScriptProvider {
    scripts: RwLock<BTreeMap<String, Arc<str>>>,
    priority: i32,
}

impl MemoryScriptProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Add or replace a script.
    pub fn insert(&self, id: impl Into<String>, text: impl Into<Arc<str>>) {
        self.scripts
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id.into(), text.into());
    }

    pub fn remove(&self, id: &str) -> bool {
        self.scripts
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(id)
            .is_some()
    }
}

#[async_trait]
impl ScriptProvider for MemoryScriptProvider {
    fn name(&self) -> &str {
        "memory"
    }

    fn priority(&self) -> i32 {
        self.priority
    }

    async fn discover(
        &self,
        path: &str,
        pattern: &str,
        recursive: bool,
    ) -> RuntimeResult<Vec<String>> {
        let matcher = compile_pattern(pattern)?;
        let prefix = path.trim_matches('/');
        let scripts = self.scripts.read().unwrap_or_else(|e| e.into_inner());

        Ok(scripts
            .keys()
            .filter(|id| {
                let rest = if prefix.is_empty() || prefix == "." {
                    Some(id.as_str())
                } else {
                    id.strip_prefix(prefix).and_then(|r| r.strip_prefix('/'))
                };
                rest.is_some_and(|r| is_within(r, recursive) && matcher.is_match(r))
            })
            .cloned()
            .collect())
    }

    async fn load(&self, script_id: &str) -> RuntimeResult<ScriptSource> {
        let scripts = self.scripts.read().unwrap_or_else(|e| e.into_inner());
        let text = scripts
            .get(script_id)
            .cloned()
            .ok_or_else(|| RuntimeError::ScriptNotFound(script_id.to_string()))?;
        Ok(ScriptSource::new(script_id, text).with_priority(self.priority))
    }
}
