//! Script compilation and the compiled-script cache.
//!
//! Compilation re-checks the import surface (a second enforcement point next
//! to the validator), syntax-checks the chunk in a bare Lua state on a worker
//! thread under a wall-clock budget, and records diagnostics and entry points.
//!
//! The cache is keyed by `(source_id, content_hash)`. Readers share it; each
//! key has its own slot lock so two threads compiling the same uncached
//! source produce one entry. Changed text for an existing id is a new key;
//! executions holding an older [`CompiledScript`] keep it alive unchanged.

use crate::analysis::ScriptAnalysis;
use crate::artifact::{Artifact, ArtifactMetadata, ArtifactStore, FORMAT_VERSION};
use crate::capability::{ApiCategory, CategorySet, SecurityPermissions, TrustLevel};
use crate::diagnostic::Diagnostic;
use crate::error::{RuntimeError, RuntimeResult};
use crate::lexer::tokenize;
use crate::source::{content_hash, ScriptSource};
use crate::validator::{category_for_root, SecurityValidator, ALLOWED_BUILTINS};
use chrono::{DateTime, Utc};
use mlua::{ChunkMode, Lua, LuaOptions, StdLib};
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{mpsc, Arc, Mutex, RwLock};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Version string written into artifacts.
pub const COMPILER_VERSION: &str = concat!("kiln-", env!("CARGO_PKG_VERSION"));

/// Options for one compilation.
#[derive(Debug, Clone)]
pub struct CompileOptions {
    /// Permissions the import surface is checked against.
    pub permissions: SecurityPermissions,

    /// Wall-clock budget for the whole compilation.
    pub timeout: Duration,

    /// Memory cap for the syntax-check state.
    pub memory_limit: usize,
}

impl CompileOptions {
    pub fn new(permissions: SecurityPermissions) -> Self {
        Self {
            permissions,
            ..Default::default()
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

impl Default for CompileOptions {
    fn default() -> Self {
        Self {
            permissions: SecurityPermissions::for_trust(TrustLevel::Untrusted),
            timeout: Duration::from_secs(2),
            memory_limit: 64 * 1024 * 1024,
        }
    }
}

/// A compiled, cache-safe script.
///
/// The executable artifact is the verified source; the sandbox loads it into
/// a fresh state for every execution, so two compilations of identical text
/// behave identically.
#[derive(Debug, Clone)]
pub struct CompiledScript {
    pub source_id: String,
    pub content_hash: String,
    pub source: Arc<str>,
    pub compiled_at: DateTime<Utc>,
    pub diagnostics: Vec<Diagnostic>,
    /// Global functions defined at chunk level.
    pub entry_points: Vec<String>,
    /// API categories the script references.
    pub required: CategorySet,
    pub compile_time: Duration,
}

impl CompiledScript {
    pub fn has_entry_point(&self, name: &str) -> bool {
        self.entry_points.iter().any(|e| e == name)
    }

    /// Export for an [`ArtifactStore`].
    pub fn to_artifact(&self) -> Artifact {
        Artifact {
            version: FORMAT_VERSION,
            metadata: ArtifactMetadata {
                source_id: self.source_id.clone(),
                content_hash: self.content_hash.clone(),
                compiled_at: self.compiled_at,
                compiler_version: COMPILER_VERSION.to_string(),
            },
            source: self.source.to_string(),
            diagnostics: self.diagnostics.clone(),
            entry_points: self.entry_points.clone(),
            required: self.required.iter().collect(),
        }
    }
}

/// Cache counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CompilerStats {
    pub entries: usize,
    pub hits: u64,
    pub compilations: u64,
    pub imports: u64,
}

type CacheKey = (String, String);

/// Work done on the compile worker thread.
struct Checked {
    diagnostics: Vec<Diagnostic>,
    entry_points: Vec<String>,
    required: CategorySet,
}

/// Compiles scripts and caches the results.
#[derive(Debug, Default)]
pub struct ScriptCompiler {
    cache: RwLock<HashMap<CacheKey, Arc<CompiledScript>>>,
    slots: Mutex<HashMap<CacheKey, Arc<Mutex<()>>>>,
    store: Option<ArtifactStore>,
    hits: AtomicU64,
    compilations: AtomicU64,
    imports: AtomicU64,
}

impl ScriptCompiler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Also persist compilations to, and import them from, a store.
    pub fn with_store(mut self, store: ArtifactStore) -> Self {
        self.store = Some(store);
        self
    }

    /// Compile a loaded source.
    pub fn compile_source(
        &self,
        source: &ScriptSource,
        options: &CompileOptions,
    ) -> RuntimeResult<Arc<CompiledScript>> {
        self.compile(&source.id, &source.text, options)
    }

    /// Compile `text` as `source_id`, returning the cached artifact when the
    /// same bytes were compiled before.
    pub fn compile(
        &self,
        source_id: &str,
        text: &str,
        options: &CompileOptions,
    ) -> RuntimeResult<Arc<CompiledScript>> {
        let key: CacheKey = (source_id.to_string(), content_hash(text));

        if let Some(hit) = self.cached(&key) {
            return self.hit(hit, options);
        }

        let slot = {
            let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
            slots.entry(key.clone()).or_default().clone()
        };
        let _writer = slot.lock().unwrap_or_else(|e| e.into_inner());

        if let Some(hit) = self.cached(&key) {
            return self.hit(hit, options);
        }

        let compiled = match self.import(&key, options) {
            Some(imported) => imported,
            None => {
                let compiled = Arc::new(self.compile_uncached(source_id, text, &key.1, options)?);
                self.compilations.fetch_add(1, Ordering::Relaxed);
                if let Some(store) = &self.store {
                    if let Err(e) = store.save(&compiled.to_artifact()) {
                        warn!(script = source_id, "Failed to persist artifact: {}", e);
                    }
                }
                compiled
            }
        };

        self.cache
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(key, compiled.clone());
        Ok(compiled)
    }

    fn cached(&self, key: &CacheKey) -> Option<Arc<CompiledScript>> {
        self.cache
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(key)
            .cloned()
    }

    /// A cached artifact is only handed to callers whose permissions cover
    /// what it references.
    fn hit(
        &self,
        compiled: Arc<CompiledScript>,
        options: &CompileOptions,
    ) -> RuntimeResult<Arc<CompiledScript>> {
        let granted = options.permissions.effective();
        if !granted.contains_all(&compiled.required) {
            let missing: Vec<&str> = compiled
                .required
                .iter()
                .filter(|c| !granted.has(*c))
                .map(|c| c.as_str())
                .collect();
            return Err(RuntimeError::CompilationFailed {
                script_id: compiled.source_id.clone(),
                message: format!("requires capabilities not granted: {}", missing.join(", ")),
            });
        }
        self.hits.fetch_add(1, Ordering::Relaxed);
        debug!(script = %compiled.source_id, "Compiler cache hit");
        Ok(compiled)
    }

    fn import(&self, key: &CacheKey, options: &CompileOptions) -> Option<Arc<CompiledScript>> {
        let store = self.store.as_ref()?;
        let artifact = match store.load(&key.0, &key.1) {
            Ok(Some(artifact)) => artifact,
            Ok(None) => return None,
            Err(e) => {
                warn!(script = %key.0, "Ignoring unusable artifact: {}", e);
                return None;
            }
        };

        let started = Instant::now();
        let checked = match Self::check(&key.0, &artifact.source, &options.permissions) {
            Ok(checked) => checked,
            Err(e) => {
                warn!(script = %key.0, "Artifact failed re-check: {}", e);
                return None;
            }
        };
        self.imports.fetch_add(1, Ordering::Relaxed);
        info!(script = %key.0, "Imported compiled artifact");

        Some(Arc::new(CompiledScript {
            source_id: key.0.clone(),
            content_hash: key.1.clone(),
            source: Arc::from(artifact.source),
            compiled_at: artifact.metadata.compiled_at,
            diagnostics: checked.diagnostics,
            entry_points: checked.entry_points,
            required: checked.required,
            compile_time: started.elapsed(),
        }))
    }

    fn compile_uncached(
        &self,
        source_id: &str,
        text: &str,
        hash: &str,
        options: &CompileOptions,
    ) -> RuntimeResult<CompiledScript> {
        let started = Instant::now();
        let source: Arc<str> = Arc::from(text);
        let (tx, rx) = mpsc::channel();

        {
            let id = source_id.to_string();
            let source = source.clone();
            let permissions = options.permissions.clone();
            let memory_limit = options.memory_limit;
            std::thread::Builder::new()
                .name(format!("kiln-compile-{}", source_id))
                .spawn(move || {
                    let result = Self::check(&id, &source, &permissions)
                        .and_then(|checked| Self::syntax_check(&id, &source, memory_limit).map(|_| checked));
                    let _ = tx.send(result);
                })?;
        }

        let checked = match rx.recv_timeout(options.timeout) {
            Ok(result) => result?,
            Err(mpsc::RecvTimeoutError::Timeout) => {
                warn!(script = source_id, "Compilation exceeded its time budget");
                return Err(RuntimeError::CompilationFailed {
                    script_id: source_id.to_string(),
                    message: format!(
                        "compilation exceeded {} ms",
                        options.timeout.as_millis()
                    ),
                });
            }
            Err(mpsc::RecvTimeoutError::Disconnected) => {
                return Err(RuntimeError::CompilationFailed {
                    script_id: source_id.to_string(),
                    message: "compiler worker exited unexpectedly".to_string(),
                });
            }
        };

        let compile_time = started.elapsed();
        debug!(
            script = source_id,
            elapsed_ms = compile_time.as_millis() as u64,
            "Compiled script"
        );

        Ok(CompiledScript {
            source_id: source_id.to_string(),
            content_hash: hash.to_string(),
            source,
            compiled_at: Utc::now(),
            diagnostics: checked.diagnostics,
            entry_points: checked.entry_points,
            required: checked.required,
            compile_time,
        })
    }

    /// Import-surface check plus diagnostics and entry points.
    fn check(
        source_id: &str,
        text: &str,
        permissions: &SecurityPermissions,
    ) -> RuntimeResult<Checked> {
        let failed = |message: String| RuntimeError::CompilationFailed {
            script_id: source_id.to_string(),
            message,
        };

        let tokens = tokenize(text).map_err(|e| failed(e.to_string()))?;
        let analysis = ScriptAnalysis::new(tokens);

        let surface = SecurityValidator::check_surface(&analysis, permissions);
        if let Some(first) = surface.iter().find(|d| d.is_error()) {
            return Err(failed(format!("import surface check failed: {}", first)));
        }

        let mut required = CategorySet::new();
        for r in &analysis.references {
            if analysis.is_declared(&r.root) {
                continue;
            }
            if let Some(category) = category_for_root(&r.root) {
                required.add(category);
            }
        }

        Ok(Checked {
            diagnostics: Self::diagnostics(&analysis),
            entry_points: analysis.entry_points(),
            required,
        })
    }

    fn diagnostics(analysis: &ScriptAnalysis) -> Vec<Diagnostic> {
        let mut diagnostics = Vec::new();

        for (i, token) in analysis.tokens.iter().enumerate() {
            if analysis.is_assignment_target(i)
                && !analysis.locals.contains(&token.text)
                && analysis.owner_of(i).is_some()
            {
                diagnostics.push(Diagnostic::warning(
                    "implicit-global",
                    format!("assignment to undeclared global '{}' inside a function", token.text),
                    token.line,
                    token.column,
                ));
            }
        }

        let shadowable: BTreeSet<&str> = ApiCategory::ALL
            .iter()
            .map(|c| c.namespace())
            .chain(ALLOWED_BUILTINS.iter().copied())
            .collect();
        for name in analysis.locals.iter().filter(|l| shadowable.contains(l.as_str())) {
            if let Some(t) = analysis.tokens.iter().find(|t| t.is_name() && &t.text == name) {
                diagnostics.push(Diagnostic::warning(
                    "shadowed-api",
                    format!("local '{}' shadows a host namespace", name),
                    t.line,
                    t.column,
                ));
            }
        }

        if let Some(r) = analysis
            .references
            .iter()
            .find(|r| r.root == "print" && !analysis.is_declared("print"))
        {
            diagnostics.push(Diagnostic::info(
                "print-redirected",
                "print output is redirected to the mod log",
                r.line,
                r.column,
            ));
        }

        diagnostics
    }

    /// Compile the chunk in a state with no libraries.
    fn syntax_check(source_id: &str, text: &str, memory_limit: usize) -> RuntimeResult<()> {
        let failed = |e: mlua::Error| RuntimeError::CompilationFailed {
            script_id: source_id.to_string(),
            message: e.to_string(),
        };

        let lua = Lua::new_with(StdLib::NONE, LuaOptions::default()).map_err(failed)?;
        lua.set_memory_limit(memory_limit).map_err(failed)?;
        lua.load(text)
            .set_name(format!("={}", source_id))
            .set_mode(ChunkMode::Text)
            .into_function()
            .map_err(failed)?;
        Ok(())
    }

    /// Drop every cached entry of a source id. Returns how many were dropped.
    pub fn invalidate(&self, source_id: &str) -> usize {
        let mut cache = self.cache.write().unwrap_or_else(|e| e.into_inner());
        let before = cache.len();
        cache.retain(|(id, _), _| id != source_id);
        self.slots
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .retain(|(id, _), _| id != source_id);
        if let Some(store) = &self.store {
            if let Err(e) = store.remove(source_id) {
                warn!(script = source_id, "Failed to remove artifacts: {}", e);
            }
        }
        before - cache.len()
    }

    /// Drop everything.
    pub fn clear(&self) {
        self.cache.write().unwrap_or_else(|e| e.into_inner()).clear();
        self.slots.lock().unwrap_or_else(|e| e.into_inner()).clear();
    }

    /// The most recently compiled entry for a source id.
    pub fn latest(&self, source_id: &str) -> Option<Arc<CompiledScript>> {
        self.cache
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|((id, _), _)| id == source_id)
            .map(|(_, compiled)| compiled)
            .max_by_key(|compiled| compiled.compiled_at)
            .cloned()
    }

    pub fn stats(&self) -> CompilerStats {
        CompilerStats {
            entries: self.cache.read().unwrap_or_else(|e| e.into_inner()).len(),
            hits: self.hits.load(Ordering::Relaxed),
            compilations: self.compilations.load(Ordering::Relaxed),
            imports: self.imports.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn options() -> CompileOptions {
        CompileOptions::new(SecurityPermissions::for_trust(TrustLevel::Trusted))
    }

    #[test]
    fn test_cache_hit_returns_same_instance() {
        let compiler = ScriptCompiler::new();
        let a = compiler.compile("m/main.lua", "function init() end", &options()).unwrap();
        let b = compiler.compile("m/main.lua", "function init() end", &options()).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        let stats = compiler.stats();
        assert_eq!(stats.compilations, 1);
        assert_eq!(stats.hits, 1);
        assert_eq!(a.entry_points, vec!["init"]);
    }

    #[test]
    fn test_changed_text_is_new_entry() {
        let compiler = ScriptCompiler::new();
        let old = compiler.compile("m/main.lua", "return 1", &options()).unwrap();
        let new = compiler.compile("m/main.lua", "return 2", &options()).unwrap();
        assert!(!Arc::ptr_eq(&old, &new));
        assert_eq!(&*old.source, "return 1");
        assert_eq!(compiler.stats().entries, 2);
        assert_eq!(compiler.latest("m/main.lua").unwrap().content_hash, new.content_hash);

        assert_eq!(compiler.invalidate("m/main.lua"), 2);
        assert_eq!(compiler.stats().entries, 0);
        assert_eq!(&*old.source, "return 1");
    }

    #[test]
    fn test_concurrent_compiles_produce_one_entry() {
        let compiler = Arc::new(ScriptCompiler::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let compiler = compiler.clone();
                std::thread::spawn(move || {
                    compiler
                        .compile("m/shared.lua", "local x = 1\nreturn x", &options())
                        .unwrap()
                })
            })
            .collect();
        let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert!(results.windows(2).all(|w| Arc::ptr_eq(&w[0], &w[1])));
        assert_eq!(compiler.stats().compilations, 1);
        assert_eq!(compiler.stats().hits, 7);
    }

    #[test]
    fn test_syntax_error_fails() {
        let compiler = ScriptCompiler::new();
        let err = compiler
            .compile("m/bad.lua", "function broken( end", &options())
            .unwrap_err();
        assert!(matches!(err, RuntimeError::CompilationFailed { .. }));
        assert_eq!(compiler.stats().entries, 0);
    }

    #[test]
    fn test_surface_rechecked() {
        let compiler = ScriptCompiler::new();
        let err = compiler
            .compile("m/evil.lua", "os.exit(1)", &options())
            .unwrap_err();
        assert!(err.to_string().contains("forbidden-api"));
    }

    #[test]
    fn test_cached_artifact_not_widened() {
        let compiler = ScriptCompiler::new();
        let source = "function init() shared.set('k', 1) end";
        compiler.compile("m/main.lua", source, &options()).unwrap();

        let untrusted = CompileOptions::new(SecurityPermissions::for_trust(TrustLevel::Untrusted));
        let err = compiler.compile("m/main.lua", source, &untrusted).unwrap_err();
        assert!(err.to_string().contains("shared_data"));
    }

    #[test]
    fn test_diagnostics() {
        let compiler = ScriptCompiler::new();
        let source = "local log = {}\nfunction init()\n  counter = 1\n  print('hi')\nend";
        let compiled = compiler.compile("m/d.lua", source, &options()).unwrap();
        let codes: Vec<&str> = compiled.diagnostics.iter().map(|d| d.code.as_str()).collect();
        assert!(codes.contains(&"implicit-global"));
        assert!(codes.contains(&"shadowed-api"));
        assert!(codes.contains(&"print-redirected"));
    }

    #[test]
    fn test_timeout_is_fatal() {
        let compiler = ScriptCompiler::new();
        let options = options().with_timeout(Duration::ZERO);
        let source = "local t = {}\n".repeat(20_000);
        let result = compiler.compile("m/slow.lua", &source, &options);
        // A zero budget cannot be met by a real compilation.
        let err = result.unwrap_err();
        assert!(err.to_string().contains("exceeded"));
    }

    #[test]
    fn test_store_import() {
        let temp = TempDir::new().unwrap();
        let store = ArtifactStore::new(temp.path());
        let source = "function init() end";

        let first = ScriptCompiler::new().with_store(store.clone());
        first.compile("m/main.lua", source, &options()).unwrap();
        assert_eq!(first.stats().compilations, 1);

        let second = ScriptCompiler::new().with_store(store);
        let imported = second.compile("m/main.lua", source, &options()).unwrap();
        assert_eq!(second.stats().compilations, 0);
        assert_eq!(second.stats().imports, 1);
        assert_eq!(imported.entry_points, vec!["init"]);
    }
}
