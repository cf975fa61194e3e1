//! Mod loader for managing the lifecycle of mods.
//!
//! The loader runs the whole pipeline: discover manifests, resolve the load
//! order, then per mod verify, validate, compile and initialise inside the
//! sandbox. Mods load in dependency waves; the mods of one wave initialise
//! concurrently on blocking tasks. A failure blocks only that mod and the
//! mods that require it.
//!
//! Every mod has a gate. Executions hold it shared; unload and reload hold
//! it exclusively for the mod and all of its dependents, so nothing runs
//! against an instance that is being torn down.

use crate::host::ModHost;
use crate::instance::{ModInstance, ModStatus, INIT_FUNCTION, SHUTDOWN_FUNCTION};
use kiln_runtime::audit::AuditRecord;
use kiln_runtime::discovery::{discover_mod, DiscoveryFailure};
use kiln_runtime::source::content_hash;
use kiln_runtime::{
    discover_in_roots, discover_mods, ArtifactStore, AuditLog, CompileOptions, CompiledScript,
    DependencyGraph, DependencyResolver, Discovery, ErrorKind, ExecutionResult, ModPath,
    ParamValue, PerformanceBudget, PerformanceMonitor, ResolveIssue, RuntimeError, RuntimeResult,
    SandboxConfig, SandboxEventKind, ScriptCompiler, ScriptSandbox, ScriptSource, SecurityPermissions,
    SecurityValidator, Severity, Stage, TrustLevel, ValidationPolicy, ValidationReport, Version,
};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{OwnedRwLockWriteGuard, RwLock};
use tokio::task::JoinSet;
use tracing::{error, info, warn};

/// Loader settings.
#[derive(Debug, Clone)]
pub struct LoaderConfig {
    /// API version mods' `apiVersion` ranges are matched against.
    pub host_api_version: Version,

    /// Also scan the user mods directory after the given roots.
    pub include_user_mods: bool,

    /// Budget for a mod's top level plus `init`.
    pub init_timeout: Duration,

    /// Budget for `shutdown`.
    pub shutdown_timeout: Duration,

    /// Budget for calls made through [`ModLoader::execute`].
    pub execute_timeout: Duration,

    pub compile_timeout: Duration,
    pub validation: ValidationPolicy,
    pub sandbox: SandboxConfig,
    pub budget: PerformanceBudget,

    /// Where compiled artifacts persist between runs.
    pub artifact_dir: Option<PathBuf>,

    /// JSON-lines file for audit records.
    pub audit_path: Option<PathBuf>,

    /// Replacement permissions for trust levels.
    pub trust: HashMap<TrustLevel, SecurityPermissions>,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            host_api_version: Version::new(1, 0, 0),
            include_user_mods: false,
            init_timeout: Duration::from_secs(2),
            shutdown_timeout: Duration::from_secs(1),
            execute_timeout: Duration::from_secs(1),
            compile_timeout: Duration::from_secs(2),
            validation: ValidationPolicy::default(),
            sandbox: SandboxConfig::default(),
            budget: PerformanceBudget::default(),
            artifact_dir: None,
            audit_path: None,
            trust: HashMap::new(),
        }
    }
}

impl LoaderConfig {
    /// Permissions for a trust level, honouring configured overrides.
    pub fn permissions_for(&self, level: TrustLevel) -> SecurityPermissions {
        self.trust
            .get(&level)
            .cloned()
            .unwrap_or_else(|| SecurityPermissions::for_trust(level))
    }
}

/// One mod in a [`LoadReport`].
#[derive(Debug, Clone, Serialize)]
pub struct ModReport {
    pub id: String,
    pub name: String,
    pub version: String,
    pub path: PathBuf,
    pub trust_level: TrustLevel,
    pub status: ModStatus,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub validation: Vec<ValidationReport>,
}

/// Machine-readable outcome of a dry run or a load.
#[derive(Debug, Clone, Default, Serialize)]
pub struct LoadReport {
    /// Resolved load order.
    pub order: Vec<String>,
    pub mods: Vec<ModReport>,
    pub issues: Vec<ResolveIssue>,
    pub discovery_failures: Vec<DiscoveryFailure>,
    /// Directories hidden by a same-id mod from an earlier root.
    pub shadowed: Vec<PathBuf>,
}

impl LoadReport {
    pub fn has_errors(&self) -> bool {
        !self.discovery_failures.is_empty()
            || self.issues.iter().any(ResolveIssue::is_error)
            || self.mods.iter().any(|m| m.status.is_failed())
    }

    pub fn get(&self, id: &str) -> Option<&ModReport> {
        self.mods.iter().find(|m| m.id == id)
    }

    pub fn status(&self, id: &str) -> Option<&ModStatus> {
        self.get(id).map(|m| &m.status)
    }

    /// Ids of mods in a given state, in report order.
    pub fn ids_where(&self, predicate: impl Fn(&ModStatus) -> bool) -> Vec<&str> {
        self.mods
            .iter()
            .filter(|m| predicate(&m.status))
            .map(|m| m.id.as_str())
            .collect()
    }
}

/// Result of one hook handler.
#[derive(Debug, Clone, Serialize)]
pub struct HookOutcome {
    pub mod_id: String,
    pub function: String,
    pub value: ParamValue,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kind: Option<ErrorKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl HookOutcome {
    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

/// The per-mod pipeline. Cheap to clone into blocking tasks.
#[derive(Clone)]
struct Pipeline {
    config: Arc<LoaderConfig>,
    host: ModHost,
    validator: Arc<SecurityValidator>,
    compiler: Arc<ScriptCompiler>,
    sandbox: Arc<ScriptSandbox>,
    monitor: Arc<PerformanceMonitor>,
    audit: Arc<AuditLog>,
}

impl Pipeline {
    /// Read the mod's scripts, entry point first, and verify the checksum.
    fn read_sources(&self, mod_path: &ModPath) -> RuntimeResult<Vec<ScriptSource>> {
        let id = mod_path.id();
        let paths = mod_path.script_paths().map_err(|e| match e {
            RuntimeError::Io(io) if io.kind() == std::io::ErrorKind::NotFound => {
                RuntimeError::ScriptNotFound(format!("{}: {}", id, io))
            }
            other => other,
        })?;

        let mut sources = Vec::with_capacity(paths.len());
        for (relative, path) in mod_path.manifest.script_paths().zip(paths) {
            let text = std::fs::read_to_string(&path)?;
            sources.push(
                ScriptSource::new(format!("{}/{}", id, relative), text)
                    .with_origin(path)
                    .with_priority(mod_path.priority as i32),
            );
        }

        if let (Some(expected), Some(entry)) = (mod_path.manifest.checksum_hex(), sources.first()) {
            if !expected.eq_ignore_ascii_case(&entry.content_hash) {
                return Err(RuntimeError::manifest(format!(
                    "checksum mismatch for '{}': manifest has {}, file is {}",
                    entry.id, expected, entry.content_hash
                )));
            }
        }
        Ok(sources)
    }

    fn validate(&self, mod_id: &str, source: &ScriptSource, permissions: &SecurityPermissions) -> ValidationReport {
        let timer = self.monitor.start(Stage::Validate, source.id.as_str());
        let report = self.validator.validate(&source.id, &source.text, permissions);
        self.observe(mod_id, timer.stop(0));

        for warning in report.warnings() {
            warn!(mod_id, script = %source.id, "{}", warning);
        }
        report
    }

    fn compile(&self, mod_id: &str, source: &ScriptSource, options: &CompileOptions) -> RuntimeResult<Arc<CompiledScript>> {
        let timer = self.monitor.start(Stage::Compile, source.id.as_str());
        let compiled = self.compiler.compile_source(source, options)?;
        self.observe(mod_id, timer.stop(0));
        Ok(compiled)
    }

    /// Run the mod's scripts and optionally one function.
    fn run(
        &self,
        instance: &ModInstance,
        function: Option<&str>,
        args: Vec<ParamValue>,
        timeout: Duration,
        stage: Stage,
    ) -> RuntimeResult<ExecutionResult> {
        let entry = instance
            .entry_script()
            .ok_or_else(|| RuntimeError::ScriptNotFound(instance.manifest.entry_point.clone()))?;

        let timer = self.monitor.start(stage, instance.id());
        let result = self
            .sandbox
            .execute(entry, instance.context(function, args), timeout);
        let mut sample = timer.stop(result.peak_memory);
        sample.gc_churn = result.gc_churn;
        self.observe(instance.id(), sample);
        Ok(result)
    }

    fn observe(&self, mod_id: &str, sample: kiln_runtime::metrics::StageSample) {
        for violation in self.monitor.record(sample) {
            warn!(mod_id, "Performance budget exceeded: {}", violation);
        }
    }

    /// Verify, validate, compile and initialise one mod.
    fn load(&self, mod_path: &ModPath) -> RuntimeResult<ModInstance> {
        let id = mod_path.id();
        let permissions = self.config.permissions_for(mod_path.manifest.trust_level);
        let sources = self.read_sources(mod_path)?;

        for source in &sources {
            let report = self.validate(id, source, &permissions);
            if report.is_rejected() {
                self.audit.record(AuditRecord::new(
                    id,
                    source.id.as_str(),
                    ErrorKind::ValidationRejected,
                    Severity::Error,
                    report.summary(),
                ));
            }
            report.into_result()?;
        }

        let options = CompileOptions::new(permissions.clone()).with_timeout(self.config.compile_timeout);
        let scripts = sources
            .iter()
            .map(|source| self.compile(id, source, &options))
            .collect::<RuntimeResult<Vec<_>>>()?;

        let instance = ModInstance::new(
            mod_path.manifest.clone(),
            mod_path.path.clone(),
            permissions.clone(),
            scripts,
            self.host.api_for(id, permissions),
        );

        let init = instance.has_function(INIT_FUNCTION).then_some(INIT_FUNCTION);
        self.run(&instance, init, Vec::new(), self.config.init_timeout, Stage::Initialize)?
            .into_result()?;
        Ok(instance)
    }

    /// Read and validate without compiling or executing.
    fn check(&self, mod_path: &ModPath) -> (ModStatus, Vec<ValidationReport>) {
        let permissions = self.config.permissions_for(mod_path.manifest.trust_level);
        let sources = match self.read_sources(mod_path) {
            Ok(sources) => sources,
            Err(e) => return (ModStatus::failed(e.kind(), e.to_string()), Vec::new()),
        };

        let reports: Vec<ValidationReport> = sources
            .iter()
            .map(|source| self.validate(mod_path.id(), source, &permissions))
            .collect();
        let status = match reports.iter().find(|r| r.is_rejected()) {
            Some(rejected) => ModStatus::failed(
                ErrorKind::ValidationRejected,
                format!("{}: {}", rejected.script_id, rejected.summary()),
            ),
            None => ModStatus::Ready,
        };
        (status, reports)
    }
}

#[derive(Default)]
struct LoaderState {
    roots: Vec<PathBuf>,
    known: BTreeMap<String, ModPath>,
    order: Vec<String>,
    graph: DependencyGraph,
    statuses: BTreeMap<String, ModStatus>,
    instances: HashMap<String, Arc<ModInstance>>,
    issues: Vec<ResolveIssue>,
    discovery_failures: Vec<DiscoveryFailure>,
    shadowed: Vec<PathBuf>,
}

impl LoaderState {
    fn position(&self, id: &str) -> usize {
        self.order
            .iter()
            .position(|m| m == id)
            .unwrap_or(usize::MAX)
    }

    /// Ids sorted by load order; unordered ids last, by id.
    fn sorted<I: IntoIterator<Item = String>>(&self, ids: I) -> Vec<String> {
        let mut ids: Vec<String> = ids.into_iter().collect();
        ids.sort_by(|a, b| self.position(a).cmp(&self.position(b)).then_with(|| a.cmp(b)));
        ids
    }

    fn report(&self, validation: &mut BTreeMap<String, Vec<ValidationReport>>) -> LoadReport {
        let mods = self
            .sorted(self.known.keys().cloned())
            .into_iter()
            .filter_map(|id| {
                let mod_path = self.known.get(&id)?;
                Some(ModReport {
                    name: mod_path.name().to_string(),
                    version: mod_path.manifest.version.to_string(),
                    path: mod_path.path.clone(),
                    trust_level: mod_path.manifest.trust_level,
                    status: self.statuses.get(&id).cloned().unwrap_or(ModStatus::Pending),
                    validation: validation.remove(&id).unwrap_or_default(),
                    id,
                })
            })
            .collect();

        LoadReport {
            order: self.order.clone(),
            mods,
            issues: self.issues.clone(),
            discovery_failures: self.discovery_failures.clone(),
            shadowed: self.shadowed.clone(),
        }
    }

    /// Replace discovery and resolution results.
    fn apply(&mut self, discovery: Discovery, resolver: &DependencyResolver) {
        self.known.clear();
        for mod_path in discovery.mods {
            self.known.entry(mod_path.id().to_string()).or_insert(mod_path);
        }
        self.discovery_failures = discovery.failures;
        self.shadowed = discovery.shadowed.into_iter().map(|m| m.path).collect();
        self.resolve(resolver, None);
    }

    /// Re-run resolution over the known manifests. Statuses are reset for
    /// `scope`, or for every mod when no scope is given.
    fn resolve(&mut self, resolver: &DependencyResolver, scope: Option<&HashSet<String>>) {
        let mut mods: Vec<&ModPath> = self.known.values().collect();
        mods.sort_by(|a, b| a.priority.cmp(&b.priority).then_with(|| a.id().cmp(b.id())));
        let manifests: Vec<_> = mods.into_iter().map(|m| m.manifest.clone()).collect();
        let resolution = resolver.resolve(&manifests);

        for id in self.known.keys() {
            if scope.is_some_and(|s| !s.contains(id)) {
                continue;
            }
            let status = match resolution.failed.get(id) {
                Some(issue) => ModStatus::failed(
                    issue.kind.unwrap_or(ErrorKind::DependencyFailed),
                    issue.message.clone(),
                ),
                None => ModStatus::Pending,
            };
            self.statuses.insert(id.clone(), status);
        }
        self.order = resolution.order;
        self.graph = resolution.graph;
        self.issues = resolution.issues;
    }

    /// Split ids into waves; a mod waits for every mod it must follow.
    fn waves(&self, ids: &[String]) -> Vec<Vec<String>> {
        let wanted: HashSet<&str> = ids.iter().map(String::as_str).collect();
        let mut waves: Vec<Vec<String>> = Vec::new();
        let mut current: HashSet<&str> = HashSet::new();

        for id in self.order.iter().filter(|id| wanted.contains(id.as_str())) {
            let must_follow = |other: &str| {
                self.graph.dependencies_of(id).any(|d| d == other)
                    || self.known.get(id).is_some_and(|m| m.manifest.load_after.iter().any(|a| a == other))
                    || self
                        .known
                        .get(other)
                        .is_some_and(|m| m.manifest.load_before.iter().any(|b| b == id))
            };
            if waves.is_empty() || current.iter().any(|other| must_follow(*other)) {
                waves.push(Vec::new());
                current.clear();
            }
            current.insert(id);
            if let Some(wave) = waves.last_mut() {
                wave.push(id.clone());
            }
        }
        waves
    }

    /// First required dependency of `id` that is not active.
    fn inactive_dependency(&self, id: &str) -> Option<String> {
        self.graph
            .required_of(id)
            .find(|d| !self.statuses.get(*d).is_some_and(ModStatus::is_active))
            .map(str::to_string)
    }
}

/// Orchestrates mods from discovery to shutdown.
pub struct ModLoader {
    pipeline: Pipeline,
    resolver: DependencyResolver,
    state: RwLock<LoaderState>,
    gates: Mutex<HashMap<String, Arc<RwLock<()>>>>,
}

impl ModLoader {
    pub fn new(config: LoaderConfig, host: ModHost) -> RuntimeResult<Self> {
        let audit = Arc::new(match &config.audit_path {
            Some(path) => AuditLog::with_file(path)?,
            None => AuditLog::new(),
        });
        let compiler = match &config.artifact_dir {
            Some(dir) => ScriptCompiler::new().with_store(ArtifactStore::new(dir)),
            None => ScriptCompiler::new(),
        };
        let pipeline = Pipeline {
            validator: Arc::new(SecurityValidator::new(config.validation.clone())?),
            compiler: Arc::new(compiler),
            sandbox: Arc::new(ScriptSandbox::new(config.sandbox.clone()).with_audit(audit.clone())),
            monitor: Arc::new(PerformanceMonitor::new(config.budget.clone())),
            audit,
            host,
            config: Arc::new(config),
        };
        Ok(Self {
            resolver: DependencyResolver::new(pipeline.config.host_api_version.clone()),
            pipeline,
            state: RwLock::new(LoaderState::default()),
            gates: Mutex::new(HashMap::new()),
        })
    }

    pub fn config(&self) -> &LoaderConfig {
        &self.pipeline.config
    }

    pub fn host(&self) -> &ModHost {
        &self.pipeline.host
    }

    pub fn compiler(&self) -> &Arc<ScriptCompiler> {
        &self.pipeline.compiler
    }

    pub fn monitor(&self) -> &Arc<PerformanceMonitor> {
        &self.pipeline.monitor
    }

    pub fn audit(&self) -> &Arc<AuditLog> {
        &self.pipeline.audit
    }

    fn discover(&self, dirs: &[PathBuf]) -> Discovery {
        if self.pipeline.config.include_user_mods {
            discover_mods(dirs)
        } else {
            discover_in_roots(dirs)
        }
    }

    fn gate(&self, mod_id: &str) -> Arc<RwLock<()>> {
        self.gates
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry(mod_id.to_string())
            .or_default()
            .clone()
    }

    /// Exclusive gates for `ids`, acquired in the given order.
    async fn lock_gates(&self, ids: &[String]) -> Vec<OwnedRwLockWriteGuard<()>> {
        let mut guards = Vec::with_capacity(ids.len());
        for id in ids {
            guards.push(self.gate(id).write_owned().await);
        }
        guards
    }

    /// Discovery, resolution and static validation. Nothing is compiled or
    /// executed and the loader's state is left untouched.
    pub fn dry_run(&self, dirs: &[PathBuf]) -> LoadReport {
        let mut state = LoaderState {
            roots: dirs.to_vec(),
            ..Default::default()
        };
        state.apply(self.discover(dirs), &self.resolver);

        let mut validation = BTreeMap::new();
        for id in state.order.clone() {
            let blocked = state
                .graph
                .required_of(&id)
                .find(|d| state.statuses.get(*d).is_some_and(ModStatus::is_failed))
                .map(str::to_string);
            let status = match blocked {
                Some(dependency) => ModStatus::failed(
                    ErrorKind::DependencyFailed,
                    format!("required dependency '{}' failed", dependency),
                ),
                None => match state.known.get(&id) {
                    Some(mod_path) => {
                        let (status, reports) = self.pipeline.check(mod_path);
                        validation.insert(id.clone(), reports);
                        status
                    }
                    None => continue,
                },
            };
            state.statuses.insert(id, status);
        }

        let report = state.report(&mut validation);
        info!(
            mods = report.mods.len(),
            errors = report.has_errors(),
            "Dry run finished"
        );
        report
    }

    /// Discover, resolve and load every mod under `dirs`.
    ///
    /// Mods already loaded are unloaded first.
    pub async fn load_all(&self, dirs: &[PathBuf]) -> LoadReport {
        self.unload_all().await;

        let discovery = self.discover(dirs);
        let order = {
            let mut state = self.state.write().await;
            *state = LoaderState {
                roots: dirs.to_vec(),
                ..Default::default()
            };
            state.apply(discovery, &self.resolver);
            for issue in state.issues.iter().filter(|i| i.is_error()) {
                warn!(mod_id = %issue.mod_id, "{}", issue.message);
            }
            state.order.clone()
        };

        self.load_in_waves(&order).await;

        let state = self.state.read().await;
        let report = state.report(&mut BTreeMap::new());
        info!(
            active = report.ids_where(ModStatus::is_active).len(),
            failed = report.ids_where(ModStatus::is_failed).len(),
            "Mods loaded"
        );
        report
    }

    async fn load_in_waves(&self, ids: &[String]) {
        let waves = self.state.read().await.waves(ids);

        for wave in waves {
            let mut tasks = JoinSet::new();
            for id in wave {
                let mod_path = {
                    let mut state = self.state.write().await;
                    if !matches!(state.statuses.get(&id), Some(ModStatus::Pending)) {
                        continue;
                    }
                    if let Some(dependency) = state.inactive_dependency(&id) {
                        let reason = format!("required dependency '{}' failed to load", dependency);
                        warn!(mod_id = %id, "{}", reason);
                        state
                            .statuses
                            .insert(id.clone(), ModStatus::failed(ErrorKind::DependencyFailed, reason));
                        continue;
                    }
                    match state.known.get(&id) {
                        Some(mod_path) => mod_path.clone(),
                        None => continue,
                    }
                };

                let pipeline = self.pipeline.clone();
                tasks.spawn_blocking(move || {
                    let id = mod_path.id().to_string();
                    let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                        pipeline.load(&mod_path)
                    }))
                    .unwrap_or_else(|_| {
                        Err(RuntimeError::ExecutionFaulted("loader task panicked".to_string()))
                    });
                    (id, result)
                });
            }

            while let Some(joined) = tasks.join_next().await {
                let (id, result) = match joined {
                    Ok(done) => done,
                    Err(e) => {
                        error!("Load task failed: {}", e);
                        continue;
                    }
                };
                let mut state = self.state.write().await;
                match result {
                    Ok(instance) => {
                        info!(
                            mod_id = %id,
                            version = %instance.version(),
                            scripts = instance.scripts.len(),
                            "Mod active"
                        );
                        state.instances.insert(id.clone(), Arc::new(instance));
                        state.statuses.insert(id, ModStatus::Active);
                    }
                    Err(e) => {
                        warn!(mod_id = %id, kind = %e.kind(), "Mod failed to load: {}", e);
                        self.pipeline.host.hooks().remove_mod(&id);
                        state.statuses.insert(id, ModStatus::failed(e.kind(), e.to_string()));
                    }
                }
            }
        }
    }

    /// Call a function of an active mod.
    ///
    /// Waits while the mod is being unloaded or reloaded.
    pub async fn execute(
        &self,
        mod_id: &str,
        function: &str,
        args: Vec<ParamValue>,
    ) -> RuntimeResult<ExecutionResult> {
        let _guard = self.gate(mod_id).read_owned().await;
        let instance = self
            .state
            .read()
            .await
            .instances
            .get(mod_id)
            .cloned()
            .ok_or_else(|| RuntimeError::ModNotFound(mod_id.to_string()))?;

        if !instance.has_function(function) {
            return Err(RuntimeError::ScriptNotFound(format!("{}::{}", mod_id, function)));
        }

        let pipeline = self.pipeline.clone();
        let function = function.to_string();
        let timeout = self.pipeline.config.execute_timeout;
        let result = tokio::task::spawn_blocking(move || {
            pipeline.run(&instance, Some(function.as_str()), args, timeout, Stage::Execute)
        })
        .await
        .map_err(|e| RuntimeError::ExecutionFaulted(format!("execution task failed: {}", e)))??;

        if result.has_event(SandboxEventKind::WatchdogTerminated) {
            self.quarantine(mod_id, &result).await;
        }
        Ok(result)
    }

    /// Take a mod out of service after the watchdog abandoned one of its
    /// workers. Its hooks are dropped and it stays `Failed` until reloaded.
    async fn quarantine(&self, mod_id: &str, result: &ExecutionResult) {
        {
            let mut state = self.state.write().await;
            if state.instances.remove(mod_id).is_none() {
                return;
            }
            state.statuses.insert(
                mod_id.to_string(),
                ModStatus::failed(
                    ErrorKind::ExecutionTimedOut,
                    format!(
                        "'{}' ignored cancellation and was terminated; reload the mod to re-enable it",
                        result.script_id
                    ),
                ),
            );
        }
        self.pipeline.host.hooks().remove_mod(mod_id);
        warn!(mod_id, script = %result.script_id, "Mod quarantined until reloaded");
    }

    /// Run every handler registered for `hook`, in mod load order.
    ///
    /// A failing handler is reported and the rest still run.
    pub async fn invoke_hook(&self, hook: &str, args: Vec<ParamValue>) -> RuntimeResult<Vec<HookOutcome>> {
        let mut handlers = self.pipeline.host.hooks().handlers(hook)?;
        {
            let state = self.state.read().await;
            handlers.sort_by_key(|h| state.position(&h.mod_id));
        }

        let mut outcomes = Vec::with_capacity(handlers.len());
        for handler in handlers {
            let outcome = match self.execute(&handler.mod_id, &handler.function, args.clone()).await {
                Ok(result) => HookOutcome {
                    value: result.value.clone(),
                    kind: result.state.error_kind(),
                    error: result.error.clone(),
                    mod_id: handler.mod_id,
                    function: handler.function,
                },
                Err(e) => HookOutcome {
                    value: ParamValue::Null,
                    kind: Some(e.kind()),
                    error: Some(e.to_string()),
                    mod_id: handler.mod_id,
                    function: handler.function,
                },
            };
            if let Some(error) = &outcome.error {
                warn!(mod_id = %outcome.mod_id, hook, "Hook handler failed: {}", error);
            }
            outcomes.push(outcome);
        }
        Ok(outcomes)
    }

    /// Shut one mod down. The caller holds its gate exclusively.
    async fn shutdown(&self, mod_id: &str) -> bool {
        let instance = {
            let mut state = self.state.write().await;
            let instance = state.instances.remove(mod_id);
            if instance.is_some() {
                state.statuses.insert(mod_id.to_string(), ModStatus::Unloaded);
            }
            instance
        };
        let Some(instance) = instance else {
            return false;
        };

        if instance.has_function(SHUTDOWN_FUNCTION) {
            let pipeline = self.pipeline.clone();
            let timeout = self.pipeline.config.shutdown_timeout;
            let instance = instance.clone();
            let outcome = tokio::task::spawn_blocking(move || {
                pipeline.run(&instance, Some(SHUTDOWN_FUNCTION), Vec::new(), timeout, Stage::Execute)
            })
            .await;
            match outcome {
                Ok(Ok(result)) if result.is_success() => {}
                Ok(Ok(result)) => warn!(
                    mod_id,
                    state = %result.state,
                    "Shutdown did not complete: {}",
                    result.error.as_deref().unwrap_or("")
                ),
                Ok(Err(e)) => warn!(mod_id, "Shutdown failed: {}", e),
                Err(e) => error!(mod_id, "Shutdown task failed: {}", e),
            }
        }

        self.pipeline.host.hooks().remove_mod(mod_id);
        for script in &instance.scripts {
            self.pipeline.compiler.invalidate(&script.source_id);
        }
        self.pipeline.monitor.forget(mod_id);
        info!(mod_id, "Mod unloaded");
        true
    }

    /// The mod plus every dependent that is known, in load order.
    async fn with_dependents(&self, mod_id: &str) -> RuntimeResult<Vec<String>> {
        let state = self.state.read().await;
        if !state.known.contains_key(mod_id) {
            return Err(RuntimeError::ModNotFound(mod_id.to_string()));
        }
        let mut ids = state.graph.transitive_dependents(mod_id);
        ids.retain(|id| state.known.contains_key(id));
        ids.insert(mod_id.to_string());
        Ok(state.sorted(ids))
    }

    /// Unload a mod and everything depending on it, dependents first.
    /// Returns the ids that were shut down.
    pub async fn unload(&self, mod_id: &str) -> RuntimeResult<Vec<String>> {
        let targets = self.with_dependents(mod_id).await?;
        let _guards = self.lock_gates(&targets).await;

        let mut unloaded = Vec::new();
        for id in targets.iter().rev() {
            if self.shutdown(id).await {
                unloaded.push(id.clone());
            }
        }
        Ok(unloaded)
    }

    /// Unload every active mod in reverse load order.
    pub async fn unload_all(&self) -> Vec<String> {
        let active = self.active_mods().await;
        let _guards = self.lock_gates(&active).await;

        let mut unloaded = Vec::new();
        for id in active.iter().rev() {
            if self.shutdown(id).await {
                unloaded.push(id.clone());
            }
        }
        unloaded
    }

    /// Reload a mod from disk together with its dependents.
    ///
    /// Executions of any affected mod wait until the reload finishes.
    /// Returns the resulting status of each affected mod, in load order.
    pub async fn reload(&self, mod_id: &str) -> RuntimeResult<Vec<(String, ModStatus)>> {
        let targets = self.with_dependents(mod_id).await?;
        let _guards = self.lock_gates(&targets).await;
        info!(mod_id, affected = targets.len(), "Reloading mod");

        for id in targets.iter().rev() {
            self.shutdown(id).await;
        }

        let scope: HashSet<String> = targets.iter().cloned().collect();
        {
            let mut state = self.state.write().await;
            for id in &targets {
                let Some(old) = state.known.get(id).cloned() else {
                    continue;
                };
                match discover_mod(&old.path, old.priority) {
                    Ok(fresh) if fresh.id() == id => {
                        state.known.insert(id.clone(), fresh);
                    }
                    Ok(fresh) => {
                        warn!(mod_id = %id, "Manifest id changed to '{}'; reload the mod root instead", fresh.id());
                        state.known.remove(id);
                        state.statuses.insert(
                            id.clone(),
                            ModStatus::failed(ErrorKind::ManifestInvalid, format!("id changed to '{}'", fresh.id())),
                        );
                    }
                    Err(e) => {
                        warn!(mod_id = %id, "Manifest no longer loads: {}", e);
                        state.known.remove(id);
                        state.statuses.insert(id.clone(), ModStatus::failed(e.kind(), e.to_string()));
                    }
                }
            }
            state.resolve(&self.resolver, Some(&scope));
        }

        self.load_in_waves(&targets).await;

        let state = self.state.read().await;
        Ok(targets
            .into_iter()
            .map(|id| {
                let status = state.statuses.get(&id).cloned().unwrap_or(ModStatus::Unloaded);
                (id, status)
            })
            .collect())
    }

    pub async fn status(&self, mod_id: &str) -> Option<ModStatus> {
        self.state.read().await.statuses.get(mod_id).cloned()
    }

    pub async fn statuses(&self) -> BTreeMap<String, ModStatus> {
        self.state.read().await.statuses.clone()
    }

    /// Active mods in load order.
    pub async fn active_mods(&self) -> Vec<String> {
        let state = self.state.read().await;
        state.sorted(state.instances.keys().cloned())
    }

    pub async fn instance(&self, mod_id: &str) -> Option<Arc<ModInstance>> {
        self.state.read().await.instances.get(mod_id).cloned()
    }

    /// Roots passed to the last [`ModLoader::load_all`].
    pub async fn roots(&self) -> Vec<PathBuf> {
        self.state.read().await.roots.clone()
    }

    /// The mod whose directory is `dir`.
    pub async fn mod_at(&self, dir: &Path) -> Option<String> {
        let dir = dir.canonicalize().ok()?;
        let state = self.state.read().await;
        state
            .known
            .values()
            .find(|m| m.path.canonicalize().is_ok_and(|p| p == dir))
            .map(|m| m.id().to_string())
    }
}
