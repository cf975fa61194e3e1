//! Sandboxed script execution.
//!
//! Every execution gets its own OS thread and a fresh Lua state with only the
//! `string`, `table`, `math` and `utf8` libraries. The script reaches the host
//! exclusively through the capability tables bound for its permitted
//! categories.
//!
//! Enforcement has two layers:
//!
//! - A VM hook inside the worker fires every `memory_poll_instructions`
//!   instructions. It honors the cancellation flag and the deadline, samples
//!   memory against the ceiling, and tracks call depth on call/return events.
//! - A watchdog on the calling thread raises the cancellation flag at the
//!   deadline. If the worker has not finished one grace period later (for
//!   example because it is blocked inside a native call where the hook cannot
//!   run), the watchdog abandons it and returns `TimedOut` regardless.
//!   Abandoned workers are counted until they exit; once
//!   `max_abandoned_workers` are outstanding, new executions are refused.
//!
//! Capability calls re-check cancellation before and after entering the host,
//! so a cancelled or abandoned worker cannot reach the host again. Values
//! leaving the state (arguments and return values) are converted under a byte
//! budget equal to the memory ceiling not yet used by the state.
//!
//! `execute` never returns an error: every failure becomes a classified
//! [`ExecutionResult`].

use crate::audit::{AuditLog, AuditRecord};
use crate::capability::{ApiCategory, LogLevel, ScriptApi, SecurityPermissions};
use crate::compiler::CompiledScript;
use crate::diagnostic::Severity;
use crate::error::{ErrorKind, RuntimeError, RuntimeResult};
use crate::params::{ParamValue, ValueLimits};
use mlua::{
    ChunkMode, DebugEvent, FromLua, FromLuaMulti, Function, HookTriggers, IntoLuaMulti, Lua,
    LuaOptions,
    MultiValue, StdLib, Table, Value, Variadic, VmState,
};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Globals removed from the base library before any script runs.
const REMOVED_GLOBALS: &[&str] = &[
    "load",
    "loadfile",
    "dofile",
    "collectgarbage",
    "rawset",
    "rawget",
    "warn",
    "_G",
];

/// Sandbox tuning shared by all executions.
#[derive(Debug, Clone)]
pub struct SandboxConfig {
    /// How long the watchdog waits after cancelling before abandoning.
    pub grace_period: Duration,

    /// VM instructions between hook checks.
    pub memory_poll_instructions: u32,

    /// Stack size of execution worker threads.
    pub stack_size: usize,

    /// Watchdog polling interval.
    pub watchdog_poll: Duration,

    /// Abandoned workers allowed to be outstanding at once.
    pub max_abandoned_workers: usize,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            grace_period: Duration::from_millis(100),
            memory_poll_instructions: 1000,
            stack_size: 8 * 1024 * 1024,
            watchdog_poll: Duration::from_millis(5),
            max_abandoned_workers: 8,
        }
    }
}

/// Lifecycle of one execution. Everything after `Running` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionState {
    Pending,
    Running,
    Completed,
    TimedOut,
    MemoryExceeded,
    SecurityViolation,
    Faulted,
}

impl ExecutionState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ExecutionState::Pending | ExecutionState::Running)
    }

    /// Error kind of a failed terminal state.
    pub fn error_kind(&self) -> Option<ErrorKind> {
        match self {
            ExecutionState::TimedOut => Some(ErrorKind::ExecutionTimedOut),
            ExecutionState::MemoryExceeded => Some(ErrorKind::ExecutionMemoryExceeded),
            ExecutionState::SecurityViolation => Some(ErrorKind::ExecutionSecurityViolation),
            ExecutionState::Faulted => Some(ErrorKind::ExecutionFaulted),
            _ => None,
        }
    }
}

impl fmt::Display for ExecutionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ExecutionState::Pending => "pending",
            ExecutionState::Running => "running",
            ExecutionState::Completed => "completed",
            ExecutionState::TimedOut => "timed_out",
            ExecutionState::MemoryExceeded => "memory_exceeded",
            ExecutionState::SecurityViolation => "security_violation",
            ExecutionState::Faulted => "faulted",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SandboxEventKind {
    CancelRequested,
    WatchdogTerminated,
    MemoryExceeded,
    CallDepthExceeded,
    CapabilityDenied,
    WorkerPanicked,
    WorkerLimitReached,
}

impl fmt::Display for SandboxEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SandboxEventKind::CancelRequested => "cancel-requested",
            SandboxEventKind::WatchdogTerminated => "watchdog-terminated",
            SandboxEventKind::MemoryExceeded => "memory-exceeded",
            SandboxEventKind::CallDepthExceeded => "call-depth-exceeded",
            SandboxEventKind::CapabilityDenied => "capability-denied",
            SandboxEventKind::WorkerPanicked => "worker-panicked",
            SandboxEventKind::WorkerLimitReached => "worker-limit-reached",
        })
    }
}

/// Security or diagnostic event observed during an execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SandboxEvent {
    pub kind: SandboxEventKind,
    pub detail: String,
    /// Milliseconds since the execution started.
    pub at_ms: u64,
}

/// Per-invocation scope: who runs, with which permissions, against which API.
#[derive(Clone)]
pub struct ExecutionContext {
    pub mod_id: String,
    pub permissions: SecurityPermissions,
    pub api: Arc<dyn ScriptApi>,
    /// Global function to call after the chunks ran.
    pub entry: Option<String>,
    pub args: Vec<ParamValue>,
    /// Further chunks run after the main one, in order.
    pub modules: Vec<Arc<CompiledScript>>,
}

impl ExecutionContext {
    pub fn new(
        mod_id: impl Into<String>,
        permissions: SecurityPermissions,
        api: Arc<dyn ScriptApi>,
    ) -> Self {
        Self {
            mod_id: mod_id.into(),
            permissions,
            api,
            entry: None,
            args: Vec::new(),
            modules: Vec::new(),
        }
    }

    pub fn with_entry(mut self, entry: impl Into<String>, args: Vec<ParamValue>) -> Self {
        self.entry = Some(entry.into());
        self.args = args;
        self
    }

    pub fn with_modules(mut self, modules: Vec<Arc<CompiledScript>>) -> Self {
        self.modules = modules;
        self
    }
}

impl fmt::Debug for ExecutionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutionContext")
            .field("mod_id", &self.mod_id)
            .field("permissions", &self.permissions)
            .field("entry", &self.entry)
            .field("args", &self.args)
            .field("modules", &self.modules.len())
            .finish()
    }
}

/// Complete outcome of one execution.
#[derive(Debug, Clone)]
pub struct ExecutionResult {
    pub mod_id: String,
    pub script_id: String,
    pub state: ExecutionState,
    /// Return value; `Null` unless completed.
    pub value: ParamValue,
    /// Failure message for non-completed states.
    pub error: Option<String>,
    pub elapsed: Duration,
    /// Live memory above the baseline when the execution ended.
    pub memory_delta: usize,
    /// Highest sampled memory above the baseline.
    pub peak_memory: usize,
    /// Memory allocated and released again (`peak - final`).
    pub gc_churn: usize,
    pub instructions: u64,
    pub events: Vec<SandboxEvent>,
}

impl ExecutionResult {
    pub fn is_success(&self) -> bool {
        self.state == ExecutionState::Completed
    }

    pub fn has_event(&self, kind: SandboxEventKind) -> bool {
        self.events.iter().any(|e| e.kind == kind)
    }

    /// The return value, or the classified failure.
    pub fn into_result(self) -> RuntimeResult<ParamValue> {
        let message = self.error.unwrap_or_default();
        match self.state {
            ExecutionState::Completed => Ok(self.value),
            ExecutionState::TimedOut => Err(RuntimeError::ExecutionTimedOut(self.script_id)),
            ExecutionState::MemoryExceeded => {
                Err(RuntimeError::ExecutionMemoryExceeded(self.script_id))
            }
            ExecutionState::SecurityViolation => {
                Err(RuntimeError::ExecutionSecurityViolation(message))
            }
            ExecutionState::Faulted | ExecutionState::Pending | ExecutionState::Running => Err(
                RuntimeError::ExecutionFaulted(format!("{}: {}", self.script_id, message)),
            ),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
enum Abort {
    Cancelled = 1,
    Deadline = 2,
    Memory = 3,
    Security = 4,
    CallDepth = 5,
}

impl Abort {
    fn from_u8(v: u8) -> Option<Self> {
        match v {
            1 => Some(Abort::Cancelled),
            2 => Some(Abort::Deadline),
            3 => Some(Abort::Memory),
            4 => Some(Abort::Security),
            5 => Some(Abort::CallDepth),
            _ => None,
        }
    }
}

const WORKER_RUNNING: u8 = 0;
const WORKER_DONE: u8 = 1;
const WORKER_ABANDONED: u8 = 2;

/// State shared between the worker, its hook and callbacks, and the watchdog.
#[derive(Debug)]
struct Meter {
    started: Instant,
    cancel: Arc<AtomicBool>,
    worker: AtomicU8,
    abort: AtomicU8,
    detail: Mutex<Option<String>>,
    depth: AtomicU32,
    instructions: AtomicU64,
    peak: AtomicUsize,
    events: Mutex<Vec<SandboxEvent>>,
}

impl Meter {
    fn new(started: Instant) -> Self {
        Self {
            started,
            cancel: Arc::new(AtomicBool::new(false)),
            worker: AtomicU8::new(WORKER_RUNNING),
            abort: AtomicU8::new(0),
            detail: Mutex::new(None),
            depth: AtomicU32::new(0),
            instructions: AtomicU64::new(0),
            peak: AtomicUsize::new(0),
            events: Mutex::new(Vec::new()),
        }
    }

    fn event(&self, kind: SandboxEventKind, detail: impl Into<String>) {
        let event = SandboxEvent {
            kind,
            detail: detail.into(),
            at_ms: self.started.elapsed().as_millis() as u64,
        };
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(event);
    }

    fn events(&self) -> Vec<SandboxEvent> {
        self.events.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn aborted(&self) -> Option<Abort> {
        Abort::from_u8(self.abort.load(Ordering::SeqCst))
    }

    fn detail(&self) -> String {
        self.detail
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
            .unwrap_or_default()
    }

    /// Record the first abort reason and build the error that unwinds the
    /// script. Later aborts keep the first reason.
    fn abort(&self, reason: Abort, detail: String) -> mlua::Error {
        let first = self
            .abort
            .compare_exchange(0, reason as u8, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok();
        if first {
            *self.detail.lock().unwrap_or_else(|e| e.into_inner()) = Some(detail.clone());
        }
        mlua::Error::RuntimeError(format!("execution aborted: {}", detail))
    }

    /// Error raised while an abort is pending.
    fn pending(&self) -> Option<mlua::Error> {
        self.aborted()
            .map(|_| mlua::Error::RuntimeError(format!("execution aborted: {}", self.detail())))
    }

    /// Error for a cancelled execution or a pending abort. Checked before
    /// and after every host call.
    fn halted(&self) -> Option<mlua::Error> {
        if self.cancel.load(Ordering::SeqCst) {
            return Some(self.abort(Abort::Cancelled, "execution was cancelled".into()));
        }
        self.pending()
    }

    /// Turn a conversion that ran out of budget into a memory abort.
    fn conversion_error(&self, e: mlua::Error) -> mlua::Error {
        match root_cause(&e) {
            mlua::Error::MemoryError(detail) => {
                let detail = detail.clone();
                self.event(SandboxEventKind::MemoryExceeded, detail.clone());
                self.abort(Abort::Memory, detail)
            }
            _ => e,
        }
    }

    fn violation(&self, detail: String) -> mlua::Error {
        self.event(SandboxEventKind::CapabilityDenied, detail.clone());
        self.abort(Abort::Security, detail)
    }

    fn api_error(&self, e: RuntimeError) -> mlua::Error {
        if e.kind() == ErrorKind::ExecutionSecurityViolation {
            self.violation(e.to_string())
        } else {
            mlua::Error::RuntimeError(e.to_string())
        }
    }
}

#[derive(Debug, Clone)]
struct Limits {
    deadline: Instant,
    memory_ceiling: usize,
    max_depth: u32,
    poll: u32,
}

struct WorkerOutcome {
    outcome: mlua::Result<ParamValue>,
    memory_delta: usize,
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

fn root_cause(e: &mlua::Error) -> &mlua::Error {
    match e {
        mlua::Error::CallbackError { cause, .. } => root_cause(cause),
        other => other,
    }
}

/// Text of a Lua value as `print` shows it, without running metamethods.
fn display_value(value: &Value) -> String {
    match value {
        Value::Nil => "nil".to_string(),
        Value::Boolean(b) => b.to_string(),
        Value::Integer(i) => i.to_string(),
        Value::Number(n) => n.to_string(),
        Value::String(s) => s.to_string_lossy().to_string(),
        other => other.type_name().to_string(),
    }
}

/// Builds capability functions that re-check cancellation and their category
/// on every call.
struct Binder<'a> {
    lua: &'a Lua,
    api: Arc<dyn ScriptApi>,
    permissions: Arc<SecurityPermissions>,
    meter: Arc<Meter>,
}

impl Binder<'_> {
    fn function<A, R, F>(
        &self,
        category: ApiCategory,
        name: &'static str,
        f: F,
    ) -> mlua::Result<Function>
    where
        A: FromLuaMulti,
        R: IntoLuaMulti,
        F: Fn(&dyn ScriptApi, A) -> RuntimeResult<R> + Send + 'static,
    {
        let api = self.api.clone();
        let permissions = self.permissions.clone();
        let meter = self.meter.clone();
        self.lua.create_function(move |lua, args: MultiValue| {
            if let Some(e) = meter.halted() {
                return Err(e);
            }
            if !permissions.permits(category) {
                return Err(meter.violation(format!(
                    "'{}' requires the '{}' capability",
                    name, category
                )));
            }
            let args = A::from_lua_multi(args, lua).map_err(|e| meter.conversion_error(e))?;
            let result = f(api.as_ref(), args).map_err(|e| meter.api_error(e))?;
            // The call may have blocked past the deadline.
            if let Some(e) = meter.halted() {
                return Err(e);
            }
            Ok(result)
        })
    }

    fn table(&self, category: ApiCategory) -> mlua::Result<Table> {
        let table = self.lua.create_table()?;
        match category {
            ApiCategory::Entities => {
                table.set(
                    "query",
                    self.function(category, "entities.query", |api, component: String| {
                        api.query_entities(&component)
                    })?,
                )?;
                table.set(
                    "get",
                    self.function(
                        category,
                        "entities.get",
                        |api, (entity, component): (u64, String)| {
                            api.get_component(entity, &component)
                        },
                    )?,
                )?;
            }
            ApiCategory::Events => {
                table.set(
                    "publish",
                    self.function(
                        category,
                        "events.publish",
                        |api, (name, payload): (String, ParamValue)| {
                            api.publish_event(&name, payload)
                        },
                    )?,
                )?;
            }
            ApiCategory::Logging => {
                for (name, level) in [
                    ("trace", LogLevel::Trace),
                    ("debug", LogLevel::Debug),
                    ("info", LogLevel::Info),
                    ("warn", LogLevel::Warn),
                    ("error", LogLevel::Error),
                ] {
                    table.set(
                        name,
                        self.function(category, "log", move |api, message: String| {
                            api.log(level, &message);
                            Ok(())
                        })?,
                    )?;
                }
            }
            ApiCategory::SharedData => {
                table.set(
                    "get",
                    self.function(category, "shared.get", |api, key: String| {
                        api.shared_get(&key)
                    })?,
                )?;
                table.set(
                    "set",
                    self.function(
                        category,
                        "shared.set",
                        |api, (key, value): (String, ParamValue)| api.shared_set(&key, value),
                    )?,
                )?;
                table.set(
                    "compare_and_swap",
                    self.function(
                        category,
                        "shared.compare_and_swap",
                        |api, (key, expected, new): (String, ParamValue, ParamValue)| {
                            let expected = (!expected.is_null()).then_some(expected);
                            api.shared_compare_and_swap(&key, expected, new)
                        },
                    )?,
                )?;
            }
            ApiCategory::Hooks => {
                table.set(
                    "register",
                    self.function(
                        category,
                        "hooks.register",
                        |api, (hook, handler): (String, String)| api.register_hook(&hook, &handler),
                    )?,
                )?;
            }
            ApiCategory::GameData => {
                table.set(
                    "get",
                    self.function(
                        category,
                        "data.get",
                        |api, (table, key): (String, String)| api.lookup_data(&table, &key),
                    )?,
                )?;
            }
        }
        Ok(table)
    }

    fn print(&self) -> mlua::Result<Function> {
        self.function(ApiCategory::Logging, "print", |api, args: Variadic<Value>| {
            let line: Vec<String> = args.iter().map(display_value).collect();
            api.log(LogLevel::Info, &line.join("\t"));
            Ok(())
        })
    }
}

/// Runs compiled scripts under resource limits.
#[derive(Debug, Default)]
pub struct ScriptSandbox {
    config: SandboxConfig,
    audit: Option<Arc<AuditLog>>,
    abandoned: AtomicU64,
    stranded: Arc<AtomicUsize>,
}

impl ScriptSandbox {
    pub fn new(config: SandboxConfig) -> Self {
        Self {
            config,
            audit: None,
            abandoned: AtomicU64::new(0),
            stranded: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Record violations in an audit log.
    pub fn with_audit(mut self, audit: Arc<AuditLog>) -> Self {
        self.audit = Some(audit);
        self
    }

    pub fn config(&self) -> &SandboxConfig {
        &self.config
    }

    /// Workers the watchdog gave up on. They finish in the background once
    /// their blocking call returns and the hook sees the cancellation.
    pub fn abandoned_workers(&self) -> u64 {
        self.abandoned.load(Ordering::Relaxed)
    }

    /// Abandoned workers that have not exited yet.
    pub fn stranded_workers(&self) -> usize {
        self.stranded.load(Ordering::SeqCst)
    }

    /// Run `compiled` (then the context's modules and entry function).
    ///
    /// The effective time budget is the smaller of `timeout` and the
    /// permissions' limit. Blocks the caller for at most the budget plus
    /// the grace period.
    pub fn execute(
        &self,
        compiled: &Arc<CompiledScript>,
        context: ExecutionContext,
        timeout: Duration,
    ) -> ExecutionResult {
        let timeout = timeout.min(context.permissions.max_execution_time);
        let started = Instant::now();
        let meter = Arc::new(Meter::new(started));
        let limits = Limits {
            deadline: started + timeout,
            memory_ceiling: context.permissions.max_memory_bytes,
            max_depth: context.permissions.max_call_depth,
            poll: self.config.memory_poll_instructions.max(1),
        };
        let mod_id = context.mod_id.clone();
        let script_id = compiled.source_id.clone();

        debug!(
            mod_id = %mod_id,
            script = %script_id,
            timeout_ms = timeout.as_millis() as u64,
            "Execution running"
        );

        let stranded = self.stranded.load(Ordering::SeqCst);
        if stranded >= self.config.max_abandoned_workers {
            let detail = format!(
                "{} abandoned workers are still running; refusing to start another",
                stranded
            );
            meter.event(SandboxEventKind::WorkerLimitReached, detail.clone());
            return self.finish(
                &mod_id,
                &script_id,
                &meter,
                ExecutionState::Faulted,
                ParamValue::Null,
                Some(detail),
                0,
            );
        }

        let (tx, rx) = mpsc::channel();
        let spawned = {
            let compiled = compiled.clone();
            let meter = meter.clone();
            let limits = limits.clone();
            let stranded = self.stranded.clone();
            std::thread::Builder::new()
                .name(format!("kiln-exec-{}", script_id))
                .stack_size(self.config.stack_size)
                .spawn(move || {
                    let outcome = catch_unwind(AssertUnwindSafe(|| {
                        Self::run_worker(&compiled, &context, &meter, &limits)
                    }));
                    let _ = tx.send(outcome.map_err(panic_message));
                    let finished = meter.worker.compare_exchange(
                        WORKER_RUNNING,
                        WORKER_DONE,
                        Ordering::SeqCst,
                        Ordering::SeqCst,
                    );
                    if finished.is_err() {
                        stranded.fetch_sub(1, Ordering::SeqCst);
                    }
                })
        };
        if let Err(e) = spawned {
            return self.finish(
                &mod_id,
                &script_id,
                &meter,
                ExecutionState::Faulted,
                ParamValue::Null,
                Some(format!("failed to start execution worker: {}", e)),
                0,
            );
        }

        let grace_deadline = limits.deadline + self.config.grace_period;
        let mut cancelled = false;
        let received = loop {
            let now = Instant::now();
            if !cancelled && now >= limits.deadline {
                meter.cancel.store(true, Ordering::SeqCst);
                meter.event(
                    SandboxEventKind::CancelRequested,
                    format!("deadline of {} ms reached", timeout.as_millis()),
                );
                cancelled = true;
            }
            if now >= grace_deadline {
                break None;
            }
            let next = if cancelled { grace_deadline } else { limits.deadline };
            let wait = next
                .saturating_duration_since(now)
                .min(self.config.watchdog_poll)
                .max(Duration::from_millis(1));
            match rx.recv_timeout(wait) {
                Ok(outcome) => break Some(outcome),
                Err(mpsc::RecvTimeoutError::Timeout) => continue,
                Err(mpsc::RecvTimeoutError::Disconnected) => {
                    break Some(Err("worker exited without a result".to_string()))
                }
            }
        };

        match received {
            None => {
                self.abandoned.fetch_add(1, Ordering::Relaxed);
                self.stranded.fetch_add(1, Ordering::SeqCst);
                let abandoned = meter.worker.compare_exchange(
                    WORKER_RUNNING,
                    WORKER_ABANDONED,
                    Ordering::SeqCst,
                    Ordering::SeqCst,
                );
                if abandoned.is_err() {
                    // Finished between the last poll and now.
                    self.stranded.fetch_sub(1, Ordering::SeqCst);
                }
                meter.event(
                    SandboxEventKind::WatchdogTerminated,
                    format!(
                        "worker ignored cancellation for {} ms and was abandoned",
                        self.config.grace_period.as_millis()
                    ),
                );
                let peak = meter.peak.load(Ordering::Relaxed);
                self.finish(
                    &mod_id,
                    &script_id,
                    &meter,
                    ExecutionState::TimedOut,
                    ParamValue::Null,
                    Some(format!(
                        "execution exceeded {} ms and was terminated by the watchdog",
                        timeout.as_millis()
                    )),
                    peak,
                )
            }
            Some(Err(panic)) => {
                meter.event(SandboxEventKind::WorkerPanicked, panic.clone());
                self.finish(
                    &mod_id,
                    &script_id,
                    &meter,
                    ExecutionState::Faulted,
                    ParamValue::Null,
                    Some(format!("worker panicked: {}", panic)),
                    0,
                )
            }
            Some(Ok(worker)) => {
                let (state, value, error) = match (worker.outcome, meter.aborted()) {
                    (Ok(value), None) => (ExecutionState::Completed, value, None),
                    (Ok(_), Some(reason)) => {
                        let (state, message) = Self::classify_abort(reason, &meter);
                        (state, ParamValue::Null, Some(message))
                    }
                    (Err(e), Some(reason)) => {
                        let (state, message) = Self::classify_abort(reason, &meter);
                        debug!(script = %script_id, "Aborted script error: {}", e);
                        (state, ParamValue::Null, Some(message))
                    }
                    (Err(e), None) => match root_cause(&e) {
                        mlua::Error::MemoryError(message) => (
                            ExecutionState::MemoryExceeded,
                            ParamValue::Null,
                            Some(format!("allocation refused: {}", message)),
                        ),
                        other => (ExecutionState::Faulted, ParamValue::Null, Some(other.to_string())),
                    },
                };
                self.finish(
                    &mod_id,
                    &script_id,
                    &meter,
                    state,
                    value,
                    error,
                    worker.memory_delta,
                )
            }
        }
    }

    fn classify_abort(reason: Abort, meter: &Meter) -> (ExecutionState, String) {
        let detail = meter.detail();
        let state = match reason {
            Abort::Cancelled | Abort::Deadline => ExecutionState::TimedOut,
            Abort::Memory => ExecutionState::MemoryExceeded,
            Abort::Security => ExecutionState::SecurityViolation,
            Abort::CallDepth => ExecutionState::Faulted,
        };
        (state, detail)
    }

    #[allow(clippy::too_many_arguments)]
    fn finish(
        &self,
        mod_id: &str,
        script_id: &str,
        meter: &Meter,
        state: ExecutionState,
        value: ParamValue,
        error: Option<String>,
        memory_delta: usize,
    ) -> ExecutionResult {
        let peak_memory = meter.peak.load(Ordering::Relaxed).max(memory_delta);
        let result = ExecutionResult {
            mod_id: mod_id.to_string(),
            script_id: script_id.to_string(),
            state,
            value,
            error,
            elapsed: meter.started.elapsed(),
            memory_delta,
            peak_memory,
            gc_churn: peak_memory.saturating_sub(memory_delta),
            instructions: meter.instructions.load(Ordering::Relaxed),
            events: meter.events(),
        };

        match state {
            ExecutionState::Completed => debug!(
                mod_id,
                script = script_id,
                elapsed_ms = result.elapsed.as_millis() as u64,
                "Execution completed"
            ),
            _ => warn!(
                mod_id,
                script = script_id,
                state = %state,
                "Execution failed: {}",
                result.error.as_deref().unwrap_or("")
            ),
        }

        let audited = matches!(
            state,
            ExecutionState::TimedOut
                | ExecutionState::MemoryExceeded
                | ExecutionState::SecurityViolation
        );
        if let (true, Some(audit), Some(kind)) = (audited, &self.audit, state.error_kind()) {
            audit.record(AuditRecord::new(
                mod_id,
                script_id,
                kind,
                Severity::Error,
                result.error.clone().unwrap_or_default(),
            ));
        }

        result
    }

    fn run_worker(
        compiled: &CompiledScript,
        context: &ExecutionContext,
        meter: &Arc<Meter>,
        limits: &Limits,
    ) -> WorkerOutcome {
        let lua = match Lua::new_with(
            StdLib::STRING | StdLib::TABLE | StdLib::MATH | StdLib::UTF8,
            LuaOptions::default(),
        ) {
            Ok(lua) => lua,
            Err(e) => {
                return WorkerOutcome {
                    outcome: Err(e),
                    memory_delta: 0,
                }
            }
        };

        if let Err(e) = Self::prepare(&lua, context, meter) {
            return WorkerOutcome {
                outcome: Err(e),
                memory_delta: 0,
            };
        }
        let baseline = lua.used_memory();
        lua.set_app_data(ValueLimits {
            ceiling: limits.memory_ceiling,
            baseline,
            cancel: Some(meter.cancel.clone()),
        });

        let outcome = Self::arm(&lua, meter, limits, baseline)
            .and_then(|_| Self::run_chunks(&lua, compiled, context, meter));
        lua.remove_hook();

        let memory_delta = lua.used_memory().saturating_sub(baseline);
        meter.peak.fetch_max(memory_delta, Ordering::Relaxed);
        WorkerOutcome {
            outcome,
            memory_delta,
        }
    }

    /// Strip the base library and bind the capability surface.
    fn prepare(lua: &Lua, context: &ExecutionContext, meter: &Arc<Meter>) -> mlua::Result<()> {
        let globals = lua.globals();
        for name in REMOVED_GLOBALS {
            globals.raw_set(*name, Value::Nil)?;
        }
        let string: Table = globals.get("string")?;
        string.raw_set("dump", Value::Nil)?;

        Self::guard_protected_calls(lua, &globals, meter)?;

        let binder = Binder {
            lua,
            api: context.api.clone(),
            permissions: Arc::new(context.permissions.clone()),
            meter: meter.clone(),
        };
        globals.raw_set("print", binder.print()?)?;
        for category in ApiCategory::ALL {
            if context.permissions.permits(category) {
                globals.raw_set(category.namespace(), binder.table(category)?)?;
            }
        }
        Ok(())
    }

    /// Wrap `pcall`/`xpcall` so an abort cannot be swallowed by the script,
    /// and so call-depth accounting survives errors unwinding past frames
    /// without return events.
    fn guard_protected_calls(lua: &Lua, globals: &Table, meter: &Arc<Meter>) -> mlua::Result<()> {
        for name in ["pcall", "xpcall"] {
            let original: Function = globals.get(name)?;
            let meter = meter.clone();
            let guarded = lua.create_function(move |_, args: MultiValue| {
                let depth = meter.depth.load(Ordering::SeqCst);
                let results = original.call::<MultiValue>(args);
                meter.depth.store(depth, Ordering::SeqCst);
                if let Some(e) = meter.pending() {
                    return Err(e);
                }
                results
            })?;
            globals.raw_set(name, guarded)?;
        }
        Ok(())
    }

    fn arm(lua: &Lua, meter: &Arc<Meter>, limits: &Limits, baseline: usize) -> mlua::Result<()> {
        let ceiling = limits.memory_ceiling;
        let headroom = ceiling / 8 + 64 * 1024;
        lua.set_memory_limit(baseline.saturating_add(ceiling).saturating_add(headroom))?;

        let meter = meter.clone();
        let limits = limits.clone();
        lua.set_hook(
            HookTriggers::new()
                .on_calls()
                .on_returns()
                .every_nth_instruction(limits.poll),
            move |lua, debug| {
                if let Some(e) = meter.halted() {
                    return Err(e);
                }
                match debug.event() {
                    DebugEvent::Call => {
                        let depth = meter.depth.fetch_add(1, Ordering::SeqCst) + 1;
                        if depth > limits.max_depth {
                            let detail = format!("call depth exceeded {}", limits.max_depth);
                            meter.event(SandboxEventKind::CallDepthExceeded, detail.clone());
                            return Err(meter.abort(Abort::CallDepth, detail));
                        }
                    }
                    DebugEvent::Ret => {
                        let _ = meter.depth.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |d| {
                            Some(d.saturating_sub(1))
                        });
                    }
                    DebugEvent::Count => {
                        meter
                            .instructions
                            .fetch_add(u64::from(limits.poll), Ordering::Relaxed);
                        if Instant::now() >= limits.deadline {
                            return Err(meter.abort(
                                Abort::Deadline,
                                "execution exceeded its time budget".into(),
                            ));
                        }
                        let delta = lua.used_memory().saturating_sub(baseline);
                        meter.peak.fetch_max(delta, Ordering::Relaxed);
                        if delta > limits.memory_ceiling {
                            let detail = format!(
                                "memory delta {} bytes exceeds ceiling of {} bytes",
                                delta, limits.memory_ceiling
                            );
                            meter.event(SandboxEventKind::MemoryExceeded, detail.clone());
                            return Err(meter.abort(Abort::Memory, detail));
                        }
                    }
                    _ => {}
                }
                Ok(VmState::Continue)
            },
        );
        Ok(())
    }

    fn run_chunk(lua: &Lua, script: &CompiledScript) -> mlua::Result<Value> {
        lua.load(&*script.source)
            .set_name(format!("={}", script.source_id))
            .set_mode(ChunkMode::Text)
            .call::<Value>(())
    }

    fn run_chunks(
        lua: &Lua,
        compiled: &CompiledScript,
        context: &ExecutionContext,
        meter: &Meter,
    ) -> mlua::Result<ParamValue> {
        let mut value = Self::run_chunk(lua, compiled)?;
        for module in &context.modules {
            Self::run_chunk(lua, module)?;
        }

        if let Some(entry) = &context.entry {
            let function: Option<Function> = lua.globals().get(entry.as_str())?;
            let Some(function) = function else {
                return Err(mlua::Error::RuntimeError(format!(
                    "entry point '{}' is not defined",
                    entry
                )));
            };
            value = function.call::<Value>(Variadic::from_iter(context.args.iter().cloned()))?;
        }

        ParamValue::from_lua(value, lua).map_err(|e| meter.conversion_error(e))
    }
}
