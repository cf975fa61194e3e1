//! Integration tests for the kiln-runtime pipeline.
//!
//! These tests cover:
//! - Mod discovery from directories
//! - Dependency resolution over discovered manifests
//! - Validation, compilation and sandboxed execution of mod scripts
//! - Artifact persistence across compiler instances

use kiln_runtime::capability::EntityId;
use kiln_runtime::discovery::discover_in_roots;
use kiln_runtime::error::ErrorKind;
use kiln_runtime::{
    ArtifactStore, AuditLog, CompileOptions, DependencyResolver, ExecutionContext, ExecutionState,
    LogLevel, ParamValue, RuntimeError, RuntimeResult, SandboxConfig, ScriptApi, ScriptCompiler,
    ScriptSandbox, SecurityPermissions, SecurityValidator, TrustLevel, ValidationPolicy, Version,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tempfile::TempDir;

// ==============================================================================
// Test Fixture Helpers
// ==============================================================================

#[derive(Default)]
struct TestMod<'a> {
    dependencies: &'a [&'a str],
    trust_level: Option<&'a str>,
    script: Option<&'a str>,
}

/// Create a mod directory with a `mod.json` and `main.lua`.
fn create_test_mod(dir: &Path, id: &str, config: TestMod) -> PathBuf {
    let mod_dir = dir.join(id);
    std::fs::create_dir_all(&mod_dir).unwrap();

    let dependencies: Vec<serde_json::Value> = config
        .dependencies
        .iter()
        .map(|d| serde_json::json!({ "modId": d }))
        .collect();
    let manifest = serde_json::json!({
        "id": id,
        "name": format!("Test Mod {}", id),
        "version": "1.0.0",
        "apiVersion": "^1.0",
        "dependencies": dependencies,
        "trustLevel": config.trust_level.unwrap_or("trusted"),
        "entryPoint": "main.lua",
    });
    std::fs::write(
        mod_dir.join("mod.json"),
        serde_json::to_string_pretty(&manifest).unwrap(),
    )
    .unwrap();
    std::fs::write(
        mod_dir.join("main.lua"),
        config.script.unwrap_or("function init() log.info('ready') end"),
    )
    .unwrap();

    mod_dir
}

struct NullApi;

impl ScriptApi for NullApi {
    fn query_entities(&self, _component: &str) -> RuntimeResult<Vec<EntityId>> {
        Ok(vec![])
    }

    fn get_component(&self, _entity: EntityId, _component: &str) -> RuntimeResult<Option<ParamValue>> {
        Ok(None)
    }

    fn publish_event(&self, _name: &str, _payload: ParamValue) -> RuntimeResult<()> {
        Ok(())
    }

    fn log(&self, _level: LogLevel, _message: &str) {}

    fn shared_get(&self, _key: &str) -> RuntimeResult<Option<ParamValue>> {
        Ok(None)
    }

    fn shared_set(&self, _key: &str, _value: ParamValue) -> RuntimeResult<()> {
        Ok(())
    }

    fn shared_compare_and_swap(&self, _key: &str, _expected: Option<ParamValue>, _new: ParamValue) -> RuntimeResult<bool> {
        Ok(false)
    }

    fn register_hook(&self, _hook: &str, _handler: &str) -> RuntimeResult<()> {
        Ok(())
    }

    fn lookup_data(&self, _table: &str, _key: &str) -> RuntimeResult<Option<ParamValue>> {
        Ok(None)
    }
}

fn context(trust: TrustLevel) -> ExecutionContext {
    ExecutionContext::new("test", SecurityPermissions::for_trust(trust), Arc::new(NullApi))
}

// ==============================================================================
// Resolution
// ==============================================================================

#[test]
fn test_discovered_chain_resolves_dependencies_first() {
    let temp = TempDir::new().unwrap();
    create_test_mod(temp.path(), "A", TestMod { dependencies: &["B"], ..Default::default() });
    create_test_mod(temp.path(), "B", TestMod { dependencies: &["C"], ..Default::default() });
    create_test_mod(temp.path(), "C", TestMod::default());

    let discovery = discover_in_roots(&[temp.path().to_path_buf()]);
    assert_eq!(discovery.mods.len(), 3);

    let manifests: Vec<_> = discovery.mods.iter().map(|m| m.manifest.clone()).collect();
    let resolution = DependencyResolver::new(Version::new(1, 0, 0)).resolve(&manifests);
    assert!(resolution.is_clean());
    assert_eq!(resolution.order, vec!["C", "B", "A"]);
}

#[test]
fn test_cycle_reported_and_independent_mods_resolve() {
    let temp = TempDir::new().unwrap();
    create_test_mod(temp.path(), "A", TestMod { dependencies: &["B"], ..Default::default() });
    create_test_mod(temp.path(), "B", TestMod { dependencies: &["A"], ..Default::default() });
    create_test_mod(temp.path(), "solo", TestMod::default());

    let discovery = discover_in_roots(&[temp.path().to_path_buf()]);
    let manifests: Vec<_> = discovery.mods.iter().map(|m| m.manifest.clone()).collect();
    let resolution = DependencyResolver::new(Version::new(1, 0, 0)).resolve(&manifests);

    assert_eq!(resolution.order, vec!["solo"]);
    let cycle = resolution
        .errors()
        .find(|i| i.kind == Some(ErrorKind::DependencyCyclic))
        .unwrap();
    assert_eq!(cycle.related, vec!["A", "B"]);
    assert!(cycle.message.contains("A -> B -> A"));
}

// ==============================================================================
// Validate -> compile -> execute
// ==============================================================================

#[test]
fn test_denied_namespace_never_reaches_compiler() {
    let validator = SecurityValidator::new(ValidationPolicy::default()).unwrap();
    let compiler = ScriptCompiler::new();
    let permissions = SecurityPermissions::for_trust(TrustLevel::Untrusted);
    let source = "function init() shared.set('score', 1) end";

    let report = validator.validate("m/main.lua", source, &permissions);
    assert!(report.is_rejected());
    assert!(report.has_code("category-denied"));
    assert!(matches!(
        report.into_result(),
        Err(RuntimeError::ValidationRejected { .. })
    ));
    assert_eq!(compiler.stats().compilations, 0);
}

#[test]
fn test_pipeline_runs_entry_point() {
    let validator = SecurityValidator::new(ValidationPolicy::default()).unwrap();
    let compiler = ScriptCompiler::new();
    let sandbox = ScriptSandbox::default();
    let permissions = SecurityPermissions::for_trust(TrustLevel::Safe);
    let source = "local function square(x) return x * x end\nfunction sum_squares(a, b) return square(a) + square(b) end";

    let report = validator.validate("m/main.lua", source, &permissions);
    assert!(!report.is_rejected(), "{}", report.summary());

    let options = CompileOptions::new(permissions.clone());
    let compiled = compiler.compile("m/main.lua", source, &options).unwrap();
    assert!(compiled.has_entry_point("sum_squares"));
    assert!(Arc::ptr_eq(
        &compiled,
        &compiler.compile("m/main.lua", source, &options).unwrap()
    ));

    let result = sandbox.execute(
        &compiled,
        context(TrustLevel::Safe).with_entry("sum_squares", vec![ParamValue::Int(3), ParamValue::Int(4)]),
        Duration::from_secs(1),
    );
    assert_eq!(result.into_result().unwrap(), ParamValue::Int(25));
}

#[test]
fn test_spinning_script_times_out_and_host_stays_responsive() {
    let audit = Arc::new(AuditLog::new());
    let compiler = ScriptCompiler::new();
    let sandbox = ScriptSandbox::new(SandboxConfig::default()).with_audit(audit.clone());
    let options = CompileOptions::new(SecurityPermissions::for_trust(TrustLevel::Trusted));

    let spin = compiler.compile("m/spin.lua", "while true do end", &options).unwrap();
    let started = Instant::now();
    let result = sandbox.execute(&spin, context(TrustLevel::Trusted), Duration::from_millis(200));
    let elapsed = started.elapsed();

    assert_eq!(result.state, ExecutionState::TimedOut);
    assert!(elapsed >= Duration::from_millis(200));
    assert!(elapsed < Duration::from_millis(1000), "took {:?}", elapsed);
    assert_eq!(audit.records()[0].kind, ErrorKind::ExecutionTimedOut);

    let next = compiler.compile("m/next.lua", "return 40 + 2", &options).unwrap();
    let result = sandbox.execute(&next, context(TrustLevel::Trusted), Duration::from_millis(200));
    assert_eq!(result.state, ExecutionState::Completed);
    assert_eq!(result.value, ParamValue::Int(42));
}

#[test]
fn test_untrusted_timeout_never_exceeds_permissions() {
    let compiler = ScriptCompiler::new();
    let sandbox = ScriptSandbox::default();
    let permissions = SecurityPermissions::for_trust(TrustLevel::Untrusted);
    let compiled = compiler
        .compile("m/spin.lua", "while true do end", &CompileOptions::new(permissions))
        .unwrap();

    let result = sandbox.execute(&compiled, context(TrustLevel::Untrusted), Duration::from_secs(30));
    assert_eq!(result.state, ExecutionState::TimedOut);
    assert!(result.elapsed < Duration::from_secs(2));
}

// ==============================================================================
// Artifacts
// ==============================================================================

#[test]
fn test_artifacts_survive_compiler_restart() {
    let temp = TempDir::new().unwrap();
    let store = ArtifactStore::new(temp.path().join("cache"));
    let options = CompileOptions::new(SecurityPermissions::for_trust(TrustLevel::Trusted));
    let source = "function init() log.info('hi') end";

    let first = ScriptCompiler::new().with_store(store.clone());
    first.compile("m/main.lua", source, &options).unwrap();

    let second = ScriptCompiler::new().with_store(store.clone());
    let imported = second.compile("m/main.lua", source, &options).unwrap();
    assert_eq!(second.stats().compilations, 0);
    assert_eq!(imported.entry_points, vec!["init"]);

    assert_eq!(second.invalidate("m/main.lua"), 1);
    assert!(store.load("m/main.lua", &imported.content_hash).unwrap().is_none());
}
