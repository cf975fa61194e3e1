//! Integration tests for kiln-mod-api.
//!
//! These tests cover:
//! - Full mod lifecycle: discover → resolve → validate → compile → init → unload
//! - Partial failure and dependency propagation
//! - Reload as a barrier for in-flight executions
//! - Hooks, events and shared data through the host API
//! - Resource limits on values crossing into the host, and quarantine after
//!   the watchdog terminates a worker

use kiln_mod_api::{LoaderConfig, ModHost, ModLoader, ModStatus, World};
use kiln_runtime::{EntityId, ErrorKind, ExecutionState, ParamValue, SandboxConfig};
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

fn loader_with(config: LoaderConfig) -> ModLoader {
    ModLoader::new(config, ModHost::new()).unwrap()
}

fn roots(temp: &TempDir) -> Vec<PathBuf> {
    vec![temp.path().to_path_buf()]
}

fn failed_kind(status: Option<ModStatus>) -> Option<ErrorKind> {
    match status {
        Some(ModStatus::Failed { kind, .. }) => Some(kind),
        _ => None,
    }
}

/// A world whose queries take a while, to hold executions open.
struct SlowWorld;

impl World for SlowWorld {
    fn entities_with(&self, _component: &str) -> Vec<EntityId> {
        std::thread::sleep(Duration::from_millis(300));
        vec![1, 2, 3]
    }

    fn component(&self, _entity: EntityId, _name: &str) -> Option<ParamValue> {
        None
    }
}

// ==============================================================================
// Loading
// ==============================================================================

#[tokio::test]
async fn test_chain_initializes_dependencies_first() {
    let temp = TempDir::new().unwrap();
    create_test_mod(temp.path(), "A", TestMod {
        dependencies: &["B"],
        script: Some("function init() if not shared.get('global:B') then error('B not ready') end end"),
        ..Default::default()
    });
    create_test_mod(temp.path(), "B", TestMod {
        dependencies: &["C"],
        script: Some(
            "function init()\n  if not shared.get('global:C') then error('C not ready') end\n  shared.set('global:B', true)\nend",
        ),
        ..Default::default()
    });
    create_test_mod(temp.path(), "C", TestMod {
        script: Some("function init() shared.set('global:C', true) end"),
        ..Default::default()
    });

    let loader = loader_with(LoaderConfig::default());
    let report = loader.load_all(&roots(&temp)).await;

    assert!(!report.has_errors(), "{:?}", report);
    assert_eq!(report.order, vec!["C", "B", "A"]);
    assert_eq!(loader.active_mods().await, vec!["C", "B", "A"]);
}

#[tokio::test]
async fn test_failure_blocks_only_dependents() {
    let temp = TempDir::new().unwrap();
    create_test_mod(temp.path(), "broken", TestMod {
        script: Some("function init() error('boom') end"),
        ..Default::default()
    });
    create_test_mod(temp.path(), "child", TestMod { dependencies: &["broken"], ..Default::default() });
    create_test_mod(temp.path(), "grandchild", TestMod { dependencies: &["child"], ..Default::default() });
    create_test_mod(temp.path(), "solo", TestMod::default());

    let loader = loader_with(LoaderConfig::default());
    let report = loader.load_all(&roots(&temp)).await;

    assert!(report.has_errors());
    match report.status("broken") {
        Some(ModStatus::Failed { kind, reason }) => {
            assert_eq!(*kind, ErrorKind::ExecutionFaulted);
            assert!(reason.contains("boom"), "{}", reason);
        }
        other => panic!("unexpected status {:?}", other),
    }
    assert_eq!(failed_kind(loader.status("child").await), Some(ErrorKind::DependencyFailed));
    assert_eq!(failed_kind(loader.status("grandchild").await), Some(ErrorKind::DependencyFailed));
    assert_eq!(loader.status("solo").await, Some(ModStatus::Active));
}

#[tokio::test]
async fn test_cycle_fails_cyclic_mods_only() {
    let temp = TempDir::new().unwrap();
    create_test_mod(temp.path(), "A", TestMod { dependencies: &["B"], ..Default::default() });
    create_test_mod(temp.path(), "B", TestMod { dependencies: &["A"], ..Default::default() });
    create_test_mod(temp.path(), "solo", TestMod::default());

    let loader = loader_with(LoaderConfig::default());
    let report = loader.load_all(&roots(&temp)).await;

    assert_eq!(failed_kind(report.status("A").cloned()), Some(ErrorKind::DependencyCyclic));
    assert_eq!(failed_kind(report.status("B").cloned()), Some(ErrorKind::DependencyCyclic));
    assert_eq!(report.ids_where(ModStatus::is_active), vec!["solo"]);
}

#[tokio::test]
async fn test_spinning_init_times_out_and_others_load() {
    let temp = TempDir::new().unwrap();
    create_test_mod(temp.path(), "spin", TestMod {
        script: Some("function init() while true do end end"),
        ..Default::default()
    });
    create_test_mod(temp.path(), "steady", TestMod::default());

    let config = LoaderConfig {
        init_timeout: Duration::from_millis(200),
        ..Default::default()
    };
    let loader = loader_with(config);

    let started = Instant::now();
    let report = loader.load_all(&roots(&temp)).await;
    assert!(started.elapsed() < Duration::from_secs(2), "took {:?}", started.elapsed());

    assert_eq!(failed_kind(report.status("spin").cloned()), Some(ErrorKind::ExecutionTimedOut));
    assert_eq!(report.status("steady"), Some(&ModStatus::Active));
    assert_eq!(loader.audit().records_for("spin")[0].kind, ErrorKind::ExecutionTimedOut);
}

#[tokio::test]
async fn test_denied_namespace_rejected_before_compile() {
    let temp = TempDir::new().unwrap();
    create_test_mod(temp.path(), "sneaky", TestMod {
        trust_level: Some("untrusted"),
        script: Some("function init() shared.set('score', 1) end"),
        ..Default::default()
    });

    let loader = loader_with(LoaderConfig::default());
    let report = loader.load_all(&roots(&temp)).await;

    assert_eq!(failed_kind(report.status("sneaky").cloned()), Some(ErrorKind::ValidationRejected));
    assert_eq!(loader.compiler().stats().compilations, 0);
    assert!(loader.compiler().latest("sneaky/main.lua").is_none());

    let audit = loader.audit().records_for("sneaky");
    assert_eq!(audit.len(), 1);
    assert_eq!(audit[0].kind, ErrorKind::ValidationRejected);
}

#[tokio::test]
async fn test_dry_run_serializes_report() {
    let temp = TempDir::new().unwrap();
    create_test_mod(temp.path(), "fine", TestMod::default());
    std::fs::create_dir_all(temp.path().join("junk")).unwrap();
    std::fs::write(temp.path().join("junk").join("mod.json"), "{ not json").unwrap();

    let loader = loader_with(LoaderConfig::default());
    let report = loader.dry_run(&roots(&temp));
    assert!(report.has_errors());
    assert!(loader.active_mods().await.is_empty());

    let json = serde_json::to_value(&report).unwrap();
    assert_eq!(json["mods"][0]["id"], "fine");
    assert_eq!(json["mods"][0]["status"]["state"], "ready");
    assert_eq!(json["discovery_failures"][0]["kind"], "manifest_invalid");
}

// ==============================================================================
// Execution, unload and reload
// ==============================================================================

#[tokio::test]
async fn test_execute_uses_fresh_state_and_shared_data() {
    let temp = TempDir::new().unwrap();
    create_test_mod(temp.path(), "counter", TestMod {
        script: Some(
            "local calls = 0\nfunction bump()\n  calls = calls + 1\n  local total = (shared.get('total') or 0) + 1\n  shared.set('total', total)\n  return { calls = calls, total = total }\nend",
        ),
        ..Default::default()
    });

    let loader = loader_with(LoaderConfig::default());
    loader.load_all(&roots(&temp)).await;

    loader.execute("counter", "bump", vec![]).await.unwrap();
    let second = loader.execute("counter", "bump", vec![]).await.unwrap();
    assert_eq!(second.state, ExecutionState::Completed);
    assert_eq!(second.value.get("calls"), Some(&ParamValue::Int(1)));
    assert_eq!(second.value.get("total"), Some(&ParamValue::Int(2)));
    assert_eq!(loader.host().shared().get("counter:total"), Some(ParamValue::Int(2)));
}

#[tokio::test]
async fn test_reload_picks_up_changes_and_reinitializes_dependents() {
    let temp = TempDir::new().unwrap();
    let base_dir = create_test_mod(temp.path(), "base", TestMod {
        script: Some("function value() return 1 end"),
        ..Default::default()
    });
    create_test_mod(temp.path(), "child", TestMod {
        dependencies: &["base"],
        script: Some(
            "function init() shared.set('global:child_inits', (shared.get('global:child_inits') or 0) + 1) end",
        ),
        ..Default::default()
    });

    let loader = loader_with(LoaderConfig::default());
    loader.load_all(&roots(&temp)).await;
    assert_eq!(loader.execute("base", "value", vec![]).await.unwrap().value, ParamValue::Int(1));

    std::fs::write(base_dir.join("main.lua"), "function value() return 2 end").unwrap();
    let statuses = loader.reload("base").await.unwrap();

    assert_eq!(
        statuses,
        vec![
            ("base".to_string(), ModStatus::Active),
            ("child".to_string(), ModStatus::Active)
        ]
    );
    assert_eq!(loader.execute("base", "value", vec![]).await.unwrap().value, ParamValue::Int(2));
    assert_eq!(loader.host().shared().get("global:child_inits"), Some(ParamValue::Int(2)));
    assert_eq!(loader.mod_at(&base_dir).await.as_deref(), Some("base"));
}

#[tokio::test]
async fn test_reload_failure_blocks_dependents() {
    let temp = TempDir::new().unwrap();
    let base_dir = create_test_mod(temp.path(), "base", TestMod::default());
    create_test_mod(temp.path(), "child", TestMod { dependencies: &["base"], ..Default::default() });

    let loader = loader_with(LoaderConfig::default());
    loader.load_all(&roots(&temp)).await;

    std::fs::write(base_dir.join("main.lua"), "function init( end").unwrap();
    let statuses = loader.reload("base").await.unwrap();

    assert_eq!(failed_kind(Some(statuses[0].1.clone())), Some(ErrorKind::CompilationFailed));
    assert_eq!(failed_kind(Some(statuses[1].1.clone())), Some(ErrorKind::DependencyFailed));
    assert!(loader.active_mods().await.is_empty());
}

#[tokio::test]
async fn test_unload_waits_for_in_flight_execution() {
    let temp = TempDir::new().unwrap();
    create_test_mod(temp.path(), "scanner", TestMod {
        script: Some("function scan() return #entities.query('position') end"),
        ..Default::default()
    });

    let host = ModHost::new().with_world(Arc::new(SlowWorld));
    let loader = Arc::new(ModLoader::new(LoaderConfig::default(), host).unwrap());
    loader.load_all(&roots(&temp)).await;

    let running = {
        let loader = loader.clone();
        tokio::spawn(async move {
            let result = loader.execute("scanner", "scan", vec![]).await;
            (result, Instant::now())
        })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;

    let unloaded = loader.unload("scanner").await.unwrap();
    let unloaded_at = Instant::now();
    let (result, finished_at) = running.await.unwrap();

    assert_eq!(unloaded, vec!["scanner"]);
    assert_eq!(result.unwrap().value, ParamValue::Int(3));
    assert!(finished_at <= unloaded_at);
    assert_eq!(loader.status("scanner").await, Some(ModStatus::Unloaded));
    assert!(loader.execute("scanner", "scan", vec![]).await.is_err());
}

#[tokio::test]
async fn test_unload_runs_shutdown_in_reverse_order() {
    let temp = TempDir::new().unwrap();
    let shutdown = |name: &str| {
        format!(
            "function shutdown() shared.set('global:log', (shared.get('global:log') or '') .. '{}') end",
            name
        )
    };
    let (base, child) = (shutdown("base,"), shutdown("child,"));
    create_test_mod(temp.path(), "base", TestMod { script: Some(base.as_str()), ..Default::default() });
    create_test_mod(temp.path(), "child", TestMod {
        dependencies: &["base"],
        script: Some(child.as_str()),
        ..Default::default()
    });

    let loader = loader_with(LoaderConfig::default());
    loader.load_all(&roots(&temp)).await;

    let unloaded = loader.unload("base").await.unwrap();
    assert_eq!(unloaded, vec!["child", "base"]);
    assert_eq!(
        loader.host().shared().get("global:log"),
        Some(ParamValue::from("child,base,"))
    );
}

// ==============================================================================
// Hooks and events
// ==============================================================================

#[tokio::test]
async fn test_hook_handlers_run_in_load_order_and_fail_independently() {
    let temp = TempDir::new().unwrap();
    create_test_mod(temp.path(), "alpha", TestMod {
        script: Some(
            "function init() hooks.register('on_turn', 'on_turn') end\nfunction on_turn(n) return n * 2 end",
        ),
        ..Default::default()
    });
    create_test_mod(temp.path(), "beta", TestMod {
        script: Some(
            "function init() hooks.register('on_turn', 'on_turn') end\nfunction on_turn(n) error('beta broke') end",
        ),
        ..Default::default()
    });

    let loader = loader_with(LoaderConfig::default());
    loader.host().hooks().define("on_turn", "Runs at the start of each turn");
    loader.load_all(&roots(&temp)).await;

    let outcomes = loader.invoke_hook("on_turn", vec![ParamValue::Int(21)]).await.unwrap();
    assert_eq!(outcomes.len(), 2);
    assert_eq!(outcomes[0].mod_id, "alpha");
    assert_eq!(outcomes[0].value, ParamValue::Int(42));
    assert_eq!(outcomes[1].mod_id, "beta");
    assert_eq!(outcomes[1].kind, Some(ErrorKind::ExecutionFaulted));
    assert!(outcomes[1].error.as_deref().unwrap().contains("beta broke"));

    loader.unload("beta").await.unwrap();
    assert_eq!(loader.invoke_hook("on_turn", vec![ParamValue::Int(1)]).await.unwrap().len(), 1);
    assert!(loader.invoke_hook("on_missing", vec![]).await.is_err());
}

#[tokio::test]
async fn test_registering_unknown_hook_fails_init() {
    let temp = TempDir::new().unwrap();
    create_test_mod(temp.path(), "eager", TestMod {
        script: Some("function init() hooks.register('on_nothing', 'init') end"),
        ..Default::default()
    });

    let loader = loader_with(LoaderConfig::default());
    let report = loader.load_all(&roots(&temp)).await;
    assert!(report.status("eager").is_some_and(ModStatus::is_failed));
}

#[tokio::test]
async fn test_events_published_during_init() {
    let temp = TempDir::new().unwrap();
    create_test_mod(temp.path(), "weather", TestMod {
        trust_level: Some("untrusted"),
        script: Some("function init() events.publish('season_changed', { season = 'winter' }) end"),
        ..Default::default()
    });

    let loader = loader_with(LoaderConfig::default());
    let mut events = loader.host().events().subscribe();
    loader.load_all(&roots(&temp)).await;

    let event = events.recv().await.unwrap();
    assert_eq!(event.source_mod, "weather");
    assert_eq!(event.name, "season_changed");
    assert_eq!(event.payload.get("season"), Some(&ParamValue::from("winter")));
}

// ==============================================================================
// Resource limits
// ==============================================================================

#[tokio::test]
async fn test_event_payload_bounded_by_trust_memory_ceiling() {
    let temp = TempDir::new().unwrap();
    create_test_mod(temp.path(), "flood", TestMod {
        trust_level: Some("untrusted"),
        script: Some(
            "function flood()\n  local s = string.rep('x', 1024 * 1024)\n  local t = {}\n  for i = 1, 32 do t[i] = s end\n  events.publish('flood', t)\nend",
        ),
        ..Default::default()
    });

    let loader = loader_with(LoaderConfig::default());
    let mut events = loader.host().events().subscribe();
    loader.load_all(&roots(&temp)).await;

    let result = loader.execute("flood", "flood", vec![]).await.unwrap();
    assert_eq!(result.state, ExecutionState::MemoryExceeded);
    assert!(events.try_recv().is_err());
}

#[tokio::test]
async fn test_watchdog_termination_quarantines_mod() {
    let temp = TempDir::new().unwrap();
    create_test_mod(temp.path(), "scanner", TestMod {
        script: Some(
            "function init() hooks.register('on_turn', 'scan') end\nfunction scan()\n  entities.query('position')\n  events.publish('late', 1)\n  return 1\nend",
        ),
        ..Default::default()
    });

    let config = LoaderConfig {
        execute_timeout: Duration::from_millis(50),
        sandbox: SandboxConfig {
            grace_period: Duration::from_millis(20),
            ..Default::default()
        },
        ..Default::default()
    };
    let host = ModHost::new().with_world(Arc::new(SlowWorld));
    host.hooks().define("on_turn", "Runs at the start of each turn");
    let loader = ModLoader::new(config, host).unwrap();
    let mut events = loader.host().events().subscribe();
    loader.load_all(&roots(&temp)).await;

    let result = loader.execute("scanner", "scan", vec![]).await.unwrap();
    assert_eq!(result.state, ExecutionState::TimedOut);
    assert_eq!(failed_kind(loader.status("scanner").await), Some(ErrorKind::ExecutionTimedOut));
    assert!(loader.invoke_hook("on_turn", vec![]).await.unwrap().is_empty());
    assert!(loader.execute("scanner", "scan", vec![]).await.is_err());

    // The abandoned worker's query returns, but it never reaches the host again.
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert!(events.try_recv().is_err());

    let statuses = loader.reload("scanner").await.unwrap();
    assert_eq!(statuses, vec![("scanner".to_string(), ModStatus::Active)]);
}
