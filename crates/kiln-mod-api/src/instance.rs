//! Loaded mod instances and their status.

use crate::host::ModApi;
use chrono::{DateTime, Utc};
use kiln_runtime::{
    CompiledScript, ErrorKind, ExecutionContext, ModManifest, ParamValue, SecurityPermissions,
};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;

/// Lifecycle function run after a mod's scripts load.
pub const INIT_FUNCTION: &str = "init";

/// Lifecycle function run before a mod unloads.
pub const SHUTDOWN_FUNCTION: &str = "shutdown";

/// Where a mod stands in the loader.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ModStatus {
    /// Resolved, not yet initialised.
    Pending,
    /// Passed a dry run: discovery, resolution and validation.
    Ready,
    /// Initialised and accepting executions.
    Active,
    Failed { kind: ErrorKind, reason: String },
    Unloaded,
}

impl ModStatus {
    pub fn failed(kind: ErrorKind, reason: impl Into<String>) -> Self {
        ModStatus::Failed {
            kind,
            reason: reason.into(),
        }
    }

    pub fn is_active(&self) -> bool {
        matches!(self, ModStatus::Active)
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, ModStatus::Failed { .. })
    }
}

impl std::fmt::Display for ModStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ModStatus::Pending => f.write_str("pending"),
            ModStatus::Ready => f.write_str("ready"),
            ModStatus::Active => f.write_str("active"),
            ModStatus::Failed { kind, reason } => write!(f, "failed ({}): {}", kind, reason),
            ModStatus::Unloaded => f.write_str("unloaded"),
        }
    }
}

/// A mod whose scripts are compiled and initialised.
pub struct ModInstance {
    pub manifest: ModManifest,

    /// Mod root directory.
    pub path: PathBuf,

    pub permissions: SecurityPermissions,

    /// Compiled scripts, entry point first.
    pub scripts: Vec<Arc<CompiledScript>>,

    /// Host functions for this mod.
    pub api: Arc<ModApi>,

    pub loaded_at: DateTime<Utc>,
}

impl std::fmt::Debug for ModInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModInstance")
            .field("id", &self.manifest.id)
            .field("path", &self.path)
            .field("scripts", &self.scripts.len())
            .finish()
    }
}

impl ModInstance {
    pub fn new(
        manifest: ModManifest,
        path: PathBuf,
        permissions: SecurityPermissions,
        scripts: Vec<Arc<CompiledScript>>,
        api: Arc<ModApi>,
    ) -> Self {
        Self {
            manifest,
            path,
            permissions,
            scripts,
            api,
            loaded_at: Utc::now(),
        }
    }

    pub fn id(&self) -> &str {
        &self.manifest.id
    }

    pub fn name(&self) -> &str {
        &self.manifest.name
    }

    pub fn version(&self) -> String {
        self.manifest.version.to_string()
    }

    pub fn entry_script(&self) -> Option<&Arc<CompiledScript>> {
        self.scripts.first()
    }

    /// Whether any script defines the global function `name`.
    pub fn has_function(&self, name: &str) -> bool {
        self.scripts.iter().any(|s| s.has_entry_point(name))
    }

    /// All functions the mod exposes.
    pub fn functions(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self
            .scripts
            .iter()
            .flat_map(|s| s.entry_points.iter().map(String::as_str))
            .collect();
        names.sort_unstable();
        names.dedup();
        names
    }

    /// An execution context running the mod's scripts, then `function` if given.
    pub fn context(&self, function: Option<&str>, args: Vec<ParamValue>) -> ExecutionContext {
        let context = ExecutionContext::new(
            self.id(),
            self.permissions.clone(),
            self.api.clone(),
        )
        .with_modules(self.scripts.iter().skip(1).cloned().collect());

        match function {
            Some(name) => context.with_entry(name, args),
            None => context,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::ModHost;
    use kiln_runtime::{CompileOptions, ScriptCompiler, TrustLevel};

    fn instance(sources: &[(&str, &str)]) -> ModInstance {
        let manifest = ModManifest::from_str(
            r#"{"id": "m", "name": "M", "version": "1.2.0", "apiVersion": "^1.0", "trustLevel": "safe", "entryPoint": "main.lua"}"#,
        )
        .unwrap();
        let permissions = SecurityPermissions::for_trust(TrustLevel::Safe);
        let compiler = ScriptCompiler::new();
        let options = CompileOptions::new(permissions.clone());
        let scripts = sources
            .iter()
            .map(|(id, text)| compiler.compile(id, text, &options).unwrap())
            .collect();
        let api = ModHost::new().api_for("m", permissions.clone());
        ModInstance::new(manifest, PathBuf::from("/mods/m"), permissions, scripts, api)
    }

    #[test]
    fn test_functions_across_scripts() {
        let m = instance(&[
            ("m/main.lua", "function init() end"),
            ("m/util.lua", "function helper() end\nfunction init() end"),
        ]);
        assert!(m.has_function(INIT_FUNCTION));
        assert!(m.has_function("helper"));
        assert!(!m.has_function(SHUTDOWN_FUNCTION));
        assert_eq!(m.functions(), vec!["helper", "init"]);
        assert_eq!(m.version(), "1.2.0");
    }

    #[test]
    fn test_context_carries_modules_and_entry() {
        let m = instance(&[("m/main.lua", "function f() end"), ("m/b.lua", "x = 1")]);
        let context = m.context(Some("f"), vec![ParamValue::Int(1)]);
        assert_eq!(context.mod_id, "m");
        assert_eq!(context.entry.as_deref(), Some("f"));
        assert_eq!(context.modules.len(), 1);
        assert_eq!(context.modules[0].source_id, "m/b.lua");
    }

    #[test]
    fn test_status_serializes_with_state_tag() {
        let status = ModStatus::failed(ErrorKind::DependencyFailed, "requires 'b'");
        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["state"], "failed");
        assert_eq!(json["kind"], "dependency_failed");
        assert_eq!(serde_json::to_value(ModStatus::Active).unwrap()["state"], "active");
    }
}
