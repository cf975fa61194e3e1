//! Host-defined extension points.
//!
//! The host declares named hooks up front. Mods register handler functions
//! against them by name; they cannot patch anything the host did not
//! declare. The loader invokes handlers in mod load order.

use kiln_runtime::{RuntimeError, RuntimeResult};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::RwLock;
use tracing::debug;

/// A mod function registered against a hook.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HookHandler {
    pub mod_id: String,
    pub function: String,
}

#[derive(Debug, Default)]
struct HookPoint {
    description: String,
    handlers: Vec<HookHandler>,
}

#[derive(Debug, Default)]
pub struct HookRegistry {
    hooks: RwLock<BTreeMap<String, HookPoint>>,
}

impl HookRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare a hook point. Redefining keeps existing handlers.
    pub fn define(&self, name: impl Into<String>, description: impl Into<String>) {
        let mut hooks = self.hooks.write().unwrap_or_else(|e| e.into_inner());
        hooks.entry(name.into()).or_default().description = description.into();
    }

    pub fn is_defined(&self, name: &str) -> bool {
        self.hooks
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(name)
    }

    /// Register `function` of `mod_id` against `hook`.
    ///
    /// Registering the same pair twice is a no-op, since a mod's top level
    /// runs again on every execution.
    pub fn register(&self, hook: &str, mod_id: &str, function: &str) -> RuntimeResult<()> {
        let mut hooks = self.hooks.write().unwrap_or_else(|e| e.into_inner());
        let point = hooks
            .get_mut(hook)
            .ok_or_else(|| RuntimeError::UnknownHook(hook.to_string()))?;

        let handler = HookHandler {
            mod_id: mod_id.to_string(),
            function: function.to_string(),
        };
        if !point.handlers.contains(&handler) {
            debug!(mod_id, hook, function, "Hook handler registered");
            point.handlers.push(handler);
        }
        Ok(())
    }

    /// Handlers of a hook in registration order.
    pub fn handlers(&self, hook: &str) -> RuntimeResult<Vec<HookHandler>> {
        self.hooks
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(hook)
            .map(|point| point.handlers.clone())
            .ok_or_else(|| RuntimeError::UnknownHook(hook.to_string()))
    }

    /// Drop every handler a mod registered. Returns how many were removed.
    pub fn remove_mod(&self, mod_id: &str) -> usize {
        let mut hooks = self.hooks.write().unwrap_or_else(|e| e.into_inner());
        hooks
            .values_mut()
            .map(|point| {
                let before = point.handlers.len();
                point.handlers.retain(|h| h.mod_id != mod_id);
                before - point.handlers.len()
            })
            .sum()
    }

    /// Defined hooks with their descriptions.
    pub fn hooks(&self) -> Vec<(String, String)> {
        self.hooks
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|(name, point)| (name.clone(), point.description.clone()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_requires_defined_hook() {
        let registry = HookRegistry::new();
        let err = registry.register("on_turn", "m", "handle").unwrap_err();
        assert!(matches!(err, RuntimeError::UnknownHook(ref h) if h == "on_turn"));

        registry.define("on_turn", "Runs at the start of each turn");
        registry.register("on_turn", "m", "handle").unwrap();
        registry.register("on_turn", "m", "handle").unwrap();
        assert_eq!(registry.handlers("on_turn").unwrap().len(), 1);
    }

    #[test]
    fn test_remove_mod() {
        let registry = HookRegistry::new();
        registry.define("on_turn", "");
        registry.define("on_battle_start", "");
        registry.register("on_turn", "a", "f").unwrap();
        registry.register("on_battle_start", "a", "g").unwrap();
        registry.register("on_turn", "b", "f").unwrap();

        assert_eq!(registry.remove_mod("a"), 2);
        let handlers = registry.handlers("on_turn").unwrap();
        assert_eq!(handlers, vec![HookHandler { mod_id: "b".into(), function: "f".into() }]);
        assert!(registry.handlers("on_battle_start").unwrap().is_empty());
    }

    #[test]
    fn test_redefine_keeps_handlers() {
        let registry = HookRegistry::new();
        registry.define("h", "old");
        registry.register("h", "a", "f").unwrap();
        registry.define("h", "new");
        assert_eq!(registry.handlers("h").unwrap().len(), 1);
        assert_eq!(registry.hooks(), vec![("h".to_string(), "new".to_string())]);
    }
}
