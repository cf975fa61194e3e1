//! Host functions exposed to mods.
//!
//! [`ModHost`] owns the collaborators scripts may reach: the entity world,
//! static game data, the event bus, shared data and the hook registry.
//! [`ModHost::api_for`] hands each mod its own [`ModApi`], which implements
//! the runtime's [`ScriptApi`] and checks every call against the mod's
//! permissions before touching the host.

use crate::data::{GameData, StaticGameData};
use crate::events::{EventBus, ModEvent};
use crate::hooks::HookRegistry;
use crate::shared::{scoped_key, SharedDataStore};
use crate::world::{InMemoryWorld, World};
use kiln_runtime::{
    ApiCategory, EntityId, LogLevel, ParamValue, RuntimeError, RuntimeResult, ScriptApi,
    SecurityPermissions,
};
use std::sync::Arc;

/// Collaborators shared by every mod.
#[derive(Clone)]
pub struct ModHost {
    world: Arc<dyn World>,
    data: Arc<dyn GameData>,
    events: EventBus,
    shared: Arc<SharedDataStore>,
    hooks: Arc<HookRegistry>,
}

impl Default for ModHost {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ModHost {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModHost")
            .field("subscribers", &self.events.subscriber_count())
            .field("shared_keys", &self.shared.len())
            .finish_non_exhaustive()
    }
}

impl ModHost {
    /// A host with an empty world and no game data.
    pub fn new() -> Self {
        Self {
            world: Arc::new(InMemoryWorld::new()),
            data: Arc::new(StaticGameData::new()),
            events: EventBus::default(),
            shared: Arc::new(SharedDataStore::new()),
            hooks: Arc::new(HookRegistry::new()),
        }
    }

    pub fn with_world(mut self, world: Arc<dyn World>) -> Self {
        self.world = world;
        self
    }

    pub fn with_data(mut self, data: Arc<dyn GameData>) -> Self {
        self.data = data;
        self
    }

    pub fn with_events(mut self, events: EventBus) -> Self {
        self.events = events;
        self
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn shared(&self) -> &Arc<SharedDataStore> {
        &self.shared
    }

    pub fn hooks(&self) -> &Arc<HookRegistry> {
        &self.hooks
    }

    /// The capability surface for one mod.
    pub fn api_for(&self, mod_id: impl Into<String>, permissions: SecurityPermissions) -> Arc<ModApi> {
        Arc::new(ModApi {
            mod_id: mod_id.into(),
            permissions,
            host: self.clone(),
        })
    }
}

/// Per-mod host functions with capability checking.
pub struct ModApi {
    /// Mod ID for logging and key scoping.
    mod_id: String,

    /// Permissions fixed at load time.
    permissions: SecurityPermissions,

    host: ModHost,
}

impl std::fmt::Debug for ModApi {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModApi")
            .field("mod_id", &self.mod_id)
            .field("permissions", &self.permissions)
            .finish()
    }
}

impl ModApi {
    pub fn mod_id(&self) -> &str {
        &self.mod_id
    }

    pub fn permissions(&self) -> &SecurityPermissions {
        &self.permissions
    }

    /// Check if a category is granted.
    fn check_capability(&self, category: ApiCategory) -> RuntimeResult<()> {
        if self.permissions.permits(category) {
            Ok(())
        } else {
            Err(RuntimeError::ExecutionSecurityViolation(format!(
                "mod '{}' is not granted '{}'",
                self.mod_id,
                category.as_str()
            )))
        }
    }
}

impl ScriptApi for ModApi {
    fn query_entities(&self, component: &str) -> RuntimeResult<Vec<EntityId>> {
        self.check_capability(ApiCategory::Entities)?;
        Ok(self.host.world.entities_with(component))
    }

    fn get_component(&self, entity: EntityId, component: &str) -> RuntimeResult<Option<ParamValue>> {
        self.check_capability(ApiCategory::Entities)?;
        Ok(self.host.world.component(entity, component))
    }

    fn publish_event(&self, name: &str, payload: ParamValue) -> RuntimeResult<()> {
        self.check_capability(ApiCategory::Events)?;
        self.host
            .events
            .publish(ModEvent::new(self.mod_id.as_str(), name, payload));
        Ok(())
    }

    fn log(&self, level: LogLevel, message: &str) {
        if self.check_capability(ApiCategory::Logging).is_err() {
            return;
        }
        match level {
            LogLevel::Trace => tracing::trace!(mod_id = %self.mod_id, "{}", message),
            LogLevel::Debug => tracing::debug!(mod_id = %self.mod_id, "{}", message),
            LogLevel::Info => tracing::info!(mod_id = %self.mod_id, "{}", message),
            LogLevel::Warn => tracing::warn!(mod_id = %self.mod_id, "{}", message),
            LogLevel::Error => tracing::error!(mod_id = %self.mod_id, "{}", message),
        }
    }

    fn shared_get(&self, key: &str) -> RuntimeResult<Option<ParamValue>> {
        self.check_capability(ApiCategory::SharedData)?;
        Ok(self.host.shared.get(&scoped_key(&self.mod_id, key)))
    }

    fn shared_set(&self, key: &str, value: ParamValue) -> RuntimeResult<()> {
        self.check_capability(ApiCategory::SharedData)?;
        self.host.shared.set(&scoped_key(&self.mod_id, key), value);
        Ok(())
    }

    fn shared_compare_and_swap(
        &self,
        key: &str,
        expected: Option<ParamValue>,
        new: ParamValue,
    ) -> RuntimeResult<bool> {
        self.check_capability(ApiCategory::SharedData)?;
        Ok(self
            .host
            .shared
            .compare_and_swap(&scoped_key(&self.mod_id, key), expected.as_ref(), new))
    }

    fn register_hook(&self, hook: &str, handler: &str) -> RuntimeResult<()> {
        self.check_capability(ApiCategory::Hooks)?;
        self.host.hooks.register(hook, &self.mod_id, handler)
    }

    fn lookup_data(&self, table: &str, key: &str) -> RuntimeResult<Option<ParamValue>> {
        self.check_capability(ApiCategory::GameData)?;
        Ok(self.host.data.lookup(table, key))
    }
}
