//! Entity access for scripts.
//!
//! The gameplay simulation owns the real entity store. Mods only see it
//! through the [`World`] trait: find entities by component, read a component.
//! [`InMemoryWorld`] backs embedding and tests.

use kiln_runtime::{EntityId, ParamValue};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;

/// Read-only view of the entity store.
pub trait World: Send + Sync {
    /// Entities carrying `component`, in ascending id order.
    fn entities_with(&self, component: &str) -> Vec<EntityId>;

    /// A component value, if the entity exists and carries it.
    fn component(&self, entity: EntityId, name: &str) -> Option<ParamValue>;
}

/// A map-backed entity store.
#[derive(Debug)]
pub struct InMemoryWorld {
    entities: RwLock<BTreeMap<EntityId, BTreeMap<String, ParamValue>>>,
    next_id: AtomicU64,
}

impl Default for InMemoryWorld {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryWorld {
    pub fn new() -> Self {
        Self {
            entities: RwLock::new(BTreeMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Create an entity with the given components.
    pub fn spawn<I, K>(&self, components: I) -> EntityId
    where
        I: IntoIterator<Item = (K, ParamValue)>,
        K: Into<String>,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let components = components.into_iter().map(|(k, v)| (k.into(), v)).collect();
        self.entities
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id, components);
        id
    }

    /// Set a component. Returns false if the entity does not exist.
    pub fn insert(&self, entity: EntityId, name: impl Into<String>, value: ParamValue) -> bool {
        let mut entities = self.entities.write().unwrap_or_else(|e| e.into_inner());
        match entities.get_mut(&entity) {
            Some(components) => {
                components.insert(name.into(), value);
                true
            }
            None => false,
        }
    }

    pub fn despawn(&self, entity: EntityId) -> bool {
        self.entities
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&entity)
            .is_some()
    }

    pub fn len(&self) -> usize {
        self.entities.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl World for InMemoryWorld {
    fn entities_with(&self, component: &str) -> Vec<EntityId> {
        self.entities
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|(_, components)| components.contains_key(component))
            .map(|(id, _)| *id)
            .collect()
    }

    fn component(&self, entity: EntityId, name: &str) -> Option<ParamValue> {
        self.entities
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&entity)
            .and_then(|components| components.get(name))
            .cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_query_by_component() {
        let world = InMemoryWorld::new();
        let a = world.spawn([("health", ParamValue::Int(10))]);
        let b = world.spawn([("health", ParamValue::Int(5)), ("name", ParamValue::from("b"))]);
        world.spawn([("name", ParamValue::from("c"))]);

        assert_eq!(world.entities_with("health"), vec![a, b]);
        assert_eq!(world.component(b, "name"), Some(ParamValue::from("b")));
        assert_eq!(world.component(a, "name"), None);
    }

    #[test]
    fn test_insert_and_despawn() {
        let world = InMemoryWorld::new();
        let a = world.spawn(Vec::<(String, ParamValue)>::new());
        assert!(world.insert(a, "level", ParamValue::Int(3)));
        assert!(!world.insert(99, "level", ParamValue::Int(3)));
        assert!(world.despawn(a));
        assert!(world.is_empty());
    }
}
