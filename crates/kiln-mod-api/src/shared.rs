//! Synchronized shared data between scripts.
//!
//! Concurrent executions share nothing implicitly. Anything that must
//! outlive one execution or cross mods goes through this store. Keys are
//! scoped to the calling mod (`<mod>:<key>`) unless written as
//! `global:<key>`, which every mod with shared-data access can see.

use kiln_runtime::ParamValue;
use std::collections::HashMap;
use std::sync::Mutex;

/// Prefix for keys visible to all mods.
pub const GLOBAL_PREFIX: &str = "global:";

/// Storage key for a script-visible key.
pub fn scoped_key(mod_id: &str, key: &str) -> String {
    if key.starts_with(GLOBAL_PREFIX) {
        key.to_string()
    } else {
        format!("{}:{}", mod_id, key)
    }
}

#[derive(Debug, Default)]
pub struct SharedDataStore {
    values: Mutex<HashMap<String, ParamValue>>,
}

impl SharedDataStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<ParamValue> {
        self.values
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(key)
            .cloned()
    }

    /// Store a value; `Null` removes the key. Returns the previous value.
    pub fn set(&self, key: &str, value: ParamValue) -> Option<ParamValue> {
        let mut values = self.values.lock().unwrap_or_else(|e| e.into_inner());
        if value.is_null() {
            values.remove(key)
        } else {
            values.insert(key.to_string(), value)
        }
    }

    /// Replace the value only if it currently equals `expected`
    /// (`None` meaning absent). Returns whether the swap happened.
    pub fn compare_and_swap(&self, key: &str, expected: Option<&ParamValue>, new: ParamValue) -> bool {
        let mut values = self.values.lock().unwrap_or_else(|e| e.into_inner());
        if values.get(key) != expected {
            return false;
        }
        if new.is_null() {
            values.remove(key);
        } else {
            values.insert(key.to_string(), new);
        }
        true
    }

    /// Drop every key scoped to `mod_id`. Global keys are kept.
    pub fn clear_mod(&self, mod_id: &str) -> usize {
        let prefix = format!("{}:", mod_id);
        let mut values = self.values.lock().unwrap_or_else(|e| e.into_inner());
        let before = values.len();
        values.retain(|k, _| !k.starts_with(&prefix));
        before - values.len()
    }

    pub fn len(&self) -> usize {
        self.values.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_scoped_keys() {
        assert_eq!(scoped_key("weather", "season"), "weather:season");
        assert_eq!(scoped_key("weather", "global:season"), "global:season");
    }

    #[test]
    fn test_set_get_and_null_removes() {
        let store = SharedDataStore::new();
        assert_eq!(store.set("m:a", ParamValue::Int(1)), None);
        assert_eq!(store.set("m:a", ParamValue::Int(2)), Some(ParamValue::Int(1)));
        assert_eq!(store.get("m:a"), Some(ParamValue::Int(2)));
        store.set("m:a", ParamValue::Null);
        assert!(store.is_empty());
    }

    #[test]
    fn test_compare_and_swap() {
        let store = SharedDataStore::new();
        assert!(store.compare_and_swap("k", None, ParamValue::Int(1)));
        assert!(!store.compare_and_swap("k", None, ParamValue::Int(5)));
        assert!(store.compare_and_swap("k", Some(&ParamValue::Int(1)), ParamValue::Int(2)));
        assert_eq!(store.get("k"), Some(ParamValue::Int(2)));
    }

    #[test]
    fn test_concurrent_increments_are_not_lost() {
        let store = Arc::new(SharedDataStore::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let store = store.clone();
                std::thread::spawn(move || {
                    for _ in 0..100 {
                        loop {
                            let current = store.get("global:count");
                            let next = current.as_ref().and_then(|v| v.as_int()).unwrap_or(0) + 1;
                            if store.compare_and_swap("global:count", current.as_ref(), ParamValue::Int(next)) {
                                break;
                            }
                        }
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(store.get("global:count"), Some(ParamValue::Int(800)));
    }

    #[test]
    fn test_clear_mod_keeps_globals() {
        let store = SharedDataStore::new();
        store.set("a:x", ParamValue::Int(1));
        store.set("ab:x", ParamValue::Int(1));
        store.set("global:x", ParamValue::Int(1));
        assert_eq!(store.clear_mod("a"), 1);
        assert_eq!(store.len(), 2);
    }
}
