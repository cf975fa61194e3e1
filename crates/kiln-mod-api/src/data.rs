//! Static game-data lookup.
//!
//! Species, move and item tables are loaded by the game, not by mods. Scripts
//! read them by `(table, key)` through the [`GameData`] trait.

use kiln_runtime::{ParamValue, RuntimeError, RuntimeResult};
use std::collections::HashMap;
use std::path::Path;
use tracing::{debug, warn};

/// Read-only keyed tables.
pub trait GameData: Send + Sync {
    fn lookup(&self, table: &str, key: &str) -> Option<ParamValue>;
}

/// Tables held in memory.
#[derive(Debug, Clone, Default)]
pub struct StaticGameData {
    tables: HashMap<String, HashMap<String, ParamValue>>,
}

impl StaticGameData {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, table: impl Into<String>, key: impl Into<String>, value: ParamValue) {
        self.tables
            .entry(table.into())
            .or_default()
            .insert(key.into(), value);
    }

    /// Add a table from a JSON object whose members are the rows.
    pub fn insert_table(&mut self, table: impl Into<String>, rows: serde_json::Value) -> RuntimeResult<()> {
        let table = table.into();
        let serde_json::Value::Object(rows) = rows else {
            return Err(RuntimeError::Unsupported(format!(
                "game data table '{}' must be a JSON object",
                table
            )));
        };
        let entry = self.tables.entry(table).or_default();
        for (key, value) in rows {
            entry.insert(key, ParamValue::from(value));
        }
        Ok(())
    }

    /// Load every `<table>.json` file in a directory.
    pub fn from_dir(dir: &Path) -> RuntimeResult<Self> {
        let mut data = Self::new();
        for entry in std::fs::read_dir(dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let Some(table) = path.file_stem().and_then(|s| s.to_str()) else {
                warn!("Skipping game data file with non-UTF-8 name: {:?}", path);
                continue;
            };
            let rows: serde_json::Value = serde_json::from_str(&std::fs::read_to_string(&path)?)?;
            data.insert_table(table, rows)?;
            debug!(table, "Loaded game data table");
        }
        Ok(data)
    }

    pub fn tables(&self) -> impl Iterator<Item = &str> {
        self.tables.keys().map(String::as_str)
    }
}

impl GameData for StaticGameData {
    fn lookup(&self, table: &str, key: &str) -> Option<ParamValue> {
        self.tables.get(table)?.get(key).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_lookup() {
        let mut data = StaticGameData::new();
        data.insert("items", "potion", ParamValue::Int(20));
        assert_eq!(data.lookup("items", "potion"), Some(ParamValue::Int(20)));
        assert_eq!(data.lookup("items", "ether"), None);
        assert_eq!(data.lookup("moves", "potion"), None);
    }

    #[test]
    fn test_from_dir() {
        let temp = TempDir::new().unwrap();
        std::fs::write(
            temp.path().join("species.json"),
            r#"{"ember": {"type": "fire", "hp": 39}}"#,
        )
        .unwrap();
        std::fs::write(temp.path().join("notes.txt"), "ignored").unwrap();

        let data = StaticGameData::from_dir(temp.path()).unwrap();
        let ember = data.lookup("species", "ember").unwrap();
        assert_eq!(ember.get("hp"), Some(&ParamValue::Int(39)));
        assert_eq!(data.tables().count(), 1);
    }

    #[test]
    fn test_table_must_be_object() {
        let mut data = StaticGameData::new();
        assert!(data.insert_table("bad", serde_json::json!([1, 2])).is_err());
    }
}
