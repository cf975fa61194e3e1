//! Tagged parameter values exchanged between the host and scripts.
//!
//! Entity components, event payloads, hook arguments, shared data and script
//! return values all use [`ParamValue`]: JSON-like flexibility with an
//! explicit type tag at every consumption site.

use mlua::{FromLua, IntoLua, Lua, Value};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Maximum table nesting converted from Lua. Deeper (or cyclic) tables fail.
pub const MAX_VALUE_DEPTH: usize = 32;

/// Named parameters.
pub type ParamMap = BTreeMap<String, ParamValue>;

/// A dynamically typed value with an explicit tag.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum ParamValue {
    #[default]
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    List(Vec<ParamValue>),
    Map(ParamMap),
}

impl ParamValue {
    /// Name of the variant tag.
    pub fn type_name(&self) -> &'static str {
        match self {
            ParamValue::Null => "null",
            ParamValue::Bool(_) => "bool",
            ParamValue::Int(_) => "int",
            ParamValue::Float(_) => "float",
            ParamValue::Str(_) => "str",
            ParamValue::List(_) => "list",
            ParamValue::Map(_) => "map",
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, ParamValue::Null)
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            ParamValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            ParamValue::Int(i) => Some(*i),
            _ => None,
        }
    }

    /// Numeric view; integers widen to floats.
    pub fn as_float(&self) -> Option<f64> {
        match self {
            ParamValue::Float(f) => Some(*f),
            ParamValue::Int(i) => Some(*i as f64),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            ParamValue::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[ParamValue]> {
        match self {
            ParamValue::List(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&ParamMap> {
        match self {
            ParamValue::Map(map) => Some(map),
            _ => None,
        }
    }

    /// Look up a key when this value is a map.
    pub fn get(&self, key: &str) -> Option<&ParamValue> {
        self.as_map().and_then(|m| m.get(key))
    }

    /// Convert to an untagged JSON value.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            ParamValue::Null => serde_json::Value::Null,
            ParamValue::Bool(b) => serde_json::Value::Bool(*b),
            ParamValue::Int(i) => serde_json::Value::from(*i),
            ParamValue::Float(f) => serde_json::Number::from_f64(*f)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            ParamValue::Str(s) => serde_json::Value::String(s.clone()),
            ParamValue::List(items) => {
                serde_json::Value::Array(items.iter().map(ParamValue::to_json).collect())
            }
            ParamValue::Map(map) => serde_json::Value::Object(
                map.iter().map(|(k, v)| (k.clone(), v.to_json())).collect(),
            ),
        }
    }

    /// Convert a Lua value, refusing functions, userdata and deep nesting.
    ///
    /// Every node, string byte and map key is charged to `budget`, so shared
    /// references are paid for each time they appear.
    pub fn from_lua_value(value: Value, budget: &mut ValueBudget) -> mlua::Result<Self> {
        budget.charge(NODE_BYTES)?;
        Self::convert(value, 0, budget)
    }

    fn convert(value: Value, depth: usize, budget: &mut ValueBudget) -> mlua::Result<Self> {
        if depth > MAX_VALUE_DEPTH {
            return Err(mlua::Error::RuntimeError(
                "value nested too deeply".to_string(),
            ));
        }
        Ok(match value {
            Value::Nil => ParamValue::Null,
            Value::Boolean(b) => ParamValue::Bool(b),
            Value::Integer(i) => ParamValue::Int(i),
            Value::Number(n) => ParamValue::Float(n),
            Value::String(s) => ParamValue::Str(budget.string(&s)?),
            Value::Table(table) => {
                let len = table.raw_len();
                let mut entries = Vec::new();
                for pair in table.pairs::<Value, Value>() {
                    budget.charge(NODE_BYTES)?;
                    entries.push(pair?);
                }
                let is_sequence = len > 0
                    && entries.len() == len
                    && entries
                        .iter()
                        .all(|(k, _)| matches!(k, Value::Integer(i) if *i >= 1 && (*i as usize) <= len));
                if is_sequence {
                    let mut items = vec![ParamValue::Null; len];
                    for (k, v) in entries {
                        if let Value::Integer(i) = k {
                            items[(i - 1) as usize] = Self::convert(v, depth + 1, budget)?;
                        }
                    }
                    ParamValue::List(items)
                } else {
                    let mut map = ParamMap::new();
                    for (k, v) in entries {
                        let key = match k {
                            Value::String(s) => budget.string(&s)?,
                            Value::Integer(i) => {
                                let key = i.to_string();
                                budget.charge(key.len())?;
                                key
                            }
                            other => {
                                return Err(mlua::Error::RuntimeError(format!(
                                    "unsupported table key type '{}'",
                                    other.type_name()
                                )))
                            }
                        };
                        map.insert(key, Self::convert(v, depth + 1, budget)?);
                    }
                    ParamValue::Map(map)
                }
            }
            other => {
                return Err(mlua::Error::RuntimeError(format!(
                    "cannot pass a {} across the script boundary",
                    other.type_name()
                )))
            }
        })
    }
}

/// Host-side cost of one converted node, before any string payload.
const NODE_BYTES: usize = std::mem::size_of::<ParamValue>();

/// Nodes converted between cancellation checks.
const CANCEL_CHECK_NODES: u64 = 1024;

/// Budget used when a Lua state carries no [`ValueLimits`].
pub const DEFAULT_VALUE_BYTES: usize = 16 * 1024 * 1024;

/// Conversion limits installed as Lua app data. The budget for each value is
/// the ceiling minus the memory the state already uses above `baseline`.
#[derive(Debug, Clone)]
pub struct ValueLimits {
    pub ceiling: usize,
    pub baseline: usize,
    /// Conversion stops once this flag is raised.
    pub cancel: Option<Arc<AtomicBool>>,
}

impl ValueLimits {
    pub fn budget(&self, lua: &Lua) -> ValueBudget {
        let used = lua.used_memory().saturating_sub(self.baseline);
        let mut budget = ValueBudget::new(self.ceiling.saturating_sub(used));
        budget.cancel = self.cancel.clone();
        budget
    }
}

/// Bytes a single Lua to host conversion may produce.
#[derive(Debug, Clone)]
pub struct ValueBudget {
    limit: usize,
    remaining: usize,
    nodes: u64,
    cancel: Option<Arc<AtomicBool>>,
}

impl ValueBudget {
    pub fn new(bytes: usize) -> Self {
        Self {
            limit: bytes,
            remaining: bytes,
            nodes: 0,
            cancel: None,
        }
    }

    pub fn with_cancel(mut self, cancel: Arc<AtomicBool>) -> Self {
        self.cancel = Some(cancel);
        self
    }

    pub fn remaining(&self) -> usize {
        self.remaining
    }

    /// Fails with `MemoryError` once the budget is spent.
    fn charge(&mut self, bytes: usize) -> mlua::Result<()> {
        self.nodes += 1;
        if self.nodes % CANCEL_CHECK_NODES == 0
            && self.cancel.as_ref().is_some_and(|c| c.load(Ordering::SeqCst))
        {
            return Err(mlua::Error::RuntimeError(
                "value conversion cancelled".to_string(),
            ));
        }
        if bytes > self.remaining {
            return Err(mlua::Error::MemoryError(format!(
                "value exceeds the {} byte conversion budget",
                self.limit
            )));
        }
        self.remaining -= bytes;
        Ok(())
    }

    /// Charge a string's length before copying it.
    fn string(&mut self, s: &mlua::String) -> mlua::Result<String> {
        self.charge(s.as_bytes().len())?;
        Ok(s.to_string_lossy().to_string())
    }
}

impl fmt::Display for ParamValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_json())
    }
}

impl From<serde_json::Value> for ParamValue {
    fn from(value: serde_json::Value) -> Self {
        match value {
            serde_json::Value::Null => ParamValue::Null,
            serde_json::Value::Bool(b) => ParamValue::Bool(b),
            serde_json::Value::Number(n) => match n.as_i64() {
                Some(i) => ParamValue::Int(i),
                None => ParamValue::Float(n.as_f64().unwrap_or(0.0)),
            },
            serde_json::Value::String(s) => ParamValue::Str(s),
            serde_json::Value::Array(items) => {
                ParamValue::List(items.into_iter().map(ParamValue::from).collect())
            }
            serde_json::Value::Object(map) => ParamValue::Map(
                map.into_iter()
                    .map(|(k, v)| (k, ParamValue::from(v)))
                    .collect(),
            ),
        }
    }
}

impl From<bool> for ParamValue {
    fn from(b: bool) -> Self {
        ParamValue::Bool(b)
    }
}

impl From<i64> for ParamValue {
    fn from(i: i64) -> Self {
        ParamValue::Int(i)
    }
}

impl From<f64> for ParamValue {
    fn from(f: f64) -> Self {
        ParamValue::Float(f)
    }
}

impl From<&str> for ParamValue {
    fn from(s: &str) -> Self {
        ParamValue::Str(s.to_string())
    }
}

impl From<String> for ParamValue {
    fn from(s: String) -> Self {
        ParamValue::Str(s)
    }
}

impl From<ParamMap> for ParamValue {
    fn from(map: ParamMap) -> Self {
        ParamValue::Map(map)
    }
}

impl IntoLua for ParamValue {
    fn into_lua(self, lua: &Lua) -> mlua::Result<Value> {
        Ok(match self {
            ParamValue::Null => Value::Nil,
            ParamValue::Bool(b) => Value::Boolean(b),
            ParamValue::Int(i) => Value::Integer(i),
            ParamValue::Float(f) => Value::Number(f),
            ParamValue::Str(s) => Value::String(lua.create_string(&s)?),
            ParamValue::List(items) => {
                let table = lua.create_table()?;
                for (i, item) in items.into_iter().enumerate() {
                    table.raw_set(i + 1, item.into_lua(lua)?)?;
                }
                Value::Table(table)
            }
            ParamValue::Map(map) => {
                let table = lua.create_table()?;
                for (k, v) in map {
                    table.raw_set(k, v.into_lua(lua)?)?;
                }
                Value::Table(table)
            }
        })
    }
}

impl FromLua for ParamValue {
    fn from_lua(value: Value, lua: &Lua) -> mlua::Result<Self> {
        let mut budget = match lua.app_data_ref::<ValueLimits>() {
            Some(limits) => limits.budget(lua),
            None => ValueBudget::new(DEFAULT_VALUE_BYTES),
        };
        ParamValue::from_lua_value(value, &mut budget)
    }
}
