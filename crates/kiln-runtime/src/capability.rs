//! Capability-based security model for mod scripts.
//!
//! A mod's trust level selects a [`SecurityPermissions`] value: which API
//! categories its scripts may reach, and how much time, memory and call depth
//! a single execution may use. Permissions are fixed when a mod is loaded and
//! are never raised while it runs.
//!
//! Scripts reach the host only through a [`ScriptApi`] object; nothing else
//! from the host process is bound into a script's environment.

use crate::error::RuntimeResult;
use crate::params::ParamValue;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::time::Duration;

/// Trust classification declared in a manifest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrustLevel {
    /// Reviewed content shipped or vetted by the host.
    Safe,
    /// Explicitly trusted by the operator.
    Trusted,
    /// Anything else. The default.
    #[default]
    Untrusted,
}

impl TrustLevel {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "safe" => Some(TrustLevel::Safe),
            "trusted" => Some(TrustLevel::Trusted),
            "untrusted" => Some(TrustLevel::Untrusted),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TrustLevel::Safe => "safe",
            TrustLevel::Trusted => "trusted",
            TrustLevel::Untrusted => "untrusted",
        }
    }
}

impl fmt::Display for TrustLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A category of host API a script can be granted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApiCategory {
    /// Entity and component queries (`entities.*`).
    Entities,

    /// Event publishing (`events.*`).
    Events,

    /// Logging (`log.*` and `print`).
    Logging,

    /// Cross-script shared data (`shared.*`).
    SharedData,

    /// Registering handlers on host hook points (`hooks.*`).
    Hooks,

    /// Static game-data lookup (`data.*`).
    GameData,
}

impl ApiCategory {
    pub const ALL: [ApiCategory; 6] = [
        ApiCategory::Entities,
        ApiCategory::Events,
        ApiCategory::Logging,
        ApiCategory::SharedData,
        ApiCategory::Hooks,
        ApiCategory::GameData,
    ];

    /// Parse a category from a string.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "entities" => Some(ApiCategory::Entities),
            "events" => Some(ApiCategory::Events),
            "logging" => Some(ApiCategory::Logging),
            "shared_data" => Some(ApiCategory::SharedData),
            "hooks" => Some(ApiCategory::Hooks),
            "game_data" => Some(ApiCategory::GameData),
            _ => None,
        }
    }

    /// Convert category to string representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            ApiCategory::Entities => "entities",
            ApiCategory::Events => "events",
            ApiCategory::Logging => "logging",
            ApiCategory::SharedData => "shared_data",
            ApiCategory::Hooks => "hooks",
            ApiCategory::GameData => "game_data",
        }
    }

    /// Global table name the category is bound to inside scripts.
    pub fn namespace(&self) -> &'static str {
        match self {
            ApiCategory::Entities => "entities",
            ApiCategory::Events => "events",
            ApiCategory::Logging => "log",
            ApiCategory::SharedData => "shared",
            ApiCategory::Hooks => "hooks",
            ApiCategory::GameData => "data",
        }
    }

    /// Reverse of [`ApiCategory::namespace`].
    pub fn from_namespace(ns: &str) -> Option<Self> {
        ApiCategory::ALL.into_iter().find(|c| c.namespace() == ns)
    }
}

impl fmt::Display for ApiCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A set of API categories.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CategorySet {
    categories: BTreeSet<ApiCategory>,
}

impl CategorySet {
    /// Create an empty set.
    pub fn new() -> Self {
        Self {
            categories: BTreeSet::new(),
        }
    }

    /// Every category.
    pub fn all() -> Self {
        ApiCategory::ALL.into_iter().collect()
    }

    /// Create a set from category strings, ignoring unknown names.
    pub fn from_strings<I, S>(strings: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        strings
            .into_iter()
            .filter_map(|s| ApiCategory::parse(s.as_ref()))
            .collect()
    }

    /// Add a category to the set.
    pub fn add(&mut self, category: ApiCategory) {
        self.categories.insert(category);
    }

    /// Check if the set contains a category.
    pub fn has(&self, category: ApiCategory) -> bool {
        self.categories.contains(&category)
    }

    /// Check if this set is a superset of another.
    pub fn contains_all(&self, other: &CategorySet) -> bool {
        other.categories.is_subset(&self.categories)
    }

    /// Iterate categories in a stable order.
    pub fn iter(&self) -> impl Iterator<Item = ApiCategory> + '_ {
        self.categories.iter().copied()
    }

    pub fn len(&self) -> usize {
        self.categories.len()
    }

    pub fn is_empty(&self) -> bool {
        self.categories.is_empty()
    }
}

impl FromIterator<ApiCategory> for CategorySet {
    fn from_iter<T: IntoIterator<Item = ApiCategory>>(iter: T) -> Self {
        Self {
            categories: iter.into_iter().collect(),
        }
    }
}

/// Limits and API access for one trust level.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SecurityPermissions {
    /// Categories the script may use.
    pub allowed: CategorySet,

    /// Categories explicitly refused. Deny wins over allow.
    #[serde(default)]
    pub denied: CategorySet,

    /// Memory ceiling per execution, in bytes above the sandbox baseline.
    pub max_memory_bytes: usize,

    /// Wall-clock budget per execution.
    #[serde(with = "duration_ms")]
    pub max_execution_time: Duration,

    /// Maximum script call depth.
    pub max_call_depth: u32,
}

impl SecurityPermissions {
    /// Default permissions for a trust level.
    pub fn for_trust(level: TrustLevel) -> Self {
        match level {
            TrustLevel::Trusted => Self {
                allowed: CategorySet::all(),
                denied: CategorySet::new(),
                max_memory_bytes: 256 * 1024 * 1024,
                max_execution_time: Duration::from_secs(5),
                max_call_depth: 200,
            },
            TrustLevel::Safe => Self {
                allowed: CategorySet::all(),
                denied: CategorySet::new(),
                max_memory_bytes: 64 * 1024 * 1024,
                max_execution_time: Duration::from_secs(1),
                max_call_depth: 128,
            },
            TrustLevel::Untrusted => Self {
                allowed: [
                    ApiCategory::Entities,
                    ApiCategory::Events,
                    ApiCategory::Logging,
                    ApiCategory::GameData,
                ]
                .into_iter()
                .collect(),
                denied: [ApiCategory::SharedData, ApiCategory::Hooks]
                    .into_iter()
                    .collect(),
                max_memory_bytes: 16 * 1024 * 1024,
                max_execution_time: Duration::from_millis(250),
                max_call_depth: 64,
            },
        }
    }

    /// Whether a category is usable: allowed and not denied.
    pub fn permits(&self, category: ApiCategory) -> bool {
        self.allowed.has(category) && !self.denied.has(category)
    }

    /// Categories that are actually usable.
    pub fn effective(&self) -> CategorySet {
        self.allowed.iter().filter(|c| !self.denied.has(*c)).collect()
    }

    /// Narrow these permissions; the result never exceeds `self`.
    pub fn restrict(&self, other: &SecurityPermissions) -> SecurityPermissions {
        let mut denied = self.denied.clone();
        for c in other.denied.iter() {
            denied.add(c);
        }
        SecurityPermissions {
            allowed: self.allowed.iter().filter(|c| other.allowed.has(*c)).collect(),
            denied,
            max_memory_bytes: self.max_memory_bytes.min(other.max_memory_bytes),
            max_execution_time: self.max_execution_time.min(other.max_execution_time),
            max_call_depth: self.max_call_depth.min(other.max_call_depth),
        }
    }
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}

/// Log level for script logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

/// Opaque entity handle handed to scripts.
pub type EntityId = u64;

/// The capability surface a script executes against.
///
/// Implementations are per mod and must be safe to call from the sandbox's
/// worker threads. The sandbox checks categories before calling in; an
/// implementation may refuse further with
/// [`crate::RuntimeError::ExecutionSecurityViolation`].
pub trait ScriptApi: Send + Sync {
    /// Entities that carry a component.
    ///
    /// Requires: `ApiCategory::Entities`
    fn query_entities(&self, component: &str) -> RuntimeResult<Vec<EntityId>>;

    /// Read a component of an entity.
    ///
    /// Requires: `ApiCategory::Entities`
    fn get_component(&self, entity: EntityId, component: &str) -> RuntimeResult<Option<ParamValue>>;

    /// Publish an event to the host event bus.
    ///
    /// Requires: `ApiCategory::Events`
    fn publish_event(&self, name: &str, payload: ParamValue) -> RuntimeResult<()>;

    /// Log a message.
    ///
    /// Requires: `ApiCategory::Logging`
    fn log(&self, level: LogLevel, message: &str);

    /// Read a shared value.
    ///
    /// Requires: `ApiCategory::SharedData`
    fn shared_get(&self, key: &str) -> RuntimeResult<Option<ParamValue>>;

    /// Write a shared value.
    ///
    /// Requires: `ApiCategory::SharedData`
    fn shared_set(&self, key: &str, value: ParamValue) -> RuntimeResult<()>;

    /// Atomically replace a shared value when it still equals `expected`.
    ///
    /// Requires: `ApiCategory::SharedData`
    fn shared_compare_and_swap(
        &self,
        key: &str,
        expected: Option<ParamValue>,
        new: ParamValue,
    ) -> RuntimeResult<bool>;

    /// Register a script function as handler for a host hook point.
    ///
    /// Requires: `ApiCategory::Hooks`
    fn register_hook(&self, hook: &str, handler: &str) -> RuntimeResult<()>;

    /// Look up a static game-data record.
    ///
    /// Requires: `ApiCategory::GameData`
    fn lookup_data(&self, table: &str, key: &str) -> RuntimeResult<Option<ParamValue>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_untrusted_defaults() {
        let perms = SecurityPermissions::for_trust(TrustLevel::Untrusted);
        assert!(perms.permits(ApiCategory::Entities));
        assert!(perms.permits(ApiCategory::Logging));
        assert!(!perms.permits(ApiCategory::SharedData));
        assert!(!perms.permits(ApiCategory::Hooks));
        assert!(perms.max_execution_time < Duration::from_secs(1));
    }

    #[test]
    fn test_deny_wins() {
        let mut perms = SecurityPermissions::for_trust(TrustLevel::Trusted);
        assert!(perms.permits(ApiCategory::Hooks));
        perms.denied.add(ApiCategory::Hooks);
        assert!(!perms.permits(ApiCategory::Hooks));
        assert!(!perms.effective().has(ApiCategory::Hooks));
    }

    #[test]
    fn test_restrict_never_escalates() {
        let trusted = SecurityPermissions::for_trust(TrustLevel::Trusted);
        let untrusted = SecurityPermissions::for_trust(TrustLevel::Untrusted);
        let narrowed = untrusted.restrict(&trusted);
        assert_eq!(narrowed.max_memory_bytes, untrusted.max_memory_bytes);
        assert!(!narrowed.permits(ApiCategory::SharedData));
        assert!(trusted.effective().contains_all(&narrowed.effective()));
    }

    #[test]
    fn test_category_namespaces() {
        for category in ApiCategory::ALL {
            assert_eq!(ApiCategory::from_namespace(category.namespace()), Some(category));
            assert_eq!(ApiCategory::parse(category.as_str()), Some(category));
        }
        let set = CategorySet::from_strings(["logging", "events", "bogus"]);
        assert_eq!(set.len(), 2);
    }

    #[test]
    fn test_permissions_serialize_duration_as_millis() {
        let perms = SecurityPermissions::for_trust(TrustLevel::Untrusted);
        let json = serde_json::to_value(&perms).unwrap();
        assert_eq!(json["max_execution_time"], 250);
        let back: SecurityPermissions = serde_json::from_value(json).unwrap();
        assert_eq!(back, perms);
    }
}
