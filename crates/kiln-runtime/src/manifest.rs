//! Mod manifest parsing.
//!
//! Each mod directory has a `mod.json` file that describes its identity,
//! dependencies, ordering hints, trust level and entry point:
//!
//! ```json
//! {
//!   "id": "better-berries",
//!   "name": "Better Berries",
//!   "version": "1.2.0",
//!   "apiVersion": "^1.0",
//!   "dependencies": [{ "modId": "core-items", "version": ">=2.1" }],
//!   "loadAfter": ["ui-tweaks"],
//!   "trustLevel": "untrusted",
//!   "entryPoint": "scripts/main.lua"
//! }
//! ```

use crate::capability::TrustLevel;
use crate::error::{RuntimeError, RuntimeResult};
use crate::version::{Version, VersionReq};
use serde::{Deserialize, Serialize};
use std::path::{Component, Path};

/// File name of the manifest inside a mod directory.
pub const MANIFEST_FILE: &str = "mod.json";

/// Longest accepted mod id.
pub const MAX_ID_LEN: usize = 64;

/// Mod manifest structure. Immutable once parsed.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModManifest {
    /// Unique identifier; also the dependency-graph key.
    pub id: String,

    /// Human-readable name.
    pub name: String,

    /// Mod version.
    pub version: Version,

    /// Host API versions this mod works with.
    pub api_version: VersionReq,

    /// Mod description.
    #[serde(default)]
    pub description: Option<String>,

    /// Mod author(s).
    #[serde(default)]
    pub authors: Vec<String>,

    /// Declared dependencies.
    #[serde(default)]
    pub dependencies: Vec<ModDependency>,

    /// Mods this one should load after, when present.
    #[serde(default)]
    pub load_after: Vec<String>,

    /// Mods this one should load before, when present.
    #[serde(default)]
    pub load_before: Vec<String>,

    /// Mods that must not be loaded together with this one.
    #[serde(default)]
    pub incompatible_with: Vec<String>,

    /// Trust classification controlling permissions.
    #[serde(default)]
    pub trust_level: TrustLevel,

    /// Entry script, relative to the mod root.
    pub entry_point: String,

    /// Additional scripts loaded after the entry point.
    #[serde(default)]
    pub scripts: Vec<String>,

    /// `sha256:<hex>` digest of the entry script.
    #[serde(default)]
    pub checksum: Option<String>,
}

/// A declared dependency on another mod.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModDependency {
    /// Id of the mod depended upon.
    pub mod_id: String,

    /// Required version range, if any.
    #[serde(default)]
    pub version: Option<VersionReq>,

    /// Optional dependencies order the load but never block it.
    #[serde(default)]
    pub optional: bool,
}

impl ModDependency {
    /// Whether a candidate version satisfies this dependency.
    pub fn accepts(&self, version: &Version) -> bool {
        self.version.as_ref().map_or(true, |req| req.matches(version))
    }
}

impl ModManifest {
    /// Load a manifest from a JSON file.
    pub fn from_file(path: &Path) -> RuntimeResult<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_str(&content)
    }

    /// Parse a manifest from a JSON string.
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(content: &str) -> RuntimeResult<Self> {
        let manifest: ModManifest = serde_json::from_str(content)
            .map_err(|e| RuntimeError::manifest(format!("malformed manifest: {}", e)))?;
        manifest.validate()?;
        Ok(manifest)
    }

    /// Validate the manifest.
    fn validate(&self) -> RuntimeResult<()> {
        validate_mod_id(&self.id).map_err(|e| RuntimeError::manifest(format!("id: {}", e)))?;

        if self.name.trim().is_empty() {
            return Err(RuntimeError::manifest("name cannot be empty"));
        }

        for dep in &self.dependencies {
            self.check_reference("dependencies", &dep.mod_id)?;
        }
        for id in &self.load_after {
            self.check_reference("loadAfter", id)?;
        }
        for id in &self.load_before {
            self.check_reference("loadBefore", id)?;
        }
        for id in &self.incompatible_with {
            self.check_reference("incompatibleWith", id)?;
        }

        validate_relative_path(&self.entry_point)
            .map_err(|e| RuntimeError::manifest(format!("entryPoint: {}", e)))?;
        for script in &self.scripts {
            validate_relative_path(script)
                .map_err(|e| RuntimeError::manifest(format!("scripts: {}", e)))?;
        }

        if let Some(checksum) = &self.checksum {
            parse_checksum(checksum)
                .map_err(|e| RuntimeError::manifest(format!("checksum: {}", e)))?;
        }

        Ok(())
    }

    fn check_reference(&self, field: &str, id: &str) -> RuntimeResult<()> {
        validate_mod_id(id).map_err(|e| RuntimeError::manifest(format!("{}: {}", field, e)))?;
        if id == self.id {
            return Err(RuntimeError::manifest(format!(
                "{}: mod '{}' cannot reference itself",
                field, id
            )));
        }
        Ok(())
    }

    /// Required (non-optional) dependencies.
    pub fn required_dependencies(&self) -> impl Iterator<Item = &ModDependency> {
        self.dependencies.iter().filter(|d| !d.optional)
    }

    /// Every script path of this mod, entry point first.
    pub fn script_paths(&self) -> impl Iterator<Item = &str> {
        std::iter::once(self.entry_point.as_str()).chain(self.scripts.iter().map(String::as_str))
    }

    /// The expected entry-point digest as lowercase hex, if declared.
    pub fn checksum_hex(&self) -> Option<&str> {
        self.checksum.as_deref().and_then(|c| parse_checksum(c).ok())
    }
}

/// Check a mod id against the naming rules.
///
/// Ids become graph keys and directory names, so anything that could act as
/// a path separator or traversal is refused.
pub fn validate_mod_id(id: &str) -> Result<(), String> {
    if id.is_empty() {
        return Err("mod id cannot be empty".to_string());
    }
    if id.len() > MAX_ID_LEN {
        return Err(format!("mod id longer than {} characters", MAX_ID_LEN));
    }
    if id.starts_with('.') || id.contains("..") {
        return Err(format!("mod id '{}' contains a traversal sequence", id));
    }
    if let Some(c) = id
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.')))
    {
        return Err(format!("mod id '{}' contains invalid character {:?}", id, c));
    }
    Ok(())
}

/// Check that a manifest path is relative and has no parent segments.
pub fn validate_relative_path(path: &str) -> Result<(), String> {
    if path.trim().is_empty() {
        return Err("path cannot be empty".to_string());
    }
    if path.contains('\\') || path.contains(':') {
        return Err(format!("path '{}' must use '/' and no drive prefix", path));
    }
    for component in Path::new(path).components() {
        match component {
            Component::Normal(_) | Component::CurDir => {}
            _ => return Err(format!("path '{}' must stay inside the mod root", path)),
        }
    }
    Ok(())
}

/// Split `sha256:<hex>` into its hex digest.
pub fn parse_checksum(checksum: &str) -> Result<&str, String> {
    let hex = checksum
        .strip_prefix("sha256:")
        .ok_or_else(|| format!("'{}' must start with 'sha256:'", checksum))?;
    if hex.len() != 64 || !hex.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err("digest must be 64 hex characters".to_string());
    }
    Ok(hex)
}
