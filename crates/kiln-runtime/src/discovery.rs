//! Mod discovery from configured and well-known paths.
//!
//! Mods are discovered from the following locations (in order):
//!
//! 1. Directories passed by the caller (configuration order)
//! 2. `$XDG_DATA_HOME/kiln/mods/` (user mods)
//!
//! Each mod is a directory containing a `mod.json` manifest. When the same id
//! appears under more than one root, the earlier root wins and the later copy
//! is shadowed. Two directories with the same id under one root are both kept
//! and left for the resolver to report as duplicates.

use crate::error::{ErrorKind, RuntimeError, RuntimeResult};
use crate::manifest::{validate_relative_path, ModManifest, MANIFEST_FILE};
use serde::Serialize;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Information about a discovered mod.
#[derive(Debug, Clone)]
pub struct ModPath {
    /// Path to the mod directory.
    pub path: PathBuf,

    /// Parsed manifest.
    pub manifest: ModManifest,

    /// Index of the root the mod was found under; lower is higher priority.
    pub priority: usize,
}

impl ModPath {
    /// Get the mod ID.
    pub fn id(&self) -> &str {
        &self.manifest.id
    }

    /// Get the mod name.
    pub fn name(&self) -> &str {
        &self.manifest.name
    }

    /// Resolve the entry point inside the mod root.
    pub fn entry_point_path(&self) -> RuntimeResult<PathBuf> {
        resolve_in_root(&self.path, &self.manifest.entry_point)
    }

    /// Resolve every script of the mod, entry point first.
    pub fn script_paths(&self) -> RuntimeResult<Vec<PathBuf>> {
        self.manifest
            .script_paths()
            .map(|p| resolve_in_root(&self.path, p))
            .collect()
    }
}

/// A mod directory whose manifest could not be used.
#[derive(Debug, Clone, Serialize)]
pub struct DiscoveryFailure {
    pub path: PathBuf,
    pub kind: ErrorKind,
    pub reason: String,
}

/// Everything found while scanning mod roots.
#[derive(Debug, Clone, Default)]
pub struct Discovery {
    /// Usable mods in priority order.
    pub mods: Vec<ModPath>,

    /// Directories with a broken manifest.
    pub failures: Vec<DiscoveryFailure>,

    /// Mods hidden by a same-id mod from a higher-priority root.
    pub shadowed: Vec<ModPath>,
}

/// Get the user mods directory.
pub fn user_mods_dir() -> Option<PathBuf> {
    directories::ProjectDirs::from("dev", "kiln", "kiln").map(|dirs| dirs.data_dir().join("mods"))
}

/// Discover mods from the given roots followed by the user mods directory.
pub fn discover_mods(roots: &[PathBuf]) -> Discovery {
    let mut all: Vec<PathBuf> = roots.to_vec();
    if let Some(user_dir) = user_mods_dir() {
        if !all.contains(&user_dir) {
            all.push(user_dir);
        }
    }
    discover_in_roots(&all)
}

/// Discover mods from exactly these roots, in priority order.
pub fn discover_in_roots(roots: &[PathBuf]) -> Discovery {
    let mut discovery = Discovery::default();
    let mut seen_ids = HashSet::new();

    for (priority, root) in roots.iter().enumerate() {
        debug!("Scanning mods directory: {:?}", root);
        let mut found = Vec::new();
        discover_in_directory(root, priority, &mut found, &mut discovery.failures);

        let mut root_ids = HashSet::new();
        for mod_path in found {
            let id = mod_path.id().to_string();
            if seen_ids.contains(&id) && !root_ids.contains(&id) {
                debug!("Skipping shadowed mod: {} at {:?}", id, mod_path.path);
                discovery.shadowed.push(mod_path);
                continue;
            }
            root_ids.insert(id);
            discovery.mods.push(mod_path);
        }
        seen_ids.extend(root_ids);
    }

    info!(
        mods = discovery.mods.len(),
        failures = discovery.failures.len(),
        "Discovered mods"
    );
    discovery
}

/// Discover mods directly under one directory, sorted by directory name.
pub fn discover_in_directory(
    dir: &Path,
    priority: usize,
    mods: &mut Vec<ModPath>,
    failures: &mut Vec<DiscoveryFailure>,
) {
    if !dir.exists() {
        return;
    }

    let entries = match std::fs::read_dir(dir) {
        Ok(e) => e,
        Err(e) => {
            warn!("Failed to read mods directory {:?}: {}", dir, e);
            return;
        }
    };

    let mut paths: Vec<PathBuf> = entries
        .flatten()
        .map(|entry| entry.path())
        .filter(|path| path.is_dir())
        .collect();
    paths.sort();

    for path in paths {
        let manifest_path = path.join(MANIFEST_FILE);
        if !manifest_path.exists() {
            debug!("Skipping {:?}: no {}", path, MANIFEST_FILE);
            continue;
        }

        match discover_mod(&path, priority) {
            Ok(mod_path) => {
                info!(
                    "Discovered mod: {} v{} at {:?}",
                    mod_path.manifest.name, mod_path.manifest.version, path
                );
                mods.push(mod_path);
            }
            Err(e) => {
                warn!("Failed to load manifest from {:?}: {}", manifest_path, e);
                failures.push(DiscoveryFailure {
                    path,
                    kind: e.kind(),
                    reason: e.to_string(),
                });
            }
        }
    }
}

/// Discover a single mod from a path.
pub fn discover_mod(path: &Path, priority: usize) -> RuntimeResult<ModPath> {
    let manifest = ModManifest::from_file(&path.join(MANIFEST_FILE))?;

    Ok(ModPath {
        path: path.to_path_buf(),
        manifest,
        priority,
    })
}

/// Resolve a manifest-relative path inside a mod root.
///
/// Symlinks are followed; the canonical result must still lie under the
/// canonical root, otherwise the path is refused.
pub fn resolve_in_root(root: &Path, relative: &str) -> RuntimeResult<PathBuf> {
    let escape = || RuntimeError::PathEscape {
        path: relative.to_string(),
        root: root.display().to_string(),
    };

    validate_relative_path(relative).map_err(|_| escape())?;

    let canonical_root = root.canonicalize()?;
    let resolved = canonical_root.join(relative).canonicalize()?;
    if !resolved.starts_with(&canonical_root) {
        return Err(escape());
    }
    Ok(resolved)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn create_test_mod(dir: &Path, dir_name: &str, id: &str) {
        let mod_dir = dir.join(dir_name);
        std::fs::create_dir_all(&mod_dir).unwrap();

        let manifest = format!(
            r#"{{
                "id": "{id}",
                "name": "Test Mod {id}",
                "version": "0.1.0",
                "apiVersion": "^1.0",
                "entryPoint": "main.lua"
            }}"#
        );
        std::fs::write(mod_dir.join(MANIFEST_FILE), manifest).unwrap();
        std::fs::write(mod_dir.join("main.lua"), "-- empty\n").unwrap();
    }

    #[test]
    fn test_discover_in_directory() {
        let temp_dir = TempDir::new().unwrap();

        create_test_mod(temp_dir.path(), "mod-b", "mod-b");
        create_test_mod(temp_dir.path(), "mod-a", "mod-a");
        std::fs::create_dir_all(temp_dir.path().join("not-a-mod")).unwrap();

        let mut mods = Vec::new();
        let mut failures = Vec::new();
        discover_in_directory(temp_dir.path(), 0, &mut mods, &mut failures);

        assert_eq!(mods.len(), 2);
        assert_eq!(mods[0].id(), "mod-a");
        assert_eq!(mods[1].id(), "mod-b");
        assert!(failures.is_empty());
    }

    #[test]
    fn test_mod_priority() {
        let temp_dir = TempDir::new().unwrap();

        let dir1 = temp_dir.path().join("dir1");
        let dir2 = temp_dir.path().join("dir2");
        create_test_mod(&dir1, "same", "same-id");
        create_test_mod(&dir2, "same", "same-id");

        let discovery = discover_in_roots(&[dir1.clone(), dir2]);

        assert_eq!(discovery.mods.len(), 1);
        assert!(discovery.mods[0].path.starts_with(&dir1));
        assert_eq!(discovery.shadowed.len(), 1);
    }

    #[test]
    fn test_duplicates_within_root_are_kept() {
        let temp_dir = TempDir::new().unwrap();
        create_test_mod(temp_dir.path(), "first", "dup");
        create_test_mod(temp_dir.path(), "second", "dup");

        let discovery = discover_in_roots(&[temp_dir.path().to_path_buf()]);
        assert_eq!(discovery.mods.len(), 2);
    }

    #[test]
    fn test_broken_manifest_is_reported() {
        let temp_dir = TempDir::new().unwrap();
        let broken = temp_dir.path().join("broken");
        std::fs::create_dir_all(&broken).unwrap();
        std::fs::write(broken.join(MANIFEST_FILE), "{ not json").unwrap();

        let discovery = discover_in_roots(&[temp_dir.path().to_path_buf()]);
        assert!(discovery.mods.is_empty());
        assert_eq!(discovery.failures.len(), 1);
        assert_eq!(discovery.failures[0].kind, ErrorKind::ManifestInvalid);
    }

    #[test]
    fn test_resolve_in_root() {
        let temp_dir = TempDir::new().unwrap();
        create_test_mod(temp_dir.path(), "m", "m");
        let root = temp_dir.path().join("m");

        let resolved = resolve_in_root(&root, "main.lua").unwrap();
        assert!(resolved.ends_with("main.lua"));

        let err = resolve_in_root(&root, "../m/main.lua").unwrap_err();
        assert!(matches!(err, RuntimeError::PathEscape { .. }));
    }

    #[cfg(unix)]
    #[test]
    fn test_symlink_escape_is_refused() {
        let temp_dir = TempDir::new().unwrap();
        create_test_mod(temp_dir.path(), "m", "m");
        let outside = temp_dir.path().join("secret.lua");
        std::fs::write(&outside, "return 1").unwrap();
        let root = temp_dir.path().join("m");
        std::os::unix::fs::symlink(&outside, root.join("link.lua")).unwrap();

        let err = resolve_in_root(&root, "link.lua").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::PathEscape);
    }
}
