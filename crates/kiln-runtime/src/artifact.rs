//! Compiled-script artifact format and on-disk store.
//!
//! Artifacts (`.kca`) let verified compilations survive restarts. They hold
//! the verified source with its metadata, never a Lua binary chunk, so an
//! imported artifact goes through the same checks as fresh source.
//!
//! ## Format
//!
//! ```text
//! +----------------+
//! | Magic (4 bytes)|  "KCA\x01" (version 1)
//! +----------------+
//! | JSON document  |  Artifact
//! +----------------+
//! ```

use crate::capability::ApiCategory;
use crate::diagnostic::Diagnostic;
use crate::error::{RuntimeError, RuntimeResult};
use crate::source::content_hash;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Magic bytes for Kiln compiled artifacts.
pub const MAGIC: &[u8; 4] = b"KCA\x01";

/// Current artifact format version.
pub const FORMAT_VERSION: u8 = 1;

/// Serialized form of a compiled script.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Artifact {
    /// Version of the artifact format.
    pub version: u8,

    /// Metadata embedded in the artifact.
    pub metadata: ArtifactMetadata,

    /// Verified source text.
    pub source: String,

    /// Diagnostics produced when the script was compiled.
    pub diagnostics: Vec<Diagnostic>,

    /// Global functions the script exposes.
    pub entry_points: Vec<String>,

    /// API categories the script references.
    pub required: Vec<ApiCategory>,
}

/// Metadata embedded in an artifact.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArtifactMetadata {
    /// Script id the artifact was compiled from.
    pub source_id: String,

    /// SHA-256 of the source, lowercase hex.
    pub content_hash: String,

    /// Compilation timestamp.
    pub compiled_at: DateTime<Utc>,

    /// Version of the compiler that produced it.
    pub compiler_version: String,
}

fn failed(source_id: &str, message: impl Into<String>) -> RuntimeError {
    RuntimeError::CompilationFailed {
        script_id: source_id.to_string(),
        message: message.into(),
    }
}

impl Artifact {
    /// Encode with the magic header.
    pub fn to_bytes(&self) -> RuntimeResult<Vec<u8>> {
        let mut bytes = MAGIC.to_vec();
        serde_json::to_writer(&mut bytes, self)?;
        Ok(bytes)
    }

    /// Parse artifact bytes.
    pub fn parse(bytes: &[u8]) -> RuntimeResult<Self> {
        if bytes.len() < 4 {
            return Err(failed("<artifact>", "file too small to be an artifact"));
        }
        if &bytes[0..3] != b"KCA" {
            return Err(failed("<artifact>", "missing artifact header"));
        }
        if &bytes[0..4] != MAGIC {
            return Err(failed(
                "<artifact>",
                format!("unsupported artifact format version {}", bytes[3]),
            ));
        }

        let content = std::str::from_utf8(&bytes[4..])
            .map_err(|e| failed("<artifact>", format!("invalid UTF-8: {}", e)))?;
        serde_json::from_str(content)
            .map_err(|e| failed("<artifact>", format!("invalid artifact JSON: {}", e)))
    }

    /// Check version and that the embedded hash matches the embedded source.
    pub fn validate(&self) -> RuntimeResult<()> {
        let id = &self.metadata.source_id;
        if self.version != FORMAT_VERSION {
            return Err(failed(
                id,
                format!("unsupported artifact version: {}", self.version),
            ));
        }
        let actual = content_hash(&self.source);
        if actual != self.metadata.content_hash {
            return Err(failed(
                id,
                format!(
                    "artifact hash mismatch: recorded {}, computed {}",
                    self.metadata.content_hash, actual
                ),
            ));
        }
        Ok(())
    }
}

/// Directory of persisted artifacts keyed by source id and content hash.
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    dir: PathBuf,
}

impl ArtifactStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// File name for a key; ids are flattened so they cannot leave the
    /// store directory.
    fn path_for(&self, source_id: &str, content_hash: &str) -> PathBuf {
        let flat: String = source_id
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || matches!(c, '-' | '_') {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        let short = content_hash.get(..16).unwrap_or(content_hash);
        self.dir.join(format!("{}-{}.kca", flat, short))
    }

    /// Persist an artifact, returning where it was written.
    pub fn save(&self, artifact: &Artifact) -> RuntimeResult<PathBuf> {
        std::fs::create_dir_all(&self.dir)?;
        let path = self.path_for(
            &artifact.metadata.source_id,
            &artifact.metadata.content_hash,
        );
        std::fs::write(&path, artifact.to_bytes()?)?;
        debug!(path = %path.display(), "Saved artifact");
        Ok(path)
    }

    /// Load and validate the artifact for a key, if one is stored.
    pub fn load(&self, source_id: &str, content_hash: &str) -> RuntimeResult<Option<Artifact>> {
        let path = self.path_for(source_id, content_hash);
        if !path.exists() {
            return Ok(None);
        }
        let artifact = Artifact::parse(&std::fs::read(&path)?)?;
        artifact.validate()?;
        if artifact.metadata.source_id != source_id || artifact.metadata.content_hash != content_hash
        {
            return Err(failed(source_id, "artifact belongs to a different script"));
        }
        Ok(Some(artifact))
    }

    /// Remove every artifact of a source id. Returns how many were removed.
    pub fn remove(&self, source_id: &str) -> RuntimeResult<usize> {
        let prefix = self.path_for(source_id, "");
        let Some(prefix) = prefix.file_name().and_then(|n| n.to_str()) else {
            return Ok(0);
        };
        let prefix = prefix.trim_end_matches(".kca").to_string();
        if !self.dir.exists() {
            return Ok(0);
        }

        let mut removed = 0;
        for entry in std::fs::read_dir(&self.dir)?.flatten() {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            let Some(rest) = name.strip_prefix(&prefix) else {
                continue;
            };
            // The remainder is exactly `<16 hex>.kca`.
            if rest.len() == 20 && rest.ends_with(".kca") {
                std::fs::remove_file(entry.path())?;
                removed += 1;
            }
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn sample_artifact() -> Artifact {
        let source = "function init() end".to_string();
        Artifact {
            version: FORMAT_VERSION,
            metadata: ArtifactMetadata {
                source_id: "demo/main.lua".to_string(),
                content_hash: content_hash(&source),
                compiled_at: Utc::now(),
                compiler_version: "test".to_string(),
            },
            source,
            diagnostics: vec![],
            entry_points: vec!["init".to_string()],
            required: vec![ApiCategory::Logging],
        }
    }

    #[test]
    fn test_artifact_bytes() {
        let bytes = sample_artifact().to_bytes().unwrap();
        assert_eq!(&bytes[..4], MAGIC);
        let parsed = Artifact::parse(&bytes).unwrap();
        assert_eq!(parsed.entry_points, vec!["init"]);
        assert!(parsed.validate().is_ok());
    }

    #[test]
    fn test_rejects_bad_headers() {
        assert!(Artifact::parse(b"KC").is_err());
        assert!(Artifact::parse(b"{\"version\":1}").is_err());

        let mut bytes = sample_artifact().to_bytes().unwrap();
        bytes[3] = 2;
        let err = Artifact::parse(&bytes).unwrap_err();
        assert!(err.to_string().contains("version 2"));
    }

    #[test]
    fn test_tampered_source_fails_validation() {
        let mut artifact = sample_artifact();
        artifact.source.push_str("\nos.exit()");
        assert!(matches!(
            artifact.validate(),
            Err(RuntimeError::CompilationFailed { .. })
        ));
    }

    #[test]
    fn test_store_save_load_remove() {
        let temp = TempDir::new().unwrap();
        let store = ArtifactStore::new(temp.path().join("artifacts"));
        let artifact = sample_artifact();
        let hash = artifact.metadata.content_hash.clone();

        let path = store.save(&artifact).unwrap();
        assert!(path.starts_with(store.dir()));
        assert!(!path.file_name().unwrap().to_str().unwrap().contains('/'));

        let loaded = store.load("demo/main.lua", &hash).unwrap().unwrap();
        assert_eq!(loaded.source, artifact.source);
        assert!(store.load("demo/main.lua", &"0".repeat(64)).unwrap().is_none());

        assert_eq!(store.remove("demo/main.lua").unwrap(), 1);
        assert!(store.load("demo/main.lua", &hash).unwrap().is_none());
    }
}
