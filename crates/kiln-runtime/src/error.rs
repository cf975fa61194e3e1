//! Error types for the Kiln runtime.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Errors that can occur while discovering, resolving, validating,
/// compiling or executing mods.
#[derive(Error, Debug)]
pub enum RuntimeError {
    /// A manifest failed to parse or violated a field rule.
    #[error("Invalid manifest: {0}")]
    ManifestInvalid(String),

    /// A required dependency is not present.
    #[error("Mod '{mod_id}' requires '{dependency}', which is not installed")]
    DependencyMissing { mod_id: String, dependency: String },

    /// A dependency cycle was found. The chain starts at its lexically
    /// smallest member and follows dependency edges.
    #[error("Dependency cycle: {}", format_cycle(.cycle))]
    DependencyCyclic { cycle: Vec<String> },

    /// Version mismatch or declared incompatibility.
    #[error("Mod '{mod_id}' is incompatible with '{other}': {reason}")]
    DependencyIncompatible {
        mod_id: String,
        other: String,
        reason: String,
    },

    /// A dependency failed to resolve or load, so its dependent is blocked.
    #[error("Mod '{mod_id}' cannot load because dependency '{dependency}' failed")]
    DependencyFailed { mod_id: String, dependency: String },

    /// The same mod id was discovered more than once.
    #[error("Duplicate mod id: {0}")]
    DuplicateMod(String),

    /// Static security validation rejected a script.
    #[error("Script '{script_id}' rejected by validation: {summary}")]
    ValidationRejected { script_id: String, summary: String },

    /// The compiler refused or failed to compile a script.
    #[error("Compilation of '{script_id}' failed: {message}")]
    CompilationFailed { script_id: String, message: String },

    /// Execution ran past its time budget.
    #[error("Execution of '{0}' timed out")]
    ExecutionTimedOut(String),

    /// Execution exceeded its memory ceiling.
    #[error("Execution of '{0}' exceeded its memory ceiling")]
    ExecutionMemoryExceeded(String),

    /// A script touched a capability it was not granted.
    #[error("Security violation: {0}")]
    ExecutionSecurityViolation(String),

    /// Unhandled script error.
    #[error("Execution fault: {0}")]
    ExecutionFaulted(String),

    /// A resolved path left its mod root.
    #[error("Path '{path}' escapes mod root '{root}'")]
    PathEscape { path: String, root: String },

    /// No mod with the given id is known.
    #[error("Mod not found: {0}")]
    ModNotFound(String),

    /// No script with the given id is known.
    #[error("Script not found: {0}")]
    ScriptNotFound(String),

    /// A hook name was used that the host never defined.
    #[error("Unknown hook: {0}")]
    UnknownHook(String),

    /// The operation is not supported by this implementation.
    #[error("Unsupported: {0}")]
    Unsupported(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// TOML parsing error.
    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),
}

fn format_cycle(cycle: &[String]) -> String {
    match cycle.first() {
        Some(first) => format!("{} -> {}", cycle.join(" -> "), first),
        None => String::from("<empty>"),
    }
}

/// Machine-readable classification of a [`RuntimeError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    ManifestInvalid,
    DependencyMissing,
    DependencyCyclic,
    DependencyIncompatible,
    DependencyFailed,
    DuplicateMod,
    ValidationRejected,
    CompilationFailed,
    ExecutionTimedOut,
    ExecutionMemoryExceeded,
    ExecutionSecurityViolation,
    ExecutionFaulted,
    PathEscape,
    NotFound,
    Unsupported,
    Io,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::ManifestInvalid => "manifest_invalid",
            ErrorKind::DependencyMissing => "dependency_missing",
            ErrorKind::DependencyCyclic => "dependency_cyclic",
            ErrorKind::DependencyIncompatible => "dependency_incompatible",
            ErrorKind::DependencyFailed => "dependency_failed",
            ErrorKind::DuplicateMod => "duplicate_mod",
            ErrorKind::ValidationRejected => "validation_rejected",
            ErrorKind::CompilationFailed => "compilation_failed",
            ErrorKind::ExecutionTimedOut => "execution_timed_out",
            ErrorKind::ExecutionMemoryExceeded => "execution_memory_exceeded",
            ErrorKind::ExecutionSecurityViolation => "execution_security_violation",
            ErrorKind::ExecutionFaulted => "execution_faulted",
            ErrorKind::PathEscape => "path_escape",
            ErrorKind::NotFound => "not_found",
            ErrorKind::Unsupported => "unsupported",
            ErrorKind::Io => "io",
        };
        f.write_str(s)
    }
}

impl RuntimeError {
    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            RuntimeError::ManifestInvalid(_) | RuntimeError::Json(_) | RuntimeError::Toml(_) => {
                ErrorKind::ManifestInvalid
            }
            RuntimeError::DependencyMissing { .. } => ErrorKind::DependencyMissing,
            RuntimeError::DependencyCyclic { .. } => ErrorKind::DependencyCyclic,
            RuntimeError::DependencyIncompatible { .. } => ErrorKind::DependencyIncompatible,
            RuntimeError::DependencyFailed { .. } => ErrorKind::DependencyFailed,
            RuntimeError::DuplicateMod(_) => ErrorKind::DuplicateMod,
            RuntimeError::ValidationRejected { .. } => ErrorKind::ValidationRejected,
            RuntimeError::CompilationFailed { .. } => ErrorKind::CompilationFailed,
            RuntimeError::ExecutionTimedOut(_) => ErrorKind::ExecutionTimedOut,
            RuntimeError::ExecutionMemoryExceeded(_) => ErrorKind::ExecutionMemoryExceeded,
            RuntimeError::ExecutionSecurityViolation(_) => ErrorKind::ExecutionSecurityViolation,
            RuntimeError::ExecutionFaulted(_) => ErrorKind::ExecutionFaulted,
            RuntimeError::PathEscape { .. } => ErrorKind::PathEscape,
            RuntimeError::ModNotFound(_)
            | RuntimeError::ScriptNotFound(_)
            | RuntimeError::UnknownHook(_) => ErrorKind::NotFound,
            RuntimeError::Unsupported(_) => ErrorKind::Unsupported,
            RuntimeError::Io(_) => ErrorKind::Io,
        }
    }

    /// Shorthand for a field-level manifest error.
    pub fn manifest(msg: impl Into<String>) -> Self {
        RuntimeError::ManifestInvalid(msg.into())
    }
}

/// Result type for runtime operations.
pub type RuntimeResult<T> = std::result::Result<T, RuntimeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cycle_message_names_chain() {
        let err = RuntimeError::DependencyCyclic {
            cycle: vec!["a".to_string(), "b".to_string()],
        };
        assert_eq!(err.to_string(), "Dependency cycle: a -> b -> a");
        assert_eq!(err.kind(), ErrorKind::DependencyCyclic);
    }

    #[test]
    fn test_kind_serializes_snake_case() {
        let json = serde_json::to_string(&ErrorKind::ExecutionTimedOut).unwrap();
        assert_eq!(json, "\"execution_timed_out\"");
        assert_eq!(ErrorKind::ExecutionTimedOut.to_string(), "execution_timed_out");
    }
}
