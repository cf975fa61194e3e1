//! # kiln-runtime
//!
//! Mechanisms for loading and running untrusted Lua mods in Kiln.
//!
//! This crate provides:
//! - Mod discovery from well-known paths, with path confinement
//! - Mod manifest parsing and semantic versions
//! - Dependency resolution with cycle reporting and partial failure
//! - Static security validation of script source
//! - Script compilation with a content-addressed cache
//! - Sandboxed execution with time, memory and call-depth limits
//! - Performance budgets and a security audit log
//!
//! ## Mod Structure
//!
//! Mods are directories containing:
//! - `mod.json` - Manifest with identity, dependencies and trust level
//! - `main.lua` (or the manifest's `entryPoint`) - Entry script
//! - further scripts listed under `scripts`
//!
//! ## Security Model
//!
//! A mod's trust level fixes its [`SecurityPermissions`]. Scripts are
//! validated against those permissions before compilation, the compiler
//! re-checks the import surface, and the sandbox binds only the capability
//! tables the permissions allow. Permissions are never raised at runtime.

pub mod analysis;
pub mod artifact;
pub mod audit;
pub mod capability;
pub mod compiler;
pub mod diagnostic;
pub mod discovery;
pub mod error;
pub mod lexer;
pub mod manifest;
pub mod metrics;
pub mod params;
pub mod resolver;
pub mod sandbox;
pub mod source;
pub mod validator;
pub mod version;

pub use artifact::{Artifact, ArtifactStore};
pub use audit::{AuditLog, AuditRecord};
pub use capability::{
    ApiCategory, CategorySet, EntityId, LogLevel, ScriptApi, SecurityPermissions, TrustLevel,
};
pub use compiler::{CompileOptions, CompiledScript, ScriptCompiler};
pub use diagnostic::{Diagnostic, Severity};
pub use discovery::{discover_in_roots, discover_mod, discover_mods, Discovery, ModPath};
pub use error::{ErrorKind, RuntimeError, RuntimeResult};
pub use manifest::{ModDependency, ModManifest};
pub use metrics::{BudgetViolation, PerformanceBudget, PerformanceMonitor, Stage};
pub use params::{ParamValue, ValueBudget, ValueLimits};
pub use resolver::{DependencyGraph, DependencyResolver, Resolution, ResolveIssue};
pub use sandbox::{
    ExecutionContext, ExecutionResult, ExecutionState, SandboxConfig, SandboxEventKind,
    ScriptSandbox,
};
pub use source::{
    DirectoryScriptProvider, MemoryScriptProvider, ScriptProvider, ScriptSource,
};
pub use validator::{SecurityValidator, ValidationPolicy, ValidationReport, Verdict};
pub use version::{Version, VersionReq};
