//! Configuration file loading and management
//!
//! This module handles loading and parsing the daemon configuration from
//! `$XDG_CONFIG_HOME/kiln/config.toml`. If the configuration file doesn't
//! exist, a default configuration is created with documented comments.

use anyhow::{Context, Result};
use kiln_mod_api::LoaderConfig;
use kiln_runtime::{
    ApiCategory, PerformanceBudget, SandboxConfig, SecurityPermissions, SecurityValidator,
    TrustLevel, ValidationPolicy, Version,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Main daemon configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    /// Daemon-specific configuration
    pub daemon: DaemonConfig,
    /// Discovery, lifecycle timeouts and hot reload
    pub loader: LoaderSettings,
    /// Sandbox tuning
    pub sandbox: SandboxSettings,
    /// Static analysis limits
    pub validator: ValidationPolicy,
    /// Performance budget checked by the monitor
    pub budget: PerformanceBudget,
    /// Security audit log
    pub audit: AuditConfig,
    /// Per-trust-level overrides, keyed by `safe`, `trusted` or `untrusted`
    pub trust: HashMap<String, TrustOverride>,
    /// Hook points mods may register handlers for, name to description
    pub hooks: BTreeMap<String, String>,
}

/// Daemon process configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DaemonConfig {
    /// Log level (trace, debug, info, warn, error)
    /// Default: "info"
    pub log_level: String,
}

/// Loader configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LoaderSettings {
    /// Mod roots in priority order. `--mods` on the command line replaces these.
    /// Default: ["mods"]
    pub mod_dirs: Vec<PathBuf>,
    /// Also scan the per-user mods directory after `mod_dirs`
    /// Default: true
    pub include_user_mods: bool,
    /// API version mods declare compatibility with
    /// Default: "1.0.0"
    pub host_api_version: String,
    /// Default: 2000
    pub init_timeout_ms: u64,
    /// Default: 1000
    pub shutdown_timeout_ms: u64,
    /// Default: 1000
    pub execute_timeout_ms: u64,
    /// Default: 2000
    pub compile_timeout_ms: u64,
    /// How often mod directories are polled for changes
    /// Default: 500
    pub watch_interval_ms: u64,
    /// Where compiled artifacts persist.
    /// If None, uses XDG_CACHE_HOME/kiln/artifacts
    #[serde(skip_serializing_if = "Option::is_none")]
    pub artifact_dir: Option<PathBuf>,
}

/// Sandbox configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SandboxSettings {
    /// Time an execution gets to unwind after cancellation
    /// Default: 100
    pub grace_period_ms: u64,
    /// VM instructions between memory and cancellation checks
    /// Default: 1000
    pub memory_poll_instructions: u32,
    /// Stack size of execution worker threads, in bytes
    /// Default: 8 MiB
    pub worker_stack_size: usize,
    /// Workers abandoned by the watchdog that may still be running before
    /// new executions are refused
    /// Default: 8
    pub max_abandoned_workers: usize,
}

/// Audit log configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AuditConfig {
    /// Append audit records as JSON lines to this file
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
}

/// Replacement limits for one trust level. Unset fields keep the built-in
/// value for that level.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TrustOverride {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub allowed: Option<Vec<ApiCategory>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub denied: Option<Vec<ApiCategory>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_memory_bytes: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_execution_time_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_call_depth: Option<u32>,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
        }
    }
}

impl Default for LoaderSettings {
    fn default() -> Self {
        Self {
            mod_dirs: vec![PathBuf::from("mods")],
            include_user_mods: true,
            host_api_version: "1.0.0".to_string(),
            init_timeout_ms: 2000,
            shutdown_timeout_ms: 1000,
            execute_timeout_ms: 1000,
            compile_timeout_ms: 2000,
            watch_interval_ms: 500,
            artifact_dir: None,
        }
    }
}

impl Default for SandboxSettings {
    fn default() -> Self {
        let defaults = SandboxConfig::default();
        Self {
            grace_period_ms: defaults.grace_period.as_millis() as u64,
            memory_poll_instructions: defaults.memory_poll_instructions,
            worker_stack_size: defaults.stack_size,
            max_abandoned_workers: defaults.max_abandoned_workers,
        }
    }
}

impl LoaderSettings {
    pub fn watch_interval(&self) -> Duration {
        Duration::from_millis(self.watch_interval_ms)
    }
}

impl TrustOverride {
    /// Built-in permissions for `level` with this override applied.
    pub fn apply(&self, level: TrustLevel) -> SecurityPermissions {
        let mut permissions = SecurityPermissions::for_trust(level);
        if let Some(allowed) = &self.allowed {
            permissions.allowed = allowed.iter().copied().collect();
        }
        if let Some(denied) = &self.denied {
            permissions.denied = denied.iter().copied().collect();
        }
        if let Some(bytes) = self.max_memory_bytes {
            permissions.max_memory_bytes = bytes;
        }
        if let Some(ms) = self.max_execution_time_ms {
            permissions.max_execution_time = Duration::from_millis(ms);
        }
        if let Some(depth) = self.max_call_depth {
            permissions.max_call_depth = depth;
        }
        permissions
    }
}

impl Config {
    /// Load configuration from the specified path
    ///
    /// # Arguments
    /// * `path` - Path to the configuration file
    ///
    /// # Returns
    /// The parsed configuration or an error if loading/parsing fails
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        config.validate()?;
        Ok(config)
    }

    /// Load configuration from the default XDG config location
    ///
    /// If the configuration file doesn't exist, creates a default configuration
    /// file with documented comments.
    pub fn load_default() -> Result<Self> {
        let config_path = Self::default_config_path()?;

        if !config_path.exists() {
            Self::create_default_file(&config_path)?;
        }

        Self::load(&config_path)
    }

    /// Get the default configuration file path
    ///
    /// Returns `$XDG_CONFIG_HOME/kiln/config.toml`
    pub fn default_config_path() -> Result<PathBuf> {
        let dirs = directories::ProjectDirs::from("dev", "kiln", "kiln")
            .context("Failed to determine project directories")?;

        Ok(dirs.config_dir().join("config.toml"))
    }

    fn create_default_file(path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        fs::write(path, Self::default_config_content())
            .with_context(|| format!("Failed to write default config file: {}", path.display()))?;

        tracing::info!("Created default configuration file at: {}", path.display());
        Ok(())
    }

    /// Generate the default configuration file content with comments
    fn default_config_content() -> String {
        r#"# Kiln Daemon Configuration
# This file configures how kiln-daemon discovers, validates and runs mods.

[daemon]
# Log level: trace, debug, info, warn, error
# RUST_LOG directives are applied on top of this.
# Default: "info"
log_level = "info"

[loader]
# Mod roots in priority order. A mod in an earlier root shadows a mod
# with the same id in a later one.
# Default: ["mods"]
mod_dirs = ["mods"]

# Also scan the per-user mods directory after mod_dirs
# Default: true
include_user_mods = true

# API version mods' apiVersion ranges are matched against
# Default: "1.0.0"
host_api_version = "1.0.0"

# Lifecycle timeouts in milliseconds
init_timeout_ms = 2000
shutdown_timeout_ms = 1000
execute_timeout_ms = 1000
compile_timeout_ms = 2000

# How often mod directories are polled for changes while running
# Default: 500
watch_interval_ms = 500

# Where compiled artifacts persist between runs
# If not specified, defaults to $XDG_CACHE_HOME/kiln/artifacts
# artifact_dir = "/path/to/artifacts"

[sandbox]
# Time an execution gets to unwind after it is cancelled
grace_period_ms = 100

# VM instructions between memory and cancellation checks
memory_poll_instructions = 1000

# Stack size of execution worker threads, in bytes
worker_stack_size = 8388608

# Abandoned workers that may still be running before new executions are refused
max_abandoned_workers = 8

[validator]
# Largest accepted script, in bytes
max_source_bytes = 524288

# Highest cyclomatic complexity per function
max_complexity = 60

# Deepest block or bracket nesting
max_nesting = 40

# Work units available to the analysis of one script
work_budget = 4000000

# Extra regular expressions that reject a script when matched
extra_patterns = []

[budget]
# Stage ceilings; exceeding one is logged, not fatal
compile_ms = 500
validate_ms = 250
execute_ms = 100
memory_bytes = 67108864

[audit]
# Append security audit records as JSON lines
# path = "/path/to/audit.jsonl"

[hooks]
# Hook points mods may register handlers for, with a description.
# Registering a handler for a hook not listed here fails the mod's init.
# on_tick = "Called once per simulation tick"

# Per-trust-level overrides. Unset fields keep the built-in limits.
# [trust.untrusted]
# allowed = ["entities", "events", "logging"]
# max_memory_bytes = 16777216
# max_execution_time_ms = 250
# max_call_depth = 64
"#
        .to_string()
    }

    /// Validate the configuration
    ///
    /// Ensures all configuration values are valid and within acceptable ranges.
    pub fn validate(&self) -> Result<()> {
        let valid_log_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_log_levels.contains(&self.daemon.log_level.as_str()) {
            anyhow::bail!(
                "Invalid log_level: {}. Must be one of: {}",
                self.daemon.log_level,
                valid_log_levels.join(", ")
            );
        }

        Version::parse(&self.loader.host_api_version).with_context(|| {
            format!("Invalid host_api_version: {}", self.loader.host_api_version)
        })?;

        let timeouts = [
            ("loader.init_timeout_ms", self.loader.init_timeout_ms),
            ("loader.shutdown_timeout_ms", self.loader.shutdown_timeout_ms),
            ("loader.execute_timeout_ms", self.loader.execute_timeout_ms),
            ("loader.compile_timeout_ms", self.loader.compile_timeout_ms),
            ("loader.watch_interval_ms", self.loader.watch_interval_ms),
            ("sandbox.grace_period_ms", self.sandbox.grace_period_ms),
        ];
        for (name, value) in timeouts {
            if value == 0 {
                anyhow::bail!("{} must be greater than 0", name);
            }
        }

        if self.sandbox.memory_poll_instructions == 0 {
            anyhow::bail!("sandbox.memory_poll_instructions must be greater than 0");
        }
        if self.sandbox.worker_stack_size == 0 {
            anyhow::bail!("sandbox.worker_stack_size must be greater than 0");
        }
        if self.sandbox.max_abandoned_workers == 0 {
            anyhow::bail!("sandbox.max_abandoned_workers must be greater than 0");
        }

        SecurityValidator::new(self.validator.clone()).context("Invalid [validator] settings")?;

        for (level, overrides) in &self.trust {
            if TrustLevel::parse(level).is_none() {
                anyhow::bail!(
                    "Unknown trust level: {}. Must be one of: safe, trusted, untrusted",
                    level
                );
            }
            if overrides.max_execution_time_ms == Some(0) {
                anyhow::bail!("trust.{}: max_execution_time_ms must be greater than 0", level);
            }
        }

        Ok(())
    }

    /// Get the artifact directory
    ///
    /// Returns the configured directory or the default XDG cache directory path
    pub fn artifact_dir(&self) -> Result<PathBuf> {
        if let Some(ref path) = self.loader.artifact_dir {
            return Ok(path.clone());
        }

        let dirs = directories::ProjectDirs::from("dev", "kiln", "kiln")
            .context("Failed to determine project directories")?;

        Ok(dirs.cache_dir().join("artifacts"))
    }

    /// Build the loader configuration these settings describe.
    pub fn loader_config(&self) -> Result<LoaderConfig> {
        self.validate()?;

        let host_api_version = Version::parse(&self.loader.host_api_version).with_context(|| {
            format!("Invalid host_api_version: {}", self.loader.host_api_version)
        })?;

        let mut trust = HashMap::new();
        for (name, overrides) in &self.trust {
            if let Some(level) = TrustLevel::parse(name) {
                trust.insert(level, overrides.apply(level));
            }
        }

        let sandbox = SandboxConfig {
            grace_period: Duration::from_millis(self.sandbox.grace_period_ms),
            memory_poll_instructions: self.sandbox.memory_poll_instructions,
            stack_size: self.sandbox.worker_stack_size,
            max_abandoned_workers: self.sandbox.max_abandoned_workers,
            ..SandboxConfig::default()
        };

        Ok(LoaderConfig {
            host_api_version,
            include_user_mods: self.loader.include_user_mods,
            init_timeout: Duration::from_millis(self.loader.init_timeout_ms),
            shutdown_timeout: Duration::from_millis(self.loader.shutdown_timeout_ms),
            execute_timeout: Duration::from_millis(self.loader.execute_timeout_ms),
            compile_timeout: Duration::from_millis(self.loader.compile_timeout_ms),
            validation: self.validator.clone(),
            sandbox,
            budget: self.budget.clone(),
            artifact_dir: Some(self.artifact_dir()?),
            audit_path: self.audit.path.clone(),
            trust,
        })
    }
}
