//! Sandbox contract and capability surface.
//!
//! A script only reaches what its [`Capabilities`] grant: host functions for
//! a permission are registered into the interpreter only when that
//! permission is present, and data/network access goes through host traits.

use std::collections::HashSet;
use std::fmt;
use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use strata_core::HooksSettings;

use crate::hooks::{HookContext, HookResult};
use crate::host::{HttpClient, RecordAccess};
use crate::types::{CompileError, RuntimeError};

/// Capability groups that can be granted to scripts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Permission {
    /// `log_info`, `log_warn`, `log_error`, `print`.
    Log,

    /// `find_record`, `find_records`, `save_record`.
    Records,

    /// `http_send`.
    Http,

    /// `env`, limited to the allowlist.
    Environment,
}

/// Limits and permissions applied to every compiled unit.
#[derive(Debug, Clone)]
pub struct SandboxConfig {
    /// Granted permissions.
    pub permissions: HashSet<Permission>,

    /// Environment variables readable through `env`.
    pub allowed_env: HashSet<String>,

    /// Operation budget per evaluation.
    pub max_operations: u64,

    /// Maximum call depth.
    pub max_call_levels: usize,

    /// Maximum expression nesting.
    pub max_expr_depth: usize,

    /// Maximum string length in bytes.
    pub max_string_size: usize,

    /// Maximum array length.
    pub max_array_size: usize,

    /// Maximum map size.
    pub max_map_size: usize,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            permissions: HashSet::from([Permission::Log]),
            allowed_env: HashSet::new(),
            max_operations: 1_000_000,
            max_call_levels: 64,
            max_expr_depth: 64,
            max_string_size: 1024 * 1024, // 1MB strings
            max_array_size: 10_000,
            max_map_size: 10_000,
        }
    }
}

impl SandboxConfig {
    /// A sandbox with no permissions and tight limits.
    pub fn minimal() -> Self {
        Self {
            permissions: HashSet::new(),
            allowed_env: HashSet::new(),
            max_operations: 100_000,
            max_call_levels: 32,
            max_expr_depth: 32,
            max_string_size: 100 * 1024, // 100KB
            max_array_size: 1000,
            max_map_size: 1000,
        }
    }

    /// Build from application settings.
    pub fn from_settings(settings: &HooksSettings) -> Self {
        let mut config = Self {
            max_operations: settings.max_operations,
            max_call_levels: settings.max_call_levels,
            ..Self::default()
        };
        for name in &settings.allowed_env {
            config = config.allow_env(name.clone());
        }
        config
    }

    /// Grant a permission.
    pub fn grant(mut self, permission: Permission) -> Self {
        self.permissions.insert(permission);
        self
    }

    /// Allow scripts to read an environment variable.
    pub fn allow_env(mut self, name: impl Into<String>) -> Self {
        self.allowed_env.insert(name.into());
        self.permissions.insert(Permission::Environment);
        self
    }

    /// Set the operation budget.
    pub fn with_max_operations(mut self, max_operations: u64) -> Self {
        self.max_operations = max_operations;
        self
    }

    /// Check if a permission is granted.
    pub fn has_permission(&self, permission: Permission) -> bool {
        self.permissions.contains(&permission)
    }

    /// Check if reading an environment variable is allowed.
    pub fn can_read_env(&self, name: &str) -> bool {
        self.has_permission(Permission::Environment) && self.allowed_env.contains(name)
    }
}

/// Everything a compiled unit is granted: limits plus host collaborators.
#[derive(Clone, Default)]
pub struct Capabilities {
    config: SandboxConfig,
    records: Option<Arc<dyn RecordAccess>>,
    http: Option<Arc<dyn HttpClient>>,
}

impl fmt::Debug for Capabilities {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Capabilities")
            .field("config", &self.config)
            .field("records", &self.records.is_some())
            .field("http", &self.http.is_some())
            .finish()
    }
}

impl Capabilities {
    /// Capabilities with the given limits and no host collaborators.
    pub fn new(config: SandboxConfig) -> Self {
        Self {
            config,
            records: None,
            http: None,
        }
    }

    /// Grant record access backed by `records`.
    pub fn with_records(mut self, records: Arc<dyn RecordAccess>) -> Self {
        self.records = Some(records);
        self.config.permissions.insert(Permission::Records);
        self
    }

    /// Grant outbound HTTP backed by `http`.
    pub fn with_http(mut self, http: Arc<dyn HttpClient>) -> Self {
        self.http = Some(http);
        self.config.permissions.insert(Permission::Http);
        self
    }

    /// Limits and permissions.
    pub fn config(&self) -> &SandboxConfig {
        &self.config
    }

    /// Record access, if granted.
    pub fn records(&self) -> Option<&Arc<dyn RecordAccess>> {
        self.records
            .as_ref()
            .filter(|_| self.config.has_permission(Permission::Records))
    }

    /// HTTP client, if granted.
    pub fn http(&self) -> Option<&Arc<dyn HttpClient>> {
        self.http
            .as_ref()
            .filter(|_| self.config.has_permission(Permission::Http))
    }
}

/// A compiled script with the handlers it registered while loading.
///
/// A unit owns its interpreter state exclusively; nothing is shared between
/// units.
pub trait CompiledUnit: Send + Sync {
    /// Script the unit was compiled from.
    fn path(&self) -> &Path;

    /// Event name of each registered handler, in declaration order.
    /// Handler indices passed to [`CompiledUnit::invoke`] index this slice.
    fn events(&self) -> &[String];

    /// Run one handler against a context.
    fn invoke(&self, handler: usize, ctx: &HookContext) -> Result<HookResult, RuntimeError>;
}

impl fmt::Debug for dyn CompiledUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompiledUnit")
            .field("path", &self.path())
            .field("events", &self.events())
            .finish()
    }
}

/// An interpreter able to compile hook scripts.
pub trait ScriptSandbox: Send + Sync {
    /// Name of the interpreter (e.g. "rhai").
    fn name(&self) -> &'static str;

    /// Compile a script and run its top-level registrations.
    fn compile(&self, path: &Path, source: &str) -> Result<Arc<dyn CompiledUnit>, CompileError>;

    /// Run one handler of a compiled unit.
    fn invoke(
        &self,
        unit: &dyn CompiledUnit,
        handler: usize,
        ctx: &HookContext,
    ) -> Result<HookResult, RuntimeError> {
        unit.invoke(handler, ctx)
    }
}
