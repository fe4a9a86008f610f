//! Embedded extension runtime for strata.
//!
//! Hook scripts live in a directory, are compiled inside a sandboxed Rhai
//! engine with an explicit set of host functions, and register handlers for
//! named events. The [`HookRegistry`] holds the active bindings as an
//! immutable table that is swapped atomically on reload, so a dispatch sees
//! either the old or the new set of handlers, never a mix.
//!
//! # Flow
//!
//! ```text
//! DirectoryWatcher --ChangeSet--> HookLoader --swap--> HookRegistry <-- dispatch
//! ```
//!
//! # Example
//!
//! ```ignore
//! use strata_hooks::{Capabilities, HookContext, HookLoader, HookRegistry, RhaiSandbox};
//!
//! let registry = Arc::new(HookRegistry::new());
//! let sandbox = Arc::new(RhaiSandbox::new(Capabilities::default()));
//! let mut loader = HookLoader::new(sandbox, registry.clone(), &["*.rhai"])?;
//!
//! let report = loader.load_all(Path::new("strata_hooks"))?;
//! for err in &report.errors {
//!     tracing::warn!("{err}");
//! }
//!
//! let outcome = registry.dispatch("records.create", &HookContext::new("records.create"));
//! ```

mod hooks;
mod host;
mod loader;
pub mod rhai;
mod registry;
mod sandbox;
mod types;
mod watcher;

pub use hooks::{HookContext, HookResult, ROUTE_EVENT_PREFIX, route_event};
pub use host::{HttpClient, HttpRequest, HttpResponse, RecordAccess};
pub use loader::{HookLoader, LoadReport, ReloadSummary, ScriptUnit};
pub use registry::{BindingDiff, BindingTable, DispatchReport, HandlerOutcome, HookBinding, HookRegistry};
pub use crate::rhai::RhaiSandbox;
pub use sandbox::{Capabilities, CompiledUnit, Permission, SandboxConfig, ScriptSandbox};
pub use types::{
    CompileError, HookError, HooksResult, LoadError, RuntimeError, Value, WatchError,
};
pub use watcher::{ChangeSet, DirectoryWatcher, WatchConfig, WatchState, spawn_reload_loop};
