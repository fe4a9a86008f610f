//! Rhai sandbox implementation.
//!
//! Each compiled script gets its own [`rhai::Engine`] carrying only the host
//! functions its capabilities grant, so units never share interpreter state.

mod convert;
mod runtime;

pub use convert::{dynamic_to_value, value_to_dynamic};
pub use runtime::RhaiSandbox;
