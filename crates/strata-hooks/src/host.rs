//! Host collaborators that back script capabilities.
//!
//! The sandbox never reaches the storage engine or the network directly.
//! The host injects implementations of these traits into
//! [`crate::Capabilities`]; scripts only see the functions built on top.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::types::Value;

/// Record data access offered to scripts.
pub trait RecordAccess: Send + Sync {
    /// Fetch one record by id.
    fn find_by_id(&self, collection: &str, id: &str) -> Result<Option<Value>, String>;

    /// Fetch records matching a host-defined filter expression.
    fn find_by_filter(&self, collection: &str, filter: &str, limit: usize) -> Result<Vec<Value>, String>;

    /// Insert or update a record, returning the stored form.
    fn save(&self, collection: &str, record: Value) -> Result<Value, String>;
}

/// Outbound HTTP request built by a script.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HttpRequest {
    pub method: String,
    pub url: String,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub body: Option<String>,
}

/// Response handed back to the script.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HttpResponse {
    pub status: u16,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    pub body: String,
}

/// Outbound HTTP offered to scripts.
///
/// Implementations consult [`strata_core::tls_verification_disabled`] when
/// building their TLS configuration.
pub trait HttpClient: Send + Sync {
    fn send(&self, request: HttpRequest) -> Result<HttpResponse, String>;
}
