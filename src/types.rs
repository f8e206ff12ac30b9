//! Shared value types for the session core: data sources, query parameters,
//! execution metadata, and fully materialized responses.

use std::path::PathBuf;

use arrow_array::RecordBatch;
use arrow_schema::SchemaRef;
use serde::{Deserialize, Serialize};

use crate::cancel::CancelToken;
use crate::error::WorkbenchError;

/// A file-backed table exposed to the engine under a stable name.
///
/// The `path` is the name queries refer to (for example `sales.csv`), unique
/// within a session; re-registering an existing path replaces the binding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DataSource {
    Local { path: String, file: PathBuf },
    Remote { path: String, url: String },
}

impl DataSource {
    pub fn local(path: impl Into<String>, file: impl Into<PathBuf>) -> Self {
        DataSource::Local {
            path: path.into(),
            file: file.into(),
        }
    }

    pub fn remote(path: impl Into<String>, url: impl Into<String>) -> Self {
        DataSource::Remote {
            path: path.into(),
            url: url.into(),
        }
    }

    /// The name this source is registered under.
    pub fn path(&self) -> &str {
        match self {
            DataSource::Local { path, .. } | DataSource::Remote { path, .. } => path,
        }
    }
}

/// A positional parameter bound to a prepared statement.
#[derive(Debug, Clone, PartialEq)]
pub enum QueryParam {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Blob(Vec<u8>),
}

impl From<bool> for QueryParam {
    fn from(value: bool) -> Self {
        QueryParam::Bool(value)
    }
}

impl From<i32> for QueryParam {
    fn from(value: i32) -> Self {
        QueryParam::Int(value.into())
    }
}

impl From<i64> for QueryParam {
    fn from(value: i64) -> Self {
        QueryParam::Int(value)
    }
}

impl From<f64> for QueryParam {
    fn from(value: f64) -> Self {
        QueryParam::Float(value)
    }
}

impl From<&str> for QueryParam {
    fn from(value: &str) -> Self {
        QueryParam::Text(value.to_string())
    }
}

impl From<String> for QueryParam {
    fn from(value: String) -> Self {
        QueryParam::Text(value)
    }
}

impl From<Vec<u8>> for QueryParam {
    fn from(value: Vec<u8>) -> Self {
        QueryParam::Blob(value)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryStatus {
    Success,
    Error,
}

/// Append-only record of one query execution.
///
/// Attached to every [`QueryResponse`], cached alongside result data, and
/// handed to external history stores. Immutable once created, except that a
/// cache hit rewrites `cache_hit` and `execution_ms` to reflect retrieval.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryMeta {
    pub sql: String,
    /// Cache key derived from the session id and the raw SQL text.
    pub hash: String,
    pub row_count: u64,
    pub execution_ms: u64,
    pub cache_hit: bool,
    pub status: QueryStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub created_at_ms: u64,
}

/// Per-call controls for `fetch_all`.
#[derive(Debug, Clone)]
pub struct QueryOptions {
    /// Consult and refresh the query cache for this call.
    pub cacheable: bool,
    /// Skip the cache read but still write the fresh result back.
    pub force_fresh: bool,
    pub cancel: Option<CancelToken>,
}

impl Default for QueryOptions {
    fn default() -> Self {
        Self {
            cacheable: true,
            force_fresh: false,
            cancel: None,
        }
    }
}

impl QueryOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Options that never touch the cache.
    pub fn uncached() -> Self {
        Self {
            cacheable: false,
            ..Self::default()
        }
    }

    pub fn with_force_fresh(mut self, force_fresh: bool) -> Self {
        self.force_fresh = force_fresh;
        self
    }

    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = Some(cancel);
        self
    }
}

/// Fully materialized result of `fetch_all`.
///
/// Errors never propagate past `fetch_all`: a failed query yields an empty
/// result with `meta.status == Error` and the raw error attached for callers
/// that want to branch on it.
#[derive(Debug)]
pub struct QueryResponse {
    pub schema: Option<SchemaRef>,
    pub batches: Vec<RecordBatch>,
    pub meta: QueryMeta,
    pub error: Option<WorkbenchError>,
}

impl QueryResponse {
    pub fn is_success(&self) -> bool {
        self.meta.status == QueryStatus::Success
    }

    pub fn total_rows(&self) -> usize {
        self.batches.iter().map(RecordBatch::num_rows).sum()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExportFormat {
    Csv,
    Parquet,
    Json,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn data_source_path_is_kind_independent() {
        let local = DataSource::local("sales.csv", "/tmp/sales.csv");
        let remote = DataSource::remote("events.parquet", "https://example.com/events.parquet");
        assert_eq!(local.path(), "sales.csv");
        assert_eq!(remote.path(), "events.parquet");
    }

    #[test]
    fn query_param_conversions() {
        assert_eq!(QueryParam::from(5i64), QueryParam::Int(5));
        assert_eq!(QueryParam::from("x"), QueryParam::Text("x".to_string()));
        assert_eq!(QueryParam::from(true), QueryParam::Bool(true));
    }

    #[test]
    fn default_options_are_cacheable() {
        let options = QueryOptions::default();
        assert!(options.cacheable);
        assert!(!options.force_fresh);
        assert!(!QueryOptions::uncached().cacheable);
    }

    #[test]
    fn query_meta_serializes_without_null_error() {
        let meta = QueryMeta {
            sql: "SELECT 1".to_string(),
            hash: "abc".to_string(),
            row_count: 1,
            execution_ms: 3,
            cache_hit: false,
            status: QueryStatus::Success,
            error: None,
            created_at_ms: 17,
        };
        let json = serde_json::to_string(&meta).expect("meta serializes");
        assert!(!json.contains("\"error\""));
        assert!(json.contains("\"status\":\"success\""));
    }
}
