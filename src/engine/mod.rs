//! Embedded engine abstraction - lifecycle, registration, and query execution.
//!
//! This module provides:
//! - `EngineDriver` / `EngineInstance` / `EngineConnection`: the black-box
//!   seam every engine implementation sits behind
//! - `EngineHandle`: lazy, serialized lifecycle management over a driver
//! - `duckdb`: the production DuckDB driver
//! - `mock`: a scriptable in-memory driver for tests
//!
//! Engine failures cross the seam as the opaque [`EngineError`]; callers
//! classify them into the session taxonomy by context.

pub mod duckdb;
mod handle;
pub mod mock;

pub use handle::EngineHandle;

use std::path::Path;
use std::sync::Arc;

use arrow_array::RecordBatch;
use arrow_schema::SchemaRef;
use async_trait::async_trait;
use thiserror::Error;

use crate::types::QueryParam;

/// Engine-side failure with the implementation detail erased.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct EngineError {
    message: String,
}

impl EngineError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

/// Settings handed to [`EngineDriver::open`].
#[derive(Debug, Clone, Default)]
pub struct EngineConfig {
    /// Statements executed once, in order, when the engine process starts.
    pub init_sql: Vec<String>,
}

/// Factory for engine processes. One driver can open many instances over
/// a session's lifetime (each `dispose` + reopen cycle creates a new one).
#[async_trait]
pub trait EngineDriver: Send + Sync {
    async fn open(&self, config: &EngineConfig) -> Result<Arc<dyn EngineInstance>, EngineError>;
}

/// One running engine process.
///
/// Logical connections from [`connect`](EngineInstance::connect) share this
/// process and its catalog; they interleave, they do not run in parallel.
#[async_trait]
pub trait EngineInstance: Send + Sync {
    /// Open a new logical connection.
    async fn connect(&self) -> Result<Box<dyn EngineConnection>, EngineError>;

    /// Expose a local file to the engine under `name`.
    async fn register_file_path(&self, name: &str, file: &Path) -> Result<(), EngineError>;

    /// Expose a remote URL to the engine under `name` without downloading it.
    async fn register_file_url(&self, name: &str, url: &str) -> Result<(), EngineError>;

    /// Remove a previously registered binding.
    async fn drop_file(&self, name: &str) -> Result<(), EngineError>;

    /// Drop every registered binding, keeping the process alive.
    async fn reset(&self) -> Result<(), EngineError>;

    /// Tear the engine process down. The instance is unusable afterwards.
    async fn terminate(&self) -> Result<(), EngineError>;
}

/// One logical connection. Holds at most one in-flight streamed result:
/// [`start_query`](EngineConnection::start_query) begins it, repeated
/// [`next_batch`](EngineConnection::next_batch) calls drain it, and
/// [`cancel_pending`](EngineConnection::cancel_pending) discards it so the
/// connection can be reused cleanly.
#[async_trait]
pub trait EngineConnection: Send {
    /// Run a statement to completion, returning the affected row count.
    async fn execute(&mut self, sql: &str) -> Result<u64, EngineError>;

    /// Parse and plan a statement without executing it.
    async fn prepare(&mut self, sql: &str) -> Result<(), EngineError>;

    /// Begin a streaming query; resolves once the result schema is known.
    async fn start_query(
        &mut self,
        sql: &str,
        params: &[QueryParam],
    ) -> Result<SchemaRef, EngineError>;

    /// Pull the next batch of the in-flight query; `None` at end of stream.
    async fn next_batch(&mut self) -> Result<Option<RecordBatch>, EngineError>;

    /// Discard any in-flight streamed result.
    async fn cancel_pending(&mut self) -> Result<(), EngineError>;

    /// Close the connection.
    async fn close(&mut self) -> Result<(), EngineError>;
}

/// Double-quote an identifier for interpolation into engine SQL.
pub(crate) fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Single-quote a string literal for interpolation into engine SQL.
pub(crate) fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quoting_escapes_embedded_quotes() {
        assert_eq!(quote_ident("plain"), "\"plain\"");
        assert_eq!(quote_ident("we\"ird"), "\"we\"\"ird\"");
        assert_eq!(quote_literal("/tmp/a.csv"), "'/tmp/a.csv'");
        assert_eq!(quote_literal("it's"), "'it''s'");
    }

    #[test]
    fn engine_error_displays_message() {
        let err = EngineError::new("catalog missing");
        assert_eq!(err.to_string(), "catalog missing");
        assert_eq!(err.message(), "catalog missing");
    }
}
