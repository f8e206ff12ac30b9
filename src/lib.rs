//! In-process SQL workbench session over an embedded analytical engine.
//!
//! `sqldeck` manages everything between a query editor and the database:
//! lazy engine startup, a cooperative connection pool, a per-session query
//! result cache, registration and replay of file/URL data sources, streaming
//! execution with cancellation, and autocomplete aggregation. The engine
//! itself sits behind a driver trait; an in-memory DuckDB driver is built in
//! and a scriptable mock ships for tests.
//!
//! Most callers only need [`DbSession`]:
//!
//! ```no_run
//! use sqldeck::{DbSession, QueryOptions, WorkbenchConfig};
//!
//! # async fn demo() -> anyhow::Result<()> {
//! let session = DbSession::new(WorkbenchConfig::load()?);
//! let response = session.fetch_all("SELECT 42 AS answer", &QueryOptions::new()).await;
//! for batch in &response.batches {
//!     println!("{} rows", batch.num_rows());
//! }
//! # Ok(())
//! # }
//! ```

pub mod cache;
pub mod cancel;
pub mod config;
pub mod engine;
pub mod error;
pub mod exec;
pub mod metrics;
pub mod pool;
pub mod session;
pub mod sources;
pub mod suggest;
pub mod types;

/// Pluggable result storage and the default in-memory store.
pub use cache::{CacheStore, MemoryCacheStore, QueryCache};
/// Cooperative cancellation handle for queries and autocomplete.
pub use cancel::CancelToken;
pub use config::WorkbenchConfig;
/// The engine seam: implement these to bring another engine.
pub use engine::{
    EngineConfig, EngineConnection, EngineDriver, EngineError, EngineHandle, EngineInstance,
};
pub use error::WorkbenchError;
pub use exec::{QueryStream, StreamingExecutor};
pub use metrics::{Metrics, MetricsSnapshot};
pub use pool::{ConnectionPool, PoolLease, PoolStats};
/// The main entry point for embedders.
pub use session::{DbSession, SessionId};
pub use sources::{DataSourceRegistry, ReplayFailure};
pub use suggest::{Autocomplete, Suggestion, SuggestionKind};
pub use types::{
    DataSource, ExportFormat, QueryMeta, QueryOptions, QueryParam, QueryResponse, QueryStatus,
};
