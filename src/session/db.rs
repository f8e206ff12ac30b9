//! The workbench session facade.
//!
//! `DbSession` owns one engine lifecycle end to end: lazy startup, pooled
//! connections, the query cache, data source registrations, autocomplete,
//! and the query history counters. Everything callers touch goes through
//! it; the parts underneath stay composable for tests.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{info, instrument};

use crate::cache::{CacheStore, MemoryCacheStore, QueryCache};
use crate::cancel::CancelToken;
use crate::config::WorkbenchConfig;
use crate::engine::duckdb::DuckDbDriver;
use crate::engine::{quote_ident, quote_literal, EngineConfig, EngineDriver, EngineHandle};
use crate::error::WorkbenchError;
use crate::exec::{QueryStream, StreamingExecutor};
use crate::metrics::{Metrics, MetricsSnapshot};
use crate::pool::{ConnectionPool, PoolStats};
use crate::session::id::SessionId;
use crate::sources::{DataSourceRegistry, ReplayFailure};
use crate::suggest::{Autocomplete, Suggestion};
use crate::types::{DataSource, ExportFormat, QueryOptions, QueryParam, QueryResponse};

struct SessionInner {
    config: WorkbenchConfig,
    handle: EngineHandle,
    registry: DataSourceRegistry,
    pool: ConnectionPool,
    cache: QueryCache,
    exec: StreamingExecutor,
    suggest: Autocomplete,
    metrics: Metrics,
}

/// One interactive database session.
///
/// The engine starts on the first call that needs it; until then,
/// registrations and configuration changes are simply recorded. Cloning is
/// cheap and every clone drives the same session.
///
/// # Example
///
/// ```no_run
/// use sqldeck::{DbSession, QueryOptions, WorkbenchConfig};
///
/// # async fn demo() -> anyhow::Result<()> {
/// let session = DbSession::new(WorkbenchConfig::default());
/// session
///     .register_file_url("trips.parquet", "https://example.com/trips.parquet")
///     .await?;
/// let response = session
///     .fetch_all("SELECT count(*) FROM \"trips.parquet\"", &QueryOptions::new())
///     .await;
/// println!("{} rows", response.total_rows());
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct DbSession {
    inner: Arc<SessionInner>,
}

impl DbSession {
    /// Session backed by an in-memory DuckDB engine and an in-memory cache.
    pub fn new(config: WorkbenchConfig) -> Self {
        Self::with_driver(
            config,
            Arc::new(DuckDbDriver),
            Arc::new(MemoryCacheStore::new()),
        )
    }

    /// Session over an arbitrary engine driver and cache store.
    pub fn with_driver(
        config: WorkbenchConfig,
        driver: Arc<dyn EngineDriver>,
        store: Arc<dyn CacheStore>,
    ) -> Self {
        let registry = DataSourceRegistry::new();
        let handle = EngineHandle::new(
            driver,
            EngineConfig {
                init_sql: config.init_sql.clone(),
            },
            registry.clone(),
        );
        let pool = ConnectionPool::new(handle.clone(), &config);
        let cache = QueryCache::new(store, config.cache_enabled, config.cache_ttl_ms);
        let metrics = Metrics::new(config.history_size);
        let exec = StreamingExecutor::new(
            pool.clone(),
            cache.clone(),
            handle.clone(),
            metrics.clone(),
        );
        let suggest = Autocomplete::new(exec.clone(), config.suggest_limit);
        Self {
            inner: Arc::new(SessionInner {
                config,
                handle,
                registry,
                pool,
                cache,
                exec,
                suggest,
                metrics,
            }),
        }
    }

    /// Start the engine now instead of on first use.
    pub async fn ensure_open(&self) -> Result<(), WorkbenchError> {
        self.inner.handle.ensure_open().await.map(|_| ())
    }

    /// Wipe engine state in place: drain the pool, reset the engine,
    /// replay data sources, and purge this session's cache entries. The
    /// session id survives.
    pub async fn reset(&self) -> Result<(), WorkbenchError> {
        info!("resetting session");
        self.inner.pool.drain().await;
        self.inner.handle.reset().await?;
        if let Some(session) = self.inner.handle.session_id() {
            self.inner.cache.purge_session(session.as_ref()).await;
        }
        Ok(())
    }

    /// Tear everything down and end the session: pool, cache entries,
    /// data source registrations, engine, and session id. Safe to call
    /// twice; a later query starts a fresh engine under a fresh session id.
    pub async fn dispose(&self) {
        let session = self.inner.handle.session_id();
        self.inner.pool.drain().await;
        if let Some(session) = session {
            self.inner.cache.purge_session(session.as_ref()).await;
        }
        self.inner.registry.clear();
        self.inner.handle.dispose().await;
    }

    /// Run a query to completion, going through the cache when the options
    /// allow it. Failures come back inside the response, not as `Err`.
    #[instrument(skip(self, options), fields(sql = %sql))]
    pub async fn fetch_all(&self, sql: &str, options: &QueryOptions) -> QueryResponse {
        self.inner.exec.fetch_all(sql, options).await
    }

    /// Stream a query's batches as they are produced. Always bypasses the
    /// cache.
    pub async fn run(
        &self,
        sql: &str,
        params: &[QueryParam],
    ) -> Result<QueryStream, WorkbenchError> {
        self.inner.exec.run(sql, params).await
    }

    /// Run a statement for its side effects.
    pub async fn exec(&self, sql: &str) -> Result<u64, WorkbenchError> {
        self.inner.exec.execute(sql).await
    }

    /// Register a local file under `path`. With the engine closed this is
    /// recorded and applied at the next open.
    pub async fn register_file_path(
        &self,
        path: &str,
        file: impl Into<PathBuf>,
    ) -> Result<(), WorkbenchError> {
        let instance = self.inner.handle.current();
        self.inner
            .registry
            .upsert(instance.as_deref(), DataSource::local(path, file))
            .await
    }

    /// Register a remote URL under `path`.
    pub async fn register_file_url(
        &self,
        path: &str,
        url: impl Into<String>,
    ) -> Result<(), WorkbenchError> {
        let instance = self.inner.handle.current();
        self.inner
            .registry
            .upsert(instance.as_deref(), DataSource::remote(path, url))
            .await
    }

    /// Drop the registration for `path`. Returns whether it existed.
    pub async fn unregister(&self, path: &str) -> Result<bool, WorkbenchError> {
        let instance = self.inner.handle.current();
        self.inner.registry.remove(instance.as_deref(), path).await
    }

    pub fn sources(&self) -> Vec<DataSource> {
        self.inner.registry.snapshot()
    }

    /// Column names, types, and nullability for `table`, straight from the
    /// engine and never cached.
    pub async fn describe_table(&self, table: &str) -> QueryResponse {
        let sql = format!("DESCRIBE {}", quote_ident(table));
        self.fetch_all(&sql, &QueryOptions::uncached()).await
    }

    /// Check that `sql` parses and binds without running it.
    pub async fn validate_query(&self, sql: &str) -> Result<(), WorkbenchError> {
        let mut lease = self.inner.pool.acquire().await?;
        let result = lease.connection().prepare(sql).await;
        lease.release().await;
        result.map_err(WorkbenchError::query)
    }

    /// Export a table to a file, returning the number of rows written.
    pub async fn export_table(
        &self,
        table: &str,
        format: ExportFormat,
        dest: &Path,
    ) -> Result<u64, WorkbenchError> {
        let dest = dest.to_str().ok_or_else(|| {
            WorkbenchError::QueryExecution("export destination is not valid UTF-8".to_string())
        })?;
        let sql = format!(
            "COPY (SELECT * FROM {}) TO {} (FORMAT {})",
            quote_ident(table),
            quote_literal(dest),
            format_clause(format)
        );
        self.inner.exec.execute(&sql).await
    }

    /// Drop every cached result belonging to this session.
    pub async fn clear_cache(&self) {
        if let Some(session) = self.inner.handle.session_id() {
            self.inner.cache.purge_session(session.as_ref()).await;
        }
    }

    pub fn cache_enabled(&self) -> bool {
        self.inner.cache.enabled()
    }

    pub fn set_cache_enabled(&self, enabled: bool) {
        self.inner.cache.set_enabled(enabled);
    }

    pub fn cache_ttl_ms(&self) -> u64 {
        self.inner.cache.ttl_ms()
    }

    pub fn set_cache_ttl_ms(&self, ttl_ms: u64) {
        self.inner.cache.set_ttl_ms(ttl_ms);
    }

    /// Ranked completions for the token under the cursor.
    pub async fn suggest(
        &self,
        partial: &str,
        full_text: &str,
        cancel: Option<&CancelToken>,
    ) -> Vec<Suggestion> {
        self.inner.suggest.suggest(partial, full_text, cancel).await
    }

    pub fn session_id(&self) -> Option<SessionId> {
        self.inner.handle.session_id()
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.inner.metrics.snapshot()
    }

    pub fn pool_stats(&self) -> PoolStats {
        self.inner.pool.stats()
    }

    /// Sources that failed to re-register during the most recent open or
    /// reset.
    pub fn take_replay_failures(&self) -> Vec<ReplayFailure> {
        self.inner.handle.take_replay_failures()
    }

    pub fn config(&self) -> &WorkbenchConfig {
        &self.inner.config
    }
}

fn format_clause(format: ExportFormat) -> &'static str {
    match format {
        ExportFormat::Csv => "CSV",
        ExportFormat::Parquet => "PARQUET",
        ExportFormat::Json => "JSON",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::mock::{int64_batch, MockDriver};
    use crate::types::QueryStatus;

    fn session_for(driver: &MockDriver) -> DbSession {
        DbSession::with_driver(
            WorkbenchConfig::default(),
            Arc::new(driver.clone()),
            Arc::new(MemoryCacheStore::new()),
        )
    }

    #[tokio::test]
    async fn registration_before_open_is_applied_at_open() -> anyhow::Result<()> {
        let driver = MockDriver::new();
        let session = session_for(&driver);

        session
            .register_file_url("sales.csv", "https://example.com/sales.csv")
            .await?;
        assert_eq!(session.sources().len(), 1);
        assert!(driver.registered_names().is_empty());

        session.ensure_open().await?;
        assert_eq!(driver.registered_names(), vec!["sales.csv"]);
        Ok(())
    }

    #[tokio::test]
    async fn reset_keeps_the_session_but_purges_its_cache() -> anyhow::Result<()> {
        let driver = MockDriver::new();
        let session = session_for(&driver);
        let (schema, batch) = int64_batch("n", &[1]);
        driver.script_query("SELECT n", schema, vec![batch]);

        let first = session.fetch_all("SELECT n", &QueryOptions::new()).await;
        assert!(first.is_success());
        let before = session.session_id().map(|id| id.to_string());

        session.reset().await?;
        assert_eq!(session.session_id().map(|id| id.to_string()), before);

        let after = session.fetch_all("SELECT n", &QueryOptions::new()).await;
        assert!(!after.meta.cache_hit, "reset must invalidate cached results");
        assert_eq!(driver.executed().len(), 2);
        Ok(())
    }

    #[tokio::test]
    async fn dispose_twice_then_reopen_under_a_new_session() -> anyhow::Result<()> {
        let driver = MockDriver::new();
        let session = session_for(&driver);

        session
            .register_file_url("old.csv", "https://example.com/old.csv")
            .await?;
        session.ensure_open().await?;
        let first = session.session_id().map(|id| id.to_string());
        session.dispose().await;
        session.dispose().await;
        assert!(session.session_id().is_none());
        assert!(session.sources().is_empty(), "dispose ends the registrations");

        session.ensure_open().await?;
        let second = session.session_id().map(|id| id.to_string());
        assert!(second.is_some());
        assert_ne!(first, second);
        Ok(())
    }

    #[tokio::test]
    async fn describe_table_quotes_the_identifier() -> anyhow::Result<()> {
        let driver = MockDriver::new();
        let session = session_for(&driver);

        let response = session.describe_table("my table").await;
        assert_eq!(response.meta.status, QueryStatus::Success);
        let executed = driver.executed();
        assert_eq!(executed.last().unwrap().1, "DESCRIBE \"my table\"");
        Ok(())
    }

    #[tokio::test]
    async fn export_builds_a_copy_statement() -> anyhow::Result<()> {
        let driver = MockDriver::new();
        let session = session_for(&driver);
        let expected = "COPY (SELECT * FROM \"trips\") TO '/tmp/out.csv' (FORMAT CSV)";
        driver.script_affected(expected, 3);

        let written = session
            .export_table("trips", ExportFormat::Csv, Path::new("/tmp/out.csv"))
            .await?;
        assert_eq!(written, 3);
        assert_eq!(driver.executed().last().unwrap().1, expected);
        Ok(())
    }

    #[tokio::test]
    async fn validate_query_releases_its_connection_either_way() -> anyhow::Result<()> {
        let driver = MockDriver::new();
        let session = session_for(&driver);

        session.validate_query("SELECT 1").await?;
        assert_eq!(session.pool_stats().idle, 1);

        driver.script_query_error("SELEC 1", "syntax error at or near \"SELEC\"");
        let err = session.validate_query("SELEC 1").await.unwrap_err();
        assert!(matches!(err, WorkbenchError::QueryExecution(_)));
        assert_eq!(session.pool_stats().idle, 1);
        Ok(())
    }

    #[tokio::test]
    async fn cache_toggle_takes_effect_immediately() -> anyhow::Result<()> {
        let driver = MockDriver::new();
        let session = session_for(&driver);

        assert!(session.cache_enabled());
        session.set_cache_enabled(false);
        session.fetch_all("SELECT 9", &QueryOptions::new()).await;
        let repeat = session.fetch_all("SELECT 9", &QueryOptions::new()).await;
        assert!(!repeat.meta.cache_hit);
        assert_eq!(driver.executed().len(), 2);

        session.set_cache_enabled(true);
        session.fetch_all("SELECT 9", &QueryOptions::new()).await;
        let hit = session.fetch_all("SELECT 9", &QueryOptions::new()).await;
        assert!(hit.meta.cache_hit);
        Ok(())
    }
}
