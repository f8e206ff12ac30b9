//! Query execution over pooled connections.
//!
//! Three submission shapes: `run` streams batches as the consumer pulls
//! them, `fetch_all` materializes a whole result (with cache read/write
//! around it), and `execute` is fire-and-forget for statements. However a
//! result stream ends — fully consumed, failed mid-stream, or dropped on
//! the floor — its connection makes it back to the pool exactly once.

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Instant;

use arrow_array::RecordBatch;
use arrow_schema::SchemaRef;
use futures::stream::{self, BoxStream};
use futures::{Stream, StreamExt};
use tracing::{debug, warn};

use crate::cache::QueryCache;
use crate::engine::EngineHandle;
use crate::error::WorkbenchError;
use crate::metrics::{now_millis, Metrics};
use crate::pool::{ConnectionPool, PoolLease};
use crate::types::{QueryMeta, QueryOptions, QueryParam, QueryResponse, QueryStatus};

struct ExecInner {
    pool: ConnectionPool,
    cache: QueryCache,
    handle: EngineHandle,
    metrics: Metrics,
}

#[derive(Clone)]
pub struct StreamingExecutor {
    inner: Arc<ExecInner>,
}

/// A live result: the schema up front, then batches on demand.
///
/// Dropping the stream abandons the query; the underlying connection is
/// handed back flagged so pending work is cancelled before anyone reuses it.
pub struct QueryStream {
    schema: SchemaRef,
    rows: BoxStream<'static, Result<RecordBatch, WorkbenchError>>,
}

impl QueryStream {
    pub fn schema(&self) -> SchemaRef {
        self.schema.clone()
    }
}

impl Stream for QueryStream {
    type Item = Result<RecordBatch, WorkbenchError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.get_mut().rows.poll_next_unpin(cx)
    }
}

enum StreamState {
    Yield(RecordBatch, PoolLease),
    Pull(PoolLease),
    Done,
}

impl StreamingExecutor {
    pub fn new(
        pool: ConnectionPool,
        cache: QueryCache,
        handle: EngineHandle,
        metrics: Metrics,
    ) -> Self {
        Self {
            inner: Arc::new(ExecInner {
                pool,
                cache,
                handle,
                metrics,
            }),
        }
    }

    /// Submit a query and stream its batches.
    ///
    /// The first batch is fetched eagerly: a query that fails at submission
    /// or on its first batch returns `Err` here with the connection already
    /// released, and an empty result releases before the stream is handed
    /// out.
    pub async fn run(
        &self,
        sql: &str,
        params: &[QueryParam],
    ) -> Result<QueryStream, WorkbenchError> {
        let mut lease = self.inner.pool.acquire().await?;
        let schema = match lease.connection().start_query(sql, params).await {
            Ok(schema) => schema,
            Err(err) => {
                lease.release().await;
                return Err(WorkbenchError::query(err));
            }
        };
        let first = match lease.connection().next_batch().await {
            Ok(first) => first,
            Err(err) => {
                lease.release().await;
                return Err(WorkbenchError::query(err));
            }
        };
        let Some(first) = first else {
            lease.release().await;
            return Ok(QueryStream {
                schema,
                rows: stream::empty().boxed(),
            });
        };

        let rows = stream::unfold(StreamState::Yield(first, lease), |state| async move {
            match state {
                StreamState::Yield(batch, lease) => {
                    Some((Ok(batch), StreamState::Pull(lease)))
                }
                StreamState::Pull(mut lease) => {
                    match lease.connection().next_batch().await {
                        Ok(Some(batch)) => Some((Ok(batch), StreamState::Pull(lease))),
                        Ok(None) => {
                            lease.release().await;
                            None
                        }
                        Err(err) => {
                            lease.release().await;
                            Some((Err(WorkbenchError::query(err)), StreamState::Done))
                        }
                    }
                }
                StreamState::Done => None,
            }
        })
        .boxed();

        Ok(QueryStream { schema, rows })
    }

    /// Run a statement for its side effects and report affected rows.
    pub async fn execute(&self, sql: &str) -> Result<u64, WorkbenchError> {
        let mut lease = self.inner.pool.acquire().await?;
        let result = lease.connection().execute(sql).await;
        lease.release().await;
        let affected = result.map_err(WorkbenchError::query)?;
        debug!(affected, "statement executed");
        Ok(affected)
    }

    /// Run a query to completion and wrap the outcome in a [`QueryResponse`].
    ///
    /// Never returns `Err`: failures land in the response's record with the
    /// raw error attached. Successful results write through to the cache
    /// even under `force_fresh`; failed ones are never cached.
    pub async fn fetch_all(&self, sql: &str, options: &QueryOptions) -> QueryResponse {
        let namespace = self.inner.handle.session_id().map(|id| id.to_string());
        let key = namespace
            .as_ref()
            .map(|ns| QueryCache::cache_key(ns, sql));

        if options.cacheable && !options.force_fresh {
            if let (Some(ns), Some(key)) = (namespace.as_ref(), key.as_ref()) {
                if let Some((meta, schema, batches)) = self.inner.cache.lookup(ns, key).await {
                    self.inner.metrics.record(&meta);
                    return QueryResponse {
                        schema,
                        batches,
                        meta,
                        error: None,
                    };
                }
            }
        }

        let started = Instant::now();
        let created_at_ms = now_millis();
        let outcome = match options.cancel.as_ref() {
            Some(token) if token.is_cancelled() => Err(WorkbenchError::Cancelled),
            Some(token) => {
                tokio::select! {
                    biased;
                    _ = token.cancelled() => Err(WorkbenchError::Cancelled),
                    outcome = self.collect(sql) => outcome,
                }
            }
            None => self.collect(sql).await,
        };
        let execution_ms = started.elapsed().as_millis() as u64;

        // The first query of a session opens the engine inside collect, so
        // the namespace may only exist now.
        let namespace =
            namespace.or_else(|| self.inner.handle.session_id().map(|id| id.to_string()));
        let hash = key.unwrap_or_else(|| {
            QueryCache::cache_key(namespace.as_deref().unwrap_or(""), sql)
        });

        match outcome {
            Ok((schema, batches)) => {
                let meta = QueryMeta {
                    sql: sql.to_string(),
                    hash: hash.clone(),
                    row_count: batches.iter().map(|b| b.num_rows() as u64).sum(),
                    execution_ms,
                    cache_hit: false,
                    status: QueryStatus::Success,
                    error: None,
                    created_at_ms,
                };
                if options.cacheable {
                    if let Some(ns) = namespace.as_ref() {
                        self.inner
                            .cache
                            .store(ns, &hash, &meta, schema.as_ref(), &batches)
                            .await;
                    }
                }
                self.inner.metrics.record(&meta);
                QueryResponse {
                    schema,
                    batches,
                    meta,
                    error: None,
                }
            }
            Err(err) => {
                warn!(sql = %sql, error = %err, "query failed");
                let meta = QueryMeta {
                    sql: sql.to_string(),
                    hash,
                    row_count: 0,
                    execution_ms,
                    cache_hit: false,
                    status: QueryStatus::Error,
                    error: Some(err.to_string()),
                    created_at_ms,
                };
                self.inner.metrics.record(&meta);
                QueryResponse {
                    schema: None,
                    batches: Vec::new(),
                    meta,
                    error: Some(err),
                }
            }
        }
    }

    async fn collect(
        &self,
        sql: &str,
    ) -> Result<(Option<SchemaRef>, Vec<RecordBatch>), WorkbenchError> {
        let mut stream = self.run(sql, &[]).await?;
        let schema = stream.schema();
        let mut batches = Vec::new();
        while let Some(batch) = stream.next().await {
            batches.push(batch?);
        }
        Ok((Some(schema), batches))
    }
}
