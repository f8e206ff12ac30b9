//! Query result cache.
//!
//! Results are keyed by a SHA-256 of the session id and the raw SQL text,
//! namespaced per session so one session's purge never touches another's.
//! Each entry packs the execution record and the Arrow batches into one
//! self-describing blob, so any byte store can hold it. Every cache failure
//! degrades to a miss or an uncached result; the query path never breaks
//! because the cache did.

use std::collections::HashMap;
use std::io::Cursor;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use arrow_array::RecordBatch;
use arrow_ipc::reader::StreamReader;
use arrow_ipc::writer::StreamWriter;
use arrow_schema::SchemaRef;
use async_trait::async_trait;
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::error::WorkbenchError;
use crate::types::QueryMeta;

/// Byte-level storage behind [`QueryCache`].
///
/// Implementations decide durability; the in-memory store below is the
/// default, and embedders can bring their own (a browser host would back
/// this with IndexedDB-style storage).
#[async_trait]
pub trait CacheStore: Send + Sync {
    async fn fetch(&self, namespace: &str, key: &str) -> Result<Option<Vec<u8>>, WorkbenchError>;

    /// Store `value` under `(namespace, key)`. A `ttl_ms` of zero means the
    /// entry never expires on its own.
    async fn store(
        &self,
        namespace: &str,
        key: &str,
        value: Vec<u8>,
        ttl_ms: u64,
    ) -> Result<(), WorkbenchError>;

    /// Drop every entry in `namespace`.
    async fn purge(&self, namespace: &str) -> Result<(), WorkbenchError>;
}

struct StoredEntry {
    value: Vec<u8>,
    expires_at: Option<Instant>,
}

/// Process-local [`CacheStore`] with lazy expiry.
#[derive(Default)]
pub struct MemoryCacheStore {
    entries: Mutex<HashMap<(String, String), StoredEntry>>,
}

impl MemoryCacheStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CacheStore for MemoryCacheStore {
    async fn fetch(&self, namespace: &str, key: &str) -> Result<Option<Vec<u8>>, WorkbenchError> {
        let mut entries = self.entries.lock().expect("cache store mutex poisoned");
        let slot = (namespace.to_string(), key.to_string());
        let expired = entries
            .get(&slot)
            .is_some_and(|entry| entry.expires_at.is_some_and(|at| Instant::now() >= at));
        if expired {
            entries.remove(&slot);
            return Ok(None);
        }
        Ok(entries.get(&slot).map(|entry| entry.value.clone()))
    }

    async fn store(
        &self,
        namespace: &str,
        key: &str,
        value: Vec<u8>,
        ttl_ms: u64,
    ) -> Result<(), WorkbenchError> {
        let expires_at = if ttl_ms == 0 {
            None
        } else {
            Instant::now().checked_add(Duration::from_millis(ttl_ms))
        };
        self.entries
            .lock()
            .expect("cache store mutex poisoned")
            .insert(
                (namespace.to_string(), key.to_string()),
                StoredEntry { value, expires_at },
            );
        Ok(())
    }

    async fn purge(&self, namespace: &str) -> Result<(), WorkbenchError> {
        self.entries
            .lock()
            .expect("cache store mutex poisoned")
            .retain(|(ns, _), _| ns != namespace);
        Ok(())
    }
}

struct CacheInner {
    store: Arc<dyn CacheStore>,
    enabled: AtomicBool,
    ttl_ms: AtomicU64,
}

/// Session-scoped result cache over a pluggable byte store.
#[derive(Clone)]
pub struct QueryCache {
    inner: Arc<CacheInner>,
}

impl QueryCache {
    pub fn new(store: Arc<dyn CacheStore>, enabled: bool, ttl_ms: u64) -> Self {
        Self {
            inner: Arc::new(CacheInner {
                store,
                enabled: AtomicBool::new(enabled),
                ttl_ms: AtomicU64::new(ttl_ms),
            }),
        }
    }

    /// Key for one query in one session. Identical SQL text in the same
    /// session always maps to the same key.
    pub fn cache_key(session: &str, sql: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(session.as_bytes());
        hasher.update(b"\n");
        hasher.update(sql.as_bytes());
        hex::encode(hasher.finalize())
    }

    pub fn enabled(&self) -> bool {
        self.inner.enabled.load(Ordering::SeqCst)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.inner.enabled.store(enabled, Ordering::SeqCst);
        debug!(enabled, "query cache toggled");
    }

    pub fn ttl_ms(&self) -> u64 {
        self.inner.ttl_ms.load(Ordering::SeqCst)
    }

    pub fn set_ttl_ms(&self, ttl_ms: u64) {
        self.inner.ttl_ms.store(ttl_ms, Ordering::SeqCst);
        debug!(ttl_ms, "query cache ttl updated");
    }

    /// Look a result up, returning it with `cache_hit` set and
    /// `execution_ms` rewritten to the retrieval time. Disabled cache,
    /// store errors, and undecodable entries all read as a miss.
    pub async fn lookup(
        &self,
        namespace: &str,
        key: &str,
    ) -> Option<(QueryMeta, Option<SchemaRef>, Vec<RecordBatch>)> {
        if !self.enabled() {
            return None;
        }
        let started = Instant::now();
        let bytes = match self.inner.store.fetch(namespace, key).await {
            Ok(Some(bytes)) => bytes,
            Ok(None) => return None,
            Err(err) => {
                warn!(error = %err, "cache fetch failed; treating as a miss");
                return None;
            }
        };
        match decode_entry(&bytes) {
            Ok((mut meta, schema, batches)) => {
                meta.cache_hit = true;
                meta.execution_ms = started.elapsed().as_millis() as u64;
                debug!(key, rows = meta.row_count, "query cache hit");
                Some((meta, schema, batches))
            }
            Err(err) => {
                warn!(error = %err, "cache entry undecodable; treating as a miss");
                None
            }
        }
    }

    /// Write a result through. Failures are logged and the result simply
    /// stays uncached.
    pub async fn store(
        &self,
        namespace: &str,
        key: &str,
        meta: &QueryMeta,
        schema: Option<&SchemaRef>,
        batches: &[RecordBatch],
    ) {
        if !self.enabled() {
            return;
        }
        let payload = match encode_entry(meta, schema, batches) {
            Ok(payload) => payload,
            Err(err) => {
                warn!(error = %err, "cache entry could not be encoded; skipping store");
                return;
            }
        };
        let ttl_ms = self.ttl_ms();
        match self.inner.store.store(namespace, key, payload, ttl_ms).await {
            Ok(()) => debug!(key, rows = meta.row_count, "query result cached"),
            Err(err) => warn!(error = %err, "cache store failed; result stays uncached"),
        }
    }

    /// Drop every entry belonging to `namespace`.
    pub async fn purge_session(&self, namespace: &str) {
        match self.inner.store.purge(namespace).await {
            Ok(()) => debug!(namespace, "cache namespace purged"),
            Err(err) => warn!(namespace, error = %err, "cache purge failed"),
        }
    }
}

fn cache_err(err: impl std::fmt::Display) -> WorkbenchError {
    WorkbenchError::CacheStore(err.to_string())
}

// Entry layout: a little-endian u32 header length, the execution record as
// JSON, then (for non-empty results) the batches as an Arrow IPC stream.
fn encode_entry(
    meta: &QueryMeta,
    schema: Option<&SchemaRef>,
    batches: &[RecordBatch],
) -> Result<Vec<u8>, WorkbenchError> {
    let header = serde_json::to_vec(meta).map_err(cache_err)?;
    let mut payload = Vec::with_capacity(header.len() + 16);
    payload.extend_from_slice(&(header.len() as u32).to_le_bytes());
    payload.extend_from_slice(&header);
    if let Some(schema) = schema {
        let mut writer = StreamWriter::try_new(&mut payload, schema.as_ref()).map_err(cache_err)?;
        for batch in batches {
            writer.write(batch).map_err(cache_err)?;
        }
        writer.finish().map_err(cache_err)?;
    }
    Ok(payload)
}

fn decode_entry(
    bytes: &[u8],
) -> Result<(QueryMeta, Option<SchemaRef>, Vec<RecordBatch>), WorkbenchError> {
    if bytes.len() < 4 {
        return Err(cache_err("cache entry truncated"));
    }
    let mut len_bytes = [0u8; 4];
    len_bytes.copy_from_slice(&bytes[..4]);
    let header_len = u32::from_le_bytes(len_bytes) as usize;
    let body_start = 4usize
        .checked_add(header_len)
        .ok_or_else(|| cache_err("cache entry header length overflow"))?;
    if bytes.len() < body_start {
        return Err(cache_err("cache entry truncated"));
    }
    let meta: QueryMeta = serde_json::from_slice(&bytes[4..body_start]).map_err(cache_err)?;
    let body = &bytes[body_start..];
    if body.is_empty() {
        return Ok((meta, None, Vec::new()));
    }
    let reader = StreamReader::try_new(Cursor::new(body), None).map_err(cache_err)?;
    let schema = reader.schema();
    let mut batches = Vec::new();
    for batch in reader {
        batches.push(batch.map_err(cache_err)?);
    }
    Ok((meta, Some(schema), batches))
}
