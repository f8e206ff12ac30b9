//! Scriptable in-memory engine for tests.
//!
//! Provides [`MockDriver`], plus fixture helpers for building small Arrow
//! batches. Scripted behavior is keyed by exact SQL text; anything not
//! scripted succeeds with an empty result, so tests only spell out what they
//! assert on.

use std::collections::{HashMap, HashSet, VecDeque};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use arrow_array::{Int64Array, RecordBatch, StringArray};
use arrow_schema::{DataType, Field, Schema, SchemaRef};
use async_trait::async_trait;
use tokio::sync::Semaphore;

use super::{EngineConfig, EngineConnection, EngineDriver, EngineError, EngineInstance};
use crate::types::QueryParam;

/// A canned query result: schema, batches, and optionally an error surfaced
/// after the last batch has been consumed.
#[derive(Clone)]
struct MockResult {
    schema: SchemaRef,
    batches: Vec<RecordBatch>,
    error_after: Option<String>,
}

#[derive(Default)]
struct MockShared {
    opens: AtomicUsize,
    fail_opens: AtomicUsize,
    open_gate: Mutex<Option<Arc<Semaphore>>>,
    connects: AtomicUsize,
    closes: AtomicUsize,
    cancels: AtomicUsize,
    fail_closes: AtomicUsize,
    next_conn_id: AtomicUsize,
    fail_registrations: Mutex<HashSet<String>>,
    fail_sql: Mutex<HashMap<String, String>>,
    results: Mutex<HashMap<String, MockResult>>,
    affected: Mutex<HashMap<String, u64>>,
    executed: Mutex<Vec<(usize, String)>>,
    registered: Mutex<Vec<(String, String)>>,
    registration_log: Mutex<Vec<String>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().expect("mock state mutex poisoned")
}

fn take_failure(counter: &AtomicUsize) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

/// Test driver whose instances record every interaction and replay scripted
/// responses.
///
/// Clones share state, so a test can keep one copy for assertions and hand
/// another to the code under test.
#[derive(Clone, Default)]
pub struct MockDriver {
    shared: Arc<MockShared>,
}

impl MockDriver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` open attempts fail.
    pub fn fail_opens(&self, n: usize) {
        self.shared.fail_opens.store(n, Ordering::SeqCst);
    }

    /// Block open attempts until [`release_open`](Self::release_open) is
    /// called, one admission per call.
    pub fn gate_opens(&self) {
        *lock(&self.shared.open_gate) = Some(Arc::new(Semaphore::new(0)));
    }

    pub fn release_open(&self) {
        if let Some(gate) = lock(&self.shared.open_gate).as_ref() {
            gate.add_permits(1);
        }
    }

    /// Script the result streamed for `sql`.
    pub fn script_query(&self, sql: &str, schema: SchemaRef, batches: Vec<RecordBatch>) {
        lock(&self.shared.results).insert(
            sql.to_string(),
            MockResult {
                schema,
                batches,
                error_after: None,
            },
        );
    }

    /// Script `sql` to fail at submission time, for queries and statements
    /// alike.
    pub fn script_query_error(&self, sql: &str, message: &str) {
        lock(&self.shared.fail_sql).insert(sql.to_string(), message.to_string());
    }

    /// Script a result that streams its batches and then fails mid-iteration.
    pub fn script_query_with_tail_error(
        &self,
        sql: &str,
        schema: SchemaRef,
        batches: Vec<RecordBatch>,
        message: &str,
    ) {
        lock(&self.shared.results).insert(
            sql.to_string(),
            MockResult {
                schema,
                batches,
                error_after: Some(message.to_string()),
            },
        );
    }

    /// Script the affected-row count reported when `sql` is executed as a
    /// statement.
    pub fn script_affected(&self, sql: &str, rows: u64) {
        lock(&self.shared.affected).insert(sql.to_string(), rows);
    }

    /// Make every registration of `name` fail until allowed again.
    pub fn fail_registration(&self, name: &str) {
        lock(&self.shared.fail_registrations).insert(name.to_string());
    }

    pub fn allow_registration(&self, name: &str) {
        lock(&self.shared.fail_registrations).remove(name);
    }

    /// Make the next `n` connection closes report an error (they still
    /// count as closed).
    pub fn fail_next_closes(&self, n: usize) {
        self.shared.fail_closes.store(n, Ordering::SeqCst);
    }

    pub fn open_count(&self) -> usize {
        self.shared.opens.load(Ordering::SeqCst)
    }

    pub fn connect_count(&self) -> usize {
        self.shared.connects.load(Ordering::SeqCst)
    }

    pub fn close_count(&self) -> usize {
        self.shared.closes.load(Ordering::SeqCst)
    }

    pub fn cancel_count(&self) -> usize {
        self.shared.cancels.load(Ordering::SeqCst)
    }

    /// Every statement and query submitted, paired with the id of the
    /// connection that ran it.
    pub fn executed(&self) -> Vec<(usize, String)> {
        lock(&self.shared.executed).clone()
    }

    /// Names currently registered, in registration order.
    pub fn registered_names(&self) -> Vec<String> {
        lock(&self.shared.registered)
            .iter()
            .map(|(name, _)| name.clone())
            .collect()
    }

    /// Full history of registration attempts, including failed ones.
    pub fn registration_log(&self) -> Vec<String> {
        lock(&self.shared.registration_log).clone()
    }
}

#[async_trait]
impl EngineDriver for MockDriver {
    async fn open(&self, _config: &EngineConfig) -> Result<Arc<dyn EngineInstance>, EngineError> {
        let gate = lock(&self.shared.open_gate).clone();
        if let Some(gate) = gate {
            let permit = gate
                .acquire()
                .await
                .map_err(|_| EngineError::new("open gate closed"))?;
            permit.forget();
        }
        self.shared.opens.fetch_add(1, Ordering::SeqCst);
        if take_failure(&self.shared.fail_opens) {
            return Err(EngineError::new("scripted open failure"));
        }
        Ok(Arc::new(MockInstance {
            shared: self.shared.clone(),
            terminated: AtomicBool::new(false),
        }))
    }
}

struct MockInstance {
    shared: Arc<MockShared>,
    terminated: AtomicBool,
}

impl MockInstance {
    fn register(&self, name: &str, location: String) -> Result<(), EngineError> {
        lock(&self.shared.registration_log).push(name.to_string());
        if lock(&self.shared.fail_registrations).contains(name) {
            return Err(EngineError::new("scripted registration failure"));
        }
        let mut registered = lock(&self.shared.registered);
        if let Some(entry) = registered.iter_mut().find(|(existing, _)| existing == name) {
            entry.1 = location;
        } else {
            registered.push((name.to_string(), location));
        }
        Ok(())
    }
}

#[async_trait]
impl EngineInstance for MockInstance {
    async fn connect(&self) -> Result<Box<dyn EngineConnection>, EngineError> {
        if self.terminated.load(Ordering::SeqCst) {
            return Err(EngineError::new("engine terminated"));
        }
        self.shared.connects.fetch_add(1, Ordering::SeqCst);
        let conn_id = self.shared.next_conn_id.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MockConnection {
            shared: self.shared.clone(),
            conn_id,
            pending: None,
        }))
    }

    async fn register_file_path(&self, name: &str, file: &Path) -> Result<(), EngineError> {
        self.register(name, file.display().to_string())
    }

    async fn register_file_url(&self, name: &str, url: &str) -> Result<(), EngineError> {
        self.register(name, url.to_string())
    }

    async fn drop_file(&self, name: &str) -> Result<(), EngineError> {
        lock(&self.shared.registered).retain(|(existing, _)| existing != name);
        Ok(())
    }

    async fn reset(&self) -> Result<(), EngineError> {
        lock(&self.shared.registered).clear();
        Ok(())
    }

    async fn terminate(&self) -> Result<(), EngineError> {
        self.terminated.store(true, Ordering::SeqCst);
        lock(&self.shared.registered).clear();
        Ok(())
    }
}

struct PendingStream {
    batches: VecDeque<RecordBatch>,
    error_after: Option<String>,
}

struct MockConnection {
    shared: Arc<MockShared>,
    conn_id: usize,
    pending: Option<PendingStream>,
}

impl MockConnection {
    fn record(&self, sql: &str) {
        lock(&self.shared.executed).push((self.conn_id, sql.to_string()));
    }

    fn scripted_failure(&self, sql: &str) -> Option<EngineError> {
        lock(&self.shared.fail_sql)
            .get(sql)
            .map(|message| EngineError::new(message.clone()))
    }
}

#[async_trait]
impl EngineConnection for MockConnection {
    async fn execute(&mut self, sql: &str) -> Result<u64, EngineError> {
        self.record(sql);
        if let Some(err) = self.scripted_failure(sql) {
            return Err(err);
        }
        Ok(lock(&self.shared.affected).get(sql).copied().unwrap_or(0))
    }

    async fn prepare(&mut self, sql: &str) -> Result<(), EngineError> {
        self.record(sql);
        match self.scripted_failure(sql) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    async fn start_query(
        &mut self,
        sql: &str,
        _params: &[QueryParam],
    ) -> Result<SchemaRef, EngineError> {
        self.record(sql);
        if let Some(err) = self.scripted_failure(sql) {
            return Err(err);
        }
        let result = lock(&self.shared.results).get(sql).cloned();
        match result {
            Some(result) => {
                let schema = result.schema.clone();
                self.pending = Some(PendingStream {
                    batches: result.batches.into(),
                    error_after: result.error_after,
                });
                Ok(schema)
            }
            None => {
                self.pending = Some(PendingStream {
                    batches: VecDeque::new(),
                    error_after: None,
                });
                Ok(Arc::new(Schema::empty()))
            }
        }
    }

    async fn next_batch(&mut self) -> Result<Option<RecordBatch>, EngineError> {
        let Some(stream) = self.pending.as_mut() else {
            return Ok(None);
        };
        if let Some(batch) = stream.batches.pop_front() {
            return Ok(Some(batch));
        }
        let tail = stream.error_after.take();
        self.pending = None;
        match tail {
            Some(message) => Err(EngineError::new(message)),
            None => Ok(None),
        }
    }

    async fn cancel_pending(&mut self) -> Result<(), EngineError> {
        self.shared.cancels.fetch_add(1, Ordering::SeqCst);
        self.pending = None;
        Ok(())
    }

    async fn close(&mut self) -> Result<(), EngineError> {
        self.shared.closes.fetch_add(1, Ordering::SeqCst);
        self.pending = None;
        if take_failure(&self.shared.fail_closes) {
            return Err(EngineError::new("scripted close failure"));
        }
        Ok(())
    }
}

/// Build a single-column Int64 batch for scripting results.
pub fn int64_batch(column: &str, values: &[i64]) -> (SchemaRef, RecordBatch) {
    let schema: SchemaRef = Arc::new(Schema::new(vec![Field::new(
        column,
        DataType::Int64,
        false,
    )]));
    let array = Int64Array::from(values.to_vec());
    let batch = RecordBatch::try_new(schema.clone(), vec![Arc::new(array)])
        .expect("fixture batch construction");
    (schema, batch)
}

/// Build a single-column Utf8 batch for scripting results.
pub fn string_batch(column: &str, values: &[&str]) -> (SchemaRef, RecordBatch) {
    let schema: SchemaRef = Arc::new(Schema::new(vec![Field::new(
        column,
        DataType::Utf8,
        false,
    )]));
    let array = StringArray::from(values.to_vec());
    let batch = RecordBatch::try_new(schema.clone(), vec![Arc::new(array)])
        .expect("fixture batch construction");
    (schema, batch)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn scripted_query_streams_batches_then_ends() -> anyhow::Result<()> {
        let driver = MockDriver::new();
        let (schema, batch) = int64_batch("n", &[1, 2, 3]);
        driver.script_query("SELECT n FROM t", schema.clone(), vec![batch]);

        let instance = driver.open(&EngineConfig::default()).await?;
        let mut conn = instance.connect().await?;
        let streamed_schema = conn.start_query("SELECT n FROM t", &[]).await?;
        assert_eq!(streamed_schema, schema);
        let first = conn.next_batch().await?;
        assert_eq!(first.map(|b| b.num_rows()), Some(3));
        assert!(conn.next_batch().await?.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn unscripted_query_yields_empty_result() -> anyhow::Result<()> {
        let driver = MockDriver::new();
        let instance = driver.open(&EngineConfig::default()).await?;
        let mut conn = instance.connect().await?;
        let schema = conn.start_query("SELECT 1", &[]).await?;
        assert_eq!(schema.fields().len(), 0);
        assert!(conn.next_batch().await?.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn tail_error_surfaces_after_last_batch() -> anyhow::Result<()> {
        let driver = MockDriver::new();
        let (schema, batch) = int64_batch("n", &[5]);
        driver.script_query_with_tail_error("SELECT n", schema, vec![batch], "disk vanished");

        let instance = driver.open(&EngineConfig::default()).await?;
        let mut conn = instance.connect().await?;
        conn.start_query("SELECT n", &[]).await?;
        assert!(conn.next_batch().await?.is_some());
        let err = conn.next_batch().await.unwrap_err();
        assert!(err.to_string().contains("disk vanished"));
        Ok(())
    }
}
