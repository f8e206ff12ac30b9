//! Production DuckDB driver.
//!
//! `duckdb::Connection` is not `Sync` and every call into it blocks, so each
//! connection lives on its own OS thread and talks to the async world over a
//! tagged command channel. Streamed result batches cross back on a bounded
//! channel of capacity 1: the consumer pulling a batch is what lets the
//! worker advance to the next one, and dropping the receiver abandons the
//! walk.

use std::path::Path;
use std::sync::{Arc, Mutex};

use arrow_array::RecordBatch;
use arrow_schema::SchemaRef;
use async_trait::async_trait;
use duckdb::types::Value;
use duckdb::{params_from_iter, Config, Connection};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, instrument, warn};

use super::{
    quote_ident, quote_literal, EngineConfig, EngineConnection, EngineDriver, EngineError,
    EngineInstance,
};
use crate::types::QueryParam;

const COMMAND_QUEUE_DEPTH: usize = 8;

impl From<duckdb::Error> for EngineError {
    fn from(err: duckdb::Error) -> Self {
        EngineError::new(err.to_string())
    }
}

/// Commands handled by the root worker thread, which owns the database's
/// primary connection and is the only place new connections are cloned from.
enum RootCmd {
    Execute {
        sql: String,
        reply: oneshot::Sender<Result<(), EngineError>>,
    },
    CloneConnection {
        reply: oneshot::Sender<Result<Connection, EngineError>>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Commands handled by a per-connection worker thread.
enum ConnCmd {
    Execute {
        sql: String,
        reply: oneshot::Sender<Result<u64, EngineError>>,
    },
    Prepare {
        sql: String,
        reply: oneshot::Sender<Result<(), EngineError>>,
    },
    Query {
        sql: String,
        params: Vec<Value>,
        schema_reply: oneshot::Sender<Result<SchemaRef, EngineError>>,
        batches: mpsc::Sender<RecordBatch>,
    },
    Close {
        reply: oneshot::Sender<()>,
    },
}

/// Driver for an in-memory DuckDB database, one per engine instance.
#[derive(Debug, Clone, Default)]
pub struct DuckDbDriver;

#[async_trait]
impl EngineDriver for DuckDbDriver {
    #[instrument(skip(self, config))]
    async fn open(&self, config: &EngineConfig) -> Result<Arc<dyn EngineInstance>, EngineError> {
        let init_sql = config.init_sql.clone();
        let conn = tokio::task::spawn_blocking(move || open_database(&init_sql))
            .await
            .map_err(|err| EngineError::new(format!("engine open task failed: {err}")))??;

        let (root, commands) = mpsc::channel(COMMAND_QUEUE_DEPTH);
        std::thread::Builder::new()
            .name("sqldeck-duckdb-root".to_string())
            .spawn(move || run_root_worker(conn, commands))
            .map_err(|err| EngineError::new(format!("failed to spawn engine worker: {err}")))?;

        info!("duckdb engine started");
        Ok(Arc::new(DuckDbInstance {
            root,
            views: Mutex::new(Vec::new()),
        }))
    }
}

fn open_database(init_sql: &[String]) -> Result<Connection, EngineError> {
    let flags = Config::default()
        .enable_autoload_extension(true)?
        .allow_unsigned_extensions()?;
    let conn = Connection::open_in_memory_with_flags(flags)?;
    for sql in init_sql {
        let trimmed = sql.trim();
        if !trimmed.is_empty() {
            conn.execute_batch(trimmed)?;
        }
    }
    Ok(conn)
}

/// One running in-memory DuckDB database.
///
/// Data sources become views over auto-detected file readers; the instance
/// tracks their names so `reset` can drop them without tearing the
/// database down.
pub struct DuckDbInstance {
    root: mpsc::Sender<RootCmd>,
    views: Mutex<Vec<String>>,
}

impl DuckDbInstance {
    async fn send_root(&self, cmd: RootCmd) -> Result<(), EngineError> {
        self.root
            .send(cmd)
            .await
            .map_err(|_| EngineError::new("engine terminated"))
    }

    async fn execute_root(&self, sql: String) -> Result<(), EngineError> {
        let (reply, response) = oneshot::channel();
        self.send_root(RootCmd::Execute { sql, reply }).await?;
        response
            .await
            .map_err(|_| EngineError::new("engine terminated"))?
    }

    async fn register_location(&self, name: &str, location: &str) -> Result<(), EngineError> {
        let sql = format!(
            "CREATE OR REPLACE VIEW {} AS SELECT * FROM {}",
            quote_ident(name),
            quote_literal(location)
        );
        self.execute_root(sql).await?;
        let mut views = self.views.lock().expect("view registry mutex poisoned");
        if !views.iter().any(|existing| existing == name) {
            views.push(name.to_string());
        }
        debug!(name, location, "registered data source view");
        Ok(())
    }
}

#[async_trait]
impl EngineInstance for DuckDbInstance {
    async fn connect(&self) -> Result<Box<dyn EngineConnection>, EngineError> {
        let (reply, response) = oneshot::channel();
        self.send_root(RootCmd::CloneConnection { reply }).await?;
        let conn = response
            .await
            .map_err(|_| EngineError::new("engine terminated"))??;
        let connection = DuckDbConnection::spawn(conn)?;
        debug!("opened engine connection");
        Ok(Box::new(connection))
    }

    async fn register_file_path(&self, name: &str, file: &Path) -> Result<(), EngineError> {
        let location = file
            .to_str()
            .ok_or_else(|| EngineError::new("source path is not valid UTF-8"))?;
        self.register_location(name, location).await
    }

    async fn register_file_url(&self, name: &str, url: &str) -> Result<(), EngineError> {
        self.register_location(name, url).await
    }

    async fn drop_file(&self, name: &str) -> Result<(), EngineError> {
        let sql = format!("DROP VIEW IF EXISTS {}", quote_ident(name));
        self.execute_root(sql).await?;
        self.views
            .lock()
            .expect("view registry mutex poisoned")
            .retain(|existing| existing != name);
        Ok(())
    }

    async fn reset(&self) -> Result<(), EngineError> {
        let names: Vec<String> = {
            let mut views = self.views.lock().expect("view registry mutex poisoned");
            std::mem::take(&mut *views)
        };
        let mut first_err = None;
        for name in names {
            let sql = format!("DROP VIEW IF EXISTS {}", quote_ident(&name));
            if let Err(err) = self.execute_root(sql).await {
                warn!(name = %name, error = %err, "failed to drop view during reset");
                if first_err.is_none() {
                    first_err = Some(err);
                }
            }
        }
        debug!("engine reset complete");
        match first_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    async fn terminate(&self) -> Result<(), EngineError> {
        let (reply, done) = oneshot::channel();
        if self.root.send(RootCmd::Shutdown { reply }).await.is_err() {
            return Ok(());
        }
        let _ = done.await;
        info!("duckdb engine terminated");
        Ok(())
    }
}

/// Async handle to one worker-owned DuckDB connection.
pub struct DuckDbConnection {
    commands: mpsc::Sender<ConnCmd>,
    pending: Option<mpsc::Receiver<RecordBatch>>,
}

impl DuckDbConnection {
    fn spawn(conn: Connection) -> Result<Self, EngineError> {
        let (commands, receiver) = mpsc::channel(COMMAND_QUEUE_DEPTH);
        std::thread::Builder::new()
            .name("sqldeck-duckdb-conn".to_string())
            .spawn(move || run_conn_worker(conn, receiver))
            .map_err(|err| EngineError::new(format!("failed to spawn connection worker: {err}")))?;
        Ok(Self {
            commands,
            pending: None,
        })
    }

    async fn send(&self, cmd: ConnCmd) -> Result<(), EngineError> {
        self.commands
            .send(cmd)
            .await
            .map_err(|_| EngineError::new("connection worker terminated"))
    }
}

#[async_trait]
impl EngineConnection for DuckDbConnection {
    async fn execute(&mut self, sql: &str) -> Result<u64, EngineError> {
        // Dropping the receiver first keeps the worker from blocking on an
        // abandoned batch send ahead of this command.
        self.pending = None;
        let (reply, response) = oneshot::channel();
        self.send(ConnCmd::Execute {
            sql: sql.to_string(),
            reply,
        })
        .await?;
        response
            .await
            .map_err(|_| EngineError::new("connection worker terminated"))?
    }

    async fn prepare(&mut self, sql: &str) -> Result<(), EngineError> {
        self.pending = None;
        let (reply, response) = oneshot::channel();
        self.send(ConnCmd::Prepare {
            sql: sql.to_string(),
            reply,
        })
        .await?;
        response
            .await
            .map_err(|_| EngineError::new("connection worker terminated"))?
    }

    async fn start_query(
        &mut self,
        sql: &str,
        params: &[QueryParam],
    ) -> Result<SchemaRef, EngineError> {
        self.pending = None;
        let params: Vec<Value> = params.iter().map(to_engine_value).collect();
        let (schema_reply, schema_response) = oneshot::channel();
        let (batch_tx, batch_rx) = mpsc::channel(1);
        self.send(ConnCmd::Query {
            sql: sql.to_string(),
            params,
            schema_reply,
            batches: batch_tx,
        })
        .await?;
        let schema = schema_response
            .await
            .map_err(|_| EngineError::new("connection worker terminated"))??;
        self.pending = Some(batch_rx);
        Ok(schema)
    }

    async fn next_batch(&mut self) -> Result<Option<RecordBatch>, EngineError> {
        let Some(receiver) = self.pending.as_mut() else {
            return Ok(None);
        };
        match receiver.recv().await {
            Some(batch) => Ok(Some(batch)),
            None => {
                self.pending = None;
                Ok(None)
            }
        }
    }

    async fn cancel_pending(&mut self) -> Result<(), EngineError> {
        self.pending = None;
        Ok(())
    }

    async fn close(&mut self) -> Result<(), EngineError> {
        self.pending = None;
        let (reply, done) = oneshot::channel();
        if self.commands.send(ConnCmd::Close { reply }).await.is_err() {
            return Ok(());
        }
        let _ = done.await;
        Ok(())
    }
}

fn run_root_worker(conn: Connection, mut commands: mpsc::Receiver<RootCmd>) {
    while let Some(cmd) = commands.blocking_recv() {
        match cmd {
            RootCmd::Execute { sql, reply } => {
                let result = conn.execute_batch(&sql).map_err(EngineError::from);
                let _ = reply.send(result);
            }
            RootCmd::CloneConnection { reply } => {
                let _ = reply.send(conn.try_clone().map_err(EngineError::from));
            }
            RootCmd::Shutdown { reply } => {
                let _ = reply.send(());
                break;
            }
        }
    }
}

fn run_conn_worker(conn: Connection, mut commands: mpsc::Receiver<ConnCmd>) {
    while let Some(cmd) = commands.blocking_recv() {
        match cmd {
            ConnCmd::Execute { sql, reply } => {
                let _ = reply.send(execute_on(&conn, &sql));
            }
            ConnCmd::Prepare { sql, reply } => {
                let result = conn.prepare(&sql).map(|_| ()).map_err(EngineError::from);
                let _ = reply.send(result);
            }
            ConnCmd::Query {
                sql,
                params,
                schema_reply,
                batches,
            } => {
                stream_query(&conn, &sql, &params, schema_reply, batches);
            }
            ConnCmd::Close { reply } => {
                let _ = reply.send(());
                break;
            }
        }
    }
}

fn execute_on(conn: &Connection, sql: &str) -> Result<u64, EngineError> {
    let mut stmt = conn.prepare(sql)?;
    let affected = stmt.execute([])?;
    debug!(affected, "executed statement");
    Ok(affected as u64)
}

fn stream_query(
    conn: &Connection,
    sql: &str,
    params: &[Value],
    schema_reply: oneshot::Sender<Result<SchemaRef, EngineError>>,
    batches: mpsc::Sender<RecordBatch>,
) {
    let mut stmt = match conn.prepare(sql) {
        Ok(stmt) => stmt,
        Err(err) => {
            let _ = schema_reply.send(Err(err.into()));
            return;
        }
    };
    let arrow = if params.is_empty() {
        stmt.query_arrow([])
    } else {
        stmt.query_arrow(params_from_iter(params.iter()))
    };
    let arrow = match arrow {
        Ok(arrow) => arrow,
        Err(err) => {
            let _ = schema_reply.send(Err(err.into()));
            return;
        }
    };
    let schema = arrow.get_schema();
    if schema_reply.send(Ok(schema)).is_err() {
        return;
    }
    for batch in arrow {
        if batches.blocking_send(batch).is_err() {
            return;
        }
    }
}

fn to_engine_value(param: &QueryParam) -> Value {
    match param {
        QueryParam::Null => Value::Null,
        QueryParam::Bool(v) => Value::Boolean(*v),
        QueryParam::Int(v) => Value::BigInt(*v),
        QueryParam::Float(v) => Value::Double(*v),
        QueryParam::Text(v) => Value::Text(v.clone()),
        QueryParam::Blob(v) => Value::Blob(v.clone()),
    }
}
