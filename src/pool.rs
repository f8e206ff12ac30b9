//! Cooperative connection pool over the engine seam.
//!
//! Connections are logical handles onto the single engine instance, so the
//! pool never caps how many exist at once; it reuses idle ones (most
//! recently released first), runs the configured setup statements on each
//! new connection, and evicts idle connections that outlive the idle TTL.
//! A healthy released connection always goes back to the idle list.

use std::mem;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{debug, warn};

use crate::config::WorkbenchConfig;
use crate::engine::{EngineConnection, EngineHandle};
use crate::error::WorkbenchError;

struct IdleConnection {
    conn: Box<dyn EngineConnection>,
    last_used: Instant,
    needs_cancel: bool,
    epoch: u64,
}

struct PoolState {
    idle: Vec<IdleConnection>,
}

struct PoolInner {
    handle: EngineHandle,
    setup_sql: Vec<String>,
    idle_ttl_ms: u64,
    state: Mutex<PoolState>,
    total: AtomicUsize,
    // Bumped by drain; leases carry the epoch they were minted under, and a
    // connection from an older epoch is closed instead of repooled.
    epoch: AtomicU64,
}

/// Counters describing the pool at one instant.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct PoolStats {
    pub total: usize,
    pub idle: usize,
    pub in_use: usize,
}

#[derive(Clone)]
pub struct ConnectionPool {
    inner: Arc<PoolInner>,
}

impl ConnectionPool {
    pub fn new(handle: EngineHandle, config: &WorkbenchConfig) -> Self {
        let mut setup_sql = Vec::new();
        for extension in &config.extensions {
            setup_sql.push(format!("LOAD {extension}"));
        }
        setup_sql.extend(config.pragmas.iter().cloned());
        Self {
            inner: Arc::new(PoolInner {
                handle,
                setup_sql,
                idle_ttl_ms: config.idle_ttl_ms,
                state: Mutex::new(PoolState { idle: Vec::new() }),
                total: AtomicUsize::new(0),
                epoch: AtomicU64::new(0),
            }),
        }
    }

    /// Check out a connection, starting the engine on first use.
    ///
    /// New connections only join the pool's accounting once every setup
    /// statement has succeeded on them; a connection that fails setup is
    /// closed and the acquire fails with a setup error.
    pub async fn acquire(&self) -> Result<PoolLease, WorkbenchError> {
        let instance = self.inner.handle.ensure_open().await?;
        let epoch = self.inner.epoch.load(Ordering::SeqCst);
        loop {
            let (candidate, expired) = {
                let mut state = self.inner.state.lock().expect("pool state mutex poisoned");
                let expired = split_expired(&mut state.idle, self.inner.idle_ttl_ms);
                (state.idle.pop(), expired)
            };
            self.close_all(expired).await;
            let Some(mut idle) = candidate else { break };
            if idle.epoch != epoch {
                self.close_one(idle.conn).await;
                continue;
            }
            if idle.needs_cancel {
                if let Err(err) = idle.conn.cancel_pending().await {
                    warn!(error = %err, "discarding connection that failed to cancel");
                    self.close_one(idle.conn).await;
                    continue;
                }
            }
            debug!("reusing pooled connection");
            return Ok(self.lease(idle.conn, epoch));
        }

        let mut conn = instance
            .connect()
            .await
            .map_err(WorkbenchError::ConnectionSetup)?;
        for sql in &self.inner.setup_sql {
            if let Err(err) = conn.execute(sql).await {
                warn!(sql = %sql, error = %err, "connection setup statement failed");
                let _ = conn.close().await;
                return Err(WorkbenchError::ConnectionSetup(err));
            }
        }
        let total = self.inner.total.fetch_add(1, Ordering::SeqCst) + 1;
        debug!(total, "opened pooled connection");
        Ok(self.lease(conn, epoch))
    }

    /// Close every idle connection and retire the current generation.
    /// Connections still leased out are closed when they come back.
    pub async fn drain(&self) {
        self.inner.epoch.fetch_add(1, Ordering::SeqCst);
        let idle = {
            let mut state = self.inner.state.lock().expect("pool state mutex poisoned");
            mem::take(&mut state.idle)
        };
        let closed = idle.len();
        self.close_all(idle).await;
        debug!(closed, "pool drained");
    }

    pub fn stats(&self) -> PoolStats {
        let idle = self
            .inner
            .state
            .lock()
            .expect("pool state mutex poisoned")
            .idle
            .len();
        let total = self.inner.total.load(Ordering::SeqCst);
        PoolStats {
            total,
            idle,
            in_use: total.saturating_sub(idle),
        }
    }

    fn lease(&self, conn: Box<dyn EngineConnection>, epoch: u64) -> PoolLease {
        PoolLease {
            conn: Some(conn),
            pool: self.clone(),
            epoch,
        }
    }

    async fn push_idle(&self, conn: Box<dyn EngineConnection>, epoch: u64, needs_cancel: bool) {
        if epoch != self.inner.epoch.load(Ordering::SeqCst) {
            debug!("closing connection from a drained pool generation");
            self.close_one(conn).await;
            return;
        }
        let mut state = self.inner.state.lock().expect("pool state mutex poisoned");
        state.idle.push(IdleConnection {
            conn,
            last_used: Instant::now(),
            needs_cancel,
            epoch,
        });
    }

    fn park_abandoned(&self, conn: Box<dyn EngineConnection>, epoch: u64) {
        if epoch != self.inner.epoch.load(Ordering::SeqCst) {
            debug!("dropping connection from a drained pool generation");
            self.inner.total.fetch_sub(1, Ordering::SeqCst);
            return;
        }
        debug!("parking abandoned connection; it will be cancelled before reuse");
        let mut state = self.inner.state.lock().expect("pool state mutex poisoned");
        state.idle.push(IdleConnection {
            conn,
            last_used: Instant::now(),
            needs_cancel: true,
            epoch,
        });
    }

    async fn close_one(&self, mut conn: Box<dyn EngineConnection>) {
        if let Err(err) = conn.close().await {
            debug!(error = %err, "connection close reported an error");
        }
        self.inner.total.fetch_sub(1, Ordering::SeqCst);
    }

    async fn close_all(&self, connections: Vec<IdleConnection>) {
        for idle in connections {
            self.close_one(idle.conn).await;
        }
    }
}

/// A checked-out connection.
///
/// Release it with [`PoolLease::release`] once the work on it has settled.
/// Dropping a lease instead parks the connection flagged for a pending-work
/// cancel before its next reuse, which is how abandoned queries hand their
/// connection back.
pub struct PoolLease {
    conn: Option<Box<dyn EngineConnection>>,
    pool: ConnectionPool,
    epoch: u64,
}

impl PoolLease {
    pub fn connection(&mut self) -> &mut dyn EngineConnection {
        self.conn
            .as_deref_mut()
            .expect("connection already returned to pool")
    }

    /// Return the connection to the pool, consuming the lease.
    pub async fn release(mut self) {
        let Some(mut conn) = self.conn.take() else {
            return;
        };
        match conn.cancel_pending().await {
            Ok(()) => self.pool.push_idle(conn, self.epoch, false).await,
            Err(err) => {
                warn!(error = %err, "discarding connection on release");
                self.pool.close_one(conn).await;
            }
        }
    }
}

impl Drop for PoolLease {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.park_abandoned(conn, self.epoch);
        }
    }
}

fn split_expired(idle: &mut Vec<IdleConnection>, idle_ttl_ms: u64) -> Vec<IdleConnection> {
    if idle_ttl_ms == 0 || idle.is_empty() {
        return Vec::new();
    }
    let Some(cutoff) = Instant::now().checked_sub(Duration::from_millis(idle_ttl_ms)) else {
        return Vec::new();
    };
    let (keep, expired): (Vec<_>, Vec<_>) = mem::take(idle)
        .into_iter()
        .partition(|conn| conn.last_used >= cutoff);
    *idle = keep;
    expired
}
