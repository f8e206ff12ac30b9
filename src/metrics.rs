use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use serde::Serialize;

use crate::types::{QueryMeta, QueryStatus};

const DEFAULT_HISTORY_SIZE: usize = 200;

/// Per-session execution counters plus a bounded ring of recent queries.
#[derive(Clone)]
pub struct Metrics {
    inner: Arc<MetricsInner>,
}

struct MetricsInner {
    started_at: Instant,
    started_at_ms: u64,
    history_size: usize,
    total_queries: AtomicU64,
    cache_hits: AtomicU64,
    total_errors: AtomicU64,
    recent: RwLock<VecDeque<QueryMeta>>,
}

#[derive(Clone, Serialize)]
pub struct MetricsSnapshot {
    pub started_at_ms: u64,
    pub uptime_ms: u64,
    pub total_queries: u64,
    pub cache_hits: u64,
    pub total_errors: u64,
    /// Most recent first.
    pub recent: Vec<QueryMeta>,
    pub history_size: usize,
}

impl Metrics {
    pub fn new(history_size: usize) -> Self {
        let history_size = if history_size == 0 {
            DEFAULT_HISTORY_SIZE
        } else {
            history_size
        };
        Self {
            inner: Arc::new(MetricsInner {
                started_at: Instant::now(),
                started_at_ms: now_millis(),
                history_size,
                total_queries: AtomicU64::new(0),
                cache_hits: AtomicU64::new(0),
                total_errors: AtomicU64::new(0),
                recent: RwLock::new(VecDeque::with_capacity(history_size)),
            }),
        }
    }

    pub fn record(&self, meta: &QueryMeta) {
        self.inner.total_queries.fetch_add(1, Ordering::Relaxed);
        if meta.cache_hit {
            self.inner.cache_hits.fetch_add(1, Ordering::Relaxed);
        }
        if meta.status == QueryStatus::Error {
            self.inner.total_errors.fetch_add(1, Ordering::Relaxed);
        }
        let mut recent = self
            .inner
            .recent
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        push_ring(&mut recent, meta.clone(), self.inner.history_size);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let recent = self
            .inner
            .recent
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .iter()
            .rev()
            .cloned()
            .collect::<Vec<_>>();
        MetricsSnapshot {
            started_at_ms: self.inner.started_at_ms,
            uptime_ms: self.inner.started_at.elapsed().as_millis() as u64,
            total_queries: self.inner.total_queries.load(Ordering::Relaxed),
            cache_hits: self.inner.cache_hits.load(Ordering::Relaxed),
            total_errors: self.inner.total_errors.load(Ordering::Relaxed),
            recent,
            history_size: self.inner.history_size,
        }
    }
}

fn push_ring<T>(target: &mut VecDeque<T>, value: T, max: usize) {
    if target.len() >= max {
        target.pop_front();
    }
    target.push_back(value);
}

pub(crate) fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_else(|_| Duration::from_secs(0))
        .as_millis() as u64
}
