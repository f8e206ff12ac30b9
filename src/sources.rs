//! Data source registry.
//!
//! Holds the session's registered files and URLs independently of engine
//! lifetime. Registrations made while the engine is closed are recorded and
//! applied on the next open; after a reset the whole set is replayed so the
//! fresh engine sees the same sources in the same order.

use std::sync::{Arc, Mutex};

use serde::Serialize;
use tracing::{debug, warn};

use crate::engine::{EngineError, EngineInstance};
use crate::error::WorkbenchError;
use crate::types::DataSource;

/// One source that could not be re-registered during a replay.
#[derive(Debug, Clone, Serialize)]
pub struct ReplayFailure {
    pub path: String,
    pub reason: String,
}

struct RegistryInner {
    sources: Mutex<Vec<DataSource>>,
}

/// Ordered, path-keyed collection of the session's data sources.
#[derive(Clone)]
pub struct DataSourceRegistry {
    inner: Arc<RegistryInner>,
}

impl Default for DataSourceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl DataSourceRegistry {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                sources: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Current registrations in the order they will replay.
    pub fn snapshot(&self) -> Vec<DataSource> {
        self.inner
            .sources
            .lock()
            .expect("source registry mutex poisoned")
            .clone()
    }

    /// Record `source`, replacing any earlier registration of the same path
    /// in place, and apply it to the engine when one is running.
    ///
    /// A failed engine registration keeps the recorded entry so the next
    /// replay retries it.
    pub async fn upsert(
        &self,
        instance: Option<&dyn EngineInstance>,
        source: DataSource,
    ) -> Result<(), WorkbenchError> {
        let replaced = {
            let mut sources = self
                .inner
                .sources
                .lock()
                .expect("source registry mutex poisoned");
            match sources
                .iter_mut()
                .find(|existing| existing.path() == source.path())
            {
                Some(slot) => {
                    *slot = source.clone();
                    true
                }
                None => {
                    sources.push(source.clone());
                    false
                }
            }
        };
        let Some(instance) = instance else {
            debug!(path = source.path(), "engine closed; source recorded for replay");
            return Ok(());
        };
        if replaced {
            if let Err(err) = instance.drop_file(source.path()).await {
                debug!(path = source.path(), error = %err, "dropping replaced source failed");
            }
        }
        register_one(instance, &source)
            .await
            .map_err(|err| WorkbenchError::source(source.path(), err))
    }

    /// Forget the registration for `path`, dropping it from the engine when
    /// one is running. Returns whether the path was registered.
    pub async fn remove(
        &self,
        instance: Option<&dyn EngineInstance>,
        path: &str,
    ) -> Result<bool, WorkbenchError> {
        let existed = {
            let mut sources = self
                .inner
                .sources
                .lock()
                .expect("source registry mutex poisoned");
            let before = sources.len();
            sources.retain(|existing| existing.path() != path);
            sources.len() != before
        };
        if !existed {
            return Ok(false);
        }
        if let Some(instance) = instance {
            instance
                .drop_file(path)
                .await
                .map_err(|err| WorkbenchError::source(path, err))?;
        }
        Ok(true)
    }

    /// Forget every recorded source. Engine-side cleanup is the caller's
    /// concern; this is for ending a session, where the engine goes down
    /// with it.
    pub fn clear(&self) {
        self.inner
            .sources
            .lock()
            .expect("source registry mutex poisoned")
            .clear();
    }

    /// Re-apply every recorded source to a freshly opened or reset engine.
    ///
    /// Failures are collected rather than aborting the replay, so one broken
    /// source cannot block the rest of the session's data.
    pub async fn replay(&self, instance: &dyn EngineInstance) -> Vec<ReplayFailure> {
        let sources = self.snapshot();
        let mut failures = Vec::new();
        for source in &sources {
            if let Err(err) = register_one(instance, source).await {
                warn!(path = source.path(), error = %err, "source replay failed");
                failures.push(ReplayFailure {
                    path: source.path().to_string(),
                    reason: err.to_string(),
                });
            }
        }
        debug!(
            total = sources.len(),
            failed = failures.len(),
            "source replay finished"
        );
        failures
    }
}

async fn register_one(
    instance: &dyn EngineInstance,
    source: &DataSource,
) -> Result<(), EngineError> {
    match source {
        DataSource::Local { path, file } => instance.register_file_path(path, file).await,
        DataSource::Remote { path, url } => instance.register_file_url(path, url).await,
    }
}
