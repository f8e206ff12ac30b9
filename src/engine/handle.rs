//! Lazy, shared handle to the session's engine instance.
//!
//! The engine starts on first use: every caller goes through
//! [`EngineHandle::ensure_open`], and concurrent callers during startup
//! collapse onto a single driver open. A failed open leaves the handle
//! closed so the next call retries from scratch.

use std::mem;
use std::sync::{Arc, Mutex};

use tracing::{debug, info, warn};

use super::{EngineConfig, EngineDriver, EngineInstance};
use crate::error::WorkbenchError;
use crate::session::id::SessionId;
use crate::sources::{DataSourceRegistry, ReplayFailure};

struct HandleInner {
    driver: Arc<dyn EngineDriver>,
    engine_config: EngineConfig,
    registry: DataSourceRegistry,
    // Serializes open, reset, and dispose; the only lock held across awaits.
    init_lock: tokio::sync::Mutex<()>,
    instance: Mutex<Option<Arc<dyn EngineInstance>>>,
    session: Mutex<Option<SessionId>>,
    replay_failures: Mutex<Vec<ReplayFailure>>,
}

#[derive(Clone)]
pub struct EngineHandle {
    inner: Arc<HandleInner>,
}

impl EngineHandle {
    pub fn new(
        driver: Arc<dyn EngineDriver>,
        engine_config: EngineConfig,
        registry: DataSourceRegistry,
    ) -> Self {
        Self {
            inner: Arc::new(HandleInner {
                driver,
                engine_config,
                registry,
                init_lock: tokio::sync::Mutex::new(()),
                instance: Mutex::new(None),
                session: Mutex::new(None),
                replay_failures: Mutex::new(Vec::new()),
            }),
        }
    }

    /// The running instance, if the engine is currently open.
    pub fn current(&self) -> Option<Arc<dyn EngineInstance>> {
        self.inner
            .instance
            .lock()
            .expect("engine state mutex poisoned")
            .clone()
    }

    /// The session id, minted at the first successful open. Survives resets
    /// and is cleared by dispose.
    pub fn session_id(&self) -> Option<SessionId> {
        self.inner
            .session
            .lock()
            .expect("engine state mutex poisoned")
            .clone()
    }

    /// Return the running instance, starting the engine if needed.
    ///
    /// The instance only becomes visible once recorded data sources have
    /// been replayed onto it, so a successful return means the engine is
    /// fully usable.
    pub async fn ensure_open(&self) -> Result<Arc<dyn EngineInstance>, WorkbenchError> {
        if let Some(instance) = self.current() {
            return Ok(instance);
        }
        let _guard = self.inner.init_lock.lock().await;
        if let Some(instance) = self.current() {
            return Ok(instance);
        }
        debug!("starting engine");
        let instance = self
            .inner
            .driver
            .open(&self.inner.engine_config)
            .await
            .map_err(WorkbenchError::EngineInit)?;
        {
            let mut session = self
                .inner
                .session
                .lock()
                .expect("engine state mutex poisoned");
            if session.is_none() {
                let id = SessionId::new();
                info!(session = %id, "engine session started");
                *session = Some(id);
            }
        }
        let failures = self.inner.registry.replay(instance.as_ref()).await;
        self.stash_failures(failures);
        *self
            .inner
            .instance
            .lock()
            .expect("engine state mutex poisoned") = Some(instance.clone());
        Ok(instance)
    }

    /// Reset the running engine in place and replay data sources onto it.
    ///
    /// The session id is preserved. A closed engine makes this a no-op.
    pub async fn reset(&self) -> Result<(), WorkbenchError> {
        let _guard = self.inner.init_lock.lock().await;
        let Some(instance) = self.current() else {
            debug!("reset requested while engine closed");
            return Ok(());
        };
        instance
            .reset()
            .await
            .map_err(WorkbenchError::EngineInit)?;
        let failures = self.inner.registry.replay(instance.as_ref()).await;
        self.stash_failures(failures);
        info!("engine reset");
        Ok(())
    }

    /// Tear the engine down and end the session. Idempotent; teardown
    /// errors are logged, not surfaced.
    pub async fn dispose(&self) {
        let _guard = self.inner.init_lock.lock().await;
        let instance = self
            .inner
            .instance
            .lock()
            .expect("engine state mutex poisoned")
            .take();
        let session = self
            .inner
            .session
            .lock()
            .expect("engine state mutex poisoned")
            .take();
        if let Some(instance) = instance {
            if let Err(err) = instance.terminate().await {
                warn!(error = %err, "engine terminate reported an error");
            }
        }
        if let Some(session) = session {
            info!(session = %session, "session disposed");
        }
    }

    /// Drain the failures recorded by the most recent source replay.
    pub fn take_replay_failures(&self) -> Vec<ReplayFailure> {
        mem::take(
            &mut *self
                .inner
                .replay_failures
                .lock()
                .expect("engine state mutex poisoned"),
        )
    }

    fn stash_failures(&self, failures: Vec<ReplayFailure>) {
        *self
            .inner
            .replay_failures
            .lock()
            .expect("engine state mutex poisoned") = failures;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::mock::MockDriver;
    use crate::types::DataSource;

    fn handle_for(driver: &MockDriver) -> EngineHandle {
        EngineHandle::new(
            Arc::new(driver.clone()),
            EngineConfig::default(),
            DataSourceRegistry::new(),
        )
    }

    #[tokio::test]
    async fn failed_open_leaves_handle_closed_and_retry_succeeds() -> anyhow::Result<()> {
        let driver = MockDriver::new();
        driver.fail_opens(1);
        let handle = handle_for(&driver);

        assert!(handle.ensure_open().await.is_err());
        assert!(handle.current().is_none());
        assert!(handle.session_id().is_none());

        handle.ensure_open().await?;
        assert!(handle.current().is_some());
        assert_eq!(driver.open_count(), 2);
        Ok(())
    }

    #[tokio::test]
    async fn concurrent_callers_share_one_open() -> anyhow::Result<()> {
        let driver = MockDriver::new();
        driver.gate_opens();
        let handle = handle_for(&driver);

        let mut tasks = Vec::new();
        for _ in 0..5 {
            let handle = handle.clone();
            tasks.push(tokio::spawn(async move { handle.ensure_open().await }));
        }
        tokio::task::yield_now().await;
        driver.release_open();

        let mut instances = Vec::new();
        for task in tasks {
            instances.push(task.await??);
        }
        assert_eq!(driver.open_count(), 1);
        let first = &instances[0];
        assert!(instances.iter().all(|other| Arc::ptr_eq(first, other)));
        Ok(())
    }

    #[tokio::test]
    async fn session_survives_reset_and_ends_on_dispose() -> anyhow::Result<()> {
        let driver = MockDriver::new();
        let handle = handle_for(&driver);

        handle.ensure_open().await?;
        let before = handle.session_id().map(|id| id.to_string());
        handle.reset().await?;
        let after = handle.session_id().map(|id| id.to_string());
        assert_eq!(before, after);

        handle.dispose().await;
        assert!(handle.session_id().is_none());
        assert!(handle.current().is_none());

        handle.ensure_open().await?;
        let renewed = handle.session_id().map(|id| id.to_string());
        assert_ne!(before, renewed);
        Ok(())
    }

    #[tokio::test]
    async fn open_replays_sources_recorded_while_closed() -> anyhow::Result<()> {
        let driver = MockDriver::new();
        let registry = DataSourceRegistry::new();
        registry
            .upsert(None, DataSource::remote("sales.csv", "https://example.com/sales.csv"))
            .await?;
        let handle = EngineHandle::new(
            Arc::new(driver.clone()),
            EngineConfig::default(),
            registry,
        );

        handle.ensure_open().await?;
        assert_eq!(driver.registered_names(), vec!["sales.csv"]);
        assert!(handle.take_replay_failures().is_empty());
        Ok(())
    }
}
