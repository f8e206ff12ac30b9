use thiserror::Error;

use crate::engine::EngineError;

#[derive(Debug, Error)]
pub enum WorkbenchError {
    #[error("engine initialization failed: {0}")]
    EngineInit(EngineError),
    #[error("connection setup failed: {0}")]
    ConnectionSetup(EngineError),
    #[error("query execution failed: {0}")]
    QueryExecution(String),
    #[error("failed to register source '{path}': {reason}")]
    SourceRegistration { path: String, reason: String },
    #[error("cache store error: {0}")]
    CacheStore(String),
    #[error("query cancelled")]
    Cancelled,
}

impl WorkbenchError {
    /// Classify an engine-side failure raised while running a query.
    pub(crate) fn query(err: EngineError) -> Self {
        WorkbenchError::QueryExecution(err.to_string())
    }

    pub(crate) fn source(path: &str, err: EngineError) -> Self {
        WorkbenchError::SourceRegistration {
            path: path.to_string(),
            reason: err.to_string(),
        }
    }
}
