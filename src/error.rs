//! Error types shared by the engine, stores, and providers.

use thiserror::Error;

/// Failures raised by a persistence backend.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The underlying database reported an error.
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// A stored column could not be decoded.
    #[error("corrupt row: {0}")]
    Corrupt(String),

    /// A lock guarding in-process state was poisoned.
    #[error("poisoned lock: {0}")]
    Poisoned(&'static str),

    /// A filesystem operation around the store failed.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        Self::Corrupt(err.to_string())
    }
}

/// Errors returned by [`crate::sim::engine::SimulationEngine`].
#[derive(Debug, Error)]
pub enum SimulationError {
    /// The creation payload was empty, mixed, or malformed.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// No run exists with the given id.
    #[error("simulation '{0}' not found")]
    NotFound(String),

    /// The store failed; the transaction was rolled back.
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Errors raised while talking to an upstream data provider.
#[derive(Debug, Error)]
pub enum ProviderError {
    /// Transport or HTTP status failure.
    #[error("{provider} request failed: {source}")]
    Http {
        /// Provider name.
        provider: &'static str,
        /// Underlying client error.
        #[source]
        source: reqwest::Error,
    },

    /// The response body did not have the expected shape.
    #[error("{provider} returned an unexpected payload: {message}")]
    Payload {
        /// Provider name.
        provider: &'static str,
        /// What was wrong with it.
        message: String,
    },
}

/// Failure of one ingestion source.
#[derive(Debug, Error)]
pub enum IngestError {
    /// The upstream provider failed.
    #[error(transparent)]
    Provider(#[from] ProviderError),

    /// Writing the readings failed.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// The blocking database task panicked or was cancelled.
    #[error("database task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}
