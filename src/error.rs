//! Error taxonomy for a vectorization pass.
//!
//! Per-record failures ([`ProviderError`], [`PersistenceError`]) are folded
//! into a [`RecordError`] and counted by the run controller; they never
//! escape it. Only [`FatalError`] reaches the invocation surface.

use std::time::Duration;

use thiserror::Error;

use crate::models::RecordKey;

type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// The embedding call for one record did not yield a usable vector.
#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("embedding provider is disabled")]
    Disabled,

    #[error("nothing to embed: record produced an empty context")]
    EmptyInput,

    #[error("embedding request failed: {0}")]
    Request(String),

    #[error("embedding API error {status}: {body}")]
    Status { status: u16, body: String },

    #[error("embedding call timed out after {0:?}")]
    Timeout(Duration),

    #[error("malformed embedding response: {0}")]
    Malformed(String),

    #[error("embedding has {got} dimensions, expected {expected}")]
    DimensionMismatch { expected: usize, got: usize },
}

impl From<reqwest::Error> for ProviderError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            ProviderError::Request(format!("timeout: {}", e))
        } else if e.is_decode() {
            ProviderError::Malformed(e.to_string())
        } else {
            ProviderError::Request(e.to_string())
        }
    }
}

/// Writing a computed vector back to the store failed. The vector is dropped.
#[derive(Debug, Error)]
#[error("failed to store vector for {key}: {source}")]
pub struct PersistenceError {
    pub key: RecordKey,
    #[source]
    pub source: BoxError,
}

impl PersistenceError {
    pub fn new(key: RecordKey, source: impl Into<BoxError>) -> Self {
        Self {
            key,
            source: source.into(),
        }
    }
}

/// Outcome of a failed record attempt.
#[derive(Debug, Error)]
pub enum RecordError {
    #[error(transparent)]
    Provider(#[from] ProviderError),

    #[error(transparent)]
    Persistence(#[from] PersistenceError),
}

impl RecordError {
    /// Short label used in logs and JSON progress output.
    pub fn kind(&self) -> &'static str {
        match self {
            RecordError::Provider(_) => "provider",
            RecordError::Persistence(_) => "persistence",
        }
    }
}

/// Aborts the run before any record is processed.
#[derive(Debug, Error)]
pub enum FatalError {
    #[error("store unavailable: {0}")]
    StoreUnavailable(#[source] BoxError),

    #[error("failed to select pending records: {0}")]
    Selection(#[source] BoxError),

    #[error("embedding client could not be created: {0}")]
    Provider(String),
}

impl FatalError {
    pub fn store(e: impl Into<BoxError>) -> Self {
        FatalError::StoreUnavailable(e.into())
    }

    pub fn selection(e: impl Into<BoxError>) -> Self {
        FatalError::Selection(e.into())
    }
}
