//! Error types for enclave-state

use thiserror::Error;

/// Errors that can occur in the state persistence layer
#[derive(Error, Debug)]
pub enum StorageError {
    /// Could not reach or authenticate against the backing store
    #[error("store connection failed: {0}")]
    Connection(String),

    /// The backing store rejected or failed a query
    #[error("store backend error: {0}")]
    Backend(String),

    /// A record could not be encoded or decoded
    #[error("record serialization failed: {0}")]
    Serialization(String),

    /// Schema setup error
    #[error("schema setup failed: {0}")]
    SchemaSetup(String),

    /// The store is deliberately refusing work (used by fakes to simulate outages)
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

impl From<surrealdb::Error> for StorageError {
    fn from(err: surrealdb::Error) -> Self {
        StorageError::Backend(err.to_string())
    }
}

impl From<serde_json::Error> for StorageError {
    fn from(err: serde_json::Error) -> Self {
        StorageError::Serialization(err.to_string())
    }
}
