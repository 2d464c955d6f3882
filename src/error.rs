//! Error types for synclimit.

use thiserror::Error;

use crate::mesh::ClusterError;
use crate::store::StoreError;

/// Main error type for synclimit operations.
#[derive(Error, Debug)]
pub enum SynclimitError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Invalid limiter parameters
    #[error("Invalid limiter: {0}")]
    InvalidLimiter(String),

    /// A synchronizer was started outside of a tokio runtime
    #[error("Synchronizer requires a running tokio runtime")]
    NoRuntime,

    /// Counter store errors
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// Gossip cluster errors
    #[error("Cluster error: {0}")]
    Cluster(#[from] ClusterError),
}

/// Result type alias for synclimit operations.
pub type Result<T> = std::result::Result<T, SynclimitError>;
