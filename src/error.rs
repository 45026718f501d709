// Error taxonomy for the client runtime.
//
// Everything user-facing is rooted at `ClientError`. Cache and transaction
// subsystems have their own enums that fold into the root via `#[from]`,
// so `?` works across subsystem boundaries.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, ClientError>;

/// Top-level error type surfaced by the client facade.
#[derive(Error, Debug)]
pub enum ClientError {
    #[error("Authentication error: {0}")]
    Authentication(String),

    #[error("Access error: {0}")]
    Access(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Multiple matches: {0}")]
    MultipleMatches(String),

    #[error("Server error: {0}")]
    Server(String),

    #[error("Session error: {0}")]
    Session(String),

    #[error(transparent)]
    Cache(#[from] CacheError),

    #[error(transparent)]
    Transaction(#[from] TransactionError),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ClientError {
    /// True for errors where retrying an idempotent read is reasonable.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ClientError::Connection(_) | ClientError::Timeout(_))
    }
}

/// Cache subsystem errors.
///
/// These never fail a user operation on the read/write path; the cache
/// manager degrades to the origin and counts them. They surface only from
/// direct backend APIs and key construction.
#[derive(Error, Debug)]
pub enum CacheError {
    #[error(transparent)]
    Backend(#[from] CacheBackendError),

    #[error("Cache key error: {0}")]
    Key(String),

    #[error("Circuit open: {0}")]
    CircuitOpen(String),
}

/// Errors raised by a cache backend implementation.
#[derive(Error, Debug)]
pub enum CacheBackendError {
    #[error("Cache connection error: {0}")]
    Connection(String),

    #[error("Cache timeout: {0}")]
    Timeout(String),

    #[error("Cache serialization error: {0}")]
    Serialization(String),

    #[error("Cache backend error: {0}")]
    Other(String),
}

/// Transaction lifecycle errors.
#[derive(Error, Debug)]
pub enum TransactionError {
    #[error("Invalid transaction state: expected {expected}, found {found}")]
    InvalidState { expected: String, found: String },

    #[error("Savepoint not found: {0}")]
    SavepointNotFound(String),

    #[error("Compensation failed: {0}")]
    CompensationFailed(String),

    #[error("No active transaction")]
    NoActiveTransaction,

    #[error("Transaction error: {0}")]
    Other(String),
}
