//! Outbox error types.

use thiserror::Error;

/// Outbox error type.
#[derive(Error, Debug)]
pub enum OutboxError {
    /// The entry could not be durably recorded while scheduling.
    #[error("Scheduling failed: {0}")]
    SchedulingFailure(String),

    /// An entry with the same unique request id already exists.
    #[error("Request already scheduled: {0}")]
    AlreadyScheduled(String),

    /// The stored entry no longer has the version the caller holds.
    #[error("Entry {0} was modified concurrently")]
    OptimisticLock(String),

    /// A scheduled call carried neither a transaction nor a context argument.
    #[error("No transaction or transaction context found for {0}")]
    NoTransaction(String),

    /// The transaction handle was used after commit or rollback.
    #[error("Transaction {0} is no longer active")]
    TransactionClosed(String),

    /// Transaction begin/commit/rollback failed.
    #[error("Transaction error: {0}")]
    Transaction(String),

    /// No handler is registered under the given name.
    #[error("Handler not found: {0}")]
    HandlerNotFound(String),

    /// The handler ran and failed.
    #[error("Handler failed: {0:#}")]
    Handler(anyhow::Error),

    /// An invocation argument was missing or had the wrong type.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Storage error reported by a persistor.
    #[error("Persistence error: {0}")]
    Persistence(String),

    /// The submitter refused the work (e.g. its queue is full).
    #[error("Submission rejected: {0}")]
    Rejected(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl OutboxError {
    /// Returns true for errors that mean another claimant already owns the entry.
    pub fn is_concurrent_modification(&self) -> bool {
        matches!(self, Self::OptimisticLock(_))
    }
}

/// Result type alias using OutboxError.
pub type OutboxResult<T> = Result<T, OutboxError>;
