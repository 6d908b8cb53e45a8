//! Database error types.

use outbox_engine::OutboxError;
use thiserror::Error;

/// Database error type.
#[derive(Error, Debug)]
pub enum DatabaseError {
    /// SQLite error
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// Connection error
    #[error("Connection error: {0}")]
    Connection(String),

    /// Migration error
    #[error("Migration error: {0}")]
    Migration(String),

    /// Transaction begin/commit/rollback error, or use of a finished transaction
    #[error("Transaction error: {0}")]
    Transaction(String),

    /// Another entry already holds this unique request id
    #[error("Duplicate request id: {0}")]
    Duplicate(String),

    /// The stored row no longer has the expected version
    #[error("Version conflict on entry {0}")]
    Conflict(String),

    /// Not found error
    #[error("Not found: {0}")]
    NotFound(String),

    /// JSON serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Invalid data error
    #[error("Invalid data: {0}")]
    InvalidData(String),
}

/// Result type alias using DatabaseError.
pub type DatabaseResult<T> = Result<T, DatabaseError>;

impl From<DatabaseError> for OutboxError {
    fn from(err: DatabaseError) -> Self {
        match err {
            DatabaseError::Duplicate(request_id) => OutboxError::AlreadyScheduled(request_id),
            DatabaseError::Conflict(entry_id) => OutboxError::OptimisticLock(entry_id),
            DatabaseError::Transaction(message) => OutboxError::Transaction(message),
            DatabaseError::Json(e) => OutboxError::Json(e),
            DatabaseError::Io(e) => OutboxError::Io(e),
            other => OutboxError::Persistence(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn storage_errors_map_to_engine_errors() {
        assert!(matches!(
            OutboxError::from(DatabaseError::Duplicate("r-1".into())),
            OutboxError::AlreadyScheduled(id) if id == "r-1"
        ));
        assert!(OutboxError::from(DatabaseError::Conflict("e-1".into())).is_concurrent_modification());
        assert!(matches!(
            OutboxError::from(DatabaseError::Connection("gone".into())),
            OutboxError::Persistence(msg) if msg == "Connection error: gone"
        ));
    }
}
