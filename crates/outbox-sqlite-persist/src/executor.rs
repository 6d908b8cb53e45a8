//! Async SQLite connection running on a dedicated background thread.
//!
//! Each [`SqliteExecutor`] owns one `tokio_rusqlite` connection. Closures
//! passed to [`SqliteExecutor::call`] run on that connection's thread, in
//! FIFO order, while the caller's task is parked.
//!
//! Only SQL and lightweight row mapping belong inside `call()`. Handler
//! logic, locking and anything slow must happen outside, otherwise every
//! transaction queued behind the connection waits on it.
//!
//! ```ignore
//! let db = SqliteExecutor::open(path).await?;
//! db.migrate().await?;
//! let entry = db.call(move |conn| queries::get_entry(conn, &id)).await?;
//! ```

use std::path::Path;

use tokio_rusqlite::Connection;
use tracing::{debug, info};

use crate::{migrations, DatabaseError, DatabaseResult};

/// Convert a tokio_rusqlite::Error to DatabaseError.
fn from_tokio_rusqlite(e: tokio_rusqlite::Error) -> DatabaseError {
    match e {
        tokio_rusqlite::Error::Rusqlite(e) => DatabaseError::Sqlite(e),
        tokio_rusqlite::Error::Close(_) => DatabaseError::Connection("Connection closed".to_string()),
        other => DatabaseError::Connection(other.to_string()),
    }
}

/// One SQLite connection with its own executor thread.
#[derive(Clone)]
pub struct SqliteExecutor {
    conn: Connection,
    path: String,
}

impl SqliteExecutor {
    /// Open a connection to the database at `path`.
    ///
    /// Creates the file and its parent directory if needed and applies the
    /// WAL and busy-timeout pragmas. Migrations are run separately through
    /// [`SqliteExecutor::migrate`].
    pub async fn open(path: &Path) -> DatabaseResult<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let path_str = path.to_string_lossy().to_string();

        let conn = Connection::open(path_str.clone())
            .await
            .map_err(|e| DatabaseError::Connection(e.to_string()))?;

        conn.call(|conn| {
            conn.execute_batch(
                "
                PRAGMA journal_mode = WAL;
                PRAGMA synchronous = NORMAL;
                PRAGMA foreign_keys = ON;
                PRAGMA cache_size = -64000;
                PRAGMA temp_store = MEMORY;
                PRAGMA mmap_size = 268435456;
                PRAGMA busy_timeout = 5000;
                ",
            )?;
            Ok(())
        })
        .await
        .map_err(from_tokio_rusqlite)?;

        debug!(path = %path_str, "Opened SQLite connection");

        Ok(Self {
            conn,
            path: path_str,
        })
    }

    /// Apply any pending schema migrations.
    ///
    /// Runs under a write lock so processes opening the same file at once
    /// apply each migration exactly once.
    pub async fn migrate(&self) -> DatabaseResult<()> {
        self.conn
            .call(|conn| {
                conn.execute_batch("BEGIN IMMEDIATE")?;
                if let Err(e) = migrations::run_migrations(conn) {
                    let _ = conn.execute_batch("ROLLBACK");
                    return Err(rusqlite::Error::ToSqlConversionFailure(Box::new(e)).into());
                }
                conn.execute_batch("COMMIT")?;
                Ok(())
            })
            .await
            .map_err(|e| match from_tokio_rusqlite(e) {
                DatabaseError::Sqlite(rusqlite::Error::ToSqlConversionFailure(inner)) => {
                    DatabaseError::Migration(inner.to_string())
                }
                other => other,
            })?;
        info!(path = %self.path, "Outbox schema up to date");
        Ok(())
    }

    /// Execute a closure on the connection's thread.
    pub async fn call<F, T>(&self, f: F) -> DatabaseResult<T>
    where
        F: FnOnce(&rusqlite::Connection) -> DatabaseResult<T> + Send + 'static,
        T: Send + 'static,
    {
        // Our DatabaseResult travels inside tokio_rusqlite's Ok so that
        // domain errors (conflicts, duplicates) survive the round trip.
        let outer_result = self.conn.call(move |conn| Ok(f(conn))).await;

        match outer_result {
            Ok(inner) => inner,
            Err(e) => Err(from_tokio_rusqlite(e)),
        }
    }

    /// Execute a closure that returns a rusqlite::Result.
    pub async fn call_sqlite<F, T>(&self, f: F) -> DatabaseResult<T>
    where
        F: FnOnce(&rusqlite::Connection) -> rusqlite::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        self.conn
            .call(move |conn| Ok(f(conn)?))
            .await
            .map_err(from_tokio_rusqlite)
    }

    /// Get the database file path.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Check the connection by executing a trivial query.
    pub async fn health_check(&self) -> DatabaseResult<()> {
        self.call_sqlite(|conn| conn.execute_batch("SELECT 1")).await?;
        debug!("Database health check passed");
        Ok(())
    }

    /// Close the connection, waiting for queued work to finish.
    pub async fn close(self) -> DatabaseResult<()> {
        self.conn
            .close()
            .await
            .map_err(|e| DatabaseError::Connection(format!("Failed to close database: {:?}", e)))?;
        debug!(path = %self.path, "SQLite connection closed");
        Ok(())
    }
}
