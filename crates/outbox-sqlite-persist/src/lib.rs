//! SQLite backend for the outbox engine.
//!
//! This crate provides:
//! - [`SqliteTransactionManager`] - `BEGIN IMMEDIATE` transactions over a
//!   small pool of async connections, each on its own executor thread
//! - [`SqlitePersistor`] - version-gated storage of outbox entries
//! - Schema migrations tracked in a `migrations` table
//! - Query helpers, including operator listings and purges
//!
//! # Architecture
//!
//! ```ignore
//! let tm = SqliteTransactionManager::open(path).await?;
//! let outbox = TransactionOutbox::builder(tm.clone(), Arc::new(SqlitePersistor), registry).build()?;
//!
//! tm.transactionally(|tx| async move {
//!     tx.call(|conn| queries_of_your_own(conn)).await?;
//!     outbox.schedule(HandlerCall::new("Mailer", "send").arg(42).transaction(tx)).await
//! }).await?;
//! ```
//!
//! **Important**: Only SQL operations should run inside `tx.call()`.
//! Anything slow holds the database write lock for every other writer.

mod error;
mod executor;
mod migrations;
mod models;
mod persistor;
pub mod queries;
mod transaction;

pub use error::{DatabaseError, DatabaseResult};
pub use executor::SqliteExecutor;
pub use migrations::{run_migrations, CURRENT_VERSION};
pub use models::{EntryCounts, EntryFilter, DEFAULT_LIST_LIMIT};
pub use persistor::SqlitePersistor;
pub use transaction::{
    SqliteContext, SqliteTransaction, SqliteTransactionManager, DEFAULT_MAX_IDLE_CONNECTIONS,
};
