//! Command implementations.

mod admin;
mod entries;

pub use admin::{migrate, show_config};
pub use entries::{list, purge, show, stats, whitelist};

use anyhow::Context;
use outbox_sqlite_persist::SqliteTransactionManager;
use tracing::debug;

use crate::paths::Paths;

/// Open the outbox database, applying any pending migrations.
async fn open_database(paths: &Paths) -> anyhow::Result<SqliteTransactionManager> {
    let path = paths.database_file();
    debug!(path = %path.display(), "Opening outbox database");
    SqliteTransactionManager::open_with_pool_size(path, 1)
        .await
        .with_context(|| format!("failed to open {}", path.display()))
}
