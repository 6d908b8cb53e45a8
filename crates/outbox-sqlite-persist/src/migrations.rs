//! Database migrations.
//!
//! Migrations are run in order and tracked in the `migrations` table.

use crate::DatabaseResult;
use rusqlite::Connection;
use tracing::{debug, info};

/// Current schema version.
pub const CURRENT_VERSION: i32 = 2;

/// Run all pending migrations.
pub fn run_migrations(conn: &Connection) -> DatabaseResult<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS migrations (
            version INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        )",
        [],
    )?;

    let current_version: i32 = conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM migrations",
        [],
        |row| row.get(0),
    )?;

    if current_version >= CURRENT_VERSION {
        debug!(current_version, "Schema already current");
        return Ok(());
    }

    info!(current_version, target_version = CURRENT_VERSION, "Running migrations");

    if current_version < 1 {
        migrate_v1_outbox_entries(conn)?;
    }
    if current_version < 2 {
        migrate_v2_blacklisted_index(conn)?;
    }

    info!("Migrations complete");
    Ok(())
}

fn record_migration(conn: &Connection, version: i32, name: &str) -> DatabaseResult<()> {
    conn.execute(
        "INSERT INTO migrations (version, name) VALUES (?1, ?2)",
        rusqlite::params![version, name],
    )?;
    debug!(version, name, "Migration applied");
    Ok(())
}

/// V1: outbox entries. Timestamps are epoch milliseconds.
fn migrate_v1_outbox_entries(conn: &Connection) -> DatabaseResult<()> {
    info!("Applying migration v1: outbox_entries");

    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS outbox_entries (
            id TEXT PRIMARY KEY,
            unique_request_id TEXT UNIQUE,
            invocation TEXT NOT NULL,
            created_at INTEGER NOT NULL,
            last_attempt_at INTEGER,
            next_attempt_at INTEGER NOT NULL,
            attempts INTEGER NOT NULL DEFAULT 0,
            blacklisted INTEGER NOT NULL DEFAULT 0,
            processed INTEGER NOT NULL DEFAULT 0,
            version INTEGER NOT NULL DEFAULT 1
        );

        CREATE INDEX IF NOT EXISTS idx_outbox_entries_due
            ON outbox_entries(processed, blacklisted, next_attempt_at);
        ",
    )?;

    record_migration(conn, 1, "outbox_entries")?;
    Ok(())
}

/// V2: partial index for operator listings of blacklisted entries.
fn migrate_v2_blacklisted_index(conn: &Connection) -> DatabaseResult<()> {
    info!("Applying migration v2: blacklisted index");

    conn.execute_batch(
        "
        CREATE INDEX IF NOT EXISTS idx_outbox_entries_blacklisted
            ON outbox_entries(created_at) WHERE blacklisted = 1;
        ",
    )?;

    record_migration(conn, 2, "blacklisted_index")?;
    Ok(())
}
