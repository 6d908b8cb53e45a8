//! Entry inspection and repair commands.

use std::sync::Arc;

use anyhow::{bail, Result};
use chrono::{DateTime, Utc};
use outbox_engine::{
    EntryId, EntryStatus, HandlerRegistry, OutboxConfig, Persistor, TransactionManager,
    TransactionOutbox,
};
use outbox_sqlite_persist::{EntryFilter, SqlitePersistor, SqliteTransaction};
use tracing::info;

use super::open_database;
use crate::output::{self, OutputFormat};
use crate::paths::Paths;

/// List entries, oldest first.
pub async fn list(
    paths: &Paths,
    status: Option<EntryStatus>,
    limit: usize,
    format: &OutputFormat,
) -> Result<()> {
    let tm = open_database(paths).await?;
    let filter = EntryFilter { status, limit };
    let entries = tm
        .transactionally(|tx| async move { SqlitePersistor.list(&tx, filter).await })
        .await?;

    match format {
        OutputFormat::Json => output::print_json(&entries)?,
        OutputFormat::Text => {
            if entries.is_empty() {
                println!("No entries found");
            } else {
                output::print_entry_header();
                for entry in &entries {
                    println!("{}", output::entry_line(entry));
                }
            }
        }
    }
    Ok(())
}

/// Show one entry in full.
pub async fn show(paths: &Paths, id: &str, format: &OutputFormat) -> Result<()> {
    let tm = open_database(paths).await?;
    let entry_id = EntryId::from_string(id);
    let entry = tm
        .transactionally(|tx| async move { SqlitePersistor.get(&tx, &entry_id).await })
        .await?;

    let Some(entry) = entry else {
        bail!("Entry {id} not found");
    };
    match format {
        OutputFormat::Json => output::print_json(&entry)?,
        OutputFormat::Text => output::print_entry_details(&entry),
    }
    Ok(())
}

/// Count entries per state.
pub async fn stats(paths: &Paths, format: &OutputFormat) -> Result<()> {
    let tm = open_database(paths).await?;
    let counts = tm
        .transactionally(|tx| async move { SqlitePersistor.counts(&tx).await })
        .await?;

    match format {
        OutputFormat::Json => output::print_json(&serde_json::json!({
            "pending": counts.pending,
            "blacklisted": counts.blacklisted,
            "processed": counts.processed,
            "total": counts.total(),
        }))?,
        OutputFormat::Text => {
            output::print_row("Pending", &counts.pending.to_string());
            output::print_row("Blacklisted", &counts.blacklisted.to_string());
            output::print_row("Processed", &counts.processed.to_string());
            output::print_row("Total", &counts.total().to_string());
        }
    }
    Ok(())
}

/// Return a blacklisted entry to the pending state.
///
/// Goes through the engine so the change is logged the same way as a
/// whitelist issued by the application itself. No handlers are needed.
pub async fn whitelist(paths: &Paths, id: &str, format: &OutputFormat) -> Result<()> {
    let config = OutboxConfig::load(paths.config_file())?;
    let tm = open_database(paths).await?;
    let outbox = TransactionOutbox::builder(
        tm,
        Arc::new(SqlitePersistor),
        Arc::new(HandlerRegistry::<SqliteTransaction>::new()),
    )
    .config(config)
    .build()?;

    if !outbox.whitelist_entry(&EntryId::from_string(id)).await? {
        bail!("Entry {id} not found or not blacklisted");
    }
    output::print_success(&format!("Entry {id} whitelisted"), format);
    Ok(())
}

/// Delete processed entries whose retention has ended, or all of them.
pub async fn purge(paths: &Paths, all: bool, format: &OutputFormat) -> Result<()> {
    let tm = open_database(paths).await?;
    let before = if all { DateTime::<Utc>::MAX_UTC } else { Utc::now() };
    let purged = tm
        .transactionally(|tx| async move { SqlitePersistor.purge_processed(&tx, before).await })
        .await?;

    info!(purged, all, "Purged processed entries");
    output::print_success(&format!("Purged {purged} processed entries"), format);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use outbox_engine::{Invocation, OutboxEntry};
    use outbox_sqlite_persist::SqliteTransactionManager;
    use tempfile::{tempdir, TempDir};

    async fn seeded(entries: Vec<OutboxEntry>) -> (TempDir, Paths, SqliteTransactionManager) {
        let dir = tempdir().unwrap();
        let paths = Paths::resolve(
            Some(dir.path().join("outbox.db")),
            Some(dir.path().join("config.json")),
        )
        .unwrap();
        let tm = SqliteTransactionManager::open(paths.database_file()).await.unwrap();
        tm.transactionally(|tx| async move {
            for entry in &entries {
                SqlitePersistor.save(&tx, entry).await?;
            }
            Ok(())
        })
        .await
        .unwrap();
        (dir, paths, tm)
    }

    fn entry() -> OutboxEntry {
        let now = Utc::now();
        OutboxEntry::new(Invocation::new("Mailer", "send", vec![]), None, now, now)
    }

    async fn stored(tm: &SqliteTransactionManager, id: &EntryId) -> Option<OutboxEntry> {
        let id = id.clone();
        tm.transactionally(|tx| async move { SqlitePersistor.get(&tx, &id).await })
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn whitelist_resets_blacklisted_entry() {
        let mut blacklisted = entry();
        blacklisted.blacklisted = true;
        blacklisted.attempts = 5;
        let id = blacklisted.id.clone();
        let (_dir, paths, tm) = seeded(vec![blacklisted]).await;

        whitelist(&paths, id.as_str(), &OutputFormat::Text).await.unwrap();
        let entry = stored(&tm, &id).await.unwrap();
        assert_eq!(entry.status(), EntryStatus::Pending);
        assert_eq!(entry.attempts, 0);

        assert!(whitelist(&paths, id.as_str(), &OutputFormat::Text).await.is_err());
    }

    #[tokio::test]
    async fn show_unknown_entry_fails() {
        let (_dir, paths, _tm) = seeded(vec![]).await;
        assert!(show(&paths, "missing", &OutputFormat::Text).await.is_err());
    }

    #[tokio::test]
    async fn purge_respects_retention_unless_all() {
        let mut expired = entry();
        expired.processed = true;
        expired.next_attempt_at = Utc::now() - Duration::hours(1);
        let mut retained = entry();
        retained.processed = true;
        retained.next_attempt_at = Utc::now() + Duration::days(7);
        let pending = entry();
        let ids = [expired.id.clone(), retained.id.clone(), pending.id.clone()];
        let (_dir, paths, tm) = seeded(vec![expired, retained, pending]).await;

        purge(&paths, false, &OutputFormat::Text).await.unwrap();
        assert!(stored(&tm, &ids[0]).await.is_none());
        assert!(stored(&tm, &ids[1]).await.is_some());

        purge(&paths, true, &OutputFormat::Text).await.unwrap();
        assert!(stored(&tm, &ids[1]).await.is_none());
        assert!(stored(&tm, &ids[2]).await.is_some(), "pending entries are never purged");

        list(&paths, None, 10, &OutputFormat::Json).await.unwrap();
        stats(&paths, &OutputFormat::Text).await.unwrap();
    }
}
