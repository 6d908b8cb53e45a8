//! [`Persistor`] over the `outbox_entries` table.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use outbox_engine::{EntryId, OutboxEntry, OutboxResult, Persistor};

use crate::transaction::SqliteTransaction;
use crate::{queries, EntryCounts, EntryFilter};

/// Stores outbox entries in the database of the transaction it is handed.
#[derive(Debug, Clone, Copy, Default)]
pub struct SqlitePersistor;

impl SqlitePersistor {
    pub fn new() -> Self {
        Self
    }

    /// Entries matching `filter`, oldest first.
    pub async fn list(
        &self,
        tx: &SqliteTransaction,
        filter: EntryFilter,
    ) -> OutboxResult<Vec<OutboxEntry>> {
        Ok(tx.call(move |conn| queries::list_entries(conn, &filter)).await?)
    }

    pub async fn counts(&self, tx: &SqliteTransaction) -> OutboxResult<EntryCounts> {
        Ok(tx.call(queries::count_entries).await?)
    }

    /// Deletes every processed entry whose retention ends before `before`.
    pub async fn purge_processed(
        &self,
        tx: &SqliteTransaction,
        before: DateTime<Utc>,
    ) -> OutboxResult<usize> {
        Ok(tx.call(move |conn| queries::purge_processed(conn, before)).await?)
    }

    pub async fn find_by_request_id(
        &self,
        tx: &SqliteTransaction,
        request_id: &str,
    ) -> OutboxResult<Option<OutboxEntry>> {
        let request_id = request_id.to_string();
        Ok(tx
            .call(move |conn| queries::find_by_request_id(conn, &request_id))
            .await?)
    }
}

#[async_trait]
impl Persistor<SqliteTransaction> for SqlitePersistor {
    async fn save(&self, tx: &SqliteTransaction, entry: &OutboxEntry) -> OutboxResult<()> {
        let entry = entry.clone();
        Ok(tx.call(move |conn| queries::insert_entry(conn, &entry)).await?)
    }

    async fn delete(&self, tx: &SqliteTransaction, entry: &OutboxEntry) -> OutboxResult<()> {
        let (id, version) = (entry.id.clone(), entry.version);
        Ok(tx
            .call(move |conn| queries::delete_entry(conn, &id, version))
            .await?)
    }

    async fn update(&self, tx: &SqliteTransaction, entry: &mut OutboxEntry) -> OutboxResult<()> {
        let snapshot = entry.clone();
        entry.version = tx
            .call(move |conn| queries::update_entry(conn, &snapshot))
            .await?;
        Ok(())
    }

    async fn lock(&self, tx: &SqliteTransaction, entry: &OutboxEntry) -> OutboxResult<bool> {
        // The transaction already holds the database write lock; confirming
        // the version is all that is left to do.
        let (id, version) = (entry.id.clone(), entry.version);
        Ok(tx
            .call(move |conn| queries::is_pending_at_version(conn, &id, version))
            .await?)
    }

    async fn whitelist(&self, tx: &SqliteTransaction, entry_id: &EntryId) -> OutboxResult<bool> {
        let id = entry_id.clone();
        Ok(tx.call(move |conn| queries::whitelist_entry(conn, &id)).await?)
    }

    async fn claim_batch(
        &self,
        tx: &SqliteTransaction,
        now: DateTime<Utc>,
        limit: usize,
        lease_until: DateTime<Utc>,
    ) -> OutboxResult<Vec<OutboxEntry>> {
        Ok(tx
            .call(move |conn| queries::claim_due_entries(conn, now, limit, lease_until))
            .await?)
    }

    async fn release(
        &self,
        tx: &SqliteTransaction,
        entry: &OutboxEntry,
        due_at: DateTime<Utc>,
    ) -> OutboxResult<bool> {
        let (id, version) = (entry.id.clone(), entry.version);
        Ok(tx
            .call(move |conn| queries::release_entry(conn, &id, version, due_at))
            .await?)
    }

    async fn delete_processed_and_expired(
        &self,
        tx: &SqliteTransaction,
        now: DateTime<Utc>,
        limit: usize,
    ) -> OutboxResult<usize> {
        Ok(tx
            .call(move |conn| queries::delete_processed_and_expired(conn, now, limit))
            .await?)
    }

    async fn get(
        &self,
        tx: &SqliteTransaction,
        entry_id: &EntryId,
    ) -> OutboxResult<Option<OutboxEntry>> {
        let id = entry_id.clone();
        Ok(tx.call(move |conn| queries::get_entry(conn, &id)).await?)
    }

    async fn clear(&self, tx: &SqliteTransaction) -> OutboxResult<()> {
        tx.call(queries::clear_entries).await?;
        Ok(())
    }
}
