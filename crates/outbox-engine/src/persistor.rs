//! Storage SPI for outbox entries.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::transaction::Transaction;
use crate::{EntryId, OutboxEntry, OutboxResult};

/// Durable storage of outbox entries.
///
/// Every operation runs inside the transaction it is given. Implementations
/// are responsible for making ownership transitions explicit:
/// - `save` must enlist in the caller's transaction so the entry is visible
///   only once that transaction commits.
/// - `claim_batch` must claim each entry with a single conditional update on
///   its current version, so concurrent claimants (in this process or another)
///   can never both claim the same entry.
/// - `update` and `delete` must only touch the row when its stored version
///   equals the entry's version, failing with `OptimisticLock` otherwise.
#[async_trait]
pub trait Persistor<TX: Transaction>: Send + Sync {
    /// Inserts a new entry. Fails with `AlreadyScheduled` when the entry's
    /// unique request id is taken.
    async fn save(&self, tx: &TX, entry: &OutboxEntry) -> OutboxResult<()>;

    /// Deletes the entry if its version still matches.
    async fn delete(&self, tx: &TX, entry: &OutboxEntry) -> OutboxResult<()>;

    /// Writes the entry's mutable fields if its version still matches, then
    /// bumps `entry.version` to the stored value.
    async fn update(&self, tx: &TX, entry: &mut OutboxEntry) -> OutboxResult<()>;

    /// Confirms the entry is still pending at the caller's version, holding
    /// it for the rest of the transaction where the store supports it.
    async fn lock(&self, tx: &TX, entry: &OutboxEntry) -> OutboxResult<bool>;

    /// Clears the blacklist flag and resets attempts. Returns false when the
    /// entry does not exist or is not blacklisted.
    async fn whitelist(&self, tx: &TX, entry_id: &EntryId) -> OutboxResult<bool>;

    /// Claims up to `limit` due entries, oldest due first, moving each one's
    /// `next_attempt_at` to `lease_until` and bumping its version.
    async fn claim_batch(
        &self,
        tx: &TX,
        now: DateTime<Utc>,
        limit: usize,
        lease_until: DateTime<Utc>,
    ) -> OutboxResult<Vec<OutboxEntry>>;

    /// Gives back a claim that could not be dispatched, making the entry due
    /// at `due_at`. Returns false if the entry moved on in the meantime.
    async fn release(&self, tx: &TX, entry: &OutboxEntry, due_at: DateTime<Utc>)
        -> OutboxResult<bool>;

    /// Removes processed entries whose retention window ended before `now`.
    async fn delete_processed_and_expired(
        &self,
        tx: &TX,
        now: DateTime<Utc>,
        limit: usize,
    ) -> OutboxResult<usize>;

    /// Reads an entry by id.
    async fn get(&self, tx: &TX, entry_id: &EntryId) -> OutboxResult<Option<OutboxEntry>>;

    /// Removes every entry.
    async fn clear(&self, tx: &TX) -> OutboxResult<()>;
}
