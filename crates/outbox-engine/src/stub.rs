//! In-memory transaction manager and persistor.
//!
//! Transactions are serialized through a single gate and undone through a
//! per-transaction journal on rollback, which gives the same visibility
//! rules as a real database for a single process. Useful for tests and for
//! embedding the engine without a database.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::persistor::Persistor;
use crate::transaction::{PostCommitHook, Transaction, TransactionManager};
use crate::{EntryId, OutboxEntry, OutboxError, OutboxResult};

type Undo = Box<dyn FnOnce() + Send>;

/// Context token of a [`StubTransaction`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StubContext(pub u64);

struct StubTransactionState {
    id: u64,
    active: AtomicBool,
    undo: Mutex<Vec<Undo>>,
    hooks: Mutex<Vec<PostCommitHook>>,
}

/// Handle to an in-memory transaction.
#[derive(Clone)]
pub struct StubTransaction {
    state: Arc<StubTransactionState>,
}

impl StubTransaction {
    fn new(id: u64) -> Self {
        Self {
            state: Arc::new(StubTransactionState {
                id,
                active: AtomicBool::new(true),
                undo: Mutex::new(Vec::new()),
                hooks: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn id(&self) -> u64 {
        self.state.id
    }

    pub fn is_active(&self) -> bool {
        self.state.active.load(Ordering::SeqCst)
    }

    /// Registers a compensating action run if the transaction rolls back.
    /// Anything a test writes alongside the outbox goes through here.
    pub fn on_rollback(&self, undo: impl FnOnce() + Send + 'static) -> OutboxResult<()> {
        self.ensure_active()?;
        self.state
            .undo
            .lock()
            .expect("lock poisoned")
            .push(Box::new(undo));
        Ok(())
    }

    pub fn ensure_active(&self) -> OutboxResult<()> {
        if self.is_active() {
            Ok(())
        } else {
            Err(OutboxError::TransactionClosed(format!("stub-{}", self.state.id)))
        }
    }

    /// Ends the transaction. On commit the journal is discarded and the
    /// hooks are returned; on rollback the journal is replayed in reverse and
    /// the hooks are dropped.
    fn finish(&self, commit: bool) -> Vec<PostCommitHook> {
        self.state.active.store(false, Ordering::SeqCst);
        let undo = std::mem::take(&mut *self.state.undo.lock().expect("lock poisoned"));
        let hooks = std::mem::take(&mut *self.state.hooks.lock().expect("lock poisoned"));
        if commit {
            hooks
        } else {
            undo.into_iter().rev().for_each(|undo| undo());
            Vec::new()
        }
    }
}

impl fmt::Debug for StubTransaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StubTransaction")
            .field("id", &self.state.id)
            .field("active", &self.is_active())
            .finish()
    }
}

impl Transaction for StubTransaction {
    type Context = StubContext;

    fn context(&self) -> StubContext {
        StubContext(self.state.id)
    }

    fn add_post_commit_hook(&self, hook: PostCommitHook) {
        self.state.hooks.lock().expect("lock poisoned").push(hook);
    }
}

struct StubManagerInner {
    gate: Arc<tokio::sync::Mutex<()>>,
    next_id: AtomicU64,
    open: Mutex<HashMap<u64, StubTransaction>>,
}

/// Serializing in-memory transaction manager.
#[derive(Clone)]
pub struct StubTransactionManager {
    inner: Arc<StubManagerInner>,
}

impl StubTransactionManager {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(StubManagerInner {
                gate: Arc::new(tokio::sync::Mutex::new(())),
                next_id: AtomicU64::new(1),
                open: Mutex::new(HashMap::new()),
            }),
        }
    }
}

impl Default for StubTransactionManager {
    fn default() -> Self {
        Self::new()
    }
}

impl TransactionManager for StubTransactionManager {
    type Transaction = StubTransaction;

    fn transactionally<T, F, Fut>(&self, work: F) -> impl Future<Output = OutboxResult<T>> + Send
    where
        T: Send + 'static,
        F: FnOnce(StubTransaction) -> Fut + Send,
        Fut: Future<Output = OutboxResult<T>> + Send,
    {
        let inner = self.inner.clone();
        async move {
            let gate = inner.gate.clone().lock_owned().await;
            let tx = StubTransaction::new(inner.next_id.fetch_add(1, Ordering::SeqCst));
            inner
                .open
                .lock()
                .expect("lock poisoned")
                .insert(tx.id(), tx.clone());

            let result = work(tx.clone()).await;

            inner.open.lock().expect("lock poisoned").remove(&tx.id());
            let hooks = tx.finish(result.is_ok());
            drop(gate);

            for hook in hooks {
                hook().await;
            }
            result
        }
    }

    fn transaction_for_context(&self, context: &StubContext) -> Option<StubTransaction> {
        self.inner
            .open
            .lock()
            .expect("lock poisoned")
            .get(&context.0)
            .cloned()
    }
}

/// In-memory entry store whose writes are undone when the enclosing
/// [`StubTransaction`] rolls back.
#[derive(Clone, Default)]
pub struct StubPersistor {
    entries: Arc<Mutex<HashMap<EntryId, OutboxEntry>>>,
}

impl StubPersistor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of every stored entry, regardless of transactions.
    pub fn entries(&self) -> Vec<OutboxEntry> {
        self.entries
            .lock()
            .expect("lock poisoned")
            .values()
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().expect("lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn find(&self, entry_id: &EntryId) -> Option<OutboxEntry> {
        self.entries
            .lock()
            .expect("lock poisoned")
            .get(entry_id)
            .cloned()
    }

    /// Replaces the stored value of `entry_id`, journaling the previous one.
    fn write(
        &self,
        tx: &StubTransaction,
        entries: &mut HashMap<EntryId, OutboxEntry>,
        entry_id: &EntryId,
        value: Option<OutboxEntry>,
    ) -> OutboxResult<()> {
        let previous = match value {
            Some(value) => entries.insert(entry_id.clone(), value),
            None => entries.remove(entry_id),
        };
        let store = self.entries.clone();
        let entry_id = entry_id.clone();
        tx.on_rollback(move || {
            let mut entries = store.lock().expect("lock poisoned");
            match previous {
                Some(previous) => entries.insert(entry_id, previous),
                None => entries.remove(&entry_id),
            };
        })
    }

    fn current<'a>(
        entries: &'a HashMap<EntryId, OutboxEntry>,
        entry: &OutboxEntry,
    ) -> OutboxResult<&'a OutboxEntry> {
        entries
            .get(&entry.id)
            .filter(|stored| stored.version == entry.version)
            .ok_or_else(|| OutboxError::OptimisticLock(entry.id.to_string()))
    }
}

#[async_trait]
impl Persistor<StubTransaction> for StubPersistor {
    async fn save(&self, tx: &StubTransaction, entry: &OutboxEntry) -> OutboxResult<()> {
        tx.ensure_active()?;
        let mut entries = self.entries.lock().expect("lock poisoned");
        if entries.contains_key(&entry.id) {
            return Err(OutboxError::Persistence(format!("duplicate entry id {}", entry.id)));
        }
        if let Some(request_id) = &entry.unique_request_id {
            let taken = entries
                .values()
                .any(|e| e.unique_request_id.as_ref() == Some(request_id));
            if taken {
                return Err(OutboxError::AlreadyScheduled(request_id.clone()));
            }
        }
        self.write(tx, &mut entries, &entry.id, Some(entry.clone()))
    }

    async fn delete(&self, tx: &StubTransaction, entry: &OutboxEntry) -> OutboxResult<()> {
        tx.ensure_active()?;
        let mut entries = self.entries.lock().expect("lock poisoned");
        Self::current(&entries, entry)?;
        self.write(tx, &mut entries, &entry.id, None)
    }

    async fn update(&self, tx: &StubTransaction, entry: &mut OutboxEntry) -> OutboxResult<()> {
        tx.ensure_active()?;
        let mut entries = self.entries.lock().expect("lock poisoned");
        Self::current(&entries, entry)?;
        entry.version += 1;
        self.write(tx, &mut entries, &entry.id, Some(entry.clone()))
    }

    async fn lock(&self, tx: &StubTransaction, entry: &OutboxEntry) -> OutboxResult<bool> {
        tx.ensure_active()?;
        let entries = self.entries.lock().expect("lock poisoned");
        Ok(entries.get(&entry.id).is_some_and(|stored| {
            stored.version == entry.version && !stored.processed && !stored.blacklisted
        }))
    }

    async fn whitelist(&self, tx: &StubTransaction, entry_id: &EntryId) -> OutboxResult<bool> {
        tx.ensure_active()?;
        let mut entries = self.entries.lock().expect("lock poisoned");
        let Some(stored) = entries.get(entry_id) else {
            return Ok(false);
        };
        if !stored.blacklisted || stored.processed {
            return Ok(false);
        }
        let mut updated = stored.clone();
        updated.attempts = 0;
        updated.blacklisted = false;
        updated.version += 1;
        self.write(tx, &mut entries, entry_id, Some(updated))?;
        Ok(true)
    }

    async fn claim_batch(
        &self,
        tx: &StubTransaction,
        now: DateTime<Utc>,
        limit: usize,
        lease_until: DateTime<Utc>,
    ) -> OutboxResult<Vec<OutboxEntry>> {
        tx.ensure_active()?;
        let mut entries = self.entries.lock().expect("lock poisoned");
        let mut due: Vec<OutboxEntry> = entries.values().filter(|e| e.is_due(now)).cloned().collect();
        due.sort_by(|a, b| a.next_attempt_at.cmp(&b.next_attempt_at));
        due.truncate(limit);

        let mut claimed = Vec::with_capacity(due.len());
        for mut entry in due {
            entry.version += 1;
            entry.next_attempt_at = lease_until;
            let id = entry.id.clone();
            self.write(tx, &mut entries, &id, Some(entry.clone()))?;
            claimed.push(entry);
        }
        Ok(claimed)
    }

    async fn release(
        &self,
        tx: &StubTransaction,
        entry: &OutboxEntry,
        due_at: DateTime<Utc>,
    ) -> OutboxResult<bool> {
        tx.ensure_active()?;
        let mut entries = self.entries.lock().expect("lock poisoned");
        let Ok(stored) = Self::current(&entries, entry) else {
            return Ok(false);
        };
        if stored.processed || stored.blacklisted {
            return Ok(false);
        }
        let mut updated = stored.clone();
        updated.next_attempt_at = due_at;
        updated.version += 1;
        self.write(tx, &mut entries, &entry.id, Some(updated))?;
        Ok(true)
    }

    async fn delete_processed_and_expired(
        &self,
        tx: &StubTransaction,
        now: DateTime<Utc>,
        limit: usize,
    ) -> OutboxResult<usize> {
        tx.ensure_active()?;
        let mut entries = self.entries.lock().expect("lock poisoned");
        let expired: Vec<EntryId> = entries
            .values()
            .filter(|e| e.processed && e.next_attempt_at < now)
            .take(limit)
            .map(|e| e.id.clone())
            .collect();
        for id in &expired {
            self.write(tx, &mut entries, id, None)?;
        }
        Ok(expired.len())
    }

    async fn get(&self, tx: &StubTransaction, entry_id: &EntryId) -> OutboxResult<Option<OutboxEntry>> {
        tx.ensure_active()?;
        Ok(self.find(entry_id))
    }

    async fn clear(&self, tx: &StubTransaction) -> OutboxResult<()> {
        tx.ensure_active()?;
        let mut entries = self.entries.lock().expect("lock poisoned");
        let ids: Vec<EntryId> = entries.keys().cloned().collect();
        for id in &ids {
            self.write(tx, &mut entries, id, None)?;
        }
        Ok(())
    }
}
