//! SQLite transaction manager.
//!
//! Every transaction checks out a dedicated connection from a small idle
//! pool and brackets the unit of work with `BEGIN IMMEDIATE` and
//! `COMMIT`/`ROLLBACK`. Taking the write lock up front means two
//! transactions (in this process or another one on the same file) never
//! interleave their writes; the second waits on `busy_timeout` instead of
//! failing half way through.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use outbox_engine::{
    OutboxError, OutboxResult, PostCommitHook, Transaction, TransactionManager,
};
use tracing::{debug, info, warn};

use crate::executor::SqliteExecutor;
use crate::{DatabaseError, DatabaseResult};

/// Idle connections kept for reuse.
pub const DEFAULT_MAX_IDLE_CONNECTIONS: usize = 4;

/// Context token of a [`SqliteTransaction`], valid while it is open.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SqliteContext(pub u64);

struct SqliteTransactionState {
    id: u64,
    executor: SqliteExecutor,
    active: AtomicBool,
    hooks: Mutex<Vec<PostCommitHook>>,
}

/// Handle to an open SQLite transaction.
///
/// Business writes made through [`SqliteTransaction::call`] commit or roll
/// back together with the outbox entries written in the same transaction.
#[derive(Clone)]
pub struct SqliteTransaction {
    state: Arc<SqliteTransactionState>,
}

impl SqliteTransaction {
    fn new(id: u64, executor: SqliteExecutor) -> Self {
        Self {
            state: Arc::new(SqliteTransactionState {
                id,
                executor,
                active: AtomicBool::new(true),
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

    fn ensure_active(&self) -> DatabaseResult<()> {
        if self.is_active() {
            Ok(())
        } else {
            Err(DatabaseError::Transaction(format!(
                "sqlite-{} is no longer active",
                self.state.id
            )))
        }
    }

    /// Run SQL inside this transaction.
    pub async fn call<F, T>(&self, f: F) -> DatabaseResult<T>
    where
        F: FnOnce(&rusqlite::Connection) -> DatabaseResult<T> + Send + 'static,
        T: Send + 'static,
    {
        self.ensure_active()?;
        self.state.executor.call(f).await
    }

    /// Run SQL that only produces rusqlite errors inside this transaction.
    pub async fn call_sqlite<F, T>(&self, f: F) -> DatabaseResult<T>
    where
        F: FnOnce(&rusqlite::Connection) -> rusqlite::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        self.ensure_active()?;
        self.state.executor.call_sqlite(f).await
    }

    fn close(&self) -> Vec<PostCommitHook> {
        self.state.active.store(false, Ordering::SeqCst);
        std::mem::take(&mut *self.state.hooks.lock().expect("lock poisoned"))
    }
}

impl fmt::Debug for SqliteTransaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SqliteTransaction")
            .field("id", &self.state.id)
            .field("active", &self.is_active())
            .finish()
    }
}

impl Transaction for SqliteTransaction {
    type Context = SqliteContext;

    fn context(&self) -> SqliteContext {
        SqliteContext(self.state.id)
    }

    fn add_post_commit_hook(&self, hook: PostCommitHook) {
        self.state.hooks.lock().expect("lock poisoned").push(hook);
    }
}

struct ManagerInner {
    path: PathBuf,
    max_idle: usize,
    idle: Mutex<Vec<SqliteExecutor>>,
    next_id: AtomicU64,
    open: Mutex<HashMap<u64, SqliteTransaction>>,
}

impl ManagerInner {
    async fn checkout(&self) -> DatabaseResult<SqliteExecutor> {
        let idle = self.idle.lock().expect("lock poisoned").pop();
        match idle {
            Some(executor) => Ok(executor),
            None => SqliteExecutor::open(&self.path).await,
        }
    }

    fn checkin(&self, executor: SqliteExecutor) {
        let mut idle = self.idle.lock().expect("lock poisoned");
        if idle.len() < self.max_idle {
            idle.push(executor);
        }
    }

    fn register(&self, tx: &SqliteTransaction) {
        self.open
            .lock()
            .expect("lock poisoned")
            .insert(tx.id(), tx.clone());
    }

    fn unregister(&self, tx: &SqliteTransaction) {
        self.open.lock().expect("lock poisoned").remove(&tx.id());
    }
}

/// Transaction manager over one SQLite database file.
#[derive(Clone)]
pub struct SqliteTransactionManager {
    inner: Arc<ManagerInner>,
}

impl SqliteTransactionManager {
    /// Open the database at `path`, creating it and applying migrations.
    pub async fn open(path: impl AsRef<Path>) -> DatabaseResult<Self> {
        Self::open_with_pool_size(path, DEFAULT_MAX_IDLE_CONNECTIONS).await
    }

    /// Like [`SqliteTransactionManager::open`], keeping at most `max_idle`
    /// connections between transactions.
    pub async fn open_with_pool_size(
        path: impl AsRef<Path>,
        max_idle: usize,
    ) -> DatabaseResult<Self> {
        let path = path.as_ref().to_path_buf();
        info!(path = %path.display(), "Opening outbox database");

        let first = SqliteExecutor::open(&path).await?;
        first.migrate().await?;

        let manager = Self {
            inner: Arc::new(ManagerInner {
                path,
                max_idle,
                idle: Mutex::new(Vec::new()),
                next_id: AtomicU64::new(1),
                open: Mutex::new(HashMap::new()),
            }),
        };
        manager.inner.checkin(first);
        Ok(manager)
    }

    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    /// Number of transactions currently open through this manager.
    pub fn open_transactions(&self) -> usize {
        self.inner.open.lock().expect("lock poisoned").len()
    }
}

impl TransactionManager for SqliteTransactionManager {
    type Transaction = SqliteTransaction;

    fn transactionally<T, F, Fut>(&self, work: F) -> impl Future<Output = OutboxResult<T>> + Send
    where
        T: Send + 'static,
        F: FnOnce(SqliteTransaction) -> Fut + Send,
        Fut: Future<Output = OutboxResult<T>> + Send,
    {
        let inner = self.inner.clone();
        async move {
            let executor = inner.checkout().await?;
            executor
                .call_sqlite(|conn| conn.execute_batch("BEGIN IMMEDIATE"))
                .await
                .map_err(|e| OutboxError::Transaction(format!("begin failed: {e}")))?;

            let tx = SqliteTransaction::new(inner.next_id.fetch_add(1, Ordering::SeqCst), executor.clone());
            inner.register(&tx);
            debug!(tx = tx.id(), "Transaction started");

            let result = work(tx.clone()).await;

            inner.unregister(&tx);
            let hooks = tx.close();

            match result {
                Ok(value) => {
                    if let Err(e) = executor.call_sqlite(|conn| conn.execute_batch("COMMIT")).await {
                        warn!(tx = tx.id(), error = %e, "Commit failed, rolling back");
                        // The connection is dropped rather than pooled: its
                        // transaction state is unknown.
                        let _ = executor.call_sqlite(|conn| conn.execute_batch("ROLLBACK")).await;
                        return Err(OutboxError::Transaction(format!("commit failed: {e}")));
                    }
                    inner.checkin(executor);
                    debug!(tx = tx.id(), hooks = hooks.len(), "Transaction committed");

                    for hook in hooks {
                        hook().await;
                    }
                    Ok(value)
                }
                Err(err) => {
                    drop(hooks);
                    match executor.call_sqlite(|conn| conn.execute_batch("ROLLBACK")).await {
                        Ok(()) => inner.checkin(executor),
                        Err(e) => warn!(tx = tx.id(), error = %e, "Rollback failed"),
                    }
                    debug!(tx = tx.id(), error = %err, "Transaction rolled back");
                    Err(err)
                }
            }
        }
    }

    fn transaction_for_context(&self, context: &SqliteContext) -> Option<SqliteTransaction> {
        self.inner
            .open
            .lock()
            .expect("lock poisoned")
            .get(&context.0)
            .cloned()
    }
}
