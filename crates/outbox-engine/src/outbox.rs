//! The outbox engine: scheduling, flushing and the per-entry retry state
//! machine.

use std::sync::Arc;

use futures_util::FutureExt;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::backoff::Backoff;
use crate::clock::{later, Clock, SystemClock};
use crate::config::OutboxConfig;
use crate::instantiator::Instantiator;
use crate::invocation::{HandlerCall, TransactionalInvocation};
use crate::listener::{guarded, NullListener, OutboxListener};
use crate::persistor::Persistor;
use crate::submitter::{Submitter, TokioSubmitter};
use crate::transaction::{Transaction, TransactionManager, TransactionRef};
use crate::{EntryId, OutboxEntry, OutboxError, OutboxResult};

type Tx<TM> = <TM as TransactionManager>::Transaction;

struct OutboxInner<TM: TransactionManager> {
    transaction_manager: TM,
    persistor: Arc<dyn Persistor<Tx<TM>>>,
    instantiator: Arc<dyn Instantiator<Tx<TM>>>,
    submitter: Arc<dyn Submitter>,
    listener: Arc<dyn OutboxListener>,
    clock: Arc<dyn Clock>,
    backoff: Arc<dyn Backoff>,
    config: OutboxConfig,
}

/// Transactional outbox.
///
/// Callers enlist handler calls in their own transaction with
/// [`schedule`](Self::schedule); the engine runs each one after, and only if,
/// that transaction commits, retrying failures until the entry succeeds or is
/// blacklisted. Cloning is cheap and every clone drives the same engine.
pub struct TransactionOutbox<TM: TransactionManager> {
    inner: Arc<OutboxInner<TM>>,
}

impl<TM: TransactionManager> Clone for TransactionOutbox<TM> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

/// Outcome of one execution attempt that did not fail.
enum Attempt {
    Done(OutboxEntry),
    Stale,
}

impl<TM: TransactionManager> TransactionOutbox<TM> {
    pub fn builder(
        transaction_manager: TM,
        persistor: Arc<dyn Persistor<Tx<TM>>>,
        instantiator: Arc<dyn Instantiator<Tx<TM>>>,
    ) -> TransactionOutboxBuilder<TM> {
        TransactionOutboxBuilder {
            transaction_manager,
            persistor,
            instantiator,
            submitter: None,
            listener: None,
            clock: None,
            backoff: None,
            config: OutboxConfig::default(),
        }
    }

    pub fn config(&self) -> &OutboxConfig {
        &self.inner.config
    }

    pub fn transaction_manager(&self) -> &TM {
        &self.inner.transaction_manager
    }

    pub fn persistor(&self) -> &Arc<dyn Persistor<Tx<TM>>> {
        &self.inner.persistor
    }

    /// Enlists `call` in the transaction it carries.
    ///
    /// The entry is saved in that transaction. Once it commits, listeners
    /// are told and the entry is submitted for immediate execution; if the
    /// transaction rolls back nothing is left behind. Never waits for the
    /// handler to run.
    pub async fn schedule(&self, call: HandlerCall<Tx<TM>>) -> OutboxResult<OutboxEntry> {
        let TransactionalInvocation {
            transaction,
            mut invocation,
            unique_request_id,
        } = self.inner.transaction_manager.extract_transaction(call)?;
        invocation.validate()?;

        if !self.inner.config.serialize_mdc {
            invocation.mdc = None;
        }

        let now = self.inner.clock.now();
        let entry = OutboxEntry::new(
            invocation,
            unique_request_id,
            now,
            later(now, self.inner.config.attempt_frequency()),
        );

        match self.inner.persistor.save(&transaction, &entry).await {
            Ok(()) => {}
            Err(e @ OutboxError::AlreadyScheduled(_)) => return Err(e),
            Err(e) => {
                return Err(OutboxError::SchedulingFailure(format!(
                    "{}: {e}",
                    entry.description()
                )))
            }
        }

        let outbox = self.clone();
        let scheduled = entry.clone();
        transaction.add_post_commit_hook(Box::new(move || {
            async move {
                outbox.notify("scheduled", |listener| listener.scheduled(&scheduled));
                outbox.submit(scheduled);
            }
            .boxed()
        }));

        debug!(entry_id = %entry.id, invocation = %entry.invocation.description(), "Scheduled entry");
        Ok(entry)
    }

    /// Claims due entries and submits them for execution.
    ///
    /// Returns `Ok(true)` when at least one entry was handed to the
    /// submitter, so callers can flush again straight away while work
    /// remains. Entries the submitter refuses are released and do not count.
    pub async fn flush(&self) -> OutboxResult<bool> {
        let now = self.inner.clock.now();
        let lease_until = later(now, self.inner.config.attempt_frequency());
        let limit = self.inner.config.flush_batch_size;

        let persistor = self.inner.persistor.clone();
        let claimed = self
            .inner
            .transaction_manager
            .transactionally(|tx| async move {
                persistor.claim_batch(&tx, now, limit, lease_until).await
            })
            .await
            .map_err(|e| {
                error!(error = %e, "Flush failed to claim entries");
                e
            })?;

        if !claimed.is_empty() {
            debug!(count = claimed.len(), "Claimed entries");
        }

        let mut submitted = 0usize;
        let mut rejected = Vec::new();
        for entry in claimed {
            if self.submit(entry.clone()) {
                submitted += 1;
            } else {
                rejected.push(entry);
            }
        }
        if !rejected.is_empty() {
            self.release(rejected).await;
        }

        self.purge_expired().await;
        Ok(submitted > 0)
    }

    /// Returns a blacklisted entry to the pending state with its attempt
    /// count reset. Runs inside the referenced transaction.
    pub async fn whitelist(
        &self,
        entry_id: &EntryId,
        transaction: TransactionRef<Tx<TM>>,
    ) -> OutboxResult<bool> {
        let tx = self.inner.transaction_manager.resolve(transaction)?;
        let whitelisted = self.inner.persistor.whitelist(&tx, entry_id).await?;
        if whitelisted {
            info!(entry_id = %entry_id, "Whitelisted entry");
        } else {
            warn!(entry_id = %entry_id, "Entry not found or not blacklisted; nothing to whitelist");
        }
        Ok(whitelisted)
    }

    /// [`whitelist`](Self::whitelist) in a transaction of its own.
    pub async fn whitelist_entry(&self, entry_id: &EntryId) -> OutboxResult<bool> {
        let outbox = self.clone();
        let entry_id = entry_id.clone();
        self.inner
            .transaction_manager
            .transactionally(|tx| async move {
                outbox.whitelist(&entry_id, TransactionRef::Transaction(tx)).await
            })
            .await
    }

    /// Hands an entry to the submitter. Returns false when it was refused.
    fn submit(&self, entry: OutboxEntry) -> bool {
        let entry_id = entry.id.clone();
        let outbox = self.clone();
        match self
            .inner
            .submitter
            .submit(async move { outbox.process(entry).await }.boxed())
        {
            Ok(()) => true,
            Err(e) => {
                warn!(entry_id = %entry_id, error = %e, "Submitter refused entry; it stays pending");
                false
            }
        }
    }

    /// Makes refused entries due again without counting an attempt.
    async fn release(&self, rejected: Vec<OutboxEntry>) {
        let now = self.inner.clock.now();
        let persistor = self.inner.persistor.clone();
        let result = self
            .inner
            .transaction_manager
            .transactionally(|tx| async move {
                let mut released = 0usize;
                for entry in &rejected {
                    if persistor.release(&tx, entry, now).await? {
                        released += 1;
                    }
                }
                Ok(released)
            })
            .await;

        match result {
            Ok(released) => debug!(released, "Released refused entries"),
            Err(e) => warn!(error = %e, "Failed to release refused entries; they retry after their lease"),
        }
    }

    async fn purge_expired(&self) {
        let now = self.inner.clock.now();
        let limit = self.inner.config.flush_batch_size;
        let persistor = self.inner.persistor.clone();
        let result = self
            .inner
            .transaction_manager
            .transactionally(|tx| async move {
                persistor.delete_processed_and_expired(&tx, now, limit).await
            })
            .await;

        match result {
            Ok(0) => {}
            Ok(purged) => debug!(purged, "Purged expired processed entries"),
            Err(e) => warn!(error = %e, "Failed to purge expired processed entries"),
        }
    }

    /// Executes one claimed entry and records the outcome.
    async fn process(&self, entry: OutboxEntry) {
        let span = info_span!(
            "outbox_entry",
            entry_id = %entry.id,
            handler = %entry.invocation.class_name,
            method = %entry.invocation.method_name,
            mdc = tracing::field::Empty,
        );
        if let Some(mdc) = &entry.invocation.mdc {
            span.record("mdc", tracing::field::debug(mdc));
        }
        self.execute(entry).instrument(span).await
    }

    async fn execute(&self, entry: OutboxEntry) {
        let inner = &self.inner;
        let claimed = entry.clone();

        let outcome = inner
            .transaction_manager
            .transactionally(|tx| async move {
                if !inner.persistor.lock(&tx, &claimed).await? {
                    return Ok(Attempt::Stale);
                }

                let handler = inner
                    .instantiator
                    .get_instance(&claimed.invocation.class_name)?;
                let call = inner
                    .transaction_manager
                    .inject_transaction(claimed.invocation.clone(), &tx);
                handler.invoke(&call).await.map_err(OutboxError::Handler)?;

                let mut done = claimed;
                if done.unique_request_id.is_some() {
                    done.processed = true;
                    done.next_attempt_at =
                        later(inner.clock.now(), inner.config.retention_threshold());
                    inner.persistor.update(&tx, &mut done).await?;
                } else {
                    inner.persistor.delete(&tx, &done).await?;
                }
                Ok(Attempt::Done(done))
            })
            .await;

        match outcome {
            Ok(Attempt::Done(done)) => {
                debug!("Processed entry");
                self.notify("success", |listener| listener.success(&done));
            }
            Ok(Attempt::Stale) => {
                debug!("Entry no longer held by this claim; skipping");
            }
            Err(e) if e.is_concurrent_modification() => {
                debug!(error = %e, "Entry claimed concurrently; abandoning attempt");
            }
            Err(e) => self.record_failure(entry, e).await,
        }
    }

    /// Counts a failed attempt and either reschedules or blacklists.
    async fn record_failure(&self, entry: OutboxEntry, cause: OutboxError) {
        let inner = &self.inner;
        let now = inner.clock.now();

        let result = inner
            .transaction_manager
            .transactionally(|tx| async move {
                let mut failed = entry;
                failed.attempts += 1;
                failed.last_attempt_at = Some(now);
                if failed.attempts >= inner.config.blacklist_after_attempts {
                    failed.blacklisted = true;
                } else {
                    failed.next_attempt_at = later(now, inner.backoff.delay(failed.attempts));
                }
                inner.persistor.update(&tx, &mut failed).await?;
                Ok(failed)
            })
            .await;

        match result {
            Ok(failed) if failed.blacklisted => {
                error!(
                    attempts = failed.attempts,
                    error = %cause,
                    "Blacklisting entry after repeated failures"
                );
                self.notify("blacklisted", |listener| listener.blacklisted(&failed, &cause));
            }
            Ok(failed) => {
                warn!(
                    attempts = failed.attempts,
                    next_attempt_at = %failed.next_attempt_at,
                    error = %cause,
                    "Attempt failed; rescheduled"
                );
                self.notify("failure", |listener| listener.failure(&failed, &cause));
            }
            Err(e) if e.is_concurrent_modification() => {
                debug!(error = %e, cause = %cause, "Entry claimed concurrently; not recording failure");
            }
            Err(e) => {
                error!(error = %e, cause = %cause, "Failed to record failed attempt; entry retries after its lease");
            }
        }
    }

    fn notify(&self, event: &'static str, callback: impl FnOnce(&dyn OutboxListener)) {
        let listener = self.inner.listener.as_ref();
        guarded(event, || callback(listener));
    }
}

/// Configures a [`TransactionOutbox`].
pub struct TransactionOutboxBuilder<TM: TransactionManager> {
    transaction_manager: TM,
    persistor: Arc<dyn Persistor<Tx<TM>>>,
    instantiator: Arc<dyn Instantiator<Tx<TM>>>,
    submitter: Option<Arc<dyn Submitter>>,
    listener: Option<Arc<dyn OutboxListener>>,
    clock: Option<Arc<dyn Clock>>,
    backoff: Option<Arc<dyn Backoff>>,
    config: OutboxConfig,
}

impl<TM: TransactionManager> TransactionOutboxBuilder<TM> {
    pub fn config(mut self, config: OutboxConfig) -> Self {
        self.config = config;
        self
    }

    /// Defaults to [`TokioSubmitter`].
    pub fn submitter(mut self, submitter: Arc<dyn Submitter>) -> Self {
        self.submitter = Some(submitter);
        self
    }

    pub fn listener(mut self, listener: Arc<dyn OutboxListener>) -> Self {
        self.listener = Some(listener);
        self
    }

    /// Defaults to [`SystemClock`].
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Overrides the backoff derived from the configuration.
    pub fn backoff(mut self, backoff: Arc<dyn Backoff>) -> Self {
        self.backoff = Some(backoff);
        self
    }

    pub fn build(self) -> OutboxResult<TransactionOutbox<TM>> {
        self.config.validate()?;
        let backoff = self.backoff.unwrap_or_else(|| self.config.backoff());

        Ok(TransactionOutbox {
            inner: Arc::new(OutboxInner {
                transaction_manager: self.transaction_manager,
                persistor: self.persistor,
                instantiator: self.instantiator,
                submitter: self.submitter.unwrap_or_else(|| Arc::new(TokioSubmitter)),
                listener: self.listener.unwrap_or_else(|| Arc::new(NullListener)),
                clock: self.clock.unwrap_or_else(|| Arc::new(SystemClock)),
                backoff,
                config: self.config,
            }),
        })
    }
}

