//! Scenario tests for the outbox engine, run against the in-memory backend.
//!
//! - `scheduling.rs`  - visibility on commit/rollback, idempotency, diagnostic context
//! - `flushing.rs`    - claiming, leases, submitter refusal, background flusher
//! - `retries.rs`     - failure counting, backoff, blacklist and whitelist
//! - `concurrency.rs` - competing engines and many concurrent callers

mod scheduling;

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::stub::{StubPersistor, StubTransaction, StubTransactionManager};
use crate::{
    BoundInvocation, Handler, HandlerCall, HandlerRegistry, ManualClock, OutboxConfig,
    OutboxEntry, OutboxError, OutboxResult, RecordingListener, Submitter, TokioSubmitter,
    TransactionManager, TransactionOutbox, Work,
};

pub(crate) const FREQUENCY: Duration = Duration::from_secs(1);

pub(crate) fn config() -> OutboxConfig {
    OutboxConfig {
        attempt_frequency_ms: FREQUENCY.as_millis() as u64,
        ..OutboxConfig::default()
    }
}

/// A business table written inside outbox transactions.
#[derive(Clone, Default)]
pub(crate) struct Ledger {
    rows: Arc<Mutex<Vec<(i64, String)>>>,
}

impl Ledger {
    pub(crate) fn insert(&self, tx: &StubTransaction, value: i64, label: &str) -> OutboxResult<()> {
        tx.ensure_active()?;
        self.rows
            .lock()
            .unwrap()
            .push((value, label.to_string()));
        let rows = self.rows.clone();
        tx.on_rollback(move || {
            rows.lock().unwrap().pop();
        })
    }

    pub(crate) fn rows(&self) -> Vec<(i64, String)> {
        self.rows.lock().unwrap().clone()
    }

    pub(crate) fn len(&self) -> usize {
        self.rows.lock().unwrap().len()
    }
}

/// `Inserter.insert(value, label, <tx>)` writes one ledger row. It can be
/// switched to fail after writing, so rollbacks are observable.
pub(crate) struct Inserter {
    pub(crate) ledger: Ledger,
    pub(crate) fail: AtomicBool,
    pub(crate) calls: AtomicU32,
}

impl Inserter {
    pub(crate) fn new(ledger: Ledger) -> Arc<Self> {
        Arc::new(Self {
            ledger,
            fail: AtomicBool::new(false),
            calls: AtomicU32::new(0),
        })
    }

    pub(crate) fn set_failing(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    pub(crate) fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Handler<StubTransaction> for Inserter {
    async fn invoke(&self, call: &BoundInvocation<StubTransaction>) -> anyhow::Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match call.method_name() {
            "insert" => {
                let value = call.int(0)?;
                let label = call.text(1)?;
                self.ledger.insert(call.transaction(), value, label)?;
                if self.fail.load(Ordering::SeqCst) {
                    anyhow::bail!("insert of {label} refused");
                }
                Ok(())
            }
            other => anyhow::bail!("Inserter has no method {other}"),
        }
    }
}

/// Submitter that keeps work until the test runs it.
#[derive(Default)]
pub(crate) struct HoldingSubmitter {
    held: Mutex<Vec<Work>>,
}

impl HoldingSubmitter {
    pub(crate) fn take(&self) -> Vec<Work> {
        std::mem::take(&mut *self.held.lock().unwrap())
    }

    pub(crate) fn len(&self) -> usize {
        self.held.lock().unwrap().len()
    }

    pub(crate) async fn run_all(&self) {
        for work in self.take() {
            work.await;
        }
    }
}

impl Submitter for HoldingSubmitter {
    fn submit(&self, work: Work) -> OutboxResult<()> {
        self.held.lock().unwrap().push(work);
        Ok(())
    }
}

/// Submitter that refuses everything.
pub(crate) struct RejectingSubmitter;

impl Submitter for RejectingSubmitter {
    fn submit(&self, _work: Work) -> OutboxResult<()> {
        Err(OutboxError::Rejected("always full".to_string()))
    }
}

/// An engine wired to the in-memory backend with a manual clock.
pub(crate) struct Harness {
    pub(crate) outbox: TransactionOutbox<StubTransactionManager>,
    pub(crate) tm: StubTransactionManager,
    pub(crate) persistor: StubPersistor,
    pub(crate) listener: Arc<RecordingListener>,
    pub(crate) clock: Arc<ManualClock>,
    pub(crate) ledger: Ledger,
    pub(crate) inserter: Arc<Inserter>,
}

impl Harness {
    pub(crate) fn new(config: OutboxConfig) -> Self {
        Self::with_submitter(config, Arc::new(TokioSubmitter))
    }

    pub(crate) fn with_submitter(config: OutboxConfig, submitter: Arc<dyn Submitter>) -> Self {
        let ledger = Ledger::default();
        let inserter = Inserter::new(ledger.clone());
        let tm = StubTransactionManager::new();
        let persistor = StubPersistor::new();
        let listener = Arc::new(RecordingListener::new());
        let clock = Arc::new(ManualClock::default());

        let registry = HandlerRegistry::<StubTransaction>::new().with("Inserter", inserter.clone());
        let outbox = TransactionOutbox::builder(
            tm.clone(),
            Arc::new(persistor.clone()),
            Arc::new(registry),
        )
        .config(config)
        .submitter(submitter)
        .listener(listener.clone())
        .clock(clock.clone())
        .build()
        .unwrap();

        Self {
            outbox,
            tm,
            persistor,
            listener,
            clock,
            ledger,
            inserter,
        }
    }

    /// Schedules the call built by `build` in a transaction of its own.
    pub(crate) async fn schedule<B>(&self, build: B) -> OutboxResult<OutboxEntry>
    where
        B: FnOnce(StubTransaction) -> HandlerCall<StubTransaction> + Send + 'static,
    {
        let outbox = self.outbox.clone();
        self.tm
            .transactionally(|tx| async move { outbox.schedule(build(tx)).await })
            .await
    }

    /// Schedules `Inserter.insert(value, label, <tx>)`.
    pub(crate) async fn insert(&self, value: i64, label: &str) -> OutboxEntry {
        let label = label.to_string();
        self.schedule(move |tx| {
            HandlerCall::new("Inserter", "insert")
                .arg(value)
                .arg(label)
                .transaction(tx)
        })
        .await
        .unwrap()
    }

    pub(crate) fn advance(&self, by: Duration) {
        self.clock.advance(by);
    }

    pub(crate) fn now(&self) -> DateTime<Utc> {
        use crate::Clock;
        self.clock.now()
    }
}

/// Polls `done` every 10ms for up to five seconds.
pub(crate) async fn wait_until(what: &str, mut done: impl FnMut() -> bool) {
    for _ in 0..500 {
        if done() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {what}");
}
