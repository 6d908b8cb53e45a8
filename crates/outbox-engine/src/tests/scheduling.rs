//! Scheduling visibility, idempotency and diagnostic context.

use std::sync::Arc;
use std::time::Duration;

use super::{config, wait_until, Harness, HoldingSubmitter, FREQUENCY};
use crate::listener::ListenerEvent;
use crate::{
    Argument, HandlerCall, OutboxConfig, OutboxError, Transaction, TransactionManager,
};

/// Inserter.insert(3, "Whee", tx): the business row appears only after the
/// scheduling transaction commits and the handler has run.
#[tokio::test]
async fn committed_call_runs_after_commit() {
    let h = Harness::new(config());
    let (outbox, ledger) = (h.outbox.clone(), h.ledger.clone());

    let entry = h
        .tm
        .transactionally(|tx| async move {
            let entry = outbox
                .schedule(
                    HandlerCall::new("Inserter", "insert")
                        .arg(3)
                        .arg("Whee")
                        .transaction(tx.clone()),
                )
                .await?;
            // Still inside the transaction: nothing has run.
            assert_eq!(ledger.len(), 0);
            Ok(entry)
        })
        .await
        .unwrap();

    assert_eq!(
        entry.invocation.args,
        vec![Argument::Int(3), Argument::from("Whee"), Argument::Transaction]
    );

    wait_until("handler success", || h.listener.successes() == 1).await;
    assert_eq!(h.ledger.rows(), vec![(3, "Whee".to_string())]);
    assert!(h.persistor.is_empty(), "processed entry is deleted");
    assert_eq!(
        h.listener.events(),
        vec![
            ListenerEvent::Scheduled(entry.id.clone()),
            ListenerEvent::Success(entry.id.clone())
        ]
    );
}

#[tokio::test]
async fn rolled_back_call_never_runs() {
    let h = Harness::new(config());
    let outbox = h.outbox.clone();

    let result = h
        .tm
        .transactionally(|tx| async move {
            outbox
                .schedule(HandlerCall::new("Inserter", "insert").arg(1).arg("gone").transaction(tx))
                .await?;
            Err::<(), _>(OutboxError::Persistence("caller aborted".into()))
        })
        .await;
    assert!(result.is_err());
    assert!(h.persistor.is_empty());

    h.advance(FREQUENCY * 2);
    assert!(!h.outbox.flush().await.unwrap());

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(h.listener.events().is_empty());
    assert_eq!(h.inserter.calls(), 0);
}

#[tokio::test]
async fn call_without_transaction_is_refused() {
    let h = Harness::new(config());
    let err = h
        .schedule(|_tx| HandlerCall::new("Inserter", "insert").arg(1).arg("x"))
        .await
        .unwrap_err();
    assert!(matches!(err, OutboxError::NoTransaction(_)));
    assert!(h.persistor.is_empty());
}

#[tokio::test]
async fn non_finite_float_is_refused() {
    let h = Harness::new(config());
    for value in [f64::NAN, f64::INFINITY, f64::NEG_INFINITY] {
        let err = h
            .schedule(move |tx| {
                HandlerCall::new("Calc", "apply")
                    .arg(Argument::Float(value))
                    .transaction(tx)
            })
            .await
            .unwrap_err();
        assert!(matches!(err, OutboxError::InvalidArgument(_)), "{value}: {err}");
    }
    assert!(h.persistor.is_empty());

    h.schedule(|tx| {
        HandlerCall::new("Calc", "apply")
            .arg(Argument::Float(1.5))
            .transaction(tx)
    })
    .await
    .unwrap();
    assert_eq!(h.persistor.len(), 1);
}

#[tokio::test]
async fn context_argument_enlists_in_its_transaction() {
    let h = Harness::new(config());
    let entry = h
        .schedule(|tx| {
            HandlerCall::new("Inserter", "insert")
                .arg(7)
                .arg("by context")
                .context(tx.context())
        })
        .await
        .unwrap();
    assert_eq!(entry.invocation.args[2], Argument::Context);

    wait_until("handler success", || h.listener.successes() == 1).await;
    assert_eq!(h.ledger.rows(), vec![(7, "by context".to_string())]);
}

#[tokio::test]
async fn closed_transaction_surfaces_as_scheduling_failure() {
    let h = Harness::new(config());
    let stale = h.tm.transactionally(|tx| async move { Ok(tx) }).await.unwrap();

    let err = h
        .outbox
        .schedule(HandlerCall::new("Inserter", "insert").arg(1).arg("late").transaction(stale))
        .await
        .unwrap_err();
    assert!(matches!(err, OutboxError::SchedulingFailure(_)));
    assert!(h.persistor.is_empty());
}

#[tokio::test]
async fn unique_request_id_is_retained_then_purged() {
    let h = Harness::new(config());
    let first = h
        .schedule(|tx| {
            HandlerCall::new("Inserter", "insert")
                .arg(1)
                .arg("once")
                .transaction(tx)
                .unique_request_id("req-1")
        })
        .await
        .unwrap();

    wait_until("handler success", || h.listener.successes() == 1).await;
    let retained = h.persistor.find(&first.id).unwrap();
    assert!(retained.processed);

    let err = h
        .schedule(|tx| {
            HandlerCall::new("Inserter", "insert")
                .arg(1)
                .arg("twice")
                .transaction(tx)
                .unique_request_id("req-1")
        })
        .await
        .unwrap_err();
    assert!(matches!(err, OutboxError::AlreadyScheduled(ref id) if id == "req-1"));

    // Processed entries are never claimed again.
    h.advance(FREQUENCY * 2);
    assert!(!h.outbox.flush().await.unwrap());

    h.advance(h.outbox.config().retention_threshold());
    h.outbox.flush().await.unwrap();
    assert!(h.persistor.is_empty(), "expired processed entry is purged");

    h.schedule(|tx| {
        HandlerCall::new("Inserter", "insert")
            .arg(1)
            .arg("again")
            .transaction(tx)
            .unique_request_id("req-1")
    })
    .await
    .unwrap();
    wait_until("second success", || h.listener.successes() == 2).await;
    assert_eq!(h.ledger.len(), 2);
}

#[tokio::test]
async fn diagnostic_context_is_persisted_unless_disabled() {
    let h = Harness::with_submitter(config(), Arc::new(HoldingSubmitter::default()));
    let entry = h
        .schedule(|tx| {
            HandlerCall::new("Inserter", "insert")
                .arg(1)
                .arg("x")
                .transaction(tx)
                .mdc("request", "r-9")
        })
        .await
        .unwrap();
    let stored = h.persistor.find(&entry.id).unwrap();
    assert_eq!(
        stored.invocation.mdc.unwrap().get("request").map(String::as_str),
        Some("r-9")
    );

    let h = Harness::with_submitter(
        OutboxConfig {
            serialize_mdc: false,
            ..config()
        },
        Arc::new(HoldingSubmitter::default()),
    );
    let entry = h
        .schedule(|tx| {
            HandlerCall::new("Inserter", "insert")
                .arg(1)
                .arg("x")
                .transaction(tx)
                .mdc("request", "r-9")
        })
        .await
        .unwrap();
    assert!(h.persistor.find(&entry.id).unwrap().invocation.mdc.is_none());
}

#[tokio::test]
async fn new_entry_is_leased_for_immediate_execution() {
    let submitter = Arc::new(HoldingSubmitter::default());
    let h = Harness::with_submitter(config(), submitter.clone());
    let entry = h.insert(5, "soon").await;

    assert_eq!(submitter.len(), 1, "submitted on commit");
    assert_eq!(entry.next_attempt_at, entry.created_at + chrono::Duration::seconds(1));
    assert!(!h.outbox.flush().await.unwrap(), "lease keeps flush away");

    submitter.run_all().await;
    assert_eq!(h.ledger.rows(), vec![(5, "soon".to_string())]);
    assert!(h.persistor.is_empty());
}
