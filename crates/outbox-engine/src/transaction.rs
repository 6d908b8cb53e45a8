//! Transaction management SPI.
//!
//! The engine never begins or commits transactions itself; it goes through a
//! [`TransactionManager`]. Transactions are always passed explicitly: a
//! scheduled call carries either the live transaction or its context, never an
//! ambient one.

use std::fmt;
use std::future::Future;

use futures_util::future::BoxFuture;

use crate::invocation::{Argument, BoundInvocation, CallArg, HandlerCall, TransactionalInvocation};
use crate::{Invocation, OutboxError, OutboxResult};

/// Work to run once a transaction has committed.
pub type PostCommitHook = Box<dyn FnOnce() -> BoxFuture<'static, ()> + Send>;

/// A live transaction handle.
///
/// Handles are cheap to clone; every clone refers to the same transaction.
pub trait Transaction: Clone + Send + Sync + 'static {
    /// Lightweight token from which the manager can find this transaction
    /// while it is open.
    type Context: Clone + fmt::Debug + Send + Sync + 'static;

    fn context(&self) -> Self::Context;

    /// Registers work to run after a successful commit. Hooks are dropped on
    /// rollback.
    fn add_post_commit_hook(&self, hook: PostCommitHook);
}

/// Either a transaction or the context of an open transaction.
#[derive(Debug, Clone)]
pub enum TransactionRef<TX: Transaction> {
    Transaction(TX),
    Context(TX::Context),
}

impl<TX: Transaction> From<TX> for TransactionRef<TX> {
    fn from(tx: TX) -> Self {
        Self::Transaction(tx)
    }
}

/// Runs units of work transactionally and moves transactions in and out of
/// invocations.
pub trait TransactionManager: Send + Sync + 'static {
    type Transaction: Transaction;

    /// Begins a transaction, runs `work`, commits on `Ok` and rolls back on
    /// `Err`. Post-commit hooks run after the commit has completed and before
    /// this returns.
    fn transactionally<T, F, Fut>(&self, work: F) -> impl Future<Output = OutboxResult<T>> + Send
    where
        T: Send + 'static,
        F: FnOnce(Self::Transaction) -> Fut + Send,
        Fut: Future<Output = OutboxResult<T>> + Send;

    /// Finds the open transaction for a context.
    fn transaction_for_context(
        &self,
        context: &<Self::Transaction as Transaction>::Context,
    ) -> Option<Self::Transaction>;

    /// Resolves a transaction reference to a live transaction.
    fn resolve(
        &self,
        reference: TransactionRef<Self::Transaction>,
    ) -> OutboxResult<Self::Transaction> {
        match reference {
            TransactionRef::Transaction(tx) => Ok(tx),
            TransactionRef::Context(context) => self
                .transaction_for_context(&context)
                .ok_or_else(|| OutboxError::TransactionClosed(format!("{context:?}"))),
        }
    }

    /// Determines the transaction a scheduled call belongs to and rewrites
    /// the call so the live handle is replaced by a slot marker.
    fn extract_transaction(
        &self,
        call: HandlerCall<Self::Transaction>,
    ) -> OutboxResult<TransactionalInvocation<Self::Transaction>> {
        let mut transaction = None;
        let mut args = Vec::with_capacity(call.args.len());

        for arg in call.args {
            match arg {
                CallArg::Value(value) => args.push(value),
                CallArg::Transaction(tx) => {
                    transaction.get_or_insert(tx);
                    args.push(Argument::Transaction);
                }
                CallArg::Context(context) => {
                    if transaction.is_none() {
                        let tx = self
                            .transaction_for_context(&context)
                            .ok_or_else(|| OutboxError::TransactionClosed(format!("{context:?}")))?;
                        transaction = Some(tx);
                    }
                    args.push(Argument::Context);
                }
            }
        }

        let invocation = Invocation {
            class_name: call.class_name,
            method_name: call.method_name,
            args,
            mdc: call.mdc,
        };

        let transaction =
            transaction.ok_or_else(|| OutboxError::NoTransaction(invocation.description()))?;

        Ok(TransactionalInvocation {
            transaction,
            invocation,
            unique_request_id: call.unique_request_id,
        })
    }

    /// Rebinds a persisted invocation to the transaction it executes in.
    fn inject_transaction(
        &self,
        invocation: Invocation,
        transaction: &Self::Transaction,
    ) -> BoundInvocation<Self::Transaction> {
        BoundInvocation::new(invocation, transaction.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stub::StubTransactionManager;

    #[tokio::test]
    async fn extract_replaces_transaction_with_slot() {
        let tm = StubTransactionManager::new();
        let tm2 = tm.clone();
        tm.transactionally(|tx| async move {
            let call = HandlerCall::new("Inserter", "insert")
                .arg(3)
                .transaction(tx.clone())
                .arg("Whee")
                .unique_request_id("req-1");
            let extracted = tm2.extract_transaction(call)?;
            assert_eq!(extracted.transaction.context(), tx.context());
            assert_eq!(
                extracted.invocation.args,
                vec![Argument::Int(3), Argument::Transaction, Argument::from("Whee")]
            );
            assert_eq!(extracted.unique_request_id.as_deref(), Some("req-1"));
            Ok(())
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn extract_resolves_context() {
        let tm = StubTransactionManager::new();
        let tm2 = tm.clone();
        tm.transactionally(|tx| async move {
            let call = HandlerCall::new("Inserter", "insert").context(tx.context());
            let extracted = tm2.extract_transaction(call)?;
            assert_eq!(extracted.transaction.context(), tx.context());
            assert_eq!(extracted.invocation.args, vec![Argument::Context]);
            Ok(())
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn extract_without_transaction_fails() {
        let tm = StubTransactionManager::new();
        let call = HandlerCall::new("Inserter", "insert").arg(1);
        let err = tm.extract_transaction(call).unwrap_err();
        assert!(matches!(err, OutboxError::NoTransaction(_)));
    }

    #[tokio::test]
    async fn stale_context_is_rejected() {
        let tm = StubTransactionManager::new();
        let context = tm
            .transactionally(|tx| async move { Ok(tx.context()) })
            .await
            .unwrap();

        let call = HandlerCall::new("Inserter", "insert").context(context.clone());
        assert!(matches!(
            tm.extract_transaction(call),
            Err(OutboxError::TransactionClosed(_))
        ));
        assert!(tm.resolve(TransactionRef::Context(context)).is_err());
    }
}
