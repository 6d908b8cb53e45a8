//! # Outbox engine
//!
//! A transactional outbox: work is enlisted inside the caller's own database
//! transaction and executed after, and only if, that transaction commits.
//!
//! ## Guarantees
//!
//! - **Committed or nothing** - an entry exists iff the scheduling transaction committed
//! - **At-least-once execution** - failures are retried until success or blacklisting
//! - **One effective execution** - claims are version-gated leases, so concurrent
//!   flushers (in this process or another) never both complete the same entry
//! - **Handler writes share the outcome** - a handler runs in the transaction that
//!   records its success, so a failed attempt leaves no trace
//!
//! ## Flow
//!
//! ```text
//! SCHEDULE:
//!   HandlerCall → extract transaction → save entry (caller's tx) → commit → submit
//!
//! FLUSH:
//!   claim due entries (version + 1, lease) → commit → submit each
//!
//! PROCESS (fresh tx):
//!   lock → handler → delete / mark processed
//!   on failure (fresh tx): attempts + 1 → reschedule or blacklist
//! ```
//!
//! ## Crate Structure
//!
//! - [`outbox`] - The engine and its builder
//! - [`invocation`] - Persisted calls and the command objects that build them
//! - [`transaction`] - Transaction manager SPI
//! - [`persistor`] - Storage SPI
//! - [`instantiator`] - Handler lookup
//! - [`submitter`] - Asynchronous execution
//! - [`listener`] - Lifecycle callbacks
//! - [`stub`] - In-memory transaction manager and persistor

pub mod backoff;
pub mod clock;
pub mod config;
mod entry;
mod error;
pub mod flusher;
pub mod instantiator;
pub mod invocation;
pub mod listener;
pub mod outbox;
pub mod persistor;
pub mod stub;
pub mod submitter;
pub mod transaction;

#[cfg(test)]
mod tests;

pub use backoff::{Backoff, ExponentialBackoff, FixedBackoff};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{BackoffConfig, OutboxConfig};
pub use entry::{EntryId, EntryStatus, OutboxEntry};
pub use error::{OutboxError, OutboxResult};
pub use flusher::{FlusherHandle, OutboxFlusher};
pub use instantiator::{Handler, HandlerRegistry, Instantiator};
pub use invocation::{Argument, BoundInvocation, CallArg, HandlerCall, Invocation, TransactionalInvocation};
pub use listener::{CompositeListener, ListenerEvent, NullListener, OutboxListener, RecordingListener};
pub use outbox::{TransactionOutbox, TransactionOutboxBuilder};
pub use persistor::Persistor;
pub use submitter::{BoundedSubmitter, Submitter, TokioSubmitter, Work};
pub use transaction::{PostCommitHook, Transaction, TransactionManager, TransactionRef};
