//! Lifecycle callbacks.
//!
//! Every callback fires after the transaction recording the event has
//! committed. A panicking listener is caught and logged by the engine and
//! never affects entry state.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex};

use tracing::error;

use crate::{EntryId, OutboxEntry, OutboxError};

/// Runs one listener callback, logging instead of propagating a panic.
pub(crate) fn guarded(event: &'static str, callback: impl FnOnce()) {
    if let Err(panic) = catch_unwind(AssertUnwindSafe(callback)) {
        let message = panic
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| panic.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "non-string panic".to_string());
        error!(event, panic = %message, "Listener panicked");
    }
}

/// Observes entry lifecycle events. All methods default to no-ops.
pub trait OutboxListener: Send + Sync {
    /// The entry was saved and its scheduling transaction committed.
    fn scheduled(&self, _entry: &OutboxEntry) {}

    /// The entry's invocation ran and its outcome committed.
    fn success(&self, _entry: &OutboxEntry) {}

    /// An attempt failed and the entry was rescheduled.
    fn failure(&self, _entry: &OutboxEntry, _error: &OutboxError) {}

    /// An attempt failed and the entry reached the blacklist threshold.
    fn blacklisted(&self, _entry: &OutboxEntry, _error: &OutboxError) {}
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NullListener;

impl OutboxListener for NullListener {}

/// Fans events out to several listeners in registration order. A panic in
/// one listener does not keep the event from the rest.
#[derive(Default, Clone)]
pub struct CompositeListener {
    listeners: Vec<Arc<dyn OutboxListener>>,
}

impl CompositeListener {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, listener: Arc<dyn OutboxListener>) -> Self {
        self.listeners.push(listener);
        self
    }
}

impl OutboxListener for CompositeListener {
    fn scheduled(&self, entry: &OutboxEntry) {
        for listener in &self.listeners {
            guarded("scheduled", || listener.scheduled(entry));
        }
    }

    fn success(&self, entry: &OutboxEntry) {
        for listener in &self.listeners {
            guarded("success", || listener.success(entry));
        }
    }

    fn failure(&self, entry: &OutboxEntry, error: &OutboxError) {
        for listener in &self.listeners {
            guarded("failure", || listener.failure(entry, error));
        }
    }

    fn blacklisted(&self, entry: &OutboxEntry, error: &OutboxError) {
        for listener in &self.listeners {
            guarded("blacklisted", || listener.blacklisted(entry, error));
        }
    }
}

/// A recorded listener event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListenerEvent {
    Scheduled(EntryId),
    Success(EntryId),
    /// Entry id and attempts at the time of failure.
    Failure(EntryId, u32),
    Blacklisted(EntryId, u32),
}

/// Listener that records every event it sees.
#[derive(Debug, Default)]
pub struct RecordingListener {
    events: Mutex<Vec<ListenerEvent>>,
}

impl RecordingListener {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<ListenerEvent> {
        self.events.lock().expect("lock poisoned").clone()
    }

    pub fn count(&self, matches: impl Fn(&ListenerEvent) -> bool) -> usize {
        self.events
            .lock()
            .expect("lock poisoned")
            .iter()
            .filter(|event| matches(event))
            .count()
    }

    pub fn successes(&self) -> usize {
        self.count(|e| matches!(e, ListenerEvent::Success(_)))
    }

    pub fn failures(&self) -> usize {
        self.count(|e| matches!(e, ListenerEvent::Failure(..)))
    }

    pub fn blacklistings(&self) -> usize {
        self.count(|e| matches!(e, ListenerEvent::Blacklisted(..)))
    }

    fn push(&self, event: ListenerEvent) {
        self.events.lock().expect("lock poisoned").push(event);
    }
}

impl OutboxListener for RecordingListener {
    fn scheduled(&self, entry: &OutboxEntry) {
        self.push(ListenerEvent::Scheduled(entry.id.clone()));
    }

    fn success(&self, entry: &OutboxEntry) {
        self.push(ListenerEvent::Success(entry.id.clone()));
    }

    fn failure(&self, entry: &OutboxEntry, _error: &OutboxError) {
        self.push(ListenerEvent::Failure(entry.id.clone(), entry.attempts));
    }

    fn blacklisted(&self, entry: &OutboxEntry, _error: &OutboxError) {
        self.push(ListenerEvent::Blacklisted(entry.id.clone(), entry.attempts));
    }
}
