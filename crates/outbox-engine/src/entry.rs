//! The durable unit of scheduled work.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::Invocation;

/// Identifier of an outbox entry.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntryId(String);

impl EntryId {
    /// Generates a fresh random id.
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn from_string(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for EntryId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for EntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Derived lifecycle state of an entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryStatus {
    Pending,
    Blacklisted,
    Processed,
}

impl EntryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Blacklisted => "blacklisted",
            Self::Processed => "processed",
        }
    }
}

/// One scheduled invocation and its retry state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboxEntry {
    pub id: EntryId,
    /// Caller-supplied idempotency key.
    pub unique_request_id: Option<String>,
    pub invocation: Invocation,
    pub created_at: DateTime<Utc>,
    pub last_attempt_at: Option<DateTime<Utc>>,
    /// The entry may be claimed once `now >= next_attempt_at`.
    pub next_attempt_at: DateTime<Utc>,
    /// Failed executions so far.
    pub attempts: u32,
    pub blacklisted: bool,
    pub processed: bool,
    /// Optimistic concurrency token, bumped on every stored change.
    pub version: i64,
}

impl OutboxEntry {
    /// Creates a pending entry with version 1.
    pub fn new(
        invocation: Invocation,
        unique_request_id: Option<String>,
        created_at: DateTime<Utc>,
        next_attempt_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: EntryId::new(),
            unique_request_id,
            invocation,
            created_at,
            last_attempt_at: None,
            next_attempt_at,
            attempts: 0,
            blacklisted: false,
            processed: false,
            version: 1,
        }
    }

    pub fn status(&self) -> EntryStatus {
        if self.processed {
            EntryStatus::Processed
        } else if self.blacklisted {
            EntryStatus::Blacklisted
        } else {
            EntryStatus::Pending
        }
    }

    /// True when the entry may be claimed at `now`.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        !self.processed && !self.blacklisted && self.next_attempt_at <= now
    }

    pub fn description(&self) -> String {
        format!("{} [{}]", self.invocation.description(), self.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn entry() -> OutboxEntry {
        let now = Utc::now();
        OutboxEntry::new(Invocation::new("A", "b", vec![]), None, now, now)
    }

    #[test]
    fn new_entry_is_pending_version_one() {
        let entry = entry();
        assert_eq!(entry.version, 1);
        assert_eq!(entry.attempts, 0);
        assert_eq!(entry.status(), EntryStatus::Pending);
        assert!(entry.last_attempt_at.is_none());
    }

    #[test]
    fn ids_are_unique() {
        assert_ne!(entry().id, entry().id);
    }

    #[test]
    fn processed_wins_over_blacklisted() {
        let mut entry = entry();
        entry.blacklisted = true;
        assert_eq!(entry.status(), EntryStatus::Blacklisted);
        entry.processed = true;
        assert_eq!(entry.status(), EntryStatus::Processed);
        assert_eq!(entry.status().as_str(), "processed");
    }

    #[test]
    fn due_only_when_pending_and_time_reached() {
        let mut entry = entry();
        let now = entry.next_attempt_at;
        assert!(entry.is_due(now));
        assert!(!entry.is_due(now - Duration::milliseconds(1)));

        entry.blacklisted = true;
        assert!(!entry.is_due(now));
        entry.blacklisted = false;
        entry.processed = true;
        assert!(!entry.is_due(now));
    }
}
