//! Query parameters and aggregates for operator tooling.

use outbox_engine::EntryStatus;

/// Default page size for entry listings.
pub const DEFAULT_LIST_LIMIT: usize = 100;

/// Selects entries for listing, oldest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntryFilter {
    /// Only entries in this state; all entries when `None`.
    pub status: Option<EntryStatus>,
    pub limit: usize,
}

impl EntryFilter {
    pub fn all() -> Self {
        Self {
            status: None,
            limit: DEFAULT_LIST_LIMIT,
        }
    }

    pub fn with_status(status: EntryStatus) -> Self {
        Self {
            status: Some(status),
            limit: DEFAULT_LIST_LIMIT,
        }
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }
}

impl Default for EntryFilter {
    fn default() -> Self {
        Self::all()
    }
}

/// Number of stored entries per state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EntryCounts {
    pub pending: u64,
    pub blacklisted: u64,
    pub processed: u64,
}

impl EntryCounts {
    pub fn total(&self) -> u64 {
        self.pending + self.blacklisted + self.processed
    }
}
