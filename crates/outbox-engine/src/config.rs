//! Engine configuration.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::backoff::{Backoff, ExponentialBackoff, FixedBackoff};
use crate::{OutboxError, OutboxResult};

/// Default delay between attempts, and the lease a claim holds (2 minutes).
pub const DEFAULT_ATTEMPT_FREQUENCY_MS: u64 = 120_000;
/// Default maximum number of entries claimed per flush.
pub const DEFAULT_FLUSH_BATCH_SIZE: usize = 4096;
/// Default number of failed attempts after which an entry is blacklisted.
pub const DEFAULT_BLACKLIST_AFTER_ATTEMPTS: u32 = 5;
/// Default retention of processed idempotent entries (7 days).
pub const DEFAULT_RETENTION_THRESHOLD_MS: u64 = 7 * 24 * 60 * 60 * 1000;
/// Default period of the background flusher.
pub const DEFAULT_FLUSH_INTERVAL_MS: u64 = 5_000;

/// Retry delay policy selection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BackoffConfig {
    /// Wait `attempt_frequency` after every failure.
    Fixed,
    /// Start at `attempt_frequency` and double up to `max_delay_ms`.
    Exponential { max_delay_ms: u64 },
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self::Fixed
    }
}

/// Tunables of a [`crate::TransactionOutbox`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboxConfig {
    #[serde(default = "default_attempt_frequency_ms")]
    pub attempt_frequency_ms: u64,
    #[serde(default = "default_flush_batch_size")]
    pub flush_batch_size: usize,
    #[serde(default = "default_blacklist_after_attempts")]
    pub blacklist_after_attempts: u32,
    #[serde(default = "default_retention_threshold_ms")]
    pub retention_threshold_ms: u64,
    /// Persist the diagnostic context map with each invocation.
    #[serde(default = "default_serialize_mdc")]
    pub serialize_mdc: bool,
    #[serde(default = "default_flush_interval_ms")]
    pub flush_interval_ms: u64,
    #[serde(default)]
    pub backoff: BackoffConfig,
}

fn default_attempt_frequency_ms() -> u64 {
    DEFAULT_ATTEMPT_FREQUENCY_MS
}

fn default_flush_batch_size() -> usize {
    DEFAULT_FLUSH_BATCH_SIZE
}

fn default_blacklist_after_attempts() -> u32 {
    DEFAULT_BLACKLIST_AFTER_ATTEMPTS
}

fn default_retention_threshold_ms() -> u64 {
    DEFAULT_RETENTION_THRESHOLD_MS
}

fn default_serialize_mdc() -> bool {
    true
}

fn default_flush_interval_ms() -> u64 {
    DEFAULT_FLUSH_INTERVAL_MS
}

impl Default for OutboxConfig {
    fn default() -> Self {
        Self {
            attempt_frequency_ms: DEFAULT_ATTEMPT_FREQUENCY_MS,
            flush_batch_size: DEFAULT_FLUSH_BATCH_SIZE,
            blacklist_after_attempts: DEFAULT_BLACKLIST_AFTER_ATTEMPTS,
            retention_threshold_ms: DEFAULT_RETENTION_THRESHOLD_MS,
            serialize_mdc: true,
            flush_interval_ms: DEFAULT_FLUSH_INTERVAL_MS,
            backoff: BackoffConfig::Fixed,
        }
    }
}

impl OutboxConfig {
    /// Load configuration from a JSON file. Missing fields take their defaults.
    pub fn load_from_file(path: &Path) -> OutboxResult<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: OutboxConfig = serde_json::from_str(&content)?;
        Ok(config)
    }

    /// Loads `path` if it exists, otherwise starts from defaults, then
    /// applies environment overrides and validates.
    pub fn load(path: &Path) -> OutboxResult<Self> {
        let mut config = if path.exists() {
            Self::load_from_file(path)?
        } else {
            Self::default()
        };
        config.apply_env()?;
        config.validate()?;
        Ok(config)
    }

    /// Override fields from `OUTBOX_*` environment variables.
    pub fn apply_env(&mut self) -> OutboxResult<()> {
        if let Some(v) = env_number("OUTBOX_ATTEMPT_FREQUENCY_MS")? {
            self.attempt_frequency_ms = v;
        }
        if let Some(v) = env_number("OUTBOX_FLUSH_BATCH_SIZE")? {
            self.flush_batch_size = v;
        }
        if let Some(v) = env_number("OUTBOX_BLACKLIST_AFTER_ATTEMPTS")? {
            self.blacklist_after_attempts = v;
        }
        if let Some(v) = env_number("OUTBOX_RETENTION_THRESHOLD_MS")? {
            self.retention_threshold_ms = v;
        }
        if let Some(v) = env_number("OUTBOX_FLUSH_INTERVAL_MS")? {
            self.flush_interval_ms = v;
        }
        Ok(())
    }

    pub fn validate(&self) -> OutboxResult<()> {
        let zero = [
            ("attempt_frequency_ms", self.attempt_frequency_ms == 0),
            ("flush_batch_size", self.flush_batch_size == 0),
            ("blacklist_after_attempts", self.blacklist_after_attempts == 0),
            ("retention_threshold_ms", self.retention_threshold_ms == 0),
            ("flush_interval_ms", self.flush_interval_ms == 0),
        ];
        if let Some((field, _)) = zero.iter().find(|(_, is_zero)| *is_zero) {
            return Err(OutboxError::Config(format!("{field} must be greater than zero")));
        }
        if let BackoffConfig::Exponential { max_delay_ms } = self.backoff {
            if max_delay_ms < self.attempt_frequency_ms {
                return Err(OutboxError::Config(
                    "backoff.max_delay_ms must not be below attempt_frequency_ms".to_string(),
                ));
            }
        }
        Ok(())
    }

    pub fn attempt_frequency(&self) -> Duration {
        Duration::from_millis(self.attempt_frequency_ms)
    }

    pub fn retention_threshold(&self) -> Duration {
        Duration::from_millis(self.retention_threshold_ms)
    }

    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }

    /// Builds the configured retry delay policy.
    pub fn backoff(&self) -> Arc<dyn Backoff> {
        match self.backoff {
            BackoffConfig::Fixed => Arc::new(FixedBackoff::new(self.attempt_frequency())),
            BackoffConfig::Exponential { max_delay_ms } => Arc::new(ExponentialBackoff::new(
                self.attempt_frequency(),
                Duration::from_millis(max_delay_ms),
            )),
        }
    }
}

fn env_number<T: std::str::FromStr>(key: &str) -> OutboxResult<Option<T>> {
    match std::env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| OutboxError::Config(format!("{key} is not a valid number: {raw:?}"))),
        Err(_) => Ok(None),
    }
}
