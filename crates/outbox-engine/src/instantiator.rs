//! Handler lookup.
//!
//! Scheduled calls name their handler by string. At execution time the
//! [`Instantiator`] resolves that name to a live [`Handler`], which then
//! dispatches on the method name.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;

use crate::invocation::BoundInvocation;
use crate::transaction::Transaction;
use crate::{OutboxError, OutboxResult};

/// Executes invocations addressed to one handler name.
#[async_trait]
pub trait Handler<TX: Transaction>: Send + Sync {
    /// Runs the invocation inside `call.transaction()`. An error rolls the
    /// transaction back and counts as a failed attempt.
    async fn invoke(&self, call: &BoundInvocation<TX>) -> anyhow::Result<()>;
}

/// Resolves handler names to handlers.
pub trait Instantiator<TX: Transaction>: Send + Sync {
    fn get_instance(&self, class_name: &str) -> OutboxResult<Arc<dyn Handler<TX>>>;
}

/// Name-keyed handler registry.
pub struct HandlerRegistry<TX: Transaction> {
    handlers: RwLock<HashMap<String, Arc<dyn Handler<TX>>>>,
}

impl<TX: Transaction> HandlerRegistry<TX> {
    pub fn new() -> Self {
        Self {
            handlers: RwLock::new(HashMap::new()),
        }
    }

    /// Registers `handler` under `class_name`, replacing any previous one.
    pub fn register(&self, class_name: impl Into<String>, handler: Arc<dyn Handler<TX>>) {
        self.handlers
            .write()
            .expect("lock poisoned")
            .insert(class_name.into(), handler);
    }

    /// Builder-style [`register`](Self::register).
    pub fn with(self, class_name: impl Into<String>, handler: Arc<dyn Handler<TX>>) -> Self {
        self.register(class_name, handler);
        self
    }

    pub fn len(&self) -> usize {
        self.handlers.read().expect("lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<TX: Transaction> Default for HandlerRegistry<TX> {
    fn default() -> Self {
        Self::new()
    }
}

impl<TX: Transaction> Instantiator<TX> for HandlerRegistry<TX> {
    fn get_instance(&self, class_name: &str) -> OutboxResult<Arc<dyn Handler<TX>>> {
        self.handlers
            .read()
            .expect("lock poisoned")
            .get(class_name)
            .cloned()
            .ok_or_else(|| OutboxError::HandlerNotFound(class_name.to_string()))
    }
}
