//! Asynchronous execution of outbox work.

use std::sync::Arc;

use futures_util::future::BoxFuture;
use tokio::sync::{mpsc, Mutex};
use tracing::debug;

use crate::{OutboxError, OutboxResult};

/// A unit of work handed to a [`Submitter`].
pub type Work = BoxFuture<'static, ()>;

/// Runs work asynchronously. Failing to accept work is not an attempt: the
/// entry stays pending and is retried once its lease lapses.
pub trait Submitter: Send + Sync {
    fn submit(&self, work: Work) -> OutboxResult<()>;
}

/// Spawns every unit of work as its own tokio task. Never rejects.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioSubmitter;

impl Submitter for TokioSubmitter {
    fn submit(&self, work: Work) -> OutboxResult<()> {
        tokio::spawn(work);
        Ok(())
    }
}

/// A fixed pool of worker tasks fed by a bounded queue.
///
/// Must be created inside a tokio runtime. Workers exit once the submitter
/// is dropped and the queue has drained.
pub struct BoundedSubmitter {
    sender: mpsc::Sender<Work>,
}

impl BoundedSubmitter {
    pub fn new(workers: usize, queue_capacity: usize) -> Self {
        let (sender, receiver) = mpsc::channel::<Work>(queue_capacity.max(1));
        let receiver = Arc::new(Mutex::new(receiver));

        for worker in 0..workers.max(1) {
            let receiver = receiver.clone();
            tokio::spawn(async move {
                loop {
                    let next = receiver.lock().await.recv().await;
                    match next {
                        Some(work) => work.await,
                        None => break,
                    }
                }
                debug!(worker, "Submitter worker stopped");
            });
        }

        Self { sender }
    }
}

impl Submitter for BoundedSubmitter {
    fn submit(&self, work: Work) -> OutboxResult<()> {
        self.sender.try_send(work).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => {
                OutboxError::Rejected("submitter queue is full".to_string())
            }
            mpsc::error::TrySendError::Closed(_) => {
                OutboxError::Rejected("submitter is shut down".to_string())
            }
        })
    }
}
