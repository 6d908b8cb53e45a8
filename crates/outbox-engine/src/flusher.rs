//! Periodic background flushing.

use std::time::Duration;

use tokio::sync::oneshot::{self, error::TryRecvError};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::outbox::TransactionOutbox;
use crate::transaction::TransactionManager;

/// Drives [`TransactionOutbox::flush`] on a fixed interval.
pub struct OutboxFlusher;

impl OutboxFlusher {
    /// Starts flushing every `period` until the returned handle is stopped.
    /// Each tick keeps flushing while entries are submitted, checking for
    /// shutdown between passes.
    pub fn spawn<TM: TransactionManager>(
        outbox: TransactionOutbox<TM>,
        period: Duration,
    ) -> FlusherHandle {
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();

        let task = tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            info!(period_ms = period.as_millis() as u64, "Outbox flusher started");

            'ticks: loop {
                tokio::select! {
                    _ = &mut shutdown_rx => break,
                    _ = ticker.tick() => {
                        loop {
                            match outbox.flush().await {
                                Ok(true) => {}
                                Ok(false) => break,
                                Err(e) => {
                                    warn!(error = %e, "Flush cycle failed");
                                    break;
                                }
                            }
                            match shutdown_rx.try_recv() {
                                Err(TryRecvError::Empty) => tokio::task::yield_now().await,
                                _ => break 'ticks,
                            }
                        }
                    }
                }
            }

            debug!("Outbox flusher stopped");
        });

        FlusherHandle {
            shutdown: Some(shutdown_tx),
            task,
        }
    }
}

/// Handle to a running flusher. Dropping it also stops the flusher, without
/// waiting for it.
pub struct FlusherHandle {
    shutdown: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

impl FlusherHandle {
    /// Stops the flusher after its current cycle. Work already submitted
    /// keeps running.
    pub async fn stop(mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        if let Err(e) = self.task.await {
            warn!(error = %e, "Outbox flusher task ended abnormally");
        }
    }
}
