//! Outbound send queue
//!
//! Application-facing actions never wait on the network. They hand the send
//! to this queue and return; a single worker drains it in submission order.
//! Failures are logged and counted, never returned to the original caller.

use super::metrics;
use crate::infrastructure::protocols::sip::SipError;
use futures::future::BoxFuture;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

/// One queued send
pub type SendJob = BoxFuture<'static, Result<(), SipError>>;

enum Task {
    Send { action: &'static str, job: SendJob },
    Flush(oneshot::Sender<()>),
}

/// Bounded FIFO of send jobs with one worker
pub struct OutboundQueue {
    tx: mpsc::Sender<Task>,
    worker: JoinHandle<()>,
}

impl OutboundQueue {
    /// Spawn the worker. Must be called from within a Tokio runtime.
    pub fn new(capacity: usize) -> Self {
        let (tx, mut rx) = mpsc::channel::<Task>(capacity.max(1));

        let worker = tokio::spawn(async move {
            while let Some(task) = rx.recv().await {
                match task {
                    Task::Send { action, job } => {
                        debug!("Running outbound {}", action);
                        if let Err(e) = job.await {
                            error!("Outbound {} failed: {}", action, e);
                            metrics::record_send_failure(action);
                        }
                    }
                    Task::Flush(done) => {
                        let _ = done.send(());
                    }
                }
            }
            debug!("Outbound queue closed");
        });

        Self { tx, worker }
    }

    /// Queue `job`. Waits only when the queue is full.
    pub async fn submit(&self, action: &'static str, job: SendJob) {
        if self.tx.send(Task::Send { action, job }).await.is_err() {
            warn!("Outbound queue is closed, dropping {}", action);
            metrics::record_send_failure(action);
        }
    }

    /// Resolve once every job submitted before this call has finished
    pub async fn flush(&self) {
        let (done_tx, done_rx) = oneshot::channel();
        if self.tx.send(Task::Flush(done_tx)).await.is_err() {
            return;
        }
        let _ = done_rx.await;
    }
}

impl Drop for OutboundQueue {
    fn drop(&mut self) {
        self.worker.abort();
    }
}
