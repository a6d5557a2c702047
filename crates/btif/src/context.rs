//! The btif task: a single execution context that runs posted jobs one at a time.
//!
//! Code that must not race with itself (the profile admission queue, HAL callbacks) posts a
//! job here instead of running on the caller's thread. Jobs run in posting order on one
//! tokio task. Payloads travel inside the job closure, so ownership moves with the job and no
//! separate deep-copy step exists.

use tokio::sync::{mpsc, oneshot};

/// Event id attached to a posted job, for tracing.
pub type ContextEvent = u16;

type Job = Box<dyn FnOnce(ContextEvent) + Send + 'static>;

enum ContextMsg {
    Run { event: ContextEvent, job: Job },
    Shutdown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ContextError {
    #[error("btif task is not running")]
    Closed,
}

/// Handle to the btif task. Clones post to the same task.
#[derive(Clone)]
pub struct BtifTask {
    tx: mpsc::UnboundedSender<ContextMsg>,
}

impl BtifTask {
    /// Spawn the task on the current tokio runtime.
    pub fn spawn() -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<ContextMsg>();

        tokio::spawn(async move {
            tracing::debug!("btif task started");
            while let Some(msg) = rx.recv().await {
                match msg {
                    ContextMsg::Run { event, job } => {
                        tracing::trace!(event, "btif task running job");
                        job(event);
                    }
                    ContextMsg::Shutdown => break,
                }
            }
            tracing::debug!("btif task exited");
        });

        Self { tx }
    }

    /// Run `job` later on the btif task. The job receives `event` back.
    pub fn transfer<F>(&self, event: ContextEvent, job: F) -> Result<(), ContextError>
    where
        F: FnOnce(ContextEvent) + Send + 'static,
    {
        self.tx
            .send(ContextMsg::Run {
                event,
                job: Box::new(job),
            })
            .map_err(|_| {
                tracing::warn!(event, "Dropping job posted to stopped btif task");
                ContextError::Closed
            })
    }

    /// Wait until every job posted before this call has run.
    pub async fn flush(&self) -> Result<(), ContextError> {
        let (done_tx, done_rx) = oneshot::channel();
        self.transfer(0, move |_| {
            let _ = done_tx.send(());
        })?;
        done_rx.await.map_err(|_| ContextError::Closed)
    }

    /// Stop the task after the jobs already queued. Later posts fail with `Closed`.
    pub fn shutdown(&self) {
        let _ = self.tx.send(ContextMsg::Shutdown);
    }
}
