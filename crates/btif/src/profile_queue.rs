//! Profile connection admission queue.
//!
//! Profiles never open an outgoing connection directly; they queue a connect callback here.
//! The queue keeps at most one connection attempt in flight: only the head node may be busy,
//! and it stays busy until the profile reports completion with `advance()` (or the
//! ticket-checked `complete()`). Ordering is strict FIFO with no coalescing, so duplicate
//! `(uuid, address)` requests connect one after the other.
//!
//! All queue mutation happens on the btif task, never on the caller's thread.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::context::{BtifTask, ContextError, ContextEvent};
use crate::ids::QueueTicket;
use crate::types::{BtStatus, RawAddress, Uuid};

const QUEUE_CONNECT_EVT: ContextEvent = 0;
const QUEUE_ADVANCE_EVT: ContextEvent = 1;
const QUEUE_CLEANUP_EVT: ContextEvent = 2;
const QUEUE_RELEASE_EVT: ContextEvent = 3;

/// Starts a profile connection. Its status is reported back unchanged by the queue.
pub type ConnectCallback = Arc<dyn Fn(&RawAddress, &Uuid) -> BtStatus + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum QueueError {
    #[error(transparent)]
    Context(#[from] ContextError),
}

impl From<QueueError> for BtStatus {
    fn from(_: QueueError) -> Self {
        BtStatus::NotReady
    }
}

struct ConnectNode {
    ticket: QueueTicket,
    addr: RawAddress,
    uuid: Uuid,
    busy: bool,
    callback: ConnectCallback,
}

#[derive(Default)]
struct QueueState {
    nodes: VecDeque<ConnectNode>,
}

#[derive(Clone)]
pub struct ProfileQueue {
    task: BtifTask,
    state: Arc<Mutex<QueueState>>,
    next_ticket: Arc<AtomicU64>,
}

impl ProfileQueue {
    pub fn new(task: BtifTask) -> Self {
        Self {
            task,
            state: Arc::new(Mutex::new(QueueState::default())),
            next_ticket: Arc::new(AtomicU64::new(1)),
        }
    }

    /// Queue a connection attempt for `uuid` to `addr`.
    ///
    /// The node is always appended to the tail; it starts right away only if it becomes the
    /// head of an idle queue. The returned ticket identifies the node for `complete()`.
    pub fn connect<F>(
        &self,
        uuid: Uuid,
        addr: RawAddress,
        callback: F,
    ) -> Result<QueueTicket, QueueError>
    where
        F: Fn(&RawAddress, &Uuid) -> BtStatus + Send + Sync + 'static,
    {
        let ticket = QueueTicket(self.next_ticket.fetch_add(1, Ordering::Relaxed));
        let node = ConnectNode {
            ticket,
            addr,
            uuid,
            busy: false,
            callback: Arc::new(callback),
        };

        let queue = self.clone();
        self.task.transfer(QUEUE_CONNECT_EVT, move |_| {
            tracing::debug!(%ticket, %addr, %uuid, "Queueing profile connect");
            queue.lock_state().nodes.push_back(node);
            queue.start_head("connect");
        })?;

        Ok(ticket)
    }

    /// Drop the head node unconditionally and start the next one.
    ///
    /// Must be called exactly once per finished connection attempt: nothing here can tell a
    /// duplicate call from a legitimate one. Prefer `complete()` where the ticket is at hand.
    pub fn advance(&self) -> Result<(), QueueError> {
        let queue = self.clone();
        self.task.transfer(QUEUE_ADVANCE_EVT, move |_| {
            queue.advance_now(None);
        })?;
        Ok(())
    }

    /// Ticket-checked `advance()`: drops the head only if it is the node `ticket` names.
    pub fn complete(&self, ticket: QueueTicket) -> Result<(), QueueError> {
        let queue = self.clone();
        self.task.transfer(QUEUE_ADVANCE_EVT, move |_| {
            queue.advance_now(Some(ticket));
        })?;
        Ok(())
    }

    /// Drop every queued node for `uuid` (profile shutting down), then start the next node.
    pub fn cleanup(&self, uuid: Uuid) -> Result<(), QueueError> {
        let queue = self.clone();
        self.task.transfer(QUEUE_CLEANUP_EVT, move |_| {
            {
                let mut state = queue.lock_state();
                let before = state.nodes.len();
                state.nodes.retain(|node| node.uuid != uuid);
                tracing::debug!(%uuid, removed = before - state.nodes.len(), "Profile queue cleanup");
            }
            queue.start_head("cleanup");
        })?;
        Ok(())
    }

    /// Drop every queued node (stack shutdown).
    pub fn release(&self) -> Result<(), QueueError> {
        let queue = self.clone();
        self.task.transfer(QUEUE_RELEASE_EVT, move |_| {
            let mut state = queue.lock_state();
            tracing::debug!(dropped = state.nodes.len(), "Profile queue released");
            state.nodes.clear();
        })?;
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.lock_state().nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of nodes with an attempt in flight. Never more than one.
    pub fn busy_count(&self) -> usize {
        self.lock_state().nodes.iter().filter(|n| n.busy).count()
    }

    fn advance_now(&self, expected: Option<QueueTicket>) {
        {
            let mut state = self.lock_state();
            match (state.nodes.front(), expected) {
                (None, _) => {
                    tracing::warn!("Profile queue advanced while empty");
                    return;
                }
                (Some(head), Some(ticket)) if head.ticket != ticket => {
                    tracing::warn!(
                        %ticket,
                        head = %head.ticket,
                        "Ignoring stale completion for profile queue"
                    );
                    return;
                }
                (Some(head), _) => {
                    tracing::debug!(ticket = %head.ticket, busy = head.busy, "Profile queue advance");
                }
            }
            state.nodes.pop_front();
        }
        self.start_head("advance");
    }

    fn start_head(&self, trigger: &'static str) {
        let status = self.connect_next();
        tracing::trace!(trigger, %status, "Profile queue head checked");
    }

    /// Start the head node if it exists and is idle.
    ///
    /// Returns `Fail` on an empty queue, `Success` if the head is already busy, otherwise the
    /// connect callback's own status.
    fn connect_next(&self) -> BtStatus {
        let (ticket, addr, uuid, callback) = {
            let mut state = self.lock_state();
            let Some(head) = state.nodes.front_mut() else {
                return BtStatus::Fail;
            };
            if head.busy {
                return BtStatus::Success;
            }
            head.busy = true;
            (head.ticket, head.addr, head.uuid, Arc::clone(&head.callback))
        };

        let status = callback(&addr, &uuid);
        tracing::debug!(%ticket, %addr, %uuid, %status, "Profile connect started");
        status
    }

    fn lock_state(&self) -> MutexGuard<'_, QueueState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                tracing::error!("Profile queue mutex poisoned - recovering");
                poisoned.into_inner()
            }
        }
    }
}
