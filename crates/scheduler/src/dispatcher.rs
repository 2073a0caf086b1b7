//! Priority dispatcher.
//!
//! A single long-lived Tokio task owns the pending queue and the set of
//! active requests. Enqueues, completions and cancellations all arrive as
//! [`DispatchCommand`]s on one channel, so only this loop ever changes
//! the active count and no re-entrancy guard is needed. After every
//! command the loop fills free concurrency slots from the queue.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashSet};
use std::sync::Arc;

use duat_core::request::GenerationRequest;
use duat_core::status::{CompletionRecord, RequestStatus};
use duat_core::types::{RequestId, Timestamp};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use crate::error::SchedulerError;
use crate::events::SchedulerEvent;
use crate::processor;
use crate::scheduler::Shared;
use crate::tracker::RequestState;

/// Reason recorded for requests cut short by [`Scheduler::shutdown`](crate::Scheduler::shutdown).
pub const SHUTDOWN_REASON: &str = "scheduler shut down";

// ---------------------------------------------------------------------------
// QueueEntry / PendingQueue
// ---------------------------------------------------------------------------

/// A request waiting in the pending queue.
#[derive(Debug, Clone)]
pub struct QueueEntry {
    pub request: Arc<GenerationRequest>,
    pub enqueued_at: Timestamp,
    /// Monotonic enqueue counter; breaks priority ties in FIFO order even
    /// when timestamps collide.
    pub sequence: u64,
}

/// Heap key for one pending request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingKey {
    pub id: RequestId,
    pub priority: i32,
    pub sequence: u64,
}

impl Ord for PendingKey {
    /// Higher priority first; among equal priorities, lower sequence first.
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.sequence.cmp(&self.sequence))
            .then_with(|| self.id.cmp(&other.id))
    }
}

impl PartialOrd for PendingKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Pending requests ordered by descending priority, then enqueue order.
#[derive(Debug, Default)]
pub struct PendingQueue {
    heap: BinaryHeap<PendingKey>,
}

impl PendingQueue {
    pub fn push(&mut self, key: PendingKey) {
        self.heap.push(key);
    }

    /// Remove and return the entry that should start next.
    pub fn pop(&mut self) -> Option<PendingKey> {
        self.heap.pop()
    }

    /// Remove a specific request. Returns whether it was present.
    pub fn remove(&mut self, id: RequestId) -> bool {
        let before = self.heap.len();
        self.heap.retain(|key| key.id != id);
        self.heap.len() != before
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    fn drain(&mut self) -> impl Iterator<Item = PendingKey> + '_ {
        self.heap.drain()
    }
}

// ---------------------------------------------------------------------------
// Dispatcher loop
// ---------------------------------------------------------------------------

/// Messages processed by the dispatcher loop, in arrival order.
pub(crate) enum DispatchCommand {
    /// A request was registered as `Queued` and wants a slot.
    Enqueue(PendingKey),
    /// A processing task recorded its terminal state and released its slot.
    Finished(RequestId),
    /// Caller-initiated cancellation.
    Cancel {
        id: RequestId,
        reply: oneshot::Sender<Result<(), SchedulerError>>,
    },
}

pub(crate) struct Dispatcher {
    shared: Arc<Shared>,
    pending: PendingQueue,
    active: HashSet<RequestId>,
    commands: mpsc::UnboundedReceiver<DispatchCommand>,
    /// Cloned into processing tasks so they can report `Finished`.
    commands_tx: mpsc::UnboundedSender<DispatchCommand>,
    shutdown: CancellationToken,
}

impl Dispatcher {
    pub(crate) fn new(
        shared: Arc<Shared>,
        commands: mpsc::UnboundedReceiver<DispatchCommand>,
        commands_tx: mpsc::UnboundedSender<DispatchCommand>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            shared,
            pending: PendingQueue::default(),
            active: HashSet::new(),
            commands,
            commands_tx,
            shutdown,
        }
    }

    /// Run the dispatcher loop until the shutdown token is triggered, then
    /// cancel everything still queued and wait for in-flight tasks.
    pub(crate) async fn run(mut self) {
        tracing::info!(
            max_concurrent = self.shared.config.max_concurrent_requests,
            "Dispatcher started",
        );

        loop {
            tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => break,
                command = self.commands.recv() => match command {
                    Some(command) => self.handle(command),
                    None => break,
                },
            }
            self.fill_slots();
        }

        self.drain().await;
        tracing::info!("Dispatcher stopped");
    }

    fn handle(&mut self, command: DispatchCommand) {
        match command {
            DispatchCommand::Enqueue(key) => self.pending.push(key),
            DispatchCommand::Finished(id) => {
                self.active.remove(&id);
                tracing::debug!(
                    request_id = %id,
                    active = self.active.len(),
                    queued = self.pending.len(),
                    "Concurrency slot released",
                );
            }
            DispatchCommand::Cancel { id, reply } => {
                // The caller may have stopped waiting for the answer.
                let _ = reply.send(self.cancel(id));
            }
        }
    }

    /// Start queued requests while slots are free.
    fn fill_slots(&mut self) {
        while self.active.len() < self.shared.config.max_concurrent_requests {
            let Some(key) = self.pending.pop() else {
                break;
            };

            let token = self.shutdown.child_token();
            let Some(entry) = self.shared.tracker.begin_processing(key.id, token.clone()) else {
                tracing::warn!(request_id = %key.id, "Dequeued request is no longer queued");
                continue;
            };

            self.active.insert(key.id);
            tracing::info!(
                request_id = %key.id,
                name = %entry.request.name,
                priority = key.priority,
                active = self.active.len(),
                "Dispatching request",
            );
            self.shared.publish(SchedulerEvent::Dispatched {
                request_id: key.id,
                name: entry.request.name.clone(),
                priority: key.priority,
            });

            let shared = Arc::clone(&self.shared);
            let finished_tx = self.commands_tx.clone();
            tokio::spawn(async move {
                let record = processor::process_request(&shared, key.id, &entry, &token).await;
                shared.finish(key.id, record);
                let _ = finished_tx.send(DispatchCommand::Finished(key.id));
            });
        }
    }

    fn cancel(&mut self, id: RequestId) -> Result<(), SchedulerError> {
        match self.shared.tracker.state_of(id)? {
            RequestState::Queued(entry) => {
                self.pending.remove(id);
                tracing::info!(request_id = %id, "Cancelled queued request");
                self.shared.finish(
                    id,
                    CompletionRecord::cancelled(
                        "cancelled while queued",
                        None,
                        entry.enqueued_at,
                        None,
                    ),
                );
                Ok(())
            }
            RequestState::Processing(processing) => {
                tracing::info!(request_id = %id, "Cancelling in-flight request");
                processing.cancel.cancel();
                Ok(())
            }
            RequestState::Terminal(record) => Err(SchedulerError::AlreadyTerminal {
                id,
                status: record.status,
            }),
        }
    }

    /// Shutdown path: cancel queued work, then wait for in-flight tasks
    /// (whose tokens are children of the shutdown token) to report back.
    /// Requests enqueued while draining are cancelled too.
    async fn drain(&mut self) {
        let queued: Vec<PendingKey> = self.pending.drain().collect();
        for key in queued {
            self.cancel_for_shutdown(key.id);
        }

        while !self.active.is_empty() {
            match self.commands.recv().await {
                Some(DispatchCommand::Finished(id)) => {
                    self.active.remove(&id);
                }
                Some(DispatchCommand::Enqueue(key)) => self.cancel_for_shutdown(key.id),
                Some(DispatchCommand::Cancel { reply, .. }) => {
                    let _ = reply.send(Err(SchedulerError::ShutDown));
                }
                None => break,
            }
        }

        // Refuse further sends, then settle whatever is still buffered.
        self.commands.close();
        while let Some(command) = self.commands.recv().await {
            match command {
                DispatchCommand::Enqueue(key) => self.cancel_for_shutdown(key.id),
                DispatchCommand::Cancel { reply, .. } => {
                    let _ = reply.send(Err(SchedulerError::ShutDown));
                }
                DispatchCommand::Finished(_) => {}
            }
        }
    }

    fn cancel_for_shutdown(&self, id: RequestId) {
        if let Ok(RequestState::Queued(entry)) = self.shared.tracker.state_of(id) {
            self.shared.finish(
                id,
                CompletionRecord::cancelled(SHUTDOWN_REASON, None, entry.enqueued_at, None),
            );
        } else {
            debug_assert!(
                self.shared.tracker.status_of(id).map(RequestStatus::is_terminal).unwrap_or(true),
                "request {id} left non-terminal at shutdown",
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(priority: i32, sequence: u64) -> PendingKey {
        PendingKey {
            id: RequestId::new(),
            priority,
            sequence,
        }
    }

    #[test]
    fn higher_priority_pops_first() {
        let mut queue = PendingQueue::default();
        queue.push(key(1, 0));
        queue.push(key(3, 1));
        queue.push(key(2, 2));

        let order: Vec<i32> = std::iter::from_fn(|| queue.pop()).map(|k| k.priority).collect();
        assert_eq!(order, vec![3, 2, 1]);
    }

    #[test]
    fn ties_pop_in_enqueue_order() {
        let mut queue = PendingQueue::default();
        let keys = [key(1, 0), key(4, 1), key(2, 2), key(4, 3)];
        for k in keys {
            queue.push(k);
        }

        let order: Vec<u64> = std::iter::from_fn(|| queue.pop()).map(|k| k.sequence).collect();
        assert_eq!(order, vec![1, 3, 2, 0]);
    }

    #[test]
    fn remove_drops_only_that_request() {
        let mut queue = PendingQueue::default();
        let keep = key(2, 0);
        let drop = key(5, 1);
        queue.push(keep);
        queue.push(drop);

        assert!(queue.remove(drop.id));
        assert!(!queue.remove(drop.id));
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.pop().map(|k| k.id), Some(keep.id));
        assert!(queue.is_empty());
    }

    #[test]
    fn negative_priorities_sort_below_zero() {
        let mut queue = PendingQueue::default();
        queue.push(key(-10, 0));
        queue.push(key(0, 1));
        assert_eq!(queue.pop().map(|k| k.priority), Some(0));
    }
}
