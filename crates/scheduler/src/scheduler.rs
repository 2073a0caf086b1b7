//! The scheduler handle.
//!
//! [`Scheduler::start`] validates the configuration and spawns the
//! dispatcher loop. The handle owns the only path into that loop; there
//! is no global instance.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use duat_comfyui::GenerationBackend;
use duat_core::config::SchedulerConfig;
use duat_core::request::{validate_request, GenerationRequest};
use duat_core::status::{CompletionRecord, RequestStatus};
use duat_core::types::RequestId;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::dispatcher::{DispatchCommand, Dispatcher, PendingKey, QueueEntry, SHUTDOWN_REASON};
use crate::error::SchedulerError;
use crate::events::SchedulerEvent;
use crate::tracker::{LifecycleTracker, QueueStats, RequestState};

/// State shared between the handle, the dispatcher loop and the
/// processing tasks.
pub(crate) struct Shared {
    pub(crate) config: SchedulerConfig,
    pub(crate) backend: Arc<dyn GenerationBackend>,
    pub(crate) tracker: LifecycleTracker,
    pub(crate) events: broadcast::Sender<SchedulerEvent>,
    /// Parent of every per-request cancellation token.
    pub(crate) shutdown: CancellationToken,
    sequence: AtomicU64,
}

impl Shared {
    /// Broadcast an event. Having no subscribers is not an error.
    pub(crate) fn publish(&self, event: SchedulerEvent) {
        let _ = self.events.send(event);
    }

    /// Record the terminal state of `id` and announce it.
    ///
    /// A rejected write (the request already has a record) is logged and
    /// otherwise ignored; the first record stands.
    pub(crate) fn finish(&self, id: RequestId, record: CompletionRecord) {
        let status = record.status;
        let event = match status {
            RequestStatus::Completed => SchedulerEvent::Completed {
                request_id: id,
                output_path: record.output_path.clone().unwrap_or_default(),
            },
            RequestStatus::Failed => SchedulerEvent::Failed {
                request_id: id,
                error: record.error.clone().unwrap_or_default(),
            },
            RequestStatus::Cancelled => SchedulerEvent::Cancelled {
                request_id: id,
                reason: record.error.clone().unwrap_or_default(),
            },
            RequestStatus::Queued | RequestStatus::Processing => {
                tracing::error!(request_id = %id, %status, "Refusing non-terminal completion record");
                return;
            }
        };

        let written = self.tracker.record_terminal(id, record);
        debug_assert!(written.is_ok(), "terminal write for {id} rejected: {written:?}");
        if let Err(e) = written {
            tracing::error!(request_id = %id, error = %e, "Terminal write rejected");
            return;
        }

        tracing::info!(request_id = %id, %status, "Request finished");
        self.publish(event);
    }
}

/// Handle to a running scheduler.
///
/// Dropping the handle stops the dispatcher the same way
/// [`shutdown`](Self::shutdown) does, without waiting for it.
pub struct Scheduler {
    shared: Arc<Shared>,
    commands: mpsc::UnboundedSender<DispatchCommand>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler").finish_non_exhaustive()
    }
}

impl Scheduler {
    /// Validate `config` and spawn the dispatcher loop.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start(
        config: SchedulerConfig,
        backend: Arc<dyn GenerationBackend>,
    ) -> Result<Self, SchedulerError> {
        config.validate()?;

        let (events, _) = broadcast::channel(config.event_channel_capacity);
        let shutdown = CancellationToken::new();
        let shared = Arc::new(Shared {
            config,
            backend,
            tracker: LifecycleTracker::new(),
            events,
            shutdown: shutdown.clone(),
            sequence: AtomicU64::new(0),
        });

        let (commands, rx) = mpsc::unbounded_channel();
        let dispatcher = Dispatcher::new(Arc::clone(&shared), rx, commands.clone(), shutdown);
        let handle = tokio::spawn(dispatcher.run());

        Ok(Self {
            shared,
            commands,
            dispatcher: Mutex::new(Some(handle)),
        })
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.shared.config
    }

    /// Subscribe to lifecycle events published from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<SchedulerEvent> {
        self.shared.events.subscribe()
    }

    /// Validate `request` and add it to the pending queue.
    ///
    /// Returns as soon as the request is registered as `Queued`; it starts
    /// once a concurrency slot is free and nothing of higher priority (or
    /// equal priority and enqueued earlier) is waiting.
    pub fn enqueue(&self, request: GenerationRequest) -> Result<RequestId, SchedulerError> {
        validate_request(&request)?;
        if self.shared.shutdown.is_cancelled() {
            return Err(SchedulerError::ShutDown);
        }

        let id = RequestId::new();
        let priority = request.priority;
        let name = request.name.clone();
        let entry = QueueEntry {
            request: Arc::new(request),
            enqueued_at: chrono::Utc::now(),
            sequence: self.shared.sequence.fetch_add(1, Ordering::Relaxed),
        };
        let key = PendingKey {
            id,
            priority,
            sequence: entry.sequence,
        };
        let enqueued_at = entry.enqueued_at;

        self.shared.tracker.insert_queued(id, entry);
        tracing::info!(request_id = %id, name = %name, priority, "Request queued");
        self.shared.publish(SchedulerEvent::Queued {
            request_id: id,
            name,
            priority,
        });

        if self.commands.send(DispatchCommand::Enqueue(key)).is_err() {
            self.shared.finish(
                id,
                CompletionRecord::cancelled(SHUTDOWN_REASON, None, enqueued_at, None),
            );
            return Err(SchedulerError::ShutDown);
        }
        Ok(id)
    }

    pub fn status_of(&self, id: RequestId) -> Result<RequestStatus, SchedulerError> {
        self.shared.tracker.status_of(id)
    }

    pub fn state_of(&self, id: RequestId) -> Result<RequestState, SchedulerError> {
        self.shared.tracker.state_of(id)
    }

    /// Completion record of a terminal request; `NotTerminal` otherwise.
    pub fn record_of(&self, id: RequestId) -> Result<CompletionRecord, SchedulerError> {
        self.shared.tracker.record_of(id)
    }

    /// Wait for `id` to reach a terminal state.
    pub async fn wait_for(&self, id: RequestId) -> Result<CompletionRecord, SchedulerError> {
        self.shared.tracker.wait_for(id).await
    }

    /// Enqueue `request` and wait for its outcome.
    pub async fn generate(
        &self,
        request: GenerationRequest,
    ) -> Result<CompletionRecord, SchedulerError> {
        let id = self.enqueue(request)?;
        self.wait_for(id).await
    }

    /// Cancel a request.
    ///
    /// A queued request is removed from the queue and recorded as
    /// `Cancelled` before this returns. An in-flight request is signalled
    /// and records `Cancelled` at its next suspension point; use
    /// [`wait_for`](Self::wait_for) to observe that. Terminal requests
    /// return [`SchedulerError::AlreadyTerminal`].
    pub async fn cancel(&self, id: RequestId) -> Result<(), SchedulerError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(DispatchCommand::Cancel { id, reply })
            .map_err(|_| SchedulerError::ShutDown)?;
        rx.await.map_err(|_| SchedulerError::ShutDown)?
    }

    pub fn stats(&self) -> QueueStats {
        self.shared.tracker.stats()
    }

    /// Drop terminal records that completed more than `older_than` ago.
    pub fn evict_terminal(&self, older_than: Duration) -> usize {
        let cutoff = chrono::Duration::from_std(older_than)
            .ok()
            .and_then(|age| chrono::Utc::now().checked_sub_signed(age))
            .unwrap_or(chrono::DateTime::<chrono::Utc>::MIN_UTC);
        let evicted = self.shared.tracker.evict_terminal_before(cutoff);
        if evicted > 0 {
            tracing::debug!(evicted, "Evicted terminal records");
        }
        evicted
    }

    /// Stop accepting work, cancel queued and in-flight requests, and wait
    /// for the dispatcher to finish. Every request known to the scheduler
    /// is terminal when this returns. Calling it again is a no-op.
    pub async fn shutdown(&self) {
        self.shared.shutdown.cancel();

        let handle = self
            .dispatcher
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                tracing::error!(error = %e, "Dispatcher task failed");
            }
        }
    }

    pub fn is_shut_down(&self) -> bool {
        self.shared.shutdown.is_cancelled()
    }

    pub(crate) fn publish(&self, event: SchedulerEvent) {
        self.shared.publish(event);
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.shared.shutdown.cancel();
    }
}
