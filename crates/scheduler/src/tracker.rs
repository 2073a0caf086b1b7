//! Lifecycle tracker: the single source of truth for "what happened to
//! request X".
//!
//! One map from [`RequestId`] to a [`RequestState`] sum type, so resolving
//! a status is a single lookup. The map sits behind a synchronous mutex
//! that is never held across an `.await`.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use duat_core::status::{state_machine, CompletionRecord, RequestStatus};
use duat_core::types::{RequestId, Timestamp};
use serde::Serialize;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use crate::dispatcher::QueueEntry;
use crate::error::SchedulerError;

// ---------------------------------------------------------------------------
// RequestState
// ---------------------------------------------------------------------------

/// Where a request currently is in its lifecycle.
#[derive(Debug, Clone)]
pub enum RequestState {
    /// Waiting for a concurrency slot.
    Queued(QueueEntry),
    /// Holding a slot.
    Processing(ProcessingState),
    /// Resolved. The record never changes after this point.
    Terminal(CompletionRecord),
}

impl RequestState {
    pub fn status(&self) -> RequestStatus {
        match self {
            Self::Queued(_) => RequestStatus::Queued,
            Self::Processing(_) => RequestStatus::Processing,
            Self::Terminal(record) => record.status,
        }
    }
}

/// Book-keeping for a request that holds a concurrency slot.
#[derive(Debug, Clone)]
pub struct ProcessingState {
    pub entry: QueueEntry,
    /// When the dispatcher handed the request a slot.
    pub started_at: Timestamp,
    /// Set once the backend accepted the workflow.
    pub backend_job_id: Option<String>,
    pub submitted_at: Option<Timestamp>,
    pub(crate) cancel: CancellationToken,
}

/// Per-status counts across every tracked request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub queued: usize,
    pub processing: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
}

// ---------------------------------------------------------------------------
// LifecycleTracker
// ---------------------------------------------------------------------------

#[derive(Default)]
struct TrackerInner {
    states: HashMap<RequestId, RequestState>,
    /// Callers blocked in [`LifecycleTracker::wait_for`].
    waiters: HashMap<RequestId, Vec<oneshot::Sender<CompletionRecord>>>,
}

/// Map from request id to lifecycle state.
///
/// Records accumulate for the life of the process unless evicted with
/// [`evict_terminal_before`](Self::evict_terminal_before).
#[derive(Default)]
pub struct LifecycleTracker {
    inner: Mutex<TrackerInner>,
}

impl LifecycleTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a freshly enqueued request.
    pub(crate) fn insert_queued(&self, id: RequestId, entry: QueueEntry) {
        let previous = self.lock().states.insert(id, RequestState::Queued(entry));
        debug_assert!(previous.is_none(), "request id {id} reused");
    }

    /// Move a request from `Queued` to `Processing`, returning its entry.
    ///
    /// Returns `None` if the request is not queued.
    pub(crate) fn begin_processing(
        &self,
        id: RequestId,
        cancel: CancellationToken,
    ) -> Option<QueueEntry> {
        let mut inner = self.lock();
        let state = inner.states.get_mut(&id)?;
        let RequestState::Queued(entry) = state else {
            return None;
        };
        let entry = entry.clone();
        *state = RequestState::Processing(ProcessingState {
            entry: entry.clone(),
            started_at: chrono::Utc::now(),
            backend_job_id: None,
            submitted_at: None,
            cancel,
        });
        Some(entry)
    }

    /// Note the backend job id of a processing request.
    pub(crate) fn mark_submitted(&self, id: RequestId, job_id: &str, submitted_at: Timestamp) {
        if let Some(RequestState::Processing(processing)) = self.lock().states.get_mut(&id) {
            processing.backend_job_id = Some(job_id.to_string());
            processing.submitted_at = Some(submitted_at);
        }
    }

    /// Write the terminal record for `id`.
    ///
    /// Write-once: a second call for the same id is rejected with
    /// [`SchedulerError::AlreadyTerminal`] and the first record is kept.
    /// Anyone blocked in [`wait_for`](Self::wait_for) is released.
    pub fn record_terminal(
        &self,
        id: RequestId,
        record: CompletionRecord,
    ) -> Result<(), SchedulerError> {
        let mut inner = self.lock();
        let current = inner
            .states
            .get(&id)
            .ok_or(SchedulerError::NotFound(id))?;

        if let RequestState::Terminal(existing) = current {
            return Err(SchedulerError::AlreadyTerminal {
                id,
                status: existing.status,
            });
        }
        state_machine::validate_transition(current.status(), record.status)
            .map_err(|reason| SchedulerError::InvalidTransition { id, reason })?;

        inner
            .states
            .insert(id, RequestState::Terminal(record.clone()));

        for waiter in inner.waiters.remove(&id).unwrap_or_default() {
            // A dropped receiver just means the waiter gave up.
            let _ = waiter.send(record.clone());
        }
        Ok(())
    }

    /// Current status of `id`. Unknown ids are an explicit `NotFound`.
    pub fn status_of(&self, id: RequestId) -> Result<RequestStatus, SchedulerError> {
        self.lock()
            .states
            .get(&id)
            .map(RequestState::status)
            .ok_or(SchedulerError::NotFound(id))
    }

    /// Snapshot of the full state of `id`.
    pub fn state_of(&self, id: RequestId) -> Result<RequestState, SchedulerError> {
        self.lock()
            .states
            .get(&id)
            .cloned()
            .ok_or(SchedulerError::NotFound(id))
    }

    /// The completion record of a terminal request.
    pub fn record_of(&self, id: RequestId) -> Result<CompletionRecord, SchedulerError> {
        match self.lock().states.get(&id) {
            None => Err(SchedulerError::NotFound(id)),
            Some(RequestState::Terminal(record)) => Ok(record.clone()),
            Some(state) => Err(SchedulerError::NotTerminal {
                id,
                status: state.status(),
            }),
        }
    }

    /// Wait until `id` is terminal and return its record.
    pub async fn wait_for(&self, id: RequestId) -> Result<CompletionRecord, SchedulerError> {
        let rx = {
            let mut inner = self.lock();
            match inner.states.get(&id) {
                None => return Err(SchedulerError::NotFound(id)),
                Some(RequestState::Terminal(record)) => return Ok(record.clone()),
                Some(_) => {}
            }
            let (tx, rx) = oneshot::channel();
            inner.waiters.entry(id).or_default().push(tx);
            rx
        };

        rx.await.map_err(|_| SchedulerError::ShutDown)
    }

    pub fn stats(&self) -> QueueStats {
        let inner = self.lock();
        let mut stats = QueueStats::default();
        for state in inner.states.values() {
            match state.status() {
                RequestStatus::Queued => stats.queued += 1,
                RequestStatus::Processing => stats.processing += 1,
                RequestStatus::Completed => stats.completed += 1,
                RequestStatus::Failed => stats.failed += 1,
                RequestStatus::Cancelled => stats.cancelled += 1,
            }
        }
        stats
    }

    /// Drop terminal records that completed before `cutoff`.
    ///
    /// Evicted ids report `NotFound` afterwards. Returns how many records
    /// were removed.
    pub fn evict_terminal_before(&self, cutoff: Timestamp) -> usize {
        let mut inner = self.lock();
        let before = inner.states.len();
        inner.states.retain(|_, state| match state {
            RequestState::Terminal(record) => record.completed_at >= cutoff,
            _ => true,
        });
        before - inner.states.len()
    }

    fn lock(&self) -> MutexGuard<'_, TrackerInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
