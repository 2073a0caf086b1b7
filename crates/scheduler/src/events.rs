//! Lifecycle events broadcast by the scheduler.
//!
//! Subscribe via [`Scheduler::subscribe`](crate::Scheduler::subscribe).
//! Events are fire-and-forget: publishing with no subscribers is fine,
//! and slow subscribers observe `RecvError::Lagged`.

use std::path::PathBuf;

use duat_core::types::RequestId;
use serde::Serialize;

/// A state change of a request or batch.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SchedulerEvent {
    /// A request passed validation and entered the pending queue.
    Queued {
        request_id: RequestId,
        name: String,
        priority: i32,
    },

    /// A request was taken off the pending queue and given a concurrency slot.
    Dispatched {
        request_id: RequestId,
        name: String,
        priority: i32,
    },

    /// The backend accepted the workflow.
    Submitted { request_id: RequestId, job_id: String },

    Completed {
        request_id: RequestId,
        output_path: PathBuf,
    },

    Failed { request_id: RequestId, error: String },

    Cancelled { request_id: RequestId, reason: String },

    /// Every request of a batch reached a terminal state.
    BatchFinished {
        batch_name: String,
        succeeded: usize,
        failed: usize,
    },
}
