//! Request lifecycle states, the transition table between them and the
//! terminal completion record.

use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::types::Timestamp;

// ---------------------------------------------------------------------------
// RequestStatus
// ---------------------------------------------------------------------------

/// Lifecycle status of a single generation request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestStatus {
    /// Waiting in the pending queue for a concurrency slot.
    Queued,
    /// Holding a concurrency slot; submitted to (or being submitted to) the backend.
    Processing,
    /// Artifact fetched and written.
    Completed,
    /// Submit, poll, fetch or artifact write failed, or the request timed out.
    Failed,
    /// Cancelled by the caller or by scheduler shutdown.
    Cancelled,
}

impl RequestStatus {
    /// Whether no further transitions can leave this status.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::Queued => "Queued",
            Self::Processing => "Processing",
            Self::Completed => "Completed",
            Self::Failed => "Failed",
            Self::Cancelled => "Cancelled",
        }
    }
}

impl fmt::Display for RequestStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

// ---------------------------------------------------------------------------
// State machine
// ---------------------------------------------------------------------------

pub mod state_machine {
    use super::RequestStatus;

    /// Returns the set of statuses reachable from `from`.
    ///
    /// Terminal states return an empty slice.
    pub fn valid_transitions(from: RequestStatus) -> &'static [RequestStatus] {
        use RequestStatus::*;
        match from {
            Queued => &[Processing, Cancelled],
            Processing => &[Completed, Failed, Cancelled],
            Completed | Failed | Cancelled => &[],
        }
    }

    /// Check whether a transition from `from` to `to` is valid.
    pub fn can_transition(from: RequestStatus, to: RequestStatus) -> bool {
        valid_transitions(from).contains(&to)
    }

    /// Validate a state transition, returning an error message for invalid ones.
    pub fn validate_transition(from: RequestStatus, to: RequestStatus) -> Result<(), String> {
        if can_transition(from, to) {
            Ok(())
        } else {
            Err(format!("Invalid transition: {from} -> {to}"))
        }
    }
}

// ---------------------------------------------------------------------------
// CompletionRecord
// ---------------------------------------------------------------------------

/// Terminal outcome of a request. Written once and never modified.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletionRecord {
    /// Always a terminal status.
    pub status: RequestStatus,
    /// Where the artifact was written. Only set for `Completed`.
    pub output_path: Option<PathBuf>,
    /// Human-readable failure or cancellation reason.
    pub error: Option<String>,
    /// Backend job id, when the request got as far as submission.
    pub backend_job_id: Option<String>,
    pub enqueued_at: Timestamp,
    /// When the workflow was handed to the backend, if it ever was.
    pub submitted_at: Option<Timestamp>,
    pub completed_at: Timestamp,
}

impl CompletionRecord {
    pub fn completed(
        output_path: PathBuf,
        backend_job_id: String,
        enqueued_at: Timestamp,
        submitted_at: Timestamp,
    ) -> Self {
        Self {
            status: RequestStatus::Completed,
            output_path: Some(output_path),
            error: None,
            backend_job_id: Some(backend_job_id),
            enqueued_at,
            submitted_at: Some(submitted_at),
            completed_at: chrono::Utc::now(),
        }
    }

    pub fn failed(
        error: impl Into<String>,
        backend_job_id: Option<String>,
        enqueued_at: Timestamp,
        submitted_at: Option<Timestamp>,
    ) -> Self {
        Self {
            status: RequestStatus::Failed,
            output_path: None,
            error: Some(error.into()),
            backend_job_id,
            enqueued_at,
            submitted_at,
            completed_at: chrono::Utc::now(),
        }
    }

    pub fn cancelled(
        reason: impl Into<String>,
        backend_job_id: Option<String>,
        enqueued_at: Timestamp,
        submitted_at: Option<Timestamp>,
    ) -> Self {
        Self {
            status: RequestStatus::Cancelled,
            output_path: None,
            error: Some(reason.into()),
            backend_job_id,
            enqueued_at,
            submitted_at,
            completed_at: chrono::Utc::now(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == RequestStatus::Completed
    }
}
