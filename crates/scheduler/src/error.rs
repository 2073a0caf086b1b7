use std::time::Duration;

use duat_core::error::CoreError;
use duat_core::status::RequestStatus;
use duat_core::types::RequestId;

/// Why a request ended in `Failed` or `Cancelled`.
///
/// These are captured into the request's completion record; they never
/// propagate to the dispatcher's caller.
#[derive(Debug, Clone, thiserror::Error)]
pub enum GenerationError {
    /// The backend was unreachable or rejected the submission.
    #[error("Backend unreachable at submit: {0}")]
    Connection(String),

    /// Queue inspection failed while waiting for the job.
    #[error("Polling the backend failed: {0}")]
    Poll(String),

    /// The backend did not report a terminal state in time.
    #[error("No terminal result within {timeout:?} (waited {elapsed:?})")]
    Timeout { timeout: Duration, elapsed: Duration },

    /// The job finished but no usable artifact came back.
    #[error("Fetching the result failed: {0}")]
    Fetch(String),

    /// The artifact could not be written to the output directory.
    #[error("Writing the artifact failed: {0}")]
    Artifact(String),

    #[error("Cancelled: {0}")]
    Cancelled(String),
}

/// Errors returned to callers of the [`Scheduler`](crate::Scheduler).
#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    /// The request or batch failed shape validation and was never queued.
    #[error("Validation failed: {0}")]
    Validation(String),

    /// No request with this id was ever enqueued (or it was evicted).
    #[error("Request {0} not found")]
    NotFound(RequestId),

    /// A terminal record already exists for this request.
    #[error("Request {id} is already terminal ({status})")]
    AlreadyTerminal { id: RequestId, status: RequestStatus },

    /// The request has no completion record yet.
    #[error("Request {id} is not terminal yet ({status})")]
    NotTerminal { id: RequestId, status: RequestStatus },

    /// A lifecycle write that the state machine forbids. Indicates a
    /// scheduler bug rather than an operational failure.
    #[error("Invalid lifecycle transition for {id}: {reason}")]
    InvalidTransition { id: RequestId, reason: String },

    /// The scheduler has been shut down and accepts no more work.
    #[error("Scheduler is shut down")]
    ShutDown,

    /// Writing a batch report failed.
    #[error("Failed to write report: {0}")]
    Report(String),
}

impl From<CoreError> for SchedulerError {
    fn from(err: CoreError) -> Self {
        match err {
            CoreError::Validation(msg) => Self::Validation(msg),
            other => Self::Validation(other.to_string()),
        }
    }
}
