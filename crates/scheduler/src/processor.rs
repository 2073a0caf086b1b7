//! Per-request processing task.
//!
//! Submit the workflow, poll the backend at a fixed interval until it
//! reports the job terminal, fetch the artifact and write it to the output
//! directory. Submit, the poll loop and fetch are each bounded by the
//! request timeout, so a backend that stops answering cannot hold a
//! dispatch slot. Every failure is turned
//! into a terminal [`CompletionRecord`]; nothing is retried and nothing
//! propagates to the dispatcher.
//!
//! The request's cancellation token is checked at each suspension point
//! (submit, every poll wait, fetch).

use std::path::{Path, PathBuf};
use std::time::Duration;

use duat_comfyui::{Artifact, GenerationBackend, PollStatus};
use duat_core::naming::artifact_filename;
use duat_core::status::CompletionRecord;
use duat_core::types::{RequestId, Timestamp};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::dispatcher::{QueueEntry, SHUTDOWN_REASON};
use crate::error::GenerationError;
use crate::events::SchedulerEvent;
use crate::scheduler::Shared;

/// Upper bound on the best-effort backend cancel issued when an
/// in-flight request is cancelled.
const BACKEND_CANCEL_TIMEOUT: Duration = Duration::from_secs(10);

/// What is known about the backend job so far.
#[derive(Default)]
struct Submission {
    job_id: Option<String>,
    submitted_at: Option<Timestamp>,
}

/// Drive one request to a terminal state and return its record.
pub(crate) async fn process_request(
    shared: &Shared,
    id: RequestId,
    entry: &QueueEntry,
    cancel: &CancellationToken,
) -> CompletionRecord {
    let mut submission = Submission::default();
    let outcome = run(shared, id, entry, cancel, &mut submission).await;

    match outcome {
        Ok(path) => CompletionRecord::completed(
            path,
            submission.job_id.unwrap_or_default(),
            entry.enqueued_at,
            submission.submitted_at.unwrap_or(entry.enqueued_at),
        ),
        Err(GenerationError::Cancelled(reason)) => {
            if let Some(job_id) = submission.job_id.as_deref() {
                cancel_on_backend(shared.backend.as_ref(), id, job_id).await;
            }
            CompletionRecord::cancelled(
                reason,
                submission.job_id,
                entry.enqueued_at,
                submission.submitted_at,
            )
        }
        Err(err) => {
            match &err {
                GenerationError::Timeout { elapsed, .. } => tracing::warn!(
                    request_id = %id,
                    name = %entry.request.name,
                    elapsed_secs = elapsed.as_secs_f64(),
                    "Request timed out",
                ),
                _ => tracing::warn!(
                    request_id = %id,
                    name = %entry.request.name,
                    error = %err,
                    "Request failed",
                ),
            }
            CompletionRecord::failed(
                err.to_string(),
                submission.job_id,
                entry.enqueued_at,
                submission.submitted_at,
            )
        }
    }
}

async fn run(
    shared: &Shared,
    id: RequestId,
    entry: &QueueEntry,
    cancel: &CancellationToken,
    submission: &mut Submission,
) -> Result<PathBuf, GenerationError> {
    let backend = shared.backend.as_ref();
    let config = &shared.config;
    let shutdown = &shared.shutdown;

    let started = Instant::now();
    let job_id = tokio::select! {
        _ = cancel.cancelled() => return Err(cancelled(shutdown)),
        result = tokio::time::timeout(config.request_timeout, backend.submit(&entry.request.workflow)) => {
            result
                .map_err(|_| timed_out(config.request_timeout, started))?
                .map_err(|e| GenerationError::Connection(e.to_string()))?
        }
    };

    let submitted_at = chrono::Utc::now();
    submission.job_id = Some(job_id.clone());
    submission.submitted_at = Some(submitted_at);
    shared.tracker.mark_submitted(id, &job_id, submitted_at);
    tracing::info!(request_id = %id, job_id = %job_id, "Workflow submitted");
    shared.publish(SchedulerEvent::Submitted {
        request_id: id,
        job_id: job_id.clone(),
    });

    let started = Instant::now();
    match tokio::time::timeout(
        config.request_timeout,
        wait_until_terminal(backend, id, &job_id, config.poll_interval, cancel, shutdown),
    )
    .await
    {
        Ok(result) => result?,
        Err(_) => return Err(timed_out(config.request_timeout, started)),
    }

    let started = Instant::now();
    let artifact = tokio::select! {
        _ = cancel.cancelled() => return Err(cancelled(shutdown)),
        result = tokio::time::timeout(config.request_timeout, backend.fetch(&job_id)) => {
            result
                .map_err(|_| timed_out(config.request_timeout, started))?
                .map_err(|e| GenerationError::Fetch(e.to_string()))?
        }
    };

    write_artifact(&config.output_dir, &entry.request.name, &artifact).await
}

/// Poll until the backend no longer lists the job.
async fn wait_until_terminal(
    backend: &dyn GenerationBackend,
    id: RequestId,
    job_id: &str,
    poll_interval: Duration,
    cancel: &CancellationToken,
    shutdown: &CancellationToken,
) -> Result<(), GenerationError> {
    loop {
        let status = tokio::select! {
            _ = cancel.cancelled() => return Err(cancelled(shutdown)),
            result = backend.poll(job_id) => {
                result.map_err(|e| GenerationError::Poll(e.to_string()))?
            }
        };

        match status {
            PollStatus::Terminal => return Ok(()),
            PollStatus::Running => {
                tracing::debug!(request_id = %id, job_id, "Still running");
            }
        }

        tokio::select! {
            _ = cancel.cancelled() => return Err(cancelled(shutdown)),
            _ = tokio::time::sleep(poll_interval) => {}
        }
    }
}

/// Write the artifact under its deterministic name, creating the output
/// directory if needed.
async fn write_artifact(
    output_dir: &Path,
    name: &str,
    artifact: &Artifact,
) -> Result<PathBuf, GenerationError> {
    tokio::fs::create_dir_all(output_dir).await.map_err(|e| {
        GenerationError::Artifact(format!("creating {}: {e}", output_dir.display()))
    })?;

    let path = output_dir.join(artifact_filename(name, Some(&artifact.filename)));
    tokio::fs::write(&path, &artifact.data)
        .await
        .map_err(|e| GenerationError::Artifact(format!("writing {}: {e}", path.display())))?;

    tracing::info!(
        path = %path.display(),
        bytes = artifact.data.len(),
        "Artifact saved",
    );
    Ok(path)
}

async fn cancel_on_backend(backend: &dyn GenerationBackend, id: RequestId, job_id: &str) {
    match tokio::time::timeout(BACKEND_CANCEL_TIMEOUT, backend.cancel(job_id)).await {
        Ok(Ok(())) => tracing::info!(request_id = %id, job_id, "Backend job cancelled"),
        Ok(Err(e)) => tracing::warn!(
            request_id = %id,
            job_id,
            error = %e,
            "Backend cancel failed",
        ),
        Err(_) => tracing::warn!(request_id = %id, job_id, "Backend cancel timed out"),
    }
}

fn timed_out(timeout: Duration, started: Instant) -> GenerationError {
    GenerationError::Timeout {
        timeout,
        elapsed: started.elapsed(),
    }
}

/// Request tokens are children of the scheduler's shutdown token, so a
/// cancelled parent means shutdown rather than a caller cancel.
fn cancelled(shutdown: &CancellationToken) -> GenerationError {
    let reason = if shutdown.is_cancelled() {
        SHUTDOWN_REASON
    } else {
        "cancelled by caller"
    };
    GenerationError::Cancelled(reason.to_string())
}
