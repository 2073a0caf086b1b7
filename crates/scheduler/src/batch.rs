//! Batch coordinator.
//!
//! Runs a named group of requests through the scheduler under the batch's
//! own concurrency limit, waits until every one of them is terminal and
//! reports a single outcome. One request failing never cancels its
//! siblings.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::{Path, PathBuf};

use duat_core::naming::name_slug;
use duat_core::request::GenerationRequest;
use duat_core::types::Timestamp;
use futures::future::join_all;
use serde::Serialize;
use tokio::sync::Semaphore;

use crate::error::SchedulerError;
use crate::events::SchedulerEvent;
use crate::scheduler::Scheduler;

/// Called once with the outcome, after every request is terminal.
pub type BatchCallback = Box<dyn FnOnce(&BatchOutcome) + Send>;

/// A named group of requests with its own concurrency limit.
pub struct BatchJob {
    pub name: String,
    pub requests: Vec<GenerationRequest>,
    /// Falls back to the scheduler's `batch_concurrency_limit` when unset.
    pub concurrency_limit: Option<usize>,
    callback: Option<BatchCallback>,
}

impl BatchJob {
    pub fn new(name: impl Into<String>, requests: Vec<GenerationRequest>) -> Self {
        Self {
            name: name.into(),
            requests,
            concurrency_limit: None,
            callback: None,
        }
    }

    pub fn with_concurrency_limit(mut self, limit: usize) -> Self {
        self.concurrency_limit = Some(limit);
        self
    }

    pub fn on_complete<F>(mut self, callback: F) -> Self
    where
        F: FnOnce(&BatchOutcome) + Send + 'static,
    {
        self.callback = Some(Box::new(callback));
        self
    }

    fn validate(&self, limit: usize) -> Result<(), SchedulerError> {
        if self.name.trim().is_empty() {
            return Err(SchedulerError::Validation(
                "batch name must not be empty".to_string(),
            ));
        }
        if limit == 0 {
            return Err(SchedulerError::Validation(format!(
                "batch '{}': concurrency limit must be at least 1",
                self.name
            )));
        }

        // Names that share a slug would overwrite each other's artifact.
        let mut seen = HashMap::new();
        for request in &self.requests {
            if let Some(first) = seen.insert(name_slug(&request.name), request.name.as_str()) {
                return Err(SchedulerError::Validation(format!(
                    "batch '{}': duplicate request name '{}' (same artifact as '{}')",
                    self.name, request.name, first
                )));
            }
        }
        Ok(())
    }
}

impl fmt::Debug for BatchJob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BatchJob")
            .field("name", &self.name)
            .field("requests", &self.requests.len())
            .field("concurrency_limit", &self.concurrency_limit)
            .field("callback", &self.callback.is_some())
            .finish()
    }
}

/// Aggregate result of a batch.
#[derive(Debug, Clone, Serialize)]
pub struct BatchOutcome {
    pub batch_name: String,
    pub started_at: Timestamp,
    pub finished_at: Timestamp,
    /// Request name to artifact path.
    pub succeeded: BTreeMap<String, PathBuf>,
    /// Names of requests that failed, were cancelled or were rejected.
    pub failed: Vec<String>,
}

impl BatchOutcome {
    pub fn total(&self) -> usize {
        self.succeeded.len() + self.failed.len()
    }

    /// Write the outcome as pretty-printed JSON.
    pub fn write_report(&self, path: &Path) -> Result<(), SchedulerError> {
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| SchedulerError::Report(e.to_string()))?;
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .map_err(|e| SchedulerError::Report(format!("{}: {e}", parent.display())))?;
        }
        std::fs::write(path, json)
            .map_err(|e| SchedulerError::Report(format!("{}: {e}", path.display())))
    }
}

impl Scheduler {
    /// Run every request of `job` and return the aggregate outcome.
    ///
    /// At most `concurrency_limit` of the batch's requests are enqueued
    /// at once; the global ceiling still applies on top. The callback, if
    /// any, fires exactly once after all requests are terminal.
    pub async fn run_batch(&self, job: BatchJob) -> Result<BatchOutcome, SchedulerError> {
        let limit = job
            .concurrency_limit
            .unwrap_or(self.config().batch_concurrency_limit);
        job.validate(limit)?;

        let BatchJob {
            name: batch_name,
            requests,
            callback,
            ..
        } = job;

        tracing::info!(
            batch = %batch_name,
            requests = requests.len(),
            limit,
            "Starting batch",
        );

        let started_at = chrono::Utc::now();
        let gate = Semaphore::new(limit);
        let runs = requests.into_iter().map(|request| {
            let gate = &gate;
            let batch_name = batch_name.as_str();
            async move {
                let name = request.name.clone();
                let Ok(_permit) = gate.acquire().await else {
                    return (name, Err(SchedulerError::ShutDown));
                };
                let result = match self.enqueue(request.with_batch_id(batch_name)) {
                    Ok(id) => self.wait_for(id).await,
                    Err(e) => Err(e),
                };
                (name, result)
            }
        });
        let results = join_all(runs).await;

        let mut succeeded = BTreeMap::new();
        let mut failed = Vec::new();
        for (name, result) in results {
            match result {
                Ok(record) if record.is_success() => {
                    succeeded.insert(name, record.output_path.unwrap_or_default());
                }
                Ok(record) => {
                    tracing::warn!(
                        batch = %batch_name,
                        request = %name,
                        status = %record.status,
                        error = record.error.as_deref().unwrap_or(""),
                        "Batch request did not complete",
                    );
                    failed.push(name);
                }
                Err(e) => {
                    tracing::warn!(
                        batch = %batch_name,
                        request = %name,
                        error = %e,
                        "Batch request rejected",
                    );
                    failed.push(name);
                }
            }
        }

        let outcome = BatchOutcome {
            batch_name,
            started_at,
            finished_at: chrono::Utc::now(),
            succeeded,
            failed,
        };

        tracing::info!(
            batch = %outcome.batch_name,
            succeeded = outcome.succeeded.len(),
            failed = outcome.failed.len(),
            "Batch finished",
        );
        self.publish(SchedulerEvent::BatchFinished {
            batch_name: outcome.batch_name.clone(),
            succeeded: outcome.succeeded.len(),
            failed: outcome.failed.len(),
        });

        if let Some(callback) = callback {
            callback(&outcome);
        }
        Ok(outcome)
    }
}
