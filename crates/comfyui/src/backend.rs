//! The generation backend seam.
//!
//! [`GenerationBackend`] is the only way the scheduler talks to the
//! network: submit a workflow, poll whether it is still running, fetch
//! the finished artifact, and (best effort) cancel. [`ComfyUIBackend`]
//! implements it on top of [`ComfyUIApi`].

use async_trait::async_trait;
use serde::Deserialize;

use crate::api::ComfyUIApi;

/// Output list keys ComfyUI nodes use for file outputs, in lookup order.
const OUTPUT_KINDS: &[&str] = &["gifs", "videos", "images"];

/// Result of a single poll.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollStatus {
    /// The job is still queued or executing on the backend.
    Running,
    /// The backend is done with the job; its result can be fetched.
    Terminal,
}

/// A finished output file downloaded from the backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Artifact {
    /// Filename as reported by the backend.
    pub filename: String,
    pub subfolder: String,
    /// Backend folder type (`output`, `temp`, ...).
    pub folder_type: String,
    pub data: Vec<u8>,
}

/// Errors surfaced by a [`GenerationBackend`].
#[derive(Debug, Clone, thiserror::Error)]
pub enum BackendError {
    /// The backend could not be reached or rejected the submission.
    #[error("Connection error: {0}")]
    Connection(String),

    /// Queue inspection failed.
    #[error("Poll error: {0}")]
    Poll(String),

    /// No usable artifact could be retrieved for a finished job.
    #[error("Fetch error: {0}")]
    Fetch(String),

    /// The cancellation request failed.
    #[error("Cancel error: {0}")]
    Cancel(String),
}

/// Operations the scheduler needs from a rendering backend.
#[async_trait]
pub trait GenerationBackend: Send + Sync {
    /// Hand a workflow to the backend. Returns the backend's job id.
    async fn submit(&self, workflow: &serde_json::Value) -> Result<String, BackendError>;

    /// Check whether `job_id` is still running.
    async fn poll(&self, job_id: &str) -> Result<PollStatus, BackendError>;

    /// Retrieve the artifact of a job that polled as terminal.
    async fn fetch(&self, job_id: &str) -> Result<Artifact, BackendError>;

    /// Ask the backend to drop `job_id`.
    async fn cancel(&self, job_id: &str) -> Result<(), BackendError>;
}

/// One file reference inside a ComfyUI history `outputs` entry.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct OutputFile {
    pub filename: String,
    #[serde(default)]
    pub subfolder: String,
    #[serde(rename = "type", default = "default_folder_type")]
    pub folder_type: String,
}

fn default_folder_type() -> String {
    "output".to_string()
}

/// Locate the first output file for `prompt_id` in a `/history` response.
///
/// Nodes are scanned in key order; within a node `gifs` win over `videos`,
/// which win over `images`. A history entry whose status reports an
/// execution error is a fetch error even if partial outputs exist.
pub fn first_output_file(
    history: &serde_json::Value,
    prompt_id: &str,
) -> Result<OutputFile, BackendError> {
    let entry = history
        .get(prompt_id)
        .ok_or_else(|| BackendError::Fetch(format!("No history entry for prompt {prompt_id}")))?;

    if entry.pointer("/status/status_str").and_then(|v| v.as_str()) == Some("error") {
        return Err(BackendError::Fetch(format!(
            "Prompt {prompt_id} finished with an execution error"
        )));
    }

    let outputs = entry
        .get("outputs")
        .and_then(|v| v.as_object())
        .ok_or_else(|| BackendError::Fetch(format!("Prompt {prompt_id} has no outputs")))?;

    for node_output in outputs.values() {
        for kind in OUTPUT_KINDS {
            let Some(files) = node_output.get(*kind).and_then(|v| v.as_array()) else {
                continue;
            };
            if let Some(first) = files.first() {
                return serde_json::from_value(first.clone()).map_err(|e| {
                    BackendError::Fetch(format!("Malformed output entry for {prompt_id}: {e}"))
                });
            }
        }
    }

    Err(BackendError::Fetch(format!(
        "Prompt {prompt_id} produced no output files"
    )))
}

/// [`GenerationBackend`] backed by a ComfyUI server.
#[derive(Clone)]
pub struct ComfyUIBackend {
    api: ComfyUIApi,
    /// Client id sent with every submission.
    client_id: String,
}

impl ComfyUIBackend {
    pub fn new(api: ComfyUIApi) -> Self {
        Self {
            api,
            client_id: uuid::Uuid::new_v4().to_string(),
        }
    }

    /// Convenience constructor from a base URL.
    pub fn from_url(api_url: impl Into<String>) -> Self {
        Self::new(ComfyUIApi::new(api_url))
    }

    pub fn api(&self) -> &ComfyUIApi {
        &self.api
    }

    /// Reachability check against `/system_stats`.
    pub async fn health_check(&self) -> Result<serde_json::Value, BackendError> {
        self.api.system_stats().await.map_err(|e| {
            BackendError::Connection(format!(
                "ComfyUI at {} is unreachable: {e}",
                self.api.api_url()
            ))
        })
    }
}

#[async_trait]
impl GenerationBackend for ComfyUIBackend {
    async fn submit(&self, workflow: &serde_json::Value) -> Result<String, BackendError> {
        let response = self
            .api
            .submit_workflow(workflow, &self.client_id)
            .await
            .map_err(|e| BackendError::Connection(e.to_string()))?;

        tracing::debug!(
            prompt_id = %response.prompt_id,
            queue_position = response.number,
            "Workflow accepted by ComfyUI",
        );
        Ok(response.prompt_id)
    }

    async fn poll(&self, job_id: &str) -> Result<PollStatus, BackendError> {
        let queue = self
            .api
            .get_queue()
            .await
            .map_err(|e| BackendError::Poll(e.to_string()))?;

        Ok(if queue.contains(job_id) {
            PollStatus::Running
        } else {
            PollStatus::Terminal
        })
    }

    async fn fetch(&self, job_id: &str) -> Result<Artifact, BackendError> {
        let history = self
            .api
            .get_history(job_id)
            .await
            .map_err(|e| BackendError::Fetch(e.to_string()))?;

        let file = first_output_file(&history, job_id)?;

        let data = self
            .api
            .view(&file.filename, &file.subfolder, &file.folder_type)
            .await
            .map_err(|e| BackendError::Fetch(format!("Download of {} failed: {e}", file.filename)))?;

        if data.is_empty() {
            return Err(BackendError::Fetch(format!(
                "Output file {} is empty",
                file.filename
            )));
        }

        Ok(Artifact {
            filename: file.filename,
            subfolder: file.subfolder,
            folder_type: file.folder_type,
            data,
        })
    }

    async fn cancel(&self, job_id: &str) -> Result<(), BackendError> {
        let queue = self
            .api
            .get_queue()
            .await
            .map_err(|e| BackendError::Cancel(e.to_string()))?;

        if queue.is_running(job_id) {
            self.api
                .interrupt(job_id)
                .await
                .map_err(|e| BackendError::Cancel(e.to_string()))?;
        } else if queue.is_pending(job_id) {
            self.api
                .cancel_execution(job_id)
                .await
                .map_err(|e| BackendError::Cancel(e.to_string()))?;
        }
        Ok(())
    }
}
