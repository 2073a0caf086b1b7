//! REST API client for the ComfyUI HTTP endpoints.
//!
//! Wraps the ComfyUI HTTP API (workflow submission, queue inspection,
//! history retrieval, file download, cancellation) using [`reqwest`].

use serde::Deserialize;

/// HTTP client for a single ComfyUI instance.
#[derive(Clone)]
pub struct ComfyUIApi {
    client: reqwest::Client,
    api_url: String,
}

/// Response returned by the ComfyUI `/prompt` endpoint after
/// successfully queuing a workflow.
#[derive(Debug, Deserialize)]
pub struct SubmitResponse {
    /// Server-assigned identifier for the queued prompt.
    pub prompt_id: String,
    /// Position in the execution queue.
    #[serde(default)]
    pub number: i64,
}

/// Snapshot of the ComfyUI execution queue from `GET /queue`.
///
/// Each entry is a positional array `[number, prompt_id, prompt, extra, outputs]`.
#[derive(Debug, Default, Deserialize)]
pub struct QueueState {
    #[serde(default)]
    pub queue_running: Vec<Vec<serde_json::Value>>,
    #[serde(default)]
    pub queue_pending: Vec<Vec<serde_json::Value>>,
}

impl QueueState {
    /// Whether `prompt_id` is currently executing.
    pub fn is_running(&self, prompt_id: &str) -> bool {
        Self::contains_in(&self.queue_running, prompt_id)
    }

    /// Whether `prompt_id` is waiting in the queue.
    pub fn is_pending(&self, prompt_id: &str) -> bool {
        Self::contains_in(&self.queue_pending, prompt_id)
    }

    /// Whether `prompt_id` appears anywhere in the queue. Absence means
    /// the backend has finished with it (successfully or not).
    pub fn contains(&self, prompt_id: &str) -> bool {
        self.is_running(prompt_id) || self.is_pending(prompt_id)
    }

    fn contains_in(items: &[Vec<serde_json::Value>], prompt_id: &str) -> bool {
        items
            .iter()
            .any(|item| item.get(1).and_then(|v| v.as_str()) == Some(prompt_id))
    }
}

/// Errors from the ComfyUI REST API layer.
#[derive(Debug, thiserror::Error)]
pub enum ComfyUIApiError {
    /// The HTTP request itself failed (network, DNS, TLS, etc.).
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),

    /// ComfyUI returned a non-2xx status code.
    #[error("ComfyUI API error ({status}): {body}")]
    ApiError {
        /// HTTP status code.
        status: u16,
        /// Raw response body for debugging.
        body: String,
    },
}

impl ComfyUIApi {
    /// Create a new API client for a ComfyUI instance.
    ///
    /// * `api_url` - Base HTTP URL, e.g. `http://host:8188`.
    pub fn new(api_url: impl Into<String>) -> Self {
        Self::with_client(reqwest::Client::new(), api_url)
    }

    /// Create an API client whose every HTTP call gives up after `timeout`.
    pub fn with_timeout(
        api_url: impl Into<String>,
        timeout: std::time::Duration,
    ) -> Result<Self, ComfyUIApiError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self::with_client(client, api_url))
    }

    /// Create an API client reusing an existing [`reqwest::Client`].
    pub fn with_client(client: reqwest::Client, api_url: impl Into<String>) -> Self {
        let api_url = api_url.into().trim_end_matches('/').to_string();
        Self { client, api_url }
    }

    pub fn api_url(&self) -> &str {
        &self.api_url
    }

    /// Submit a workflow for execution.
    ///
    /// Sends a `POST /prompt` request with the given workflow JSON and
    /// client ID.  Returns the server-assigned `prompt_id` and queue
    /// position.
    pub async fn submit_workflow(
        &self,
        workflow: &serde_json::Value,
        client_id: &str,
    ) -> Result<SubmitResponse, ComfyUIApiError> {
        let body = serde_json::json!({
            "prompt": workflow,
            "client_id": client_id,
        });

        let response = self
            .client
            .post(format!("{}/prompt", self.api_url))
            .json(&body)
            .send()
            .await?;

        Self::parse_response(response).await
    }

    /// Fetch the running and pending queue via `GET /queue`.
    pub async fn get_queue(&self) -> Result<QueueState, ComfyUIApiError> {
        let response = self
            .client
            .get(format!("{}/queue", self.api_url))
            .send()
            .await?;

        Self::parse_response(response).await
    }

    /// Retrieve execution history for a specific prompt.
    ///
    /// Sends a `GET /history/{prompt_id}` request.  The returned JSON
    /// is keyed by prompt id and contains per-node outputs and status.
    pub async fn get_history(&self, prompt_id: &str) -> Result<serde_json::Value, ComfyUIApiError> {
        let response = self
            .client
            .get(format!("{}/history/{}", self.api_url, prompt_id))
            .send()
            .await?;

        Self::parse_response(response).await
    }

    /// Download an output file via `GET /view`.
    pub async fn view(
        &self,
        filename: &str,
        subfolder: &str,
        folder_type: &str,
    ) -> Result<Vec<u8>, ComfyUIApiError> {
        let response = self
            .client
            .get(format!("{}/view", self.api_url))
            .query(&[
                ("filename", filename),
                ("subfolder", subfolder),
                ("type", folder_type),
            ])
            .send()
            .await?;

        let response = Self::ensure_success(response).await?;
        Ok(response.bytes().await?.to_vec())
    }

    /// Cancel a queued execution.
    ///
    /// Sends a `POST /queue` request asking ComfyUI to delete the
    /// specified prompt from the queue.
    pub async fn cancel_execution(&self, prompt_id: &str) -> Result<(), ComfyUIApiError> {
        let body = serde_json::json!({
            "delete": [prompt_id],
        });

        let response = self
            .client
            .post(format!("{}/queue", self.api_url))
            .json(&body)
            .send()
            .await?;

        Self::check_status(response).await
    }

    /// Interrupt the currently running execution immediately.
    ///
    /// Sends a `POST /interrupt` request carrying `prompt_id`. Servers
    /// that understand the field only stop that prompt; older ones ignore
    /// the body and interrupt whatever is executing right now.
    pub async fn interrupt(&self, prompt_id: &str) -> Result<(), ComfyUIApiError> {
        let response = self
            .client
            .post(format!("{}/interrupt", self.api_url))
            .json(&serde_json::json!({ "prompt_id": prompt_id }))
            .send()
            .await?;

        Self::check_status(response).await
    }

    /// Fetch server statistics via `GET /system_stats`. Used as a
    /// reachability check before scheduling work.
    pub async fn system_stats(&self) -> Result<serde_json::Value, ComfyUIApiError> {
        let response = self
            .client
            .get(format!("{}/system_stats", self.api_url))
            .send()
            .await?;

        Self::parse_response(response).await
    }

    // ---- private helpers ----

    /// Ensure the response has a success status code. Returns the
    /// response unchanged on success, or a [`ComfyUIApiError::ApiError`]
    /// containing the status and body text on failure.
    async fn ensure_success(
        response: reqwest::Response,
    ) -> Result<reqwest::Response, ComfyUIApiError> {
        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "<unreadable body>".to_string());
            return Err(ComfyUIApiError::ApiError {
                status: status.as_u16(),
                body,
            });
        }
        Ok(response)
    }

    /// Parse a successful JSON response body into the expected type.
    async fn parse_response<T: serde::de::DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<T, ComfyUIApiError> {
        let response = Self::ensure_success(response).await?;
        Ok(response.json::<T>().await?)
    }

    /// Assert the response has a success status code, discarding the body.
    async fn check_status(response: reqwest::Response) -> Result<(), ComfyUIApiError> {
        Self::ensure_success(response).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn queue(running: &[&str], pending: &[&str]) -> QueueState {
        let raw = json!({
            "queue_running": running.iter().enumerate().map(|(i, id)| json!([i, id, {}, {}, []])).collect::<Vec<_>>(),
            "queue_pending": pending.iter().enumerate().map(|(i, id)| json!([i, id, {}, {}, []])).collect::<Vec<_>>(),
        });
        serde_json::from_value(raw).unwrap()
    }

    #[test]
    fn queue_finds_running_prompt() {
        let state = queue(&["abc"], &[]);
        assert!(state.is_running("abc"));
        assert!(state.contains("abc"));
        assert!(!state.is_pending("abc"));
    }

    #[test]
    fn queue_finds_pending_prompt() {
        let state = queue(&["other"], &["abc"]);
        assert!(state.is_pending("abc"));
        assert!(state.contains("abc"));
    }

    #[test]
    fn absent_prompt_is_not_contained() {
        let state = queue(&["x"], &["y"]);
        assert!(!state.contains("abc"));
    }

    #[test]
    fn missing_queue_fields_default_to_empty() {
        let state: QueueState = serde_json::from_value(json!({})).unwrap();
        assert!(!state.contains("abc"));
    }

    #[test]
    fn trailing_slash_is_trimmed() {
        let api = ComfyUIApi::new("http://host:8188/");
        assert_eq!(api.api_url(), "http://host:8188");
    }
}
