#![allow(dead_code)]

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use duat_comfyui::{Artifact, BackendError, GenerationBackend, PollStatus};
use duat_core::config::SchedulerConfig;
use duat_core::request::GenerationRequest;
use duat_scheduler::{Scheduler, SchedulerEvent};
use serde_json::json;
use tokio::sync::broadcast;

/// Requests whose name contains this fail at submit.
pub const FAIL_SUBMIT: &str = "fail-submit";
/// Requests whose name contains this never leave the backend queue.
pub const HANG: &str = "hang";
/// Requests whose name contains this poll terminal but have no artifact.
pub const FAIL_FETCH: &str = "fail-fetch";
/// Requests whose name contains this never get an answer to submit.
pub const STALL_SUBMIT: &str = "stall-submit";
/// Requests whose name contains this never get an answer to fetch.
pub const STALL_FETCH: &str = "stall-fetch";

/// Build a test `SchedulerConfig` writing into `output_dir`.
///
/// Polls every 10ms and times out after 5s so tests finish quickly.
pub fn test_config(output_dir: &Path, max_concurrent: usize) -> SchedulerConfig {
    SchedulerConfig {
        backend_url: "http://mock.invalid".to_string(),
        max_concurrent_requests: max_concurrent,
        request_timeout: Duration::from_secs(5),
        poll_interval: Duration::from_millis(10),
        batch_concurrency_limit: 2,
        output_dir: output_dir.to_path_buf(),
        event_channel_capacity: 1024,
    }
}

/// A request whose workflow carries its name, which is how the mock
/// backend decides how to behave.
pub fn request(name: &str) -> GenerationRequest {
    GenerationRequest::new(name, "creature", json!({ "name": name, "1": {} }))
}

pub fn start(config: SchedulerConfig, backend: &Arc<MockBackend>) -> Scheduler {
    let backend: Arc<dyn GenerationBackend> = backend.clone();
    Scheduler::start(config, backend).expect("test config should be valid")
}

/// Everything currently buffered on an event receiver.
pub fn drain_events(rx: &mut broadcast::Receiver<SchedulerEvent>) -> Vec<SchedulerEvent> {
    std::iter::from_fn(|| rx.try_recv().ok()).collect()
}

/// Names of dispatched requests, in dispatch order.
pub fn dispatched_names(events: &[SchedulerEvent]) -> Vec<String> {
    events
        .iter()
        .filter_map(|event| match event {
            SchedulerEvent::Dispatched { name, .. } => Some(name.clone()),
            _ => None,
        })
        .collect()
}

// ---------------------------------------------------------------------------
// MockBackend
// ---------------------------------------------------------------------------

struct MockJob {
    name: String,
    polls: usize,
}

#[derive(Default)]
struct MockState {
    next_job: u64,
    jobs: HashMap<String, MockJob>,
    submitted: Vec<String>,
    cancelled: Vec<String>,
    in_flight: usize,
    max_in_flight: usize,
}

/// In-memory backend. Jobs turn terminal after `polls_until_done` polls
/// unless their name says otherwise (see the constants above).
pub struct MockBackend {
    polls_until_done: usize,
    state: Mutex<MockState>,
}

impl MockBackend {
    pub fn new(polls_until_done: usize) -> Arc<Self> {
        Arc::new(Self {
            polls_until_done,
            state: Mutex::new(MockState::default()),
        })
    }

    /// Request names in the order the backend accepted them.
    pub fn submitted(&self) -> Vec<String> {
        self.state.lock().unwrap().submitted.clone()
    }

    /// Request names of jobs the scheduler asked to cancel.
    pub fn cancelled(&self) -> Vec<String> {
        self.state.lock().unwrap().cancelled.clone()
    }

    /// Highest number of jobs submitted but not yet fetched or cancelled.
    pub fn max_in_flight(&self) -> usize {
        self.state.lock().unwrap().max_in_flight
    }

    fn release(state: &mut MockState) {
        state.in_flight = state.in_flight.saturating_sub(1);
    }
}

#[async_trait]
impl GenerationBackend for MockBackend {
    async fn submit(&self, workflow: &serde_json::Value) -> Result<String, BackendError> {
        tokio::task::yield_now().await;
        let name = workflow["name"].as_str().unwrap_or_default().to_string();
        if name.contains(FAIL_SUBMIT) {
            return Err(BackendError::Connection("connection refused".into()));
        }
        if name.contains(STALL_SUBMIT) {
            std::future::pending::<()>().await;
        }

        let mut state = self.state.lock().unwrap();
        state.next_job += 1;
        let job_id = format!("job-{}", state.next_job);
        state.jobs.insert(
            job_id.clone(),
            MockJob {
                name: name.clone(),
                polls: 0,
            },
        );
        state.submitted.push(name);
        state.in_flight += 1;
        state.max_in_flight = state.max_in_flight.max(state.in_flight);
        Ok(job_id)
    }

    async fn poll(&self, job_id: &str) -> Result<PollStatus, BackendError> {
        let mut state = self.state.lock().unwrap();
        let job = state
            .jobs
            .get_mut(job_id)
            .ok_or_else(|| BackendError::Poll(format!("unknown job {job_id}")))?;
        if job.name.contains(HANG) {
            return Ok(PollStatus::Running);
        }
        job.polls += 1;
        if job.polls >= self.polls_until_done {
            Ok(PollStatus::Terminal)
        } else {
            Ok(PollStatus::Running)
        }
    }

    async fn fetch(&self, job_id: &str) -> Result<Artifact, BackendError> {
        let name = {
            let mut state = self.state.lock().unwrap();
            Self::release(&mut state);
            state
                .jobs
                .get(job_id)
                .map(|job| job.name.clone())
                .ok_or_else(|| BackendError::Fetch(format!("unknown job {job_id}")))?
        };
        if name.contains(STALL_FETCH) {
            std::future::pending::<()>().await;
        }
        if name.contains(FAIL_FETCH) {
            return Err(BackendError::Fetch(format!("no outputs for {job_id}")));
        }
        Ok(Artifact {
            filename: format!("{job_id}_00001_.gif"),
            subfolder: String::new(),
            folder_type: "output".to_string(),
            data: b"GIF89a".to_vec(),
        })
    }

    async fn cancel(&self, job_id: &str) -> Result<(), BackendError> {
        let mut state = self.state.lock().unwrap();
        Self::release(&mut state);
        let name = state
            .jobs
            .get(job_id)
            .map(|job| job.name.clone())
            .unwrap_or_default();
        state.cancelled.push(name);
        Ok(())
    }
}
