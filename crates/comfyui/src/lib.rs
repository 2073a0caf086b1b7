//! ComfyUI REST client library.
//!
//! Provides a thin HTTP wrapper over the ComfyUI API ([`api`]) and the
//! [`GenerationBackend`](backend::GenerationBackend) trait the scheduler
//! drives: submit a workflow, poll the queue, fetch the finished artifact.

pub mod api;
pub mod backend;

pub use backend::{Artifact, BackendError, ComfyUIBackend, GenerationBackend, PollStatus};
