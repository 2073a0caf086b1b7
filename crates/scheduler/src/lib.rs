//! Priority scheduler for generation requests.
//!
//! Sits between an asset pipeline and a slow generation backend:
//!
//! - [`Scheduler`]: explicitly constructed handle; enqueue, query,
//!   cancel, wait, shut down.
//! - [`tracker::LifecycleTracker`]: one map from request id to its
//!   current [`RequestState`](tracker::RequestState).
//! - [`dispatcher`]: single long-running loop that owns the pending
//!   queue and enforces the global concurrency ceiling.
//! - [`processor`]: per-request submit / poll / fetch task.
//! - [`batch`]: runs a named group of requests under its own
//!   concurrency limit and reports one aggregate outcome.
//! - [`events::SchedulerEvent`]: broadcast lifecycle notifications.

pub mod batch;
pub mod dispatcher;
pub mod error;
pub mod events;
pub mod processor;
pub mod scheduler;
pub mod tracker;

pub use batch::{BatchJob, BatchOutcome};
pub use error::{GenerationError, SchedulerError};
pub use events::SchedulerEvent;
pub use scheduler::Scheduler;
pub use tracker::{QueueStats, RequestState};
