//! Generation request shape, priority constants and validation.

use serde::{Deserialize, Serialize};

use crate::error::CoreError;

// ---------------------------------------------------------------------------
// Priority constants
// ---------------------------------------------------------------------------

/// Background work. Dispatched after everything else.
pub const PRIORITY_LOW: i32 = 1;

/// Default priority.
pub const PRIORITY_NORMAL: i32 = 2;

/// Dispatched ahead of normal work.
pub const PRIORITY_HIGH: i32 = 3;

/// Dispatched before all others.
pub const PRIORITY_URGENT: i32 = 4;

// ---------------------------------------------------------------------------
// Limits
// ---------------------------------------------------------------------------

const MAX_NAME_LEN: usize = 128;
const MAX_DIMENSION: u32 = 4096;
const MAX_FRAMES: u32 = 256;
const MAX_MOTION_STRENGTH: f32 = 4.0;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// Numeric rendering parameters attached to a request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationParams {
    pub width: u32,
    pub height: u32,
    /// Number of frames in the output animation.
    pub frames: u32,
    /// Playback rate of the output animation, frames per second.
    pub frame_rate: u32,
    /// Style knob controlling how much the animation moves.
    pub motion_strength: f32,
}

impl Default for GenerationParams {
    fn default() -> Self {
        Self {
            width: 512,
            height: 768,
            frames: 16,
            frame_rate: 8,
            motion_strength: 1.0,
        }
    }
}

/// One unit of work for the generation backend.
///
/// Immutable once enqueued. The scheduler never inspects `workflow`; it
/// is handed to the backend verbatim.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationRequest {
    /// Domain name of the thing being rendered, e.g. `"Ra, Solar Deity"`.
    /// Also used to derive the artifact filename.
    pub name: String,
    /// Style or category tag, e.g. `"creature"`.
    pub category: String,
    /// Opaque workflow descriptor for the backend.
    pub workflow: serde_json::Value,
    pub params: GenerationParams,
    /// Deterministic seed; `None` lets the backend pick.
    pub seed: Option<u64>,
    /// Higher values are dispatched sooner.
    pub priority: i32,
    /// Caller-supplied grouping label.
    pub batch_id: Option<String>,
}

impl GenerationRequest {
    /// Create a request with default parameters and normal priority.
    pub fn new(
        name: impl Into<String>,
        category: impl Into<String>,
        workflow: serde_json::Value,
    ) -> Self {
        Self {
            name: name.into(),
            category: category.into(),
            workflow,
            params: GenerationParams::default(),
            seed: None,
            priority: PRIORITY_NORMAL,
            batch_id: None,
        }
    }

    pub fn with_params(mut self, params: GenerationParams) -> Self {
        self.params = params;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_batch_id(mut self, batch_id: impl Into<String>) -> Self {
        self.batch_id = Some(batch_id.into());
        self
    }
}

/// Supplies generation requests for domain objects.
///
/// Implemented by the consuming application (prompt templates, resolution
/// tables and the like live there, not in the scheduler).
pub trait RequestBuilder {
    type Subject;

    fn build(&self, subject: &Self::Subject) -> Result<GenerationRequest, CoreError>;
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// Validate the shape of a request before it is allowed into the queue.
///
/// Rules:
/// - `name` must be non-empty and at most `MAX_NAME_LEN` characters.
/// - `category` must be non-empty.
/// - `workflow` must be a non-empty JSON object.
/// - Dimensions in `1..=MAX_DIMENSION`, frames in `1..=MAX_FRAMES`,
///   frame rate non-zero.
/// - `motion_strength` finite and within `0.0..=MAX_MOTION_STRENGTH`.
pub fn validate_request(request: &GenerationRequest) -> Result<(), CoreError> {
    if request.name.trim().is_empty() {
        return Err(CoreError::Validation(
            "Request name must not be empty".to_string(),
        ));
    }
    if request.name.chars().count() > MAX_NAME_LEN {
        return Err(CoreError::Validation(format!(
            "Request name must not exceed {MAX_NAME_LEN} characters"
        )));
    }
    if request.category.trim().is_empty() {
        return Err(CoreError::Validation(
            "Request category must not be empty".to_string(),
        ));
    }
    match request.workflow.as_object() {
        Some(nodes) if !nodes.is_empty() => {}
        Some(_) => {
            return Err(CoreError::Validation(
                "Workflow descriptor must not be empty".to_string(),
            ))
        }
        None => {
            return Err(CoreError::Validation(
                "Workflow descriptor must be a JSON object".to_string(),
            ))
        }
    }
    validate_params(&request.params)
}

fn validate_params(params: &GenerationParams) -> Result<(), CoreError> {
    for (label, value) in [("width", params.width), ("height", params.height)] {
        if value == 0 || value > MAX_DIMENSION {
            return Err(CoreError::Validation(format!(
                "{label} must be between 1 and {MAX_DIMENSION}, got {value}"
            )));
        }
    }
    if params.frames == 0 || params.frames > MAX_FRAMES {
        return Err(CoreError::Validation(format!(
            "frames must be between 1 and {MAX_FRAMES}, got {}",
            params.frames
        )));
    }
    if params.frame_rate == 0 {
        return Err(CoreError::Validation(
            "frame_rate must be greater than zero".to_string(),
        ));
    }
    if !params.motion_strength.is_finite()
        || !(0.0..=MAX_MOTION_STRENGTH).contains(&params.motion_strength)
    {
        return Err(CoreError::Validation(format!(
            "motion_strength must be between 0 and {MAX_MOTION_STRENGTH}, got {}",
            params.motion_strength
        )));
    }
    Ok(())
}
