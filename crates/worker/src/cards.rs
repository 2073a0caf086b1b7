//! Card animation requests.
//!
//! [`CardAnimationBuilder`] maps a [`CardSpec`] to a [`GenerationRequest`]
//! carrying an AnimateDiff workflow for ComfyUI. Resolution, frame count
//! and motion strength depend on the card's rarity and type.

use duat_core::error::CoreError;
use duat_core::request::{GenerationParams, GenerationRequest, RequestBuilder, PRIORITY_NORMAL};
use serde::{Deserialize, Serialize};
use serde_json::json;

/// Frame rate of every generated animation.
pub const ANIMATION_FPS: u32 = 8;

/// Motion strength never exceeds this, whatever the type and rarity.
const MAX_CARD_MOTION: f32 = 2.0;

const NEGATIVE_PROMPT: &str = "blurry, low quality, distorted, bad anatomy, deformed, ugly, \
     bad proportions, extra limbs, watermark, signature, text, modern objects, \
     contemporary clothing";

const QUALITY_TERMS: &str = "masterpiece, best quality, highly detailed, cinematic lighting, \
     egyptian art style, mystical atmosphere";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CardType {
    Creature,
    Spell,
    Artifact,
}

impl CardType {
    pub fn label(self) -> &'static str {
        match self {
            Self::Creature => "creature",
            Self::Spell => "spell",
            Self::Artifact => "artifact",
        }
    }

    fn base_motion(self) -> f32 {
        match self {
            Self::Creature => 1.0,
            Self::Spell => 1.3,
            Self::Artifact => 0.8,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Rarity {
    Common,
    Rare,
    Epic,
    Legendary,
}

impl Rarity {
    /// Output `(width, height)`.
    fn dimensions(self) -> (u32, u32) {
        match self {
            Self::Legendary => (768, 1024),
            Self::Epic => (640, 896),
            Self::Common | Self::Rare => (512, 768),
        }
    }

    fn frames(self) -> u32 {
        match self {
            Self::Legendary => 24,
            _ => 16,
        }
    }

    fn motion_multiplier(self) -> f32 {
        match self {
            Self::Legendary => 1.2,
            Self::Epic => 1.1,
            Self::Common | Self::Rare => 1.0,
        }
    }

    fn prompt_terms(self) -> &'static str {
        match self {
            Self::Legendary => "divine cosmic energy, celestial radiance, godlike presence",
            Self::Epic => "powerful magical aura, glowing hieroglyphic symbols",
            Self::Common | Self::Rare => "mystical energy, ancient magic, desert atmosphere",
        }
    }
}

/// One card to animate, as listed in a batch manifest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CardSpec {
    pub name: String,
    pub card_type: CardType,
    pub rarity: Rarity,
    /// Patron deity, e.g. `"ra"`. Selects the prompt theme.
    pub deity: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_priority")]
    pub priority: i32,
    #[serde(default)]
    pub seed: Option<u64>,
}

fn default_priority() -> i32 {
    PRIORITY_NORMAL
}

/// Prompt atmosphere and motifs for a deity. Unknown deities use Ra's.
fn deity_theme(deity: &str) -> (&'static str, &'static str) {
    match deity.to_ascii_lowercase().as_str() {
        "anubis" => (
            "mystical underworld energy, purple shadows",
            "jackal head, scales of justice",
        ),
        "isis" => (
            "maternal divine energy, healing blue light",
            "wings spread, ankh symbol",
        ),
        "set" => ("chaotic storm energy, red lightning", "storm clouds, lightning"),
        "thoth" => (
            "intellectual divine light, floating knowledge",
            "ibis head, papyrus scrolls",
        ),
        "horus" => (
            "royal divine presence, sky blue radiance",
            "falcon wings, eye of horus",
        ),
        _ => ("divine solar radiance, golden light beams", "sun disk, solar rays"),
    }
}

/// Stable 64-bit FNV-1a hash, used to derive a per-card seed.
fn name_seed(name: &str) -> u64 {
    name.bytes().fold(0xcbf2_9ce4_8422_2325, |hash, byte| {
        (hash ^ u64::from(byte)).wrapping_mul(0x0100_0000_01b3)
    })
}

/// Builds AnimateDiff requests for cards.
#[derive(Debug, Clone)]
pub struct CardAnimationBuilder {
    pub checkpoint: String,
    pub motion_module: String,
    pub steps: u32,
    pub cfg: f32,
}

impl Default for CardAnimationBuilder {
    fn default() -> Self {
        Self {
            checkpoint: "revAnimated_v122.safetensors".to_string(),
            motion_module: "mm_sd_v15_v2.ckpt".to_string(),
            steps: 20,
            cfg: 8.0,
        }
    }
}

impl CardAnimationBuilder {
    pub fn params_for(card: &CardSpec) -> GenerationParams {
        let (width, height) = card.rarity.dimensions();
        let motion = (card.card_type.base_motion() * card.rarity.motion_multiplier())
            .min(MAX_CARD_MOTION);
        GenerationParams {
            width,
            height,
            frames: card.rarity.frames(),
            frame_rate: ANIMATION_FPS,
            motion_strength: motion,
        }
    }

    pub fn prompt_for(card: &CardSpec) -> String {
        let (atmosphere, motifs) = deity_theme(&card.deity);
        let mut parts = vec![format!("ancient egyptian {}", card.card_type.label())];
        if !card.description.trim().is_empty() {
            parts.push(card.description.trim().to_string());
        }
        parts.push(format!("associated with {}", card.deity.to_ascii_lowercase()));
        parts.extend(
            [atmosphere, card.rarity.prompt_terms(), motifs, QUALITY_TERMS].map(String::from),
        );
        parts.join(", ")
    }

    fn workflow(&self, card: &CardSpec, params: &GenerationParams, seed: u64) -> serde_json::Value {
        json!({
            "1": {
                "class_type": "CheckpointLoaderSimple",
                "inputs": { "ckpt_name": self.checkpoint }
            },
            "2": {
                "class_type": "CLIPTextEncode",
                "inputs": { "text": Self::prompt_for(card), "clip": ["1", 1] }
            },
            "3": {
                "class_type": "CLIPTextEncode",
                "inputs": { "text": NEGATIVE_PROMPT, "clip": ["1", 1] }
            },
            "4": {
                "class_type": "AnimateDiffLoader",
                "inputs": { "model_name": self.motion_module, "beta_schedule": "sqrt_linear" }
            },
            "5": {
                "class_type": "AnimateDiffSampler",
                "inputs": {
                    "model": ["1", 0],
                    "motion_module": ["4", 0],
                    "positive": ["2", 0],
                    "negative": ["3", 0],
                    "seed": seed,
                    "steps": self.steps,
                    "cfg": self.cfg,
                    "sampler_name": "euler_ancestral",
                    "scheduler": "normal",
                    "width": params.width,
                    "height": params.height,
                    "length": params.frames,
                    "motion_scale": params.motion_strength
                }
            },
            "6": {
                "class_type": "VHS_VideoCombine",
                "inputs": {
                    "images": ["5", 0],
                    "frame_rate": params.frame_rate,
                    "loop_count": 0,
                    "filename_prefix": format!("duat_card_{}", card.name),
                    "format": "image/gif",
                    "pingpong": false,
                    "save_output": true
                }
            }
        })
    }
}

impl RequestBuilder for CardAnimationBuilder {
    type Subject = CardSpec;

    fn build(&self, card: &CardSpec) -> Result<GenerationRequest, CoreError> {
        if card.deity.trim().is_empty() {
            return Err(CoreError::Validation(format!(
                "Card '{}' has no deity",
                card.name
            )));
        }

        let params = Self::params_for(card);
        let seed = card.seed.unwrap_or_else(|| name_seed(&card.name));
        let workflow = self.workflow(card, &params, seed);

        Ok(
            GenerationRequest::new(card.name.clone(), card.card_type.label(), workflow)
                .with_params(params)
                .with_seed(seed)
                .with_priority(card.priority),
        )
    }
}
