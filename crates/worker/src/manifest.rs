//! Batch manifest loading.
//!
//! | Env Var          | Required | Default | Description                         |
//! |------------------|----------|---------|-------------------------------------|
//! | `BATCH_MANIFEST` | yes      | --      | JSON file with a list of cards      |
//! | `BATCH_NAME`     | no       | `cards` | Name used in logs and the report    |
//! | `BATCH_REPORT`   | no       | --      | Where to write the JSON outcome     |

use std::path::{Path, PathBuf};

use anyhow::Context;
use duat_core::error::CoreError;
use duat_core::request::{GenerationRequest, RequestBuilder};

use crate::cards::CardSpec;

pub const DEFAULT_BATCH_NAME: &str = "cards";

/// What the worker binary should run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchSettings {
    pub manifest: PathBuf,
    pub name: String,
    pub report: Option<PathBuf>,
}

impl BatchSettings {
    pub fn from_env() -> Result<Self, CoreError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, CoreError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let manifest = lookup("BATCH_MANIFEST")
            .filter(|v| !v.trim().is_empty())
            .ok_or_else(|| {
                CoreError::Validation("BATCH_MANIFEST environment variable is required".into())
            })?;

        Ok(Self {
            manifest: PathBuf::from(manifest),
            name: lookup("BATCH_NAME")
                .filter(|v| !v.trim().is_empty())
                .unwrap_or_else(|| DEFAULT_BATCH_NAME.to_string()),
            report: lookup("BATCH_REPORT")
                .filter(|v| !v.trim().is_empty())
                .map(PathBuf::from),
        })
    }
}

/// Read the list of cards from a manifest file.
pub fn load_cards(path: &Path) -> anyhow::Result<Vec<CardSpec>> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("reading manifest {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("parsing manifest {}", path.display()))
}

/// Build one request per card, failing on the first card that cannot be
/// turned into a request.
pub fn build_requests<B>(builder: &B, cards: &[CardSpec]) -> Result<Vec<GenerationRequest>, CoreError>
where
    B: RequestBuilder<Subject = CardSpec>,
{
    cards.iter().map(|card| builder.build(card)).collect()
}
