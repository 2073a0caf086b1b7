//! `duat-worker` -- runs one batch of card animations against ComfyUI.
//!
//! Scheduler settings come from the environment (see
//! [`SchedulerConfig::from_env`]); the batch itself from
//! [`BatchSettings`](duat_worker::manifest::BatchSettings).

use std::sync::Arc;

use anyhow::Context;
use duat_comfyui::api::ComfyUIApi;
use duat_comfyui::{ComfyUIBackend, GenerationBackend};
use duat_core::config::SchedulerConfig;
use duat_scheduler::{BatchJob, Scheduler};
use duat_worker::cards::CardAnimationBuilder;
use duat_worker::manifest::{self, BatchSettings};

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "duat_worker=info,duat_scheduler=info,duat_comfyui=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    if let Err(e) = run().await {
        tracing::error!(error = format!("{e:#}"), "Worker failed");
        std::process::exit(1);
    }
}

async fn run() -> anyhow::Result<()> {
    let config = SchedulerConfig::from_env().context("loading scheduler config")?;
    let settings = BatchSettings::from_env().context("loading batch settings")?;

    tracing::info!(
        backend_url = %config.backend_url,
        max_concurrent = config.max_concurrent_requests,
        manifest = %settings.manifest.display(),
        batch = %settings.name,
        "Starting duat-worker",
    );

    let api = ComfyUIApi::with_timeout(config.backend_url.clone(), config.request_timeout)
        .context("building HTTP client")?;
    let backend = ComfyUIBackend::new(api);
    let stats = backend.health_check().await?;
    tracing::info!(system = %stats["system"], "ComfyUI reachable");

    let cards = manifest::load_cards(&settings.manifest)?;
    let requests = manifest::build_requests(&CardAnimationBuilder::default(), &cards)
        .context("building requests")?;

    let backend: Arc<dyn GenerationBackend> = Arc::new(backend);
    let scheduler = Scheduler::start(config, backend)?;

    let job = BatchJob::new(settings.name.clone(), requests).on_complete(|outcome| {
        for name in &outcome.failed {
            tracing::warn!(card = %name, "No animation generated");
        }
    });
    let outcome = scheduler.run_batch(job).await?;
    scheduler.shutdown().await;

    if let Some(report) = &settings.report {
        outcome.write_report(report)?;
        tracing::info!(path = %report.display(), "Batch report written");
    }

    tracing::info!(
        succeeded = outcome.succeeded.len(),
        failed = outcome.failed.len(),
        "Batch complete",
    );
    Ok(())
}
