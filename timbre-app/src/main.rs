//! Timbre job intake service entry point.
//!
//! Wires the persistent stores and the inference client into a
//! `ConversionEngine`, then serves the HTTP intake routes until Ctrl+C.

mod commands;
mod settings;
mod state;
mod storage;

use std::sync::Arc;

use anyhow::Context;
use settings::{default_settings_path, load_settings};
use state::AppState;
use storage::SqliteDocumentStore;
use timbre_core::{
    ConversionEngine, FsBlobStore, HttpInferenceClient, InferenceHandle, JobStatus, Services,
    StubBackend,
};
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── Tracing ───────────────────────────────────────────────────────────
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("timbre=info,timbre_core=info")),
        )
        .init();

    // ── Settings ──────────────────────────────────────────────────────────
    let settings_path = default_settings_path();
    let mut settings = load_settings(&settings_path);
    settings.apply_env_overrides();
    info!(path = %settings_path.display(), bind = %settings.bind_addr, "Timbre starting");

    // ── Services ──────────────────────────────────────────────────────────
    let blobs = Arc::new(
        FsBlobStore::new(&settings.blob_root, settings.public_base_url.clone())
            .with_context(|| format!("blob root {}", settings.blob_root.display()))?,
    );
    let documents = Arc::new(
        SqliteDocumentStore::new(&settings.db_path)
            .with_context(|| format!("document store {}", settings.db_path.display()))?,
    );
    info!(db = %documents.path().display(), blobs = %blobs.root().display(), "stores ready");

    let inference = match &settings.inference_url {
        Some(url) => {
            let mut client = HttpInferenceClient::new(url).with_timeout(settings.inference_timeout());
            if let Some(sep) = &settings.separation_url {
                client = client.with_separation_url(sep);
            }
            if let Some(key) = &settings.inference_api_key {
                client = client.with_api_key(key);
            }
            info!(url = %url, "using remote inference");
            InferenceHandle::new(client)
        }
        None => {
            warn!("no inference URL configured; conversions echo their input");
            InferenceHandle::new(StubBackend::new(blobs.clone()))
        }
    };

    let engine = Arc::new(ConversionEngine::new(
        settings.engine_config(),
        Services {
            blobs,
            inference,
            documents,
        },
    ));
    engine.start().context("starting conversion engine")?;
    spawn_event_logger(&engine);

    // ── HTTP ──────────────────────────────────────────────────────────────
    let bind_addr = settings.bind_addr.clone();
    let app = commands::router(AppState::new(Arc::clone(&engine), settings));
    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("binding {bind_addr}"))?;
    info!(addr = %bind_addr, "intake listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!("ctrl-c handler failed: {e}");
            }
        })
        .await
        .context("http server")?;

    engine.stop().context("stopping conversion engine")?;
    info!("Timbre stopped");
    Ok(())
}

/// Log terminal job events so failures are visible without polling.
fn spawn_event_logger(engine: &ConversionEngine) {
    let mut events = engine.subscribe();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(ev) if ev.status == JobStatus::Failed => {
                    warn!(job_id = %ev.job_id, model_id = %ev.model_id, detail = ?ev.detail, "job failed");
                }
                Ok(ev) if ev.status == JobStatus::Done => {
                    info!(job_id = %ev.job_id, model_id = %ev.model_id, output = ?ev.detail, "job done");
                }
                Ok(_) => {}
                Err(RecvError::Lagged(n)) => warn!(skipped = n, "event logger lagged"),
                Err(RecvError::Closed) => break,
            }
        }
    });
}
