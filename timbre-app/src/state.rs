//! Shared host state handed to every request handler.

use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};

use chrono::{DateTime, Utc};
use serde::Serialize;
use timbre_core::{engine::DiagnosticsSnapshot, ConversionEngine};

use crate::settings::AppSettings;

/// Cloned into each handler by axum's `State` extractor.
#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<ConversionEngine>,
    /// Settings the process started with.
    pub settings: Arc<AppSettings>,
    pub intake: Arc<IntakeCounters>,
    pub started_at: DateTime<Utc>,
}

impl AppState {
    pub fn new(engine: Arc<ConversionEngine>, settings: AppSettings) -> Self {
        Self {
            engine,
            settings: Arc::new(settings),
            intake: Arc::new(IntakeCounters::default()),
            started_at: Utc::now(),
        }
    }

    pub fn diagnostics_snapshot(&self) -> AppDiagnostics {
        AppDiagnostics {
            requests_accepted: self.intake.accepted.load(Ordering::Relaxed),
            requests_rejected: self.intake.rejected.load(Ordering::Relaxed),
            uptime_secs: (Utc::now() - self.started_at).num_seconds().max(0) as u64,
            pipeline: self.engine.diagnostics_snapshot(),
        }
    }
}

/// Intake request counters.
#[derive(Debug, Default)]
pub struct IntakeCounters {
    pub accepted: AtomicUsize,
    pub rejected: AtomicUsize,
}

impl IntakeCounters {
    pub fn accept(&self) {
        self.accepted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn reject(&self) {
        self.rejected.fetch_add(1, Ordering::Relaxed);
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AppDiagnostics {
    pub requests_accepted: usize,
    pub requests_rejected: usize,
    pub uptime_secs: u64,
    pub pipeline: DiagnosticsSnapshot,
}
