//! Persistent host settings (JSON file in the app data directory), with
//! `TIMBRE_*` environment overrides applied on top.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use timbre_core::EngineConfig;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[serde(default)]
pub struct AppSettings {
    pub bind_addr: String,
    /// Conversion endpoint. `None` runs the local stub backend.
    pub inference_url: Option<String>,
    pub separation_url: Option<String>,
    pub inference_api_key: Option<String>,
    pub inference_timeout_secs: u64,
    pub blob_root: PathBuf,
    /// Prefix for public blob URIs. `None` hands out `file://` URIs.
    pub public_base_url: Option<String>,
    pub db_path: PathBuf,
    pub pool_capacity: usize,
    /// Per-job deadline; 0 disables it.
    pub job_timeout_secs: u64,
    pub sweep_pitch_min: i32,
    pub sweep_pitch_max: i32,
    pub auto_score_sweeps: bool,
}

impl Default for AppSettings {
    fn default() -> Self {
        let data = data_dir();
        Self {
            bind_addr: "127.0.0.1:8080".into(),
            inference_url: None,
            separation_url: None,
            inference_api_key: None,
            inference_timeout_secs: 600,
            blob_root: data.join("blobs"),
            public_base_url: None,
            db_path: data.join("timbre.db"),
            pool_capacity: 50,
            job_timeout_secs: 0,
            sweep_pitch_min: -12,
            sweep_pitch_max: 12,
            auto_score_sweeps: true,
        }
    }
}

impl AppSettings {
    pub fn normalize(&mut self) {
        let defaults = AppSettings::default();
        self.bind_addr = self.bind_addr.trim().to_string();
        if self.bind_addr.is_empty() {
            self.bind_addr = defaults.bind_addr;
        }
        self.inference_url = non_empty(self.inference_url.take());
        self.separation_url = non_empty(self.separation_url.take());
        self.inference_api_key = non_empty(self.inference_api_key.take());
        self.public_base_url =
            non_empty(self.public_base_url.take()).map(|u| u.trim_end_matches('/').to_string());
        if self.blob_root.as_os_str().is_empty() {
            self.blob_root = defaults.blob_root;
        }
        if self.db_path.as_os_str().is_empty() {
            self.db_path = defaults.db_path;
        }
        self.inference_timeout_secs = self.inference_timeout_secs.clamp(1, 3600);
        self.pool_capacity = self.pool_capacity.clamp(1, 512);
        self.job_timeout_secs = self.job_timeout_secs.min(86_400);
        self.sweep_pitch_min = self.sweep_pitch_min.clamp(-48, 48);
        self.sweep_pitch_max = self.sweep_pitch_max.clamp(-48, 48);
        if self.sweep_pitch_min > self.sweep_pitch_max {
            std::mem::swap(&mut self.sweep_pitch_min, &mut self.sweep_pitch_max);
        }
    }

    /// Override fields from `TIMBRE_*` variables. Unparseable numbers are
    /// ignored with a warning.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(v) = lookup("TIMBRE_BIND_ADDR") {
            self.bind_addr = v;
        }
        if let Some(v) = lookup("TIMBRE_INFERENCE_URL") {
            self.inference_url = Some(v);
        }
        if let Some(v) = lookup("TIMBRE_SEPARATION_URL") {
            self.separation_url = Some(v);
        }
        if let Some(v) = lookup("TIMBRE_INFERENCE_API_KEY") {
            self.inference_api_key = Some(v);
        }
        if let Some(v) = lookup("TIMBRE_BLOB_ROOT") {
            self.blob_root = PathBuf::from(v);
        }
        if let Some(v) = lookup("TIMBRE_PUBLIC_BASE_URL") {
            self.public_base_url = Some(v);
        }
        if let Some(v) = lookup("TIMBRE_DB_PATH") {
            self.db_path = PathBuf::from(v);
        }
        if let Some(v) = parsed(&lookup, "TIMBRE_POOL_CAPACITY") {
            self.pool_capacity = v;
        }
        if let Some(v) = parsed(&lookup, "TIMBRE_JOB_TIMEOUT_SECS") {
            self.job_timeout_secs = v;
        }
        self.normalize();
    }

    pub fn inference_timeout(&self) -> Duration {
        Duration::from_secs(self.inference_timeout_secs)
    }

    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            pool_capacity: self.pool_capacity,
            sweep_pitch_range: self.sweep_pitch_min..=self.sweep_pitch_max,
            job_timeout: (self.job_timeout_secs > 0)
                .then(|| Duration::from_secs(self.job_timeout_secs)),
            auto_score_sweeps: self.auto_score_sweeps,
            scratch_dir: Some(self.blob_root.join(".scratch")),
            ..EngineConfig::default()
        }
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

fn parsed<T: std::str::FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    let raw = lookup(key)?;
    match raw.trim().parse() {
        Ok(v) => Some(v),
        Err(_) => {
            tracing::warn!(key, value = %raw, "ignoring unparseable override");
            None
        }
    }
}

fn data_dir() -> PathBuf {
    #[cfg(target_os = "windows")]
    {
        std::env::var_os("APPDATA")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("."))
            .join("Timbre")
    }
    #[cfg(not(target_os = "windows"))]
    {
        std::env::var_os("XDG_DATA_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|| {
                std::env::var_os("HOME")
                    .map(PathBuf::from)
                    .unwrap_or_else(|| PathBuf::from("/tmp"))
                    .join(".local")
                    .join("share")
            })
            .join("timbre")
    }
}

/// `TIMBRE_SETTINGS_PATH`, else `settings.json` in the data directory.
pub fn default_settings_path() -> PathBuf {
    std::env::var_os("TIMBRE_SETTINGS_PATH")
        .map(PathBuf::from)
        .unwrap_or_else(|| data_dir().join("settings.json"))
}

/// Read settings from `path`. A missing or malformed file yields defaults.
pub fn load_settings(path: &Path) -> AppSettings {
    let mut settings = fs::read_to_string(path)
        .ok()
        .and_then(|raw| serde_json::from_str::<AppSettings>(&raw).ok())
        .unwrap_or_default();
    settings.normalize();
    settings
}

pub fn save_settings(path: &Path, settings: &AppSettings) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let json = serde_json::to_string_pretty(settings).map_err(std::io::Error::other)?;
    fs::write(path, json)
}
