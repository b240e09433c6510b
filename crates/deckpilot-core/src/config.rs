use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Client configuration (where local state lives)
#[derive(Debug, Clone)]
pub struct Config {
    /// Root data directory (~/.local/share/deckpilot)
    pub data_dir: PathBuf,
    /// User settings (JSON)
    pub settings_file: PathBuf,
    /// Export task records that survive restarts
    pub export_tasks_file: PathBuf,
}

impl Config {
    /// Load configuration or use defaults
    pub fn load_or_default() -> Self {
        let data_dir = dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("deckpilot");
        Self::with_data_dir(data_dir)
    }

    /// Configuration rooted at an explicit directory.
    pub fn with_data_dir(data_dir: impl Into<PathBuf>) -> Self {
        let data_dir = data_dir.into();
        Self {
            settings_file: data_dir.join("settings.json"),
            export_tasks_file: data_dir.join("export_tasks.json"),
            data_dir,
        }
    }

    /// Ensure all required directories exist
    pub fn ensure_dirs(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.data_dir)
    }
}

/// User-tunable settings, persisted as JSON.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Base URL of the REST backend
    pub api_base_url: String,
    /// Period between status queries
    pub poll_interval_ms: u64,
    /// Give up on a job after this long
    pub poll_timeout_secs: u64,
    /// Per-request timeout for the HTTP client
    pub request_timeout_secs: u64,
    /// Region selections smaller than this (display px, either side) are ignored
    pub min_region_px: f64,
    /// Delay before re-listing files after an upload
    pub reload_delay_ms: u64,
    /// Maximum number of reference files selectable at once (None = unlimited)
    pub max_selection: Option<usize>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            api_base_url: "http://localhost:5000".to_string(),
            poll_interval_ms: 2_000,
            poll_timeout_secs: 120,
            request_timeout_secs: 30,
            min_region_px: 10.0,
            reload_delay_ms: 500,
            max_selection: None,
        }
    }
}

impl Settings {
    /// Load settings from disk. Missing or unreadable files give defaults.
    pub fn load(path: &Path) -> Self {
        if !path.exists() {
            return Self::default();
        }
        match std::fs::read_to_string(path)
            .map_err(anyhow::Error::from)
            .and_then(|raw| serde_json::from_str(&raw).map_err(anyhow::Error::from))
        {
            Ok(settings) => Self::checked(settings),
            Err(e) => {
                tracing::warn!("Failed to load settings from {:?}: {}", path, e);
                Self::default()
            }
        }
    }

    /// Replace values the pollers cannot run with.
    fn checked(mut settings: Self) -> Self {
        if settings.poll_interval_ms == 0 {
            let fallback = Self::default().poll_interval_ms;
            tracing::warn!(fallback_ms = fallback, "poll_interval_ms must be positive, using default");
            settings.poll_interval_ms = fallback;
        }
        settings
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let content = serde_json::to_string_pretty(self).context("Failed to serialize settings")?;
        std::fs::write(path, content).context("Failed to write settings file")?;
        Ok(())
    }

    /// Never zero; a zero period cannot drive an interval timer.
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    pub fn poll_timeout(&self) -> Duration {
        Duration::from_secs(self.poll_timeout_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn reload_delay(&self) -> Duration {
        Duration::from_millis(self.reload_delay_ms)
    }
}
