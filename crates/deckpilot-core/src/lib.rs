//! Deckpilot Core - client-side logic for the slide-deck authoring service
//!
//! This crate contains everything a client needs between the user and the
//! REST backend, including:
//! - Job status polling with timeouts and cancellation
//! - The optimistic project store
//! - Reference file upload and parse tracking
//! - Export tasks that survive restarts
//! - Region capture from page images
//! - External service connectivity tests

pub mod api;
pub mod config;
pub mod error;
pub mod export;
pub mod jobs;
pub mod models;
pub mod notify;
pub mod project;
pub mod reference;
pub mod region;
pub mod services;
pub mod store;

use std::sync::Arc;

pub use api::{DeckApi, HttpApi, InMemoryApi};
pub use config::{Config, Settings};
pub use error::{ClientError, ClientResult};
pub use export::{ExportKind, ExportTask, ExportTaskTracker};
pub use jobs::{ActiveJobs, PollConfig, PollOutcome, TaskPoller};
pub use notify::{LogNotifier, Notice, Notifier};
pub use reference::{FileParseTracker, SelectionMode};
pub use store::ProjectStore;
pub use services::{ServiceKind, ServiceTester};

/// Client state shared by every command
pub struct ClientState {
    pub config: Config,
    pub settings: Settings,
    pub api: Arc<dyn DeckApi>,
    pub notifier: Arc<dyn Notifier>,
    pub poller: TaskPoller,
    /// Project being edited
    pub store: ProjectStore,
    /// Export tasks, persisted under the data directory
    pub exports: ExportTaskTracker,
    pub services: ServiceTester,
}

impl ClientState {
    pub fn new(
        config: Config,
        settings: Settings,
        api: Arc<dyn DeckApi>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        let poller = TaskPoller::new(api.clone(), PollConfig::from_settings(&settings));
        let store = ProjectStore::new(api.clone(), poller.clone(), notifier.clone());
        let exports = ExportTaskTracker::new(
            api.clone(),
            poller.clone(),
            notifier.clone(),
            Some(config.export_tasks_file.clone()),
        );
        let services = ServiceTester::new(api.clone(), poller.clone(), notifier.clone());

        Self {
            config,
            settings,
            api,
            notifier,
            poller,
            store,
            exports,
            services,
        }
    }

    /// State talking to the configured HTTP backend.
    pub fn connect(config: Config, notifier: Arc<dyn Notifier>) -> anyhow::Result<Self> {
        let settings = Settings::load(&config.settings_file);
        let api = HttpApi::from_settings(&settings)?;
        tracing::info!(base_url = %settings.api_base_url, "Using HTTP backend");
        Ok(Self::new(config, settings, Arc::new(api), notifier))
    }

    /// Tracker for one file picker view.
    pub fn file_tracker(&self, mode: SelectionMode) -> FileParseTracker {
        FileParseTracker::new(self.api.clone(), self.notifier.clone(), &self.settings, mode)
    }

    /// Default picker mode from settings
    pub fn selection_mode(&self) -> SelectionMode {
        SelectionMode::Multiple {
            max: self.settings.max_selection,
        }
    }

    /// Stop all background work and clear the project store.
    pub async fn reset(&self) {
        self.store.reset().await;
        self.exports.stop_all().await;
        tracing::info!("Client state reset");
    }
}
