pub mod commands;
pub mod download;
pub mod error;
pub mod history;
pub mod job;
pub mod logging;
pub mod settings;
pub mod utils;

use std::path::PathBuf;

use tokio::task::JoinHandle;

use crate::download::events::EventBus;
use crate::download::manager::DownloadManager;
use crate::download::metadata::MetadataResolver;
use crate::history::HistoryStore;

pub use crate::commands::downloader::{CollectionChoice, CollectionPrompt, Submission};
pub use crate::download::consumer::{EventConsumer, Notice, StatusBoard};
pub use crate::download::events::{EngineEvent, SessionEnd};
pub use crate::download::manager::SessionState;
pub use crate::error::{EngineError, Result};
pub use crate::job::{Job, JobId, JobOptions, JobState, OutputQuality, PlaylistScope};
pub use crate::settings::Settings;

/// The running engine: a download worker plus the handles to drive it.
///
/// The matching [`EventConsumer`] is returned separately so the control loop
/// can own it mutably while the engine is shared.
#[derive(Debug)]
pub struct Engine {
    manager: DownloadManager,
    worker: JoinHandle<()>,
    settings: Settings,
    settings_file: PathBuf,
}

impl Engine {
    /// Spawn the worker. Must be called from within a tokio runtime.
    pub fn start(settings: Settings) -> (Engine, EventConsumer) {
        tracing::info!(
            "engine starting; downloader={} output_mode={:?}",
            settings.downloader_path,
            settings.output_mode
        );
        let (bus, rx) = EventBus::new();
        let (manager, worker) = DownloadManager::spawn(settings.clone(), bus);
        let history = HistoryStore::open(settings.history_path());
        let consumer = EventConsumer::new(rx, manager.clone(), history, settings.retry_failed_once);
        (
            Engine {
                manager,
                worker,
                settings,
                settings_file: crate::settings::settings_json_path(),
            },
            consumer,
        )
    }

    /// Persist settings changes somewhere other than the user's settings.json.
    pub fn with_settings_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.settings_file = path.into();
        self
    }

    pub fn manager(&self) -> &DownloadManager {
        &self.manager
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn resolver(&self) -> MetadataResolver {
        MetadataResolver::new(self.settings.downloader_path.clone())
    }

    pub async fn submit(&self, url: &str, options: &JobOptions) -> Result<Submission> {
        commands::downloader::submit_url(&self.resolver(), url, options).await
    }

    pub async fn enqueue(&self, jobs: Vec<Job>) -> Result<usize> {
        commands::downloader::queue_jobs(&self.manager, jobs).await
    }

    /// Queue a listed collection the way the user chose.
    pub async fn enqueue_collection(
        &self,
        prompt: CollectionPrompt,
        choice: CollectionChoice,
    ) -> Result<usize> {
        prompt.queue(&self.manager, choice).await
    }

    pub async fn start_session(&self) -> Result<()> {
        commands::downloader::start_downloads(&self.manager).await
    }

    pub fn cancel(&self) {
        commands::downloader::cancel_downloads(&self.manager);
    }

    pub async fn queued(&self) -> Result<Vec<Job>> {
        self.manager.snapshot().await
    }

    /// Save new settings and hand them to both the worker and `consumer`.
    pub async fn update_settings(
        &mut self,
        consumer: &mut EventConsumer,
        settings: Settings,
    ) -> Result<()> {
        commands::settings_cmd::save_settings(
            &self.settings_file,
            &self.manager,
            consumer,
            settings.clone(),
        )
        .await?;
        self.settings = settings;
        Ok(())
    }

    pub fn open_download_folder(&self) -> Result<()> {
        commands::files::open_download_folder(&self.settings)
    }

    /// Stop the worker, cancelling whatever it is running, and wait for it.
    pub async fn shutdown(self) -> Result<()> {
        self.manager.shutdown().await?;
        if let Err(e) = self.worker.await {
            tracing::error!("download worker ended abnormally: {e}");
        }
        Ok(())
    }
}
