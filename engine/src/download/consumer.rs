//! Control-thread side of the event bus.
//!
//! [`EventConsumer::poll`] is called at a fixed cadence and drains whatever the
//! worker has emitted since the last call. It owns everything the user sees: the
//! [`StatusBoard`], the history file and the list of failed jobs. Nothing else
//! writes history or reports failures.

use std::collections::HashSet;
use std::path::Path;

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TryRecvError;

use crate::download::events::{EngineEvent, SessionEnd};
use crate::download::manager::{DownloadManager, ManagerCommand, SessionState};
use crate::download::parse::{derive_title, ProgressEvent};
use crate::download::supervisor::RunStatus;
use crate::error::Result;
use crate::history::{HistoryEntry, HistoryStore};
use crate::job::{Job, JobId, JobOptions, PlaylistScope};
use crate::settings::Settings;
use crate::utils::url::is_collection_url;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActiveJob {
    pub id: JobId,
    pub title: String,
    pub url: String,
}

/// Aggregate display state, updated only by the consumer.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StatusBoard {
    session: SessionState,
    status_text: String,
    percent: f32,
    size_text: String,
    speed_text: String,
    stage: Option<(u32, u32)>,
    active: Option<ActiveJob>,
    current_file: Option<String>,
    last_log: Option<String>,
}

impl StatusBoard {
    pub fn session(&self) -> SessionState {
        self.session
    }

    pub fn status_text(&self) -> &str {
        &self.status_text
    }

    pub fn percent(&self) -> f32 {
        self.percent
    }

    pub fn size_text(&self) -> &str {
        &self.size_text
    }

    pub fn speed_text(&self) -> &str {
        &self.speed_text
    }

    /// `(K, N)` while a multi-item run is on item K.
    pub fn stage(&self) -> Option<(u32, u32)> {
        self.stage
    }

    pub fn active(&self) -> Option<&ActiveJob> {
        self.active.as_ref()
    }

    pub fn current_file(&self) -> Option<&str> {
        self.current_file.as_deref()
    }

    pub fn last_log(&self) -> Option<&str> {
        self.last_log.as_deref()
    }

    fn reset_transfer(&mut self) {
        self.percent = 0.0;
        self.size_text.clear();
        self.speed_text.clear();
    }

    fn start_job(&mut self, id: JobId, title: &str, url: &str) {
        self.reset_transfer();
        self.stage = None;
        self.current_file = None;
        self.last_log = None;
        self.active = Some(ActiveJob {
            id,
            title: title.to_string(),
            url: url.to_string(),
        });
        self.status_text = "Starting download...".into();
    }

    fn apply(&mut self, event: &ProgressEvent) {
        match event {
            ProgressEvent::StageChanged { index, total } => {
                self.stage = Some((*index, *total));
                self.reset_transfer();
                self.status_text = format!("Downloading video {index}/{total}...");
            }
            ProgressEvent::DestinationKnown { path } => {
                let name = derive_title(path);
                self.status_text = format!("Downloading {name}");
                self.current_file = Some(name);
            }
            ProgressEvent::Progress {
                percent,
                size_text,
                speed_text,
            } => {
                self.percent = *percent;
                self.size_text.clone_from(size_text);
                self.speed_text.clone_from(speed_text);
            }
            ProgressEvent::Finalized { output_path } => {
                self.current_file = Some(derive_title(output_path));
            }
            ProgressEvent::LogLine { text } => {
                self.last_log = Some(text.clone());
            }
            ProgressEvent::Failed { .. } => {
                self.status_text = "Error - Download failed".into();
            }
            ProgressEvent::Cancelled => {
                self.reset_transfer();
                self.stage = None;
                self.status_text = "Download cancelled".into();
            }
            ProgressEvent::Completed => {
                self.percent = 100.0;
                self.status_text = "Download complete!".into();
            }
        }
    }
}

/// Something the user should be told about.
#[derive(Debug, Clone, PartialEq)]
pub enum Notice {
    /// A finished file was recorded in history.
    Saved { title: String, url: String },
    DownloadFailed {
        job_id: JobId,
        title: String,
        url: String,
        message: String,
        /// Requeued automatically; no action needed.
        will_retry: bool,
    },
    /// Title lookup failed; the job never started.
    Skipped { url: String, message: String },
    Cancelled { title: String },
    HistoryWriteFailed { message: String },
    SessionFinished { end: SessionEnd, remaining: usize },
}

pub struct EventConsumer {
    rx: mpsc::UnboundedReceiver<EngineEvent>,
    manager: DownloadManager,
    board: StatusBoard,
    history: HistoryStore,
    retry_failed_once: bool,
    failed: Vec<Job>,
    finalized_seen: bool,
    /// Jobs requeued automatically that have not started again yet.
    pending_retries: HashSet<JobId>,
}

impl EventConsumer {
    pub fn new(
        rx: mpsc::UnboundedReceiver<EngineEvent>,
        manager: DownloadManager,
        history: HistoryStore,
        retry_failed_once: bool,
    ) -> Self {
        EventConsumer {
            rx,
            manager,
            board: StatusBoard::default(),
            history,
            retry_failed_once,
            failed: Vec::new(),
            finalized_seen: false,
            pending_retries: HashSet::new(),
        }
    }

    pub fn board(&self) -> &StatusBoard {
        &self.board
    }

    pub fn history(&self) -> &HistoryStore {
        &self.history
    }

    pub fn history_path(&self) -> &Path {
        self.history.path()
    }

    /// Jobs that failed for good, oldest first.
    pub fn failed(&self) -> &[Job] {
        &self.failed
    }

    pub fn manager(&self) -> &DownloadManager {
        &self.manager
    }

    pub fn retry_failed_once(&self) -> bool {
        self.retry_failed_once
    }

    /// Take over the retry policy and history location of new settings.
    pub fn apply_settings(&mut self, settings: &Settings) {
        self.retry_failed_once = settings.retry_failed_once;
        let path = settings.history_path();
        if path != self.history.path() {
            tracing::info!("history moves to {}", path.display());
            self.history = HistoryStore::open(path);
        }
    }

    /// Drain everything currently on the bus. Never blocks.
    ///
    /// `None` once the worker is gone and there is nothing left to report.
    pub fn poll(&mut self) -> Option<Vec<Notice>> {
        let mut notices = Vec::new();
        let open = self.drain_into(&mut notices);
        (open || !notices.is_empty()).then_some(notices)
    }

    /// Wait for at least one event, then drain. `None` once the worker is gone.
    pub async fn wait(&mut self) -> Option<Vec<Notice>> {
        let first = self.rx.recv().await?;
        let mut notices = Vec::new();
        self.handle(first, &mut notices);
        self.drain_into(&mut notices);
        Some(notices)
    }

    /// Returns false if the bus is closed.
    fn drain_into(&mut self, notices: &mut Vec<Notice>) -> bool {
        loop {
            match self.rx.try_recv() {
                Ok(event) => self.handle(event, notices),
                Err(TryRecvError::Empty) => return true,
                Err(TryRecvError::Disconnected) => return false,
            }
        }
    }

    fn handle(&mut self, event: EngineEvent, notices: &mut Vec<Notice>) {
        match event {
            EngineEvent::SessionStarted { pending } => {
                tracing::debug!("session started ({pending} pending)");
                self.board.session = SessionState::Draining;
            }
            EngineEvent::SessionFinished { end, remaining } => {
                if end == SessionEnd::Drained && !self.pending_retries.is_empty() {
                    // a retry landed after the queue ran dry; keep the session going
                    let retries = std::mem::take(&mut self.pending_retries);
                    if self.manager.try_start_session().is_ok() {
                        tracing::info!("restarting session for {} retries", retries.len());
                        return;
                    }
                }
                self.board.active = None;
                self.board.session = match end {
                    SessionEnd::Drained => SessionState::Idle,
                    SessionEnd::Cancelled => SessionState::Cancelled,
                };
                notices.push(Notice::SessionFinished { end, remaining });
            }
            EngineEvent::JobStatus { id, text } => {
                tracing::debug!("job {id}: {text}");
                self.board.status_text = text;
            }
            EngineEvent::JobStarted { id, title, url } => {
                self.pending_retries.remove(&id);
                self.finalized_seen = false;
                self.board.start_job(id, &title, &url);
            }
            EngineEvent::Job { id: _, event } => {
                self.board.apply(&event);
                if let ProgressEvent::Finalized { output_path } = &event {
                    self.finalized_seen = true;
                    let url = self
                        .board
                        .active
                        .as_ref()
                        .map(|a| a.url.clone())
                        .unwrap_or_default();
                    self.record_history(derive_title(output_path), url, notices);
                }
            }
            EngineEvent::JobEnded { job, outcome } => {
                self.board.apply(&outcome.to_event());
                self.board.active = None;
                self.finish_job(*job, outcome, notices);
            }
            EngineEvent::JobSkipped { job, message } => {
                self.pending_retries.remove(&job.id);
                notices.push(Notice::Skipped {
                    url: job.source_url.clone(),
                    message,
                });
                self.failed.push(*job);
            }
        }
    }

    fn finish_job(&mut self, job: Job, outcome: RunStatus, notices: &mut Vec<Notice>) {
        match outcome {
            RunStatus::Completed => {
                if !self.finalized_seen {
                    let title = job.display_title().to_string();
                    self.record_history(title, job.source_url.clone(), notices);
                }
            }
            RunStatus::Cancelled => {
                notices.push(Notice::Cancelled {
                    title: job.display_title().to_string(),
                });
            }
            RunStatus::Failed { message, cause } => {
                let title = job.display_title().to_string();
                let url = job.source_url.clone();
                let job_id = job.id;
                let error = cause.into_error(message.clone());

                let automatic = self.retry_failed_once && error.is_retryable() && job.attempts == 0;
                if automatic {
                    let retry = job.clone().into_retry(true);
                    let id = retry.id;
                    if self.manager.try_enqueue(retry).is_ok() {
                        tracing::info!("requeued {url} after failure: {message}");
                        self.pending_retries.insert(id);
                        notices.push(Notice::DownloadFailed {
                            job_id,
                            title,
                            url,
                            message,
                            will_retry: true,
                        });
                        return;
                    }
                }

                tracing::warn!("{url}: {error}");
                self.failed.push(job);
                notices.push(Notice::DownloadFailed {
                    job_id,
                    title,
                    url,
                    message,
                    will_retry: false,
                });
            }
        }
    }

    fn record_history(&mut self, title: String, url: String, notices: &mut Vec<Notice>) {
        match self.history.append(HistoryEntry::now(title.clone(), url.clone())) {
            Ok(()) => notices.push(Notice::Saved { title, url }),
            Err(e) => {
                tracing::warn!("could not write history: {e}");
                notices.push(Notice::HistoryWriteFailed {
                    message: e.to_string(),
                });
            }
        }
    }

    /// Put a failed job back at the head of the queue. Returns false for unknown ids.
    pub fn retry_failed(&mut self, id: JobId) -> Result<bool> {
        let Some(pos) = self.failed.iter().position(|j| j.id == id) else {
            return Ok(false);
        };
        let job = self.failed.remove(pos).into_retry(false);
        if let Err(e) = self.manager.try_send(ManagerCommand::EnqueueFront { job: job.clone() }) {
            self.failed.insert(pos, job);
            return Err(e);
        }
        Ok(true)
    }

    pub fn clear_history(&mut self) -> Result<()> {
        tracing::info!("clearing history ({} entries)", self.history.len());
        self.history.clear()
    }

    /// Queue a fresh download of a history entry with the given options.
    pub fn redownload(&self, entry: &HistoryEntry, options: &JobOptions) -> Result<JobId> {
        let mut job = Job::new(entry.source_url.clone(), options);
        if is_collection_url(&job.source_url) {
            job = job.with_scope(PlaylistScope::SingleItem);
        }
        let id = job.id;
        self.manager.try_enqueue(job)?;
        Ok(id)
    }
}
