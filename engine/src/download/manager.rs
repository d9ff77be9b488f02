use std::fmt;
use std::future::Future;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::download::command::download_invocation;
use crate::download::events::{EngineEvent, EventBus, SessionEnd};
use crate::download::metadata::{CollectionMember, MetadataResolver};
use crate::download::parse::parse_line;
use crate::download::queue::JobQueue;
use crate::download::supervisor::{CancelFlag, ProcessSupervisor, RunStatus};
use crate::error::{EngineError, Result};
use crate::job::{Job, JobOptions, JobState, PlaylistScope};
use crate::settings::Settings;

const COMMAND_BUFFER: usize = 64;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SessionState {
    #[default]
    Idle,
    Draining,
    Cancelled,
}

#[derive(Debug)]
pub enum ManagerCommand {
    Enqueue { jobs: Vec<Job> },
    EnqueueFront { job: Job },
    /// One job per member, in listing order.
    EnqueueCollection {
        members: Vec<CollectionMember>,
        options: JobOptions,
    },
    StartSession,
    Clear,
    Snapshot { reply: oneshot::Sender<Vec<Job>> },
    UpdateSettings(Box<Settings>),
    Shutdown,
}

/// Handle to the background worker. Cheap to clone.
#[derive(Clone)]
pub struct DownloadManager {
    cmd_tx: mpsc::Sender<ManagerCommand>,
    cancel: CancelFlag,
}

impl DownloadManager {
    /// Start the worker task. It runs until `shutdown` or until every handle is dropped.
    pub fn spawn(settings: Settings, bus: EventBus) -> (Self, JoinHandle<()>) {
        let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_BUFFER);
        let cancel = CancelFlag::new();
        let worker = Worker {
            rx: cmd_rx,
            queue: JobQueue::new(),
            settings,
            bus,
            cancel: cancel.clone(),
            closed: false,
        };
        let handle = tokio::spawn(worker.run());
        (Self { cmd_tx, cancel }, handle)
    }

    pub async fn send(&self, cmd: ManagerCommand) -> Result<()> {
        self.cmd_tx
            .send(cmd)
            .await
            .map_err(|_| EngineError::ManagerStopped)
    }

    /// Non-async send for the control thread.
    pub fn try_send(&self, cmd: ManagerCommand) -> Result<()> {
        self.cmd_tx.try_send(cmd).map_err(|e| {
            tracing::warn!("manager command not delivered: {e}");
            EngineError::ManagerStopped
        })
    }

    pub async fn enqueue(&self, job: Job) -> Result<()> {
        self.enqueue_many(vec![job]).await
    }

    pub async fn enqueue_many(&self, jobs: Vec<Job>) -> Result<()> {
        self.send(ManagerCommand::Enqueue { jobs }).await
    }

    pub async fn enqueue_front(&self, job: Job) -> Result<()> {
        self.send(ManagerCommand::EnqueueFront { job }).await
    }

    pub async fn enqueue_collection(
        &self,
        members: Vec<CollectionMember>,
        options: JobOptions,
    ) -> Result<()> {
        self.send(ManagerCommand::EnqueueCollection { members, options })
            .await
    }

    pub fn try_enqueue(&self, job: Job) -> Result<()> {
        self.try_send(ManagerCommand::Enqueue { jobs: vec![job] })
    }

    pub async fn start_session(&self) -> Result<()> {
        self.send(ManagerCommand::StartSession).await
    }

    pub fn try_start_session(&self) -> Result<()> {
        self.try_send(ManagerCommand::StartSession)
    }

    pub async fn clear(&self) -> Result<()> {
        self.send(ManagerCommand::Clear).await
    }

    pub async fn snapshot(&self) -> Result<Vec<Job>> {
        let (reply, rx) = oneshot::channel();
        self.send(ManagerCommand::Snapshot { reply }).await?;
        rx.await.map_err(|_| EngineError::ManagerStopped)
    }

    /// Takes effect from the next job on.
    pub async fn update_settings(&self, settings: Settings) -> Result<()> {
        self.send(ManagerCommand::UpdateSettings(Box::new(settings))).await
    }

    pub async fn shutdown(&self) -> Result<()> {
        self.send(ManagerCommand::Shutdown).await
    }

    /// Request cancellation of the running session. Safe from any thread.
    pub fn cancel(&self) {
        tracing::info!("cancel requested");
        self.cancel.cancel();
    }
}

impl fmt::Debug for DownloadManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DownloadManager").finish_non_exhaustive()
    }
}

struct Worker {
    rx: mpsc::Receiver<ManagerCommand>,
    queue: JobQueue,
    settings: Settings,
    bus: EventBus,
    cancel: CancelFlag,
    closed: bool,
}

impl Worker {
    async fn run(mut self) {
        tracing::info!("download manager started");
        while !self.closed {
            let Some(cmd) = self.rx.recv().await else {
                break;
            };
            if self.apply(cmd, SessionState::Idle) {
                self.drain_session().await;
            }
        }
        tracing::info!("download manager stopped ({} jobs left queued)", self.queue.len());
    }

    /// Returns true when a session should start.
    fn apply(&mut self, cmd: ManagerCommand, state: SessionState) -> bool {
        match cmd {
            ManagerCommand::Enqueue { jobs } => {
                for job in jobs {
                    tracing::debug!("queued {} ({})", job.id, job.source_url);
                    self.queue.enqueue(job);
                }
            }
            ManagerCommand::EnqueueFront { job } => {
                self.queue.push_front(job);
            }
            ManagerCommand::EnqueueCollection { members, options } => {
                tracing::debug!("queued {} collection members", members.len());
                self.queue.enqueue_collection(&members, &options);
            }
            ManagerCommand::StartSession => {
                if state == SessionState::Draining {
                    tracing::debug!("session already running");
                } else {
                    return true;
                }
            }
            ManagerCommand::Clear => {
                let n = self.queue.clear();
                tracing::info!("cleared {n} queued jobs");
            }
            ManagerCommand::Snapshot { reply } => {
                let _ = reply.send(self.queue.snapshot());
            }
            ManagerCommand::UpdateSettings(settings) => {
                self.settings = *settings;
            }
            ManagerCommand::Shutdown => {
                self.closed = true;
                if state == SessionState::Draining {
                    self.cancel.cancel();
                }
            }
        }
        false
    }

    /// Drive `fut` to completion while still answering commands.
    async fn serve_while<F: Future>(&mut self, fut: F) -> F::Output {
        tokio::pin!(fut);
        loop {
            tokio::select! {
                biased;
                out = &mut fut => return out,
                cmd = self.rx.recv(), if !self.closed => match cmd {
                    Some(cmd) => {
                        self.apply(cmd, SessionState::Draining);
                    }
                    None => {
                        // every handle is gone; nobody can observe the rest of the session
                        self.closed = true;
                        self.cancel.cancel();
                    }
                },
            }
        }
    }

    fn drain_pending_commands(&mut self) {
        while let Ok(cmd) = self.rx.try_recv() {
            self.apply(cmd, SessionState::Draining);
        }
    }

    async fn drain_session(&mut self) {
        self.cancel.reset();
        tracing::info!("session started with {} jobs", self.queue.len());
        self.bus.emit(EngineEvent::SessionStarted {
            pending: self.queue.len(),
        });

        let end = loop {
            if !self.closed {
                self.drain_pending_commands();
            }
            if self.cancel.is_cancelled() {
                break SessionEnd::Cancelled;
            }
            let Some(mut job) = self.queue.dequeue() else {
                break SessionEnd::Drained;
            };

            if job.has_placeholder_title() && job.playlist_scope != PlaylistScope::EntireCollection {
                job.state = JobState::ResolvingMetadata;
                self.bus.emit(EngineEvent::JobStatus {
                    id: job.id,
                    text: "Fetching title...".to_string(),
                });

                let resolver = MetadataResolver::new(self.settings.downloader_path.clone());
                let cancel = self.cancel.clone();
                let url = job.source_url.clone();
                let fetched = self
                    .serve_while(async move {
                        tokio::select! {
                            biased;
                            _ = cancel.cancelled() => None,
                            r = resolver.fetch_title(&url) => Some(r),
                        }
                    })
                    .await;

                match fetched {
                    None => {
                        tracing::info!("cancelled while fetching title for {}", job.source_url);
                        self.queue.push_front(job);
                        break SessionEnd::Cancelled;
                    }
                    Some(Ok(title)) => job.title = Some(title),
                    Some(Err(e)) => {
                        tracing::warn!("skipping {}: {e}", job.source_url);
                        let message = e.to_string();
                        job.state = JobState::Failed;
                        job.error_message = Some(message.clone());
                        self.bus.emit(EngineEvent::JobSkipped {
                            job: Box::new(job),
                            message,
                        });
                        continue;
                    }
                }
            }

            let outcome = self.download(&mut job).await;
            let stop = outcome == RunStatus::Cancelled;
            self.bus.emit(EngineEvent::JobEnded {
                job: Box::new(job),
                outcome,
            });
            if stop {
                break SessionEnd::Cancelled;
            }
        };

        let remaining = self.queue.len();
        match end {
            SessionEnd::Drained => tracing::info!("session finished: queue empty"),
            SessionEnd::Cancelled => {
                tracing::info!("session cancelled; {remaining} jobs stay queued")
            }
        }
        self.bus
            .emit(EngineEvent::SessionFinished { end, remaining });
    }

    /// One supervised downloader run. Leaves the job in its terminal state.
    async fn download(&mut self, job: &mut Job) -> RunStatus {
        let invocation = download_invocation(job, &self.settings);
        job.state = JobState::Downloading;
        tracing::info!("downloading {} ({})", job.display_title(), job.source_url);
        self.bus.emit(EngineEvent::JobStarted {
            id: job.id,
            title: job.display_title().to_string(),
            url: job.source_url.clone(),
        });

        let supervisor = ProcessSupervisor::new(self.settings.output_mode, self.cancel.clone());
        let bus = self.bus.clone();
        let id = job.id;
        let outcome = self
            .serve_while(async move {
                supervisor
                    .run(&invocation, |line| {
                        if let Some(event) = parse_line(&line.text) {
                            bus.progress(id, event);
                        }
                    })
                    .await
            })
            .await;

        match &outcome {
            RunStatus::Completed => job.state = JobState::Completed,
            RunStatus::Failed { message, .. } => {
                job.state = JobState::Failed;
                job.error_message = Some(message.clone());
            }
            RunStatus::Cancelled => job.state = JobState::Cancelled,
        }
        outcome
    }
}
