use tokio::sync::mpsc;

use crate::download::parse::ProgressEvent;
use crate::download::supervisor::RunStatus;
use crate::job::{Job, JobId};

/// How a drain session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    /// The queue ran empty.
    Drained,
    /// The user cancelled; the remaining jobs stay queued.
    Cancelled,
}

/// Everything the worker tells the consumer, in emission order.
#[derive(Debug, Clone)]
pub enum EngineEvent {
    SessionStarted {
        pending: usize,
    },
    SessionFinished {
        end: SessionEnd,
        remaining: usize,
    },
    /// Free-form status text for the job being worked on ("Fetching title...").
    JobStatus {
        id: JobId,
        text: String,
    },
    JobStarted {
        id: JobId,
        title: String,
        url: String,
    },
    Job {
        id: JobId,
        event: ProgressEvent,
    },
    /// The downloader run for this job is over. Sent exactly once per started job.
    JobEnded {
        job: Box<Job>,
        outcome: RunStatus,
    },
    /// The job never reached the downloader (title lookup failed).
    JobSkipped {
        job: Box<Job>,
        message: String,
    },
}

/// Worker side of the event channel. Sending never blocks the worker.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: mpsc::UnboundedSender<EngineEvent>,
}

impl EventBus {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<EngineEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (EventBus { tx }, rx)
    }

    pub fn emit(&self, event: EngineEvent) {
        tracing::trace!("[EngineEvent] {event:?}");
        if self.tx.send(event).is_err() {
            // consumer is gone; the worker keeps going so the process can still be cancelled
            tracing::debug!("event dropped: no consumer");
        }
    }

    pub fn progress(&self, id: JobId, event: ProgressEvent) {
        self.emit(EngineEvent::Job { id, event });
    }
}
