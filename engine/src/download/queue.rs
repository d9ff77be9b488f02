use std::collections::VecDeque;

use crate::download::metadata::CollectionMember;
use crate::job::{Job, JobOptions, JobState};

/// FIFO of pending jobs. Only the manager's worker task touches it.
#[derive(Debug, Default)]
pub struct JobQueue {
    jobs: VecDeque<Job>,
}

impl JobQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enqueue(&mut self, mut job: Job) {
        job.state = JobState::Queued;
        self.jobs.push_back(job);
    }

    /// One job per member, in listing order.
    pub fn enqueue_collection(&mut self, members: &[CollectionMember], options: &JobOptions) {
        for m in members {
            self.enqueue(Job::from_member(m, options));
        }
    }

    pub fn dequeue(&mut self) -> Option<Job> {
        self.jobs.pop_front()
    }

    /// Return a job that was taken but never started.
    pub fn push_front(&mut self, mut job: Job) {
        job.state = JobState::Queued;
        self.jobs.push_front(job);
    }

    pub fn clear(&mut self) -> usize {
        let n = self.jobs.len();
        self.jobs.clear();
        n
    }

    pub fn snapshot(&self) -> Vec<Job> {
        self.jobs.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }
}
