use crate::download::manager::DownloadManager;
use crate::download::metadata::{CollectionMember, MetadataResolver};
use crate::error::{EngineError, Result};
use crate::job::{Job, JobOptions, PlaylistScope};
use crate::utils::url::{is_collection_url, sanitize_url};

/// What to do with a collection URL.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CollectionChoice {
    /// One job for the whole playlist, downloaded in a single tool run.
    EntireCollection,
    /// Only the item the URL points at.
    SingleItem,
    /// One job per member.
    ExpandMembers,
}

/// A collection URL waiting for the user's decision.
#[derive(Debug, Clone)]
pub struct CollectionPrompt {
    url: String,
    options: JobOptions,
    members: Vec<CollectionMember>,
}

impl CollectionPrompt {
    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn members(&self) -> &[CollectionMember] {
        &self.members
    }

    /// Queue the collection the chosen way. Returns how many jobs were added.
    pub async fn queue(self, manager: &DownloadManager, choice: CollectionChoice) -> Result<usize> {
        let scope = match choice {
            CollectionChoice::EntireCollection => PlaylistScope::EntireCollection,
            CollectionChoice::SingleItem => PlaylistScope::SingleItem,
            CollectionChoice::ExpandMembers => {
                let n = self.members.len();
                manager.enqueue_collection(self.members, self.options).await?;
                return Ok(n);
            }
        };
        let job = Job::new(self.url, &self.options).with_scope(scope);
        queue_jobs(manager, vec![job]).await
    }
}

#[derive(Debug)]
pub enum Submission {
    /// Jobs that can be queued as they are.
    Ready(Vec<Job>),
    Collection(CollectionPrompt),
}

/// Turn a pasted URL into jobs, listing the collection first when it is one.
pub async fn submit_url(
    resolver: &MetadataResolver,
    raw_url: &str,
    options: &JobOptions,
) -> Result<Submission> {
    let url = sanitize_url(raw_url);
    if url.is_empty() {
        return Err(EngineError::InvalidUrl(raw_url.to_string()));
    }
    if !is_collection_url(&url) {
        return Ok(Submission::Ready(vec![Job::new(url, options)]));
    }

    tracing::info!("listing collection {url}");
    let mut members = resolver.list_collection(&url).await?;
    if members.len() == 1 {
        // nothing to choose between
        let only = members.remove(0);
        return Ok(Submission::Ready(vec![Job::from_member(&only, options)]));
    }
    tracing::info!("{url}: {} entries", members.len());
    Ok(Submission::Collection(CollectionPrompt {
        url,
        options: options.clone(),
        members,
    }))
}

pub async fn queue_jobs(manager: &DownloadManager, jobs: Vec<Job>) -> Result<usize> {
    let n = jobs.len();
    if n > 0 {
        manager.enqueue_many(jobs).await?;
    }
    Ok(n)
}

pub async fn start_downloads(manager: &DownloadManager) -> Result<()> {
    manager.start_session().await
}

pub fn cancel_downloads(manager: &DownloadManager) {
    manager.cancel();
}
