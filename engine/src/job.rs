use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::download::metadata::CollectionMember;
use crate::settings::Settings;

/* ----------------------------- enums & models ----------------------------- */

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(Uuid);

impl JobId {
    pub fn new() -> Self {
        JobId(Uuid::new_v4())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // first group is enough to tell jobs apart in logs
        let s = self.0.to_string();
        f.write_str(s.split('-').next().unwrap_or(&s))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "height")]
pub enum OutputQuality {
    AudioOnly,
    VideoHeightCap(u32),
}

impl Default for OutputQuality {
    fn default() -> Self {
        OutputQuality::VideoHeightCap(720)
    }
}

impl OutputQuality {
    pub fn is_audio(&self) -> bool {
        matches!(self, OutputQuality::AudioOnly)
    }
}

/// Explicit values that replace the ones derived from settings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FormatOverrides {
    /// Replaces the `-f` selector entirely.
    #[serde(default)]
    pub format_selector: Option<String>,
    /// Audio container for audio-only jobs (`mp3`, `m4a`, `opus`, ...).
    #[serde(default)]
    pub audio_format: Option<String>,
}

/// How a job relates to a collection (playlist) URL.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlaylistScope {
    #[default]
    NotCollection,
    SingleItem,
    EntireCollection,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Queued,
    ResolvingMetadata,
    Downloading,
    Completed,
    Failed,
    Cancelled,
}

/// Per-submission options chosen by the user.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobOptions {
    pub output_quality: OutputQuality,
    pub embed_thumbnail: bool,
    #[serde(default)]
    pub format_overrides: FormatOverrides,
}

impl JobOptions {
    pub fn from_settings(settings: &Settings) -> Self {
        JobOptions {
            output_quality: OutputQuality::VideoHeightCap(settings.video_height_cap),
            embed_thumbnail: settings.embed_thumbnail,
            format_overrides: FormatOverrides::default(),
        }
    }

    pub fn audio_only(mut self) -> Self {
        self.output_quality = OutputQuality::AudioOnly;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub source_url: String,
    pub output_quality: OutputQuality,
    pub format_overrides: FormatOverrides,
    pub embed_thumbnail: bool,
    pub originates_from_collection: bool,
    pub playlist_scope: PlaylistScope,
    pub state: JobState,
    /// `None` is the placeholder title, resolved by the drain loop before download.
    pub title: Option<String>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    /// Automatic retries already spent on this job.
    #[serde(default)]
    pub attempts: u32,
}

impl Job {
    pub fn new(source_url: impl Into<String>, options: &JobOptions) -> Self {
        let audio = options.output_quality.is_audio();
        Job {
            id: JobId::new(),
            source_url: source_url.into().trim().to_string(),
            output_quality: options.output_quality,
            format_overrides: options.format_overrides.clone(),
            // thumbnails are only embedded into extracted audio
            embed_thumbnail: audio && options.embed_thumbnail,
            originates_from_collection: false,
            playlist_scope: PlaylistScope::NotCollection,
            state: JobState::Queued,
            title: None,
            error_message: None,
            created_at: Utc::now(),
            attempts: 0,
        }
    }

    /// A job for one member of an expanded collection.
    pub fn from_member(member: &CollectionMember, options: &JobOptions) -> Self {
        let mut job = Job::new(member.url.clone(), options);
        job.originates_from_collection = true;
        job.title = Some(member.title.clone()).filter(|t| !t.trim().is_empty());
        job
    }

    pub fn with_scope(mut self, scope: PlaylistScope) -> Self {
        self.playlist_scope = scope;
        self
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }

    pub fn has_placeholder_title(&self) -> bool {
        self.title.as_deref().map_or(true, |t| t.trim().is_empty())
    }

    /// Title for status lines and history; falls back to the URL.
    pub fn display_title(&self) -> &str {
        match self.title.as_deref() {
            Some(t) if !t.trim().is_empty() => t,
            _ => &self.source_url,
        }
    }

    /// Put a finished job back into the pending state for another attempt.
    pub fn into_retry(mut self, automatic: bool) -> Self {
        self.state = JobState::Queued;
        self.error_message = None;
        if automatic {
            self.attempts += 1;
        } else {
            self.attempts = 0;
        }
        self
    }
}
