use std::fmt;
use std::path::Path;

use crate::job::{Job, OutputQuality, PlaylistScope};
use crate::settings::Settings;

const SINGLE_TEMPLATE: &str = "%(title)s [%(id)s].%(ext)s";
const COLLECTION_TEMPLATE: &str = "%(playlist_title)s/%(playlist_index)s - %(title)s [%(id)s].%(ext)s";

/// Program plus arguments for one external tool run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolInvocation {
    pub program: String,
    pub args: Vec<String>,
}

impl ToolInvocation {
    pub fn new(program: impl Into<String>) -> Self {
        ToolInvocation {
            program: program.into(),
            args: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Value following `flag`, if present.
    pub fn value_of(&self, flag: &str) -> Option<&str> {
        self.args
            .iter()
            .position(|a| a == flag)
            .and_then(|i| self.args.get(i + 1))
            .map(String::as_str)
    }

    pub fn has_flag(&self, flag: &str) -> bool {
        self.args.iter().any(|a| a == flag)
    }
}

impl fmt::Display for ToolInvocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.program)?;
        for a in &self.args {
            if a.is_empty() || a.contains(char::is_whitespace) {
                write!(f, " \"{a}\"")?;
            } else {
                write!(f, " {a}")?;
            }
        }
        Ok(())
    }
}

/// `-f` selector (and audio extraction flags) for a job.
fn format_args(job: &Job, settings: &Settings) -> Vec<String> {
    let overrides = &job.format_overrides;
    match job.output_quality {
        OutputQuality::AudioOnly => {
            let container = overrides
                .audio_format
                .clone()
                .unwrap_or_else(|| settings.audio_format.clone());
            let mut args = vec![
                "-f".to_string(),
                overrides
                    .format_selector
                    .clone()
                    .unwrap_or_else(|| "bestaudio/best".into()),
                "-x".into(),
                "--audio-format".into(),
                container,
            ];
            if job.embed_thumbnail {
                args.push("--embed-thumbnail".into());
            }
            args
        }
        OutputQuality::VideoHeightCap(q) => vec![
            "-f".into(),
            overrides
                .format_selector
                .clone()
                .unwrap_or_else(|| format!("bestvideo[height<={q}]+bestaudio/best[height<={q}]")),
        ],
    }
}

fn playlist_flag(job: &Job) -> Option<&'static str> {
    if job.originates_from_collection {
        // members are always fetched on their own
        return Some("--no-playlist");
    }
    match job.playlist_scope {
        PlaylistScope::NotCollection => None,
        PlaylistScope::SingleItem => Some("--no-playlist"),
        PlaylistScope::EntireCollection => Some("--yes-playlist"),
    }
}

pub fn output_template(download_dir: &Path, scope: PlaylistScope) -> String {
    let tmpl = match scope {
        PlaylistScope::EntireCollection => COLLECTION_TEMPLATE,
        _ => SINGLE_TEMPLATE,
    };
    download_dir.join(tmpl).to_string_lossy().to_string()
}

/// Full downloader command line for a job:
/// `<tool> <url> -f <sel> [..] [--yes-playlist|--no-playlist] --external-downloader <acc>
///  --external-downloader-args <args> -o <template> --no-mtime --progress`
pub fn download_invocation(job: &Job, settings: &Settings) -> ToolInvocation {
    let scope = if job.originates_from_collection {
        PlaylistScope::SingleItem
    } else {
        job.playlist_scope
    };

    let mut inv = ToolInvocation::new(settings.downloader_path.clone())
        .arg(job.source_url.clone())
        .args(format_args(job, settings));
    if let Some(flag) = playlist_flag(job) {
        inv = inv.arg(flag);
    }
    inv.args([
        "--external-downloader".to_string(),
        settings.accelerator_path.clone(),
        "--external-downloader-args".into(),
        settings.accelerator_args.clone(),
        "-o".into(),
        output_template(Path::new(&settings.download_directory), scope),
        "--no-mtime".into(),
        "--progress".into(),
    ])
}

/// Flat listing of a collection, one JSON object per line.
pub fn collection_listing_invocation(tool: &str, url: &str) -> ToolInvocation {
    ToolInvocation::new(tool).args(["--flat-playlist", "--dump-json", url])
}

pub fn title_invocation(tool: &str, url: &str) -> ToolInvocation {
    ToolInvocation::new(tool).args(["--skip-download", "--no-playlist", "--print", "title", url])
}
