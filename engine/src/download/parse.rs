//! Line classifier for yt-dlp output.
//!
//! Every line the downloader prints goes through [`parse_line`], which tries an
//! ordered table of matchers and returns at most one [`ProgressEvent`]. Nothing
//! in here fails: a line that looks like progress but carries garbage numbers
//! comes back as a plain log line.

use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type")]
pub enum ProgressEvent {
    /// "Downloading item K of N" inside a playlist run.
    StageChanged { index: u32, total: u32 },
    DestinationKnown { path: String },
    Progress {
        percent: f32,
        size_text: String,
        speed_text: String,
    },
    /// Merged or extracted output file; the file that lands in history.
    Finalized { output_path: String },
    LogLine { text: String },
    Failed { message: String },
    Cancelled,
    Completed,
}

impl ProgressEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ProgressEvent::Failed { .. } | ProgressEvent::Cancelled | ProgressEvent::Completed
        )
    }
}

type Matcher = fn(&Captures<'_>) -> Option<ProgressEvent>;

static STAGE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\[download\] Downloading (?:item|video) (\S+) of (\S+)").unwrap());
static DESTINATION_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\[download\] Destination: (.+)$").unwrap());
static PROGRESS_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^\[download\]\s+(\S+)% of\s+~?\s*(.+?)\s+at\s+(.+?)\s+ETA").unwrap()
});
static FINAL_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"^(?:\[Merger\] Merging formats into "(.+)"|\[ExtractAudio\] Destination: (.+))$"#)
        .unwrap()
});

/// Tried in order; first regex that matches decides the line.
static MATCHERS: Lazy<[(&'static Regex, Matcher); 4]> = Lazy::new(|| {
    [
        (&*STAGE_RE, stage as Matcher),
        (&*DESTINATION_RE, destination as Matcher),
        (&*PROGRESS_RE, progress as Matcher),
        (&*FINAL_RE, finalized as Matcher),
    ]
});

/// Classify one line of downloader output. Blank lines produce nothing.
pub fn parse_line(line: &str) -> Option<ProgressEvent> {
    let line = line.trim_end_matches(['\r', '\n']);
    if line.trim().is_empty() {
        return None;
    }
    let line = line.trim_start();

    for (re, matcher) in MATCHERS.iter() {
        if let Some(caps) = re.captures(line) {
            return Some(matcher(&caps).unwrap_or_else(|| log_line(line)));
        }
    }
    Some(log_line(line))
}

/// Base name of an output path, as shown in status lines and history.
/// Accepts both separators since the tool may run on either platform.
pub fn derive_title(path: &str) -> String {
    let trimmed = path.trim().trim_matches('"');
    trimmed
        .rsplit(['/', '\\'])
        .find(|s| !s.is_empty())
        .unwrap_or(trimmed)
        .to_string()
}

fn log_line(line: &str) -> ProgressEvent {
    ProgressEvent::LogLine {
        text: line.trim().to_string(),
    }
}

fn stage(caps: &Captures<'_>) -> Option<ProgressEvent> {
    let index: u32 = caps.get(1)?.as_str().parse().ok()?;
    let total: u32 = caps.get(2)?.as_str().parse().ok()?;
    if index == 0 || total == 0 || index > total {
        return None;
    }
    Some(ProgressEvent::StageChanged { index, total })
}

fn destination(caps: &Captures<'_>) -> Option<ProgressEvent> {
    let path = caps.get(1)?.as_str().trim();
    (!path.is_empty()).then(|| ProgressEvent::DestinationKnown {
        path: path.to_string(),
    })
}

fn progress(caps: &Captures<'_>) -> Option<ProgressEvent> {
    let percent: f32 = caps.get(1)?.as_str().parse().ok()?;
    if !percent.is_finite() || !(0.0..=100.0).contains(&percent) {
        return None;
    }
    let size_text = caps.get(2)?.as_str().trim();
    let speed_text = caps.get(3)?.as_str().trim();
    if size_text.is_empty() || speed_text.is_empty() {
        return None;
    }
    Some(ProgressEvent::Progress {
        percent,
        size_text: size_text.to_string(),
        speed_text: speed_text.to_string(),
    })
}

fn finalized(caps: &Captures<'_>) -> Option<ProgressEvent> {
    let path = caps.get(1).or_else(|| caps.get(2))?.as_str().trim();
    (!path.is_empty()).then(|| ProgressEvent::Finalized {
        output_path: path.to_string(),
    })
}

/// Human-readable cause from captured error text: the rest of the first line
/// that starts with `ERROR:`.
pub fn extract_error_message<'a, I>(lines: I) -> Option<String>
where
    I: IntoIterator<Item = &'a str>,
{
    lines.into_iter().find_map(|l| {
        let msg = l.trim_start().strip_prefix("ERROR:")?.trim();
        (!msg.is_empty()).then(|| msg.to_string())
    })
}
