use chrono::{Local, NaiveDateTime, Timelike};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use tempfile::NamedTempFile;

use crate::error::Result;

/// One completed download as written to `history.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub title: String,
    #[serde(rename = "date", with = "history_date")]
    pub completed_at: NaiveDateTime,
    #[serde(rename = "url")]
    pub source_url: String,
}

impl HistoryEntry {
    /// Stamp an entry with the current local time (whole seconds, as persisted).
    pub fn now(title: impl Into<String>, source_url: impl Into<String>) -> Self {
        let now = Local::now().naive_local();
        HistoryEntry {
            title: title.into(),
            completed_at: now.with_nanosecond(0).unwrap_or(now),
            source_url: source_url.into(),
        }
    }
}

mod history_date {
    use chrono::NaiveDateTime;
    use serde::{self, Deserialize, Deserializer, Serializer};

    pub const FORMAT: &str = "%Y-%m-%d %H:%M:%S";

    pub fn serialize<S: Serializer>(date: &NaiveDateTime, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&date.format(FORMAT).to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<NaiveDateTime, D::Error> {
        let raw = String::deserialize(d)?;
        NaiveDateTime::parse_from_str(&raw, FORMAT).map_err(serde::de::Error::custom)
    }
}

/// Append-only log of completed jobs, rewritten in full on every change.
///
/// Only the consumer loop owns a `HistoryStore`, so writes never overlap.
#[derive(Debug)]
pub struct HistoryStore {
    path: PathBuf,
    entries: Vec<HistoryEntry>,
}

impl HistoryStore {
    /// Load the history file. A missing file is an empty history; a corrupt one is
    /// moved aside to `<name>.corrupt` and also treated as empty.
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let entries = match fs::read_to_string(&path) {
            Ok(body) if body.trim().is_empty() => Vec::new(),
            Ok(body) => match serde_json::from_str::<Vec<HistoryEntry>>(&body) {
                Ok(v) => v,
                Err(e) => {
                    tracing::warn!("history file {} is corrupt ({e}); starting empty", path.display());
                    let aside = corrupt_path(&path);
                    if let Err(e) = fs::rename(&path, &aside) {
                        tracing::warn!("could not move corrupt history aside: {e}");
                    }
                    Vec::new()
                }
            },
            Err(_) => Vec::new(),
        };
        tracing::debug!("loaded {} history entries from {}", entries.len(), path.display());
        HistoryStore { path, entries }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Entries in completion order.
    pub fn entries(&self) -> &[HistoryEntry] {
        &self.entries
    }

    /// Entries for display: most recent first.
    pub fn newest_first(&self) -> impl Iterator<Item = &HistoryEntry> {
        self.entries.iter().rev()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Append and persist immediately. On a write error the entry stays in memory
    /// and the next successful write includes it.
    pub fn append(&mut self, entry: HistoryEntry) -> Result<()> {
        tracing::info!("history += '{}' ({})", entry.title, entry.source_url);
        self.entries.push(entry);
        self.persist()
    }

    pub fn clear(&mut self) -> Result<()> {
        self.entries.clear();
        self.persist()
    }

    /// Write to a temp file in the same directory, then rename over the target.
    fn persist(&self) -> Result<()> {
        let dir = match self.path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        };
        fs::create_dir_all(&dir)?;

        let body = serde_json::to_string_pretty(&self.entries)?;
        let mut tmp = NamedTempFile::new_in(&dir)?;
        tmp.write_all(body.as_bytes())?;
        tmp.flush()?;
        tmp.as_file_mut().sync_all()?;
        tmp.persist(&self.path).map_err(|e| e.error)?;
        Ok(())
    }
}

fn corrupt_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_else(|| "history.json".into());
    name.push(".corrupt");
    path.with_file_name(name)
}
