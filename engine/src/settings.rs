use serde::{Deserialize, Serialize};
use std::{
    fs,
    path::{Path, PathBuf},
};
use uuid::Uuid;

use crate::download::supervisor::OutputMode;
use crate::error::{EngineError, Result};

pub const APP_DIR_NAME: &str = "aria-downloader";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub download_directory: String,
    /// Height cap used for video jobs (720, or 1080 with the "1080p" toggle).
    pub video_height_cap: u32,
    /// Container for audio-only extraction.
    pub audio_format: String,
    pub embed_thumbnail: bool,
    pub downloader_path: String,
    pub accelerator_path: String,
    pub accelerator_args: String,
    pub output_mode: OutputMode,
    /// Requeue a failed download once before giving up.
    pub retry_failed_once: bool,
    pub poll_interval_ms: u64,
    /// Overrides the default `history.json` next to settings.json.
    pub history_file: Option<String>,
    pub debug_logs: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            download_directory: default_download_dir().to_string_lossy().to_string(),
            video_height_cap: 720,
            audio_format: "mp3".into(),
            embed_thumbnail: false,
            downloader_path: "yt-dlp".into(),
            accelerator_path: "aria2c".into(),
            accelerator_args: "-x 16 -k 1M".into(),
            output_mode: OutputMode::Merged,
            retry_failed_once: true,
            poll_interval_ms: 100,
            history_file: None,
            debug_logs: false,
        }
    }
}

impl Settings {
    pub fn history_path(&self) -> PathBuf {
        match self.history_file.as_deref().map(str::trim) {
            Some(p) if !p.is_empty() => PathBuf::from(p),
            _ => app_support_dir().join("history.json"),
        }
    }
}

/// Where we store settings.json:
///   ~/Library/Application Support/aria-downloader (macOS)
///   ~/.config/aria-downloader (Linux)
///   %APPDATA%\aria-downloader (Windows)
pub fn app_support_dir() -> PathBuf {
    let base = dirs::config_dir().unwrap_or_else(|| dirs::home_dir().unwrap_or_default());
    base.join(APP_DIR_NAME)
}

pub fn settings_json_path() -> PathBuf {
    app_support_dir().join("settings.json")
}

fn default_download_dir() -> PathBuf {
    // Cross-platform Downloads folder (dirs::download_dir handles win/mac/linux)
    dirs::download_dir()
        .or_else(dirs::home_dir)
        .unwrap_or_else(|| PathBuf::from("/"))
}

fn dir_is_writable(p: &Path) -> bool {
    if !p.exists() || !p.is_dir() {
        return false;
    }
    let test = p.join(format!(".writecheck-{}.tmp", Uuid::new_v4()));
    match fs::OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(&test)
    {
        Ok(_) => {
            let _ = fs::remove_file(test);
            true
        }
        Err(_) => false,
    }
}

/// Validate a candidate directory. If invalid, return the default Downloads dir (and try to create it).
fn validated_download_dir<S: Into<String>>(candidate: S) -> String {
    let cand = candidate.into();
    let mut path = PathBuf::from(cand.trim());

    if path.as_os_str().is_empty() || !path.is_absolute() {
        path = default_download_dir();
    }

    if !path.exists() && fs::create_dir_all(&path).is_err() {
        path = default_download_dir();
        let _ = fs::create_dir_all(&path);
    }

    if !dir_is_writable(&path) {
        let d = default_download_dir();
        let _ = fs::create_dir_all(&d);
        return d.to_string_lossy().to_string();
    }

    path.to_string_lossy().to_string()
}

/// Load settings from the default location.
pub fn load_settings() -> Settings {
    load_settings_from(&settings_json_path())
}

/// Load settings from JSON, **validate the download path**, and persist any fixups.
/// A missing or unreadable file yields defaults.
pub fn load_settings_from(path: &Path) -> Settings {
    if let Some(parent) = path.parent() {
        let _ = fs::create_dir_all(parent);
    }

    let mut settings = match fs::read_to_string(path) {
        Ok(s) => serde_json::from_str::<Settings>(&s).unwrap_or_else(|e| {
            tracing::warn!("settings file {} is invalid ({e}); using defaults", path.display());
            Settings::default()
        }),
        Err(_) => Settings::default(),
    };

    let fixed_dir = validated_download_dir(&settings.download_directory);
    if settings.download_directory != fixed_dir {
        tracing::info!(
            "download directory '{}' unusable; using '{}'",
            settings.download_directory,
            fixed_dir
        );
        settings.download_directory = fixed_dir;
    }
    if settings.video_height_cap == 0 {
        settings.video_height_cap = Settings::default().video_height_cap;
    }
    if settings.poll_interval_ms == 0 {
        settings.poll_interval_ms = Settings::default().poll_interval_ms;
    }

    // Persist the clean copy (also migrates any old/invalid file)
    if let Ok(body) = serde_json::to_string_pretty(&settings) {
        let _ = fs::write(path, body);
    }

    settings
}

/// Save settings back to JSON (and ensure the target directory exists).
/// The download directory is validated; an invalid one falls back to the default Downloads path.
pub fn save_settings_to(path: &Path, settings: &Settings) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .map_err(|e| EngineError::Settings(format!("failed to create settings dir: {e}")))?;
    }
    if settings.downloader_path.trim().is_empty() {
        return Err(EngineError::Settings("downloader path is empty".into()));
    }

    let to_write = Settings {
        download_directory: validated_download_dir(&settings.download_directory),
        ..settings.clone()
    };

    let body = serde_json::to_string_pretty(&to_write)?;
    fs::write(path, body)?;
    Ok(())
}
