use once_cell::sync::OnceCell;
use std::path::PathBuf;

use tracing_appender::{
    non_blocking::{self, WorkerGuard},
    rolling::RollingFileAppender,
};
use tracing_subscriber::{
    filter::LevelFilter, fmt, prelude::*, reload, util::SubscriberInitExt, EnvFilter,
};

use crate::settings::APP_DIR_NAME;

const LOG_FILE: &str = "engine.log";
const KEEP_LOGS: usize = 10;

static FILE_FILTER_HANDLE: OnceCell<reload::Handle<EnvFilter, tracing_subscriber::Registry>> =
    OnceCell::new();
static _GUARD: OnceCell<WorkerGuard> = OnceCell::new(); // keep writer alive

pub fn log_dir() -> PathBuf {
    // ~/Library/Application Support/aria-downloader/logs (macOS)
    // ~/.config/aria-downloader/logs (Linux)
    // %APPDATA%\aria-downloader\logs (Windows)
    let base = dirs::config_dir().unwrap_or_else(|| dirs::home_dir().unwrap_or_default());
    base.join(APP_DIR_NAME).join("logs")
}

/// File filter: `RUST_LOG` when set, else info (raw tool lines need `yt-dlp=debug`).
fn file_filter(enabled: bool) -> EnvFilter {
    if !enabled {
        return EnvFilter::new("off");
    }
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Initialize the global subscriber. Call once at startup; later calls are ignored.
pub fn init(file_enabled: bool) {
    init_with_console(file_enabled, LevelFilter::INFO);
}

pub fn init_with_console(file_enabled: bool, console_level: LevelFilter) {
    if FILE_FILTER_HANDLE.get().is_some() {
        return;
    }
    let dir = log_dir();
    let _ = std::fs::create_dir_all(&dir);

    // Daily rotation; rotated copies get a date suffix.
    let file_appender: RollingFileAppender = tracing_appender::rolling::daily(&dir, LOG_FILE);
    let (nb_writer, guard): (non_blocking::NonBlocking, WorkerGuard) =
        tracing_appender::non_blocking(file_appender);

    let _ = _GUARD.set(guard);

    let console = fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_level(true)
        .with_line_number(false)
        .with_thread_ids(false)
        .with_ansi(true);

    // File layer: no ANSI, target + line for debugging.
    let file_layer = fmt::layer()
        .with_writer(nb_writer)
        .with_ansi(false)
        .with_target(true)
        .with_level(true)
        .with_line_number(true);

    let (reloadable_filter, handle) = reload::Layer::new(file_filter(file_enabled));
    let _ = FILE_FILTER_HANDLE.set(handle);

    // the reloadable layer has to sit directly on the Registry
    let installed = tracing_subscriber::registry()
        .with(file_layer.with_filter(reloadable_filter))
        .with(console.with_filter(console_level))
        .try_init();
    if installed.is_err() {
        // someone else (a test harness) owns the global subscriber
        return;
    }

    prune_old_logs(&dir);
}

/// Enable/disable file logging after startup.
pub fn set_file_logging_enabled(enabled: bool) {
    if let Some(h) = FILE_FILTER_HANDLE.get() {
        let _ = h.modify(|f| *f = file_filter(enabled));
    }
}

/// Keep the newest rotated logs, delete the rest.
fn prune_old_logs(dir: &std::path::Path) {
    use std::fs;

    let Ok(entries) = fs::read_dir(dir) else {
        return;
    };

    let mut files: Vec<_> = entries
        .flatten()
        .filter(|e| e.file_type().map(|t| t.is_file()).unwrap_or(false))
        .filter(|e| e.file_name().to_string_lossy().starts_with(LOG_FILE))
        .collect();

    files.sort_by_key(|e| e.metadata().and_then(|m| m.modified()).ok()); // oldest first

    if files.len() > KEEP_LOGS {
        let excess = files.len() - KEEP_LOGS;
        for e in files.iter().take(excess) {
            let _ = fs::remove_file(e.path());
        }
    }
}
