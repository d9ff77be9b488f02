use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    /// Collection enumeration failed; the session is not started.
    #[error("could not list collection contents for {url}: {message}")]
    MetadataFetch { url: String, message: String },

    /// Per-item title lookup failed; the drain loop skips the job and continues.
    #[error("could not fetch title for {url}: {message}")]
    TitleFetch { url: String, message: String },

    /// The tool is missing or not executable; never retried automatically.
    #[error("{message}")]
    ProcessLaunch { message: String },

    #[error("download failed: {message}")]
    DownloadFailed { message: String, code: Option<i32> },

    #[error("not a usable url: {0:?}")]
    InvalidUrl(String),

    #[error("invalid settings: {0}")]
    Settings(String),

    #[error("download manager is not running")]
    ManagerStopped,

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl EngineError {
    /// Failures worth another attempt without changing anything.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            EngineError::DownloadFailed { .. } | EngineError::TitleFetch { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;
