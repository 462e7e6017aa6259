use thiserror::Error;

/// Typed application error hierarchy for the public API surface.
///
/// Internal layers (database, file plumbing) use `anyhow`; everything that
/// crosses the crate boundary is folded into one of these variants so callers
/// can match on the failure class.
#[derive(Debug, Error)]
pub enum AppError {
    /// A segment upload attempt failed for a network-class reason. Retried
    /// locally by the upload manager; only surfaces once the retry budget is
    /// exhausted.
    #[error("upload failed: {0}")]
    Transport(String),

    /// Finalization was requested but the received segments do not cover the
    /// full `0..expected` range.
    #[error("incomplete upload: missing segment(s) {missing:?} of {expected}")]
    IncompleteUpload { expected: u32, missing: Vec<u32> },

    /// A pipeline stage failed. Prior stage outputs are preserved; the run
    /// can be resumed from this stage.
    #[error("stage {stage} failed: {detail}")]
    StageFailed { stage: String, detail: String },

    /// The audio artifact failed validation before any heavy stage ran.
    #[error("invalid audio: {0}")]
    InvalidAudio(String),

    #[error("{0}")]
    Database(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("{0}")]
    Io(String),

    #[error("{0}")]
    Json(String),

    #[error("{0}")]
    Audio(String),

    #[error("{0}")]
    Other(String),
}

impl AppError {
    /// True for failures the upload manager treats as retryable.
    pub fn is_transient(&self) -> bool {
        matches!(self, AppError::Transport(_))
    }
}

// ── From impls ─────────────────────────────────────────────────────────────

impl From<anyhow::Error> for AppError {
    fn from(e: anyhow::Error) -> Self {
        AppError::Database(e.to_string())
    }
}

impl From<rusqlite::Error> for AppError {
    fn from(e: rusqlite::Error) -> Self {
        AppError::Database(e.to_string())
    }
}

impl From<std::io::Error> for AppError {
    fn from(e: std::io::Error) -> Self {
        AppError::Io(e.to_string())
    }
}

impl From<serde_json::Error> for AppError {
    fn from(e: serde_json::Error) -> Self {
        AppError::Json(e.to_string())
    }
}

impl From<hound::Error> for AppError {
    fn from(e: hound::Error) -> Self {
        AppError::Audio(e.to_string())
    }
}

impl From<reqwest::Error> for AppError {
    fn from(e: reqwest::Error) -> Self {
        AppError::Transport(e.to_string())
    }
}

/// Allows `.map_err(|e| format!("…", e))?` to coerce into AppError without
/// changing the call sites.
impl From<String> for AppError {
    fn from(s: String) -> Self {
        AppError::Other(s)
    }
}

/// Allows `.ok_or("literal string")?` to coerce into AppError.
impl From<&str> for AppError {
    fn from(s: &str) -> Self {
        AppError::Other(s.to_string())
    }
}
