//! Error types for the skyclf-core crate.
//!
//! "Not ready" states (no model trained yet, no idle template captured) are
//! absent here: they surface as `Ok(None)` or as no-ops.

use thiserror::Error;

/// Top-level error type for model lifecycle operations.
#[derive(Debug, Error)]
pub enum SkyError {
    /// Start while a run is active, or stop while idle. No state was mutated.
    #[error("{0}")]
    Conflict(String),

    /// A container platform call failed.
    #[error("Container platform error: {0}")]
    Remote(String),

    /// Broken model export: malformed `classes.json`, index gaps, and so on.
    #[error("Model data corrupt: {0}")]
    DataCorruption(String),

    /// Nonzero training exit code. Recorded in job state, never raised by `start()`.
    #[error("training failed with exit code {0}")]
    JobFailure(i64),

    #[error("Inference error: {0}")]
    Inference(String),

    #[error("Preprocess error: {0}")]
    Preprocess(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Cancelled: {0}")]
    Cancelled(String),

    #[error("Inference engine is closed")]
    Closed,

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Image decode error: {0}")]
    Image(#[from] image::ImageError),
}

impl SkyError {
    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict(msg.into())
    }

    pub fn remote(msg: impl Into<String>) -> Self {
        Self::Remote(msg.into())
    }

    pub fn corrupt(msg: impl Into<String>) -> Self {
        Self::DataCorruption(msg.into())
    }

    pub fn inference(msg: impl Into<String>) -> Self {
        Self::Inference(msg.into())
    }

    pub fn invalid_input(msg: impl Into<String>) -> Self {
        Self::InvalidInput(msg.into())
    }

    /// True for errors that say "the orchestrator refused", as opposed to
    /// "something broke".
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_failure_message() {
        assert_eq!(
            SkyError::JobFailure(2).to_string(),
            "training failed with exit code 2"
        );
    }

    #[test]
    fn test_conflict_displays_bare_message() {
        let err = SkyError::conflict("no training in progress");
        assert_eq!(err.to_string(), "no training in progress");
        assert!(err.is_conflict());
        assert!(!SkyError::remote("boom").is_conflict());
    }
}
