//! Unified error types for scriba.
//!
//! Pipeline orchestration code uses `anyhow::Result` with context; this
//! enum is the boundary type that RPCs and the worker's failure
//! classification speak. Each variant carries a fixed retryability so a
//! failed job is either re-dispatched by the coordinator or poisoned on
//! the first attempt.

/// Top-level error type for scriba operations.
#[derive(Debug, thiserror::Error)]
pub enum ScribaError {
    /// A blob or job that should exist does not.
    #[error("not found: {0}")]
    NotFound(String),

    /// Disk or filesystem failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Network failure talking to the coordinator or a collaborator.
    #[error("HTTP error: {0}")]
    Http(String),

    /// Heartbeat or commit was rejected; the lease moved on.
    #[error("lease lost")]
    LeaseLost,

    /// The audio container could not be probed or extracted.
    #[error("audio decode error: {0}")]
    AudioDecode(String),

    /// The speech decoder failed on at least one chunk.
    #[error("decode error: {0}")]
    Decode(String),

    /// Structural invariant violation while merging segments.
    #[error("merge error: {0}")]
    Merge(String),

    /// Formatter or summarizer collaborator failed (best-effort, callers
    /// log and continue).
    #[error("external tool error: {0}")]
    ExternalTool(String),

    /// Configuration errors.
    #[error("configuration error: {0}")]
    Config(String),

    /// Generic error.
    #[error("{0}")]
    Other(String),
}

impl ScribaError {
    /// Create a configuration error.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a generic error.
    pub fn other(msg: impl Into<String>) -> Self {
        Self::Other(msg.into())
    }

    /// Whether the coordinator should re-dispatch a job that failed with
    /// this error.
    ///
    /// `LeaseLost` is not retryable from the worker's point of view: the
    /// current attempt is dead, but no `fail` RPC is sent because the
    /// coordinator already reclaimed the job.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Io(_) | Self::Http(_) | Self::Decode(_) => true,
            Self::NotFound(_)
            | Self::LeaseLost
            | Self::AudioDecode(_)
            | Self::Merge(_)
            | Self::ExternalTool(_)
            | Self::Config(_)
            | Self::Other(_) => false,
        }
    }
}

/// Convenience result type using ScribaError.
pub type Result<T> = std::result::Result<T, ScribaError>;

impl From<anyhow::Error> for ScribaError {
    fn from(err: anyhow::Error) -> Self {
        match err.downcast::<ScribaError>() {
            Ok(e) => e,
            Err(err) => ScribaError::Other(format!("{err:#}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryability_matches_taxonomy() {
        assert!(ScribaError::Decode("chunk 3".into()).is_retryable());
        assert!(ScribaError::Http("timeout".into()).is_retryable());
        assert!(!ScribaError::AudioDecode("bad header".into()).is_retryable());
        assert!(!ScribaError::Merge("coverage".into()).is_retryable());
        assert!(!ScribaError::LeaseLost.is_retryable());
    }

    #[test]
    fn anyhow_downcast_preserves_variant() {
        let err: anyhow::Error = ScribaError::LeaseLost.into();
        let back: ScribaError = err.into();
        assert!(matches!(back, ScribaError::LeaseLost));
    }
}
