use std::path::PathBuf;

/// Errors that can occur across the synod pipeline.
///
/// Each variant wraps a specific error domain. Library crates use this type
/// directly; the binary crate converts to `miette` diagnostics at the edge.
/// The orchestrator never matches variants individually — it acts on the
/// [`ErrorClass`] returned by [`SynodError::class`].
///
/// # Examples
///
/// ```
/// use synod_core::{ErrorClass, SynodError};
///
/// let err = SynodError::Timeout("model gpt-4o after 120s".into());
/// assert_eq!(err.class(), ErrorClass::Transient);
/// ```
#[derive(Debug, thiserror::Error)]
pub enum SynodError {
    /// Filesystem I/O failure.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Invalid or missing configuration.
    #[error("configuration error: {0}")]
    Config(String),

    /// Git operation failure (clone, checkout, push).
    #[error("git error: {0}")]
    Git(String),

    /// GitHub API failure.
    #[error("GitHub error: {0}")]
    Github(String),

    /// AI model API failure.
    #[error("model error: {0}")]
    Model(String),

    /// Static-analysis infrastructure failure.
    #[error("analysis error: {0}")]
    Analysis(String),

    /// Job store failure.
    #[error("database error: {0}")]
    Database(String),

    /// Tool or model output that could not be parsed.
    #[error("malformed output: {0}")]
    Malformed(String),

    /// An operation exceeded its deadline.
    #[error("timeout: {0}")]
    Timeout(String),

    /// A newer event superseded the work in flight.
    #[error("conflict: {0}")]
    Conflict(String),

    /// JSON serialization / deserialization failure.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// TOML deserialization failure.
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),

    /// A required file was not found.
    #[error("file not found: {}", .0.display())]
    FileNotFound(PathBuf),
}

/// Retry/propagation class of an error, acted on at the orchestrator
/// boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Likely to succeed on retry; backed off and retried up to the cap.
    Transient,
    /// Unparseable external output; degraded to a synthetic artifact,
    /// never retried and never a stage abort.
    Malformed,
    /// Not recoverable by retrying; the stage failure policy applies.
    Fatal,
    /// Supersession; aborts the job without marking it failed.
    Conflict,
}

impl SynodError {
    /// Classify this error for the orchestrator's retry policy.
    pub fn class(&self) -> ErrorClass {
        match self {
            SynodError::Io(_)
            | SynodError::Git(_)
            | SynodError::Github(_)
            | SynodError::Model(_)
            | SynodError::Timeout(_) => ErrorClass::Transient,
            SynodError::Malformed(_) => ErrorClass::Malformed,
            SynodError::Conflict(_) => ErrorClass::Conflict,
            _ => ErrorClass::Fatal,
        }
    }

    /// `true` when a retry with backoff is worthwhile.
    pub fn is_transient(&self) -> bool {
        self.class() == ErrorClass::Transient
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_error_converts_and_is_transient() {
        let io_err = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset");
        let err: SynodError = io_err.into();
        assert!(err.to_string().contains("reset"));
        assert!(err.is_transient());
    }

    #[test]
    fn classification_matches_taxonomy() {
        assert_eq!(
            SynodError::Model("503".into()).class(),
            ErrorClass::Transient
        );
        assert_eq!(
            SynodError::Malformed("not json".into()).class(),
            ErrorClass::Malformed
        );
        assert_eq!(
            SynodError::Config("missing token".into()).class(),
            ErrorClass::Fatal
        );
        assert_eq!(
            SynodError::Conflict("superseded".into()).class(),
            ErrorClass::Conflict
        );
        assert_eq!(
            SynodError::Database("locked".into()).class(),
            ErrorClass::Fatal
        );
    }

    #[test]
    fn display_carries_message() {
        let err = SynodError::Github("422 Unprocessable".into());
        assert_eq!(err.to_string(), "GitHub error: 422 Unprocessable");
    }

    #[test]
    fn file_not_found_shows_path() {
        let err = SynodError::FileNotFound(PathBuf::from("/tmp/synod.toml"));
        assert!(err.to_string().contains("/tmp/synod.toml"));
    }
}
