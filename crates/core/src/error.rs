//! Error types for CloudRepl.

use thiserror::Error;

/// Result type alias using CloudRepl's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Core error type for CloudRepl.
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // Container engine
    // =========================================================================
    #[error("Container engine unavailable: {0}")]
    EngineUnavailable(String),

    #[error("Sandbox not found: {0}")]
    SandboxNotFound(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Failed to pull image '{image}': {reason}")]
    ImagePullFailure { image: String, reason: String },

    #[error("Invalid resource limits: {0}")]
    ResourceLimitInvalid(String),

    // =========================================================================
    // Streams
    // =========================================================================
    #[error("Incomplete frame: {0}")]
    IncompleteFrame(String),

    #[error("Unexpected stat output: {0:?}")]
    StatParseError(String),

    #[error("Stream error: {0}")]
    Stream(String),

    #[error("Interactive session already attached to sandbox {0}")]
    AlreadyAttached(String),

    // =========================================================================
    // Requests
    // =========================================================================
    #[error("User not found: {0}")]
    UserNotFound(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Operation cancelled: {0}")]
    Cancelled(String),

    // =========================================================================
    // Generic Errors
    // =========================================================================
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl Error {
    /// Create an engine unavailable error.
    pub fn engine_unavailable(msg: impl Into<String>) -> Self {
        Self::EngineUnavailable(msg.into())
    }

    /// Create a sandbox not found error.
    pub fn sandbox_not_found(id: impl Into<String>) -> Self {
        Self::SandboxNotFound(id.into())
    }

    /// Create a not found error.
    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound(what.into())
    }

    /// Create an image pull failure.
    pub fn image_pull(image: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::ImagePullFailure {
            image: image.into(),
            reason: reason.into(),
        }
    }

    /// Create a resource limit error.
    pub fn resource_limit(msg: impl Into<String>) -> Self {
        Self::ResourceLimitInvalid(msg.into())
    }

    /// Create an incomplete frame error.
    pub fn incomplete_frame(msg: impl Into<String>) -> Self {
        Self::IncompleteFrame(msg.into())
    }

    /// Create a stream error.
    pub fn stream(msg: impl Into<String>) -> Self {
        Self::Stream(msg.into())
    }

    /// Create an invalid request error.
    pub fn invalid_request(msg: impl Into<String>) -> Self {
        Self::InvalidRequest(msg.into())
    }

    /// Create a cancellation error.
    pub fn cancelled(what: impl Into<String>) -> Self {
        Self::Cancelled(what.into())
    }

    /// Create an internal error.
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Whether the error means the addressed sandbox (or object) is gone.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::SandboxNotFound(_) | Self::NotFound(_))
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Self::Stream(err.to_string())
    }
}

impl From<config::ConfigError> for Error {
    fn from(err: config::ConfigError) -> Self {
        Self::Config(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_errors_become_stream_errors() {
        let err: Error = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe closed").into();
        assert!(matches!(err, Error::Stream(_)));
        assert!(err.to_string().contains("pipe closed"));
    }

    #[test]
    fn test_not_found_classification() {
        assert!(Error::sandbox_not_found("abc").is_not_found());
        assert!(Error::not_found("abc").is_not_found());
        assert!(!Error::engine_unavailable("down").is_not_found());
    }

    #[test]
    fn test_stat_parse_error_shows_raw_output() {
        let err = Error::StatParseError("garbage\n".into());
        assert_eq!(err.to_string(), "Unexpected stat output: \"garbage\\n\"");
    }
}
