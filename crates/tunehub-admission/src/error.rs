//! Error types for admission control.

use thiserror::Error;

/// Errors that can occur in admission operations.
///
/// Evaluation itself never surfaces these to callers: in-memory limiters are
/// total, and store failures are folded into the verdict by the configured
/// [`FailurePolicy`](crate::config::FailurePolicy).
#[derive(Debug, Error)]
pub enum AdmissionError {
    /// A collaborator store (reputation store, access log) could not be reached.
    #[error("{store} unavailable: {message}")]
    StorageUnavailable {
        /// Which store failed.
        store: &'static str,
        /// Underlying failure description.
        message: String,
    },

    /// A client key was empty or malformed where a concrete key is required.
    #[error("invalid client key: {0:?}")]
    InvalidKey(String),

    /// A ban duration outside the accepted range.
    #[error("ban duration of {0} hours is out of range")]
    InvalidBanDuration(u32),

    /// Invalid configuration detected at startup.
    #[error("configuration error: {0}")]
    Config(String),

    /// Failed to serialize or deserialize persisted state.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Filesystem error.
    #[error("io error: {0}")]
    Io(String),
}

impl AdmissionError {
    /// Shorthand for a [`AdmissionError::StorageUnavailable`] error.
    pub fn storage(store: &'static str, message: impl Into<String>) -> Self {
        Self::StorageUnavailable {
            store,
            message: message.into(),
        }
    }
}

impl From<serde_json::Error> for AdmissionError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<std::io::Error> for AdmissionError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

/// Result type for admission operations.
pub type AdmissionResult<T> = Result<T, AdmissionError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_storage_unavailable() {
        let err = AdmissionError::storage("reputation store", "connection refused");
        let msg = err.to_string();
        assert!(msg.contains("reputation store"));
        assert!(msg.contains("connection refused"));
    }

    #[test]
    fn test_error_display_invalid_key() {
        let err = AdmissionError::InvalidKey(String::new());
        assert_eq!(err.to_string(), "invalid client key: \"\"");
    }

    #[test]
    fn test_error_display_invalid_ban_duration() {
        let err = AdmissionError::InvalidBanDuration(u32::MAX);
        assert!(err.to_string().contains("4294967295"));
    }

    #[test]
    fn test_error_display_config() {
        let err = AdmissionError::Config("window must be positive".into());
        assert!(err.to_string().contains("window must be positive"));
    }

    #[test]
    fn test_from_serde_json_error() {
        let json_err = serde_json::from_str::<u32>("nope").unwrap_err();
        let err: AdmissionError = json_err.into();
        assert!(matches!(err, AdmissionError::Serialization(_)));
    }

    #[test]
    fn test_from_io_error() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "missing");
        let err: AdmissionError = io_err.into();
        assert!(matches!(err, AdmissionError::Io(_)));
        assert!(err.to_string().contains("missing"));
    }
}
