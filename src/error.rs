// Error types for the sync core.
// Covers transport failures, session loss, validation, and persistence errors.

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum SyncError {
    #[error("Not authenticated: no usable access credential")]
    Unauthenticated,

    #[error("Session expired: credential refresh failed")]
    SessionExpired,

    #[error("Network unavailable")]
    NetworkUnavailable,

    #[error("Request failed: {0}")]
    RequestFailed(String),

    #[error("Validation failed: {0}")]
    ValidationFailed(String),

    /// Not a failure: the key has no cached entry yet and a load is needed.
    #[error("Cache miss")]
    CacheMiss,

    #[error("JSON error: {0}")]
    Json(String),

    #[error("IO error: {0}")]
    Io(String),

    #[error("Config error: {0}")]
    Config(String),
}

impl SyncError {
    /// Whether this error ends the current session.
    /// Only a failed refresh is fatal; everything else may be retried.
    pub fn is_fatal(&self) -> bool {
        matches!(self, SyncError::SessionExpired)
    }

    /// Whether the request never reached the server.
    pub fn is_offline(&self) -> bool {
        matches!(self, SyncError::NetworkUnavailable)
    }
}

// Errors are cloned into cache entries and shared refresh results, so the
// non-Clone sources are flattened to their messages.
impl From<serde_json::Error> for SyncError {
    fn from(err: serde_json::Error) -> Self {
        SyncError::Json(err.to_string())
    }
}

impl From<std::io::Error> for SyncError {
    fn from(err: std::io::Error) -> Self {
        SyncError::Io(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, SyncError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_session_expired_is_fatal() {
        assert!(SyncError::SessionExpired.is_fatal());
        assert!(!SyncError::Unauthenticated.is_fatal());
        assert!(!SyncError::NetworkUnavailable.is_fatal());
        assert!(!SyncError::RequestFailed("boom".into()).is_fatal());
    }

    #[test]
    fn test_json_error_converts() {
        let err = serde_json::from_str::<serde_json::Value>("{not json").unwrap_err();
        let sync: SyncError = err.into();
        assert!(matches!(sync, SyncError::Json(_)));
    }
}
