// ABOUTME: Error types for sandbox operations
// ABOUTME: Remote rejections, timeouts, lifecycle violations, and local validation failures

use skiff_config::ConfigError;
use skiff_transport::TransportError;
use thiserror::Error;

/// Main error type for sandbox operations
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SandboxError {
    /// The platform rejected the request; status and message are passed through verbatim
    #[error("API error ({status}): {message}")]
    Api { status: u16, message: String },

    /// A client-side deadline elapsed
    #[error("Operation timed out")]
    Timeout,

    /// The sandbox, process, or path does not exist (or no longer does)
    #[error("Not found: {resource}")]
    NotFound { resource: String },

    /// The operation is not allowed in the current lifecycle or entry state
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Code execution was requested on a template without an interpreter
    #[error("Template '{template}' does not provide a code interpreter")]
    UnsupportedTemplate { template: String },

    /// Arguments were rejected before anything was sent
    #[error("Validation error: {0}")]
    Validation(String),

    /// Connection-level failure that outlived the retry budget, or an undecodable payload
    #[error("Transport error: {0}")]
    Transport(TransportError),
}

/// Type alias for Results that return SandboxError
pub type Result<T> = std::result::Result<T, SandboxError>;

impl SandboxError {
    pub fn not_found(resource: impl Into<String>) -> Self {
        Self::NotFound {
            resource: resource.into(),
        }
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Remote status, for errors that came from the platform
    pub fn status(&self) -> Option<u16> {
        match self {
            SandboxError::Api { status, .. } => Some(*status),
            SandboxError::Transport(err) => err.status_code(),
            _ => None,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, SandboxError::NotFound { .. })
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, SandboxError::Timeout)
    }

    /// Map a transport failure, turning a remote 404 into `NotFound` for `resource`
    pub(crate) fn from_transport_for(err: TransportError, resource: impl Into<String>) -> Self {
        if err.is_not_found() {
            Self::not_found(resource)
        } else {
            err.into()
        }
    }
}

impl From<TransportError> for SandboxError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::Status { status, message } => SandboxError::Api { status, message },
            TransportError::Timeout => SandboxError::Timeout,
            TransportError::InvalidRequest(msg) => SandboxError::Validation(msg),
            other => SandboxError::Transport(other),
        }
    }
}

impl From<ConfigError> for SandboxError {
    fn from(err: ConfigError) -> Self {
        SandboxError::Validation(err.to_string())
    }
}

impl From<serde_json::Error> for SandboxError {
    fn from(err: serde_json::Error) -> Self {
        SandboxError::Transport(err.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_status_errors_pass_through_verbatim() {
        let err: SandboxError = TransportError::status(400, "template 'nope' not found").into();
        assert_eq!(
            err,
            SandboxError::Api {
                status: 400,
                message: "template 'nope' not found".to_string()
            }
        );
        assert_eq!(err.status(), Some(400));
    }

    #[test]
    fn test_transport_mapping() {
        assert_eq!(SandboxError::from(TransportError::Timeout), SandboxError::Timeout);
        assert!(matches!(
            SandboxError::from(TransportError::Network("reset".into())),
            SandboxError::Transport(TransportError::Network(_))
        ));
        assert!(matches!(
            SandboxError::from(TransportError::protocol("bad frame")),
            SandboxError::Transport(_)
        ));
    }

    #[test]
    fn test_not_found_for_resource() {
        let err = SandboxError::from_transport_for(TransportError::status(404, "gone"), "sandbox abc");
        assert_eq!(err.to_string(), "Not found: sandbox abc");
        assert!(err.is_not_found());

        let err = SandboxError::from_transport_for(TransportError::status(500, "boom"), "sandbox abc");
        assert_eq!(err.status(), Some(500));
    }

    #[test]
    fn test_missing_credentials_is_validation() {
        let err: SandboxError = ConfigError::MissingApiKey.into();
        assert!(matches!(err, SandboxError::Validation(msg) if msg.contains("E2B_API_KEY")));
    }

    #[test]
    fn test_errors_are_send_sync() {
        fn assert_send_sync<T: Send + Sync + 'static>() {}
        assert_send_sync::<SandboxError>();
    }
}
