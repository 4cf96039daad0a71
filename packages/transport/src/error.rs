// ABOUTME: Transport error types
// ABOUTME: Remote status failures, connection faults, timeouts, and protocol violations

use thiserror::Error;

/// Result type for transport operations
pub type Result<T> = std::result::Result<T, TransportError>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// The remote answered with a non-success status
    #[error("HTTP {status}: {message}")]
    Status { status: u16, message: String },

    /// Connection could not be established or was reset
    #[error("Network error: {0}")]
    Network(String),

    #[error("Request timed out")]
    Timeout,

    /// The remote broke the framing or payload contract
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// The request could not be built locally
    #[error("Invalid request: {0}")]
    InvalidRequest(String),
}

impl TransportError {
    pub fn status(status: u16, message: impl Into<String>) -> Self {
        Self::Status {
            status,
            message: message.into(),
        }
    }

    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }

    /// HTTP-style status code, when the remote produced one
    pub fn status_code(&self) -> Option<u16> {
        match self {
            TransportError::Status { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// Failures worth another attempt: resets and server-side faults
    pub fn is_transient(&self) -> bool {
        match self {
            TransportError::Network(_) => true,
            TransportError::Status { status, .. } => *status >= 500 && *status != 501,
            _ => false,
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.status_code() == Some(404)
    }

    pub fn is_conflict(&self) -> bool {
        self.status_code() == Some(409)
    }
}

impl From<reqwest::Error> for TransportError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            TransportError::Timeout
        } else if err.is_builder() {
            TransportError::InvalidRequest(err.to_string())
        } else if let Some(status) = err.status() {
            TransportError::Status {
                status: status.as_u16(),
                message: err.to_string(),
            }
        } else {
            TransportError::Network(err.to_string())
        }
    }
}

impl From<serde_json::Error> for TransportError {
    fn from(err: serde_json::Error) -> Self {
        TransportError::Protocol(format!("invalid JSON payload: {}", err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(TransportError::Network("reset".into()), true)]
    #[case(TransportError::status(500, "boom"), true)]
    #[case(TransportError::status(503, "unavailable"), true)]
    #[case(TransportError::status(501, "unimplemented"), false)]
    #[case(TransportError::status(404, "missing"), false)]
    #[case(TransportError::status(429, "slow down"), false)]
    #[case(TransportError::Timeout, false)]
    #[case(TransportError::protocol("bad frame"), false)]
    fn test_transient_classification(#[case] err: TransportError, #[case] transient: bool) {
        assert_eq!(err.is_transient(), transient);
    }

    #[test]
    fn test_status_display_is_verbatim() {
        let err = TransportError::status(400, "template 'nope' not found");
        assert_eq!(err.to_string(), "HTTP 400: template 'nope' not found");
        assert_eq!(err.status_code(), Some(400));
        assert!(!err.is_not_found());
        assert!(TransportError::status(404, "x").is_not_found());
        assert!(TransportError::status(409, "x").is_conflict());
    }
}
