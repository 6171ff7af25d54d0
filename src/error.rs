//! Error types for the Gatekeeper service.

use thiserror::Error;

/// Main error type for Gatekeeper operations.
#[derive(Error, Debug)]
pub enum GatekeeperError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// The check context is unusable; signals a caller integration bug.
    #[error("Invalid check context: {0}")]
    InvalidContext(String),

    /// Lookup of a named policy scope failed (admin surface only; checks fall
    /// back to the default policy instead).
    #[error("Policy not found for scope: {0}")]
    PolicyNotFound(String),

    /// The shared quota store could not be reached or rejected the operation.
    #[error("Quota store unavailable: {0}")]
    StoreUnavailable(String),

    /// A bounded call did not complete in time.
    #[error("Operation timed out after {0} ms")]
    Timeout(u64),

    /// gRPC server errors
    #[error("gRPC error: {0}")]
    Grpc(#[from] tonic::transport::Error),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl GatekeeperError {
    /// Whether this error means the central engine could not produce a verdict.
    ///
    /// Timeouts are treated exactly like an unreachable store.
    pub fn is_unavailable(&self) -> bool {
        matches!(
            self,
            GatekeeperError::StoreUnavailable(_) | GatekeeperError::Timeout(_) | GatekeeperError::Grpc(_)
        )
    }
}

impl From<redis::RedisError> for GatekeeperError {
    fn from(err: redis::RedisError) -> Self {
        GatekeeperError::StoreUnavailable(err.to_string())
    }
}

impl From<GatekeeperError> for tonic::Status {
    fn from(err: GatekeeperError) -> Self {
        match err {
            GatekeeperError::InvalidContext(msg) => tonic::Status::invalid_argument(msg),
            GatekeeperError::Config(msg) => tonic::Status::invalid_argument(msg),
            GatekeeperError::PolicyNotFound(scope) => {
                tonic::Status::not_found(format!("no policy for scope {scope}"))
            }
            GatekeeperError::StoreUnavailable(msg) => tonic::Status::unavailable(msg),
            GatekeeperError::Timeout(ms) => {
                tonic::Status::deadline_exceeded(format!("timed out after {ms} ms"))
            }
            other => tonic::Status::internal(other.to_string()),
        }
    }
}

/// Result type alias for Gatekeeper operations.
pub type Result<T> = std::result::Result<T, GatekeeperError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unavailable_classification() {
        assert!(GatekeeperError::StoreUnavailable("down".into()).is_unavailable());
        assert!(GatekeeperError::Timeout(50).is_unavailable());
        assert!(!GatekeeperError::InvalidContext("missing client_ip".into()).is_unavailable());
        assert!(!GatekeeperError::PolicyNotFound("/api".into()).is_unavailable());
    }

    #[test]
    fn test_status_mapping() {
        let status: tonic::Status = GatekeeperError::InvalidContext("bad".into()).into();
        assert_eq!(status.code(), tonic::Code::InvalidArgument);

        let status: tonic::Status = GatekeeperError::PolicyNotFound("/x".into()).into();
        assert_eq!(status.code(), tonic::Code::NotFound);

        let status: tonic::Status = GatekeeperError::Timeout(10).into();
        assert_eq!(status.code(), tonic::Code::DeadlineExceeded);
    }
}
