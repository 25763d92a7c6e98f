//! Server error taxonomy

use crate::store::StoreError;
use tidings_cluster::{ClusterError, StatusCode};
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    /// Malformed name, oversized payload or a validator rejection
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("not found: {0}")]
    NotFound(String),

    /// Mailbox or queue full; the caller may retry later
    #[error("overloaded: {0}")]
    Backpressure(String),

    /// Topic is loading, unloading or moving between nodes
    #[error("ownership in transition: {0}")]
    OwnershipTransient(String),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("cluster error: {0}")]
    Cluster(#[from] ClusterError),

    #[error("session closed")]
    SessionClosed,

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Check if a client may retry the same request
    pub fn is_retriable(&self) -> bool {
        match self {
            Error::Backpressure(_) | Error::OwnershipTransient(_) => true,
            Error::Cluster(e) => e.is_retriable(),
            Error::Store(e) => e.is_retriable(),
            _ => false,
        }
    }

    /// Failures a proxy answers by re-resolving the owner and retrying
    pub fn is_upstream_transient(&self) -> bool {
        match self {
            Error::Backpressure(_) | Error::OwnershipTransient(_) => true,
            Error::Cluster(e) => e.is_peer_failure(),
            _ => false,
        }
    }

    /// Wire status for this error
    pub fn status(&self) -> StatusCode {
        match self {
            Error::Validation(_) => StatusCode::Validation,
            Error::PermissionDenied(_) => StatusCode::PermissionDenied,
            Error::NotFound(_) => StatusCode::NotFound,
            Error::Backpressure(_) => StatusCode::Backpressure,
            Error::OwnershipTransient(_) => StatusCode::OwnershipTransient,
            Error::Store(_) => StatusCode::Store,
            Error::Cluster(e) if e.is_retriable() => StatusCode::Unavailable,
            Error::Cluster(_) => StatusCode::Unknown,
            Error::SessionClosed => StatusCode::InvalidRequest,
            Error::Config(_) | Error::Internal(_) => StatusCode::Unknown,
        }
    }

    /// Rebuild an error from a wire status
    pub fn from_status(status: StatusCode, message: impl Into<String>) -> Self {
        let message = message.into();
        match status {
            StatusCode::Validation | StatusCode::InvalidRequest => Error::Validation(message),
            StatusCode::PermissionDenied => Error::PermissionDenied(message),
            StatusCode::NotFound => Error::NotFound(message),
            StatusCode::Backpressure => Error::Backpressure(message),
            StatusCode::NotOwner | StatusCode::OwnershipTransient => {
                Error::OwnershipTransient(message)
            }
            StatusCode::Store => Error::Store(StoreError::Unavailable(message)),
            StatusCode::Unavailable => Error::Cluster(ClusterError::NodeUnreachable(message)),
            StatusCode::UnsupportedVersion => Error::Cluster(ClusterError::Protocol(message)),
            StatusCode::Ok | StatusCode::Unknown => Error::Internal(message),
        }
    }
}

/// Error as reported back to a client
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorReply {
    pub status: StatusCode,
    pub message: String,
}

impl From<&Error> for ErrorReply {
    fn from(e: &Error) -> Self {
        Self {
            status: e.status(),
            message: e.to_string(),
        }
    }
}

impl From<Error> for ErrorReply {
    fn from(e: Error) -> Self {
        Self::from(&e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retriable() {
        assert!(Error::Backpressure("mailbox".into()).is_retriable());
        assert!(Error::OwnershipTransient("unloading".into()).is_retriable());
        assert!(Error::Cluster(ClusterError::Timeout).is_retriable());
        assert!(!Error::PermissionDenied("no J".into()).is_retriable());
        assert!(!Error::Validation("too big".into()).is_retriable());
    }

    #[test]
    fn test_status_mapping_preserves_kind() {
        let cases = [
            Error::Validation("v".into()),
            Error::PermissionDenied("p".into()),
            Error::NotFound("n".into()),
            Error::Backpressure("b".into()),
            Error::OwnershipTransient("o".into()),
        ];
        for err in cases {
            let back = Error::from_status(err.status(), "x");
            assert_eq!(back.status(), err.status());
        }
    }

    #[test]
    fn test_not_owner_is_transient() {
        let err = Error::from_status(StatusCode::NotOwner, "owner is c");
        assert!(matches!(err, Error::OwnershipTransient(_)));
        assert!(err.is_upstream_transient());
    }

    #[test]
    fn test_error_reply() {
        let reply = ErrorReply::from(Error::NotFound("grpX".into()));
        assert_eq!(reply.status, StatusCode::NotFound);
        assert_eq!(reply.message, "not found: grpX");
    }
}
