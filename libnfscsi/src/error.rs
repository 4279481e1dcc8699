//! Error type for every plugin operation.
//!
//! [`CsiError`] is serializable so a failure reaches the caller intact, and
//! [`CsiError::code`] tells the orchestrator whether to retry.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Status categories reported to the orchestrator, matching the gRPC codes
/// a CSI caller expects.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum StatusCode {
    InvalidArgument,
    NotFound,
    AlreadyExists,
    Internal,
    /// Transient; retrying later may succeed.
    Unavailable,
    DeadlineExceeded,
    Unimplemented,
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::InvalidArgument => "InvalidArgument",
            Self::NotFound => "NotFound",
            Self::AlreadyExists => "AlreadyExists",
            Self::Internal => "Internal",
            Self::Unavailable => "Unavailable",
            Self::DeadlineExceeded => "DeadlineExceeded",
            Self::Unimplemented => "Unimplemented",
        };
        f.write_str(s)
    }
}

/// Failure of a controller, node or identity call.
#[derive(Debug, Error, Serialize, Deserialize, Clone)]
pub enum CsiError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A volume identifier could not be decoded.
    #[error("malformed volume id {0:?}")]
    MalformedVolumeId(String),

    /// The target already holds something incompatible with the request.
    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// A referenced object (e.g. a staging mount) does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    #[error("mount failed at {path}: {reason}")]
    MountFailed {
        path: String,
        reason: String,
    },

    #[error("unmount failed at {path}: {reason}")]
    UnmountFailed {
        path: String,
        reason: String,
    },

    /// A scratch working mount could not be torn down.
    #[error("cleanup failed at {path}: {reason}")]
    CleanupFailed { path: String, reason: String },

    /// The NFS server could not be reached.
    #[error("unavailable: {0}")]
    Unavailable(String),

    /// The request did not finish before its deadline.
    #[error("deadline exceeded: {0}")]
    DeadlineExceeded(String),

    /// The operation is not supported by this plugin configuration.
    #[error("unimplemented: {0}")]
    Unimplemented(String),

    /// Stream or connection failure, or an undecodable message.
    #[error("transport error: {0}")]
    TransportError(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl CsiError {
    /// Status category of this error.
    pub fn code(&self) -> StatusCode {
        match self {
            Self::InvalidArgument(_) | Self::MalformedVolumeId(_) => StatusCode::InvalidArgument,
            Self::AlreadyExists(_) => StatusCode::AlreadyExists,
            Self::NotFound(_) => StatusCode::NotFound,
            Self::MountFailed { .. }
            | Self::UnmountFailed { .. }
            | Self::CleanupFailed { .. }
            | Self::Internal(_) => StatusCode::Internal,
            Self::Unavailable(_) | Self::TransportError(_) => StatusCode::Unavailable,
            Self::DeadlineExceeded(_) => StatusCode::DeadlineExceeded,
            Self::Unimplemented(_) => StatusCode::Unimplemented,
        }
    }

    pub fn invalid<E: fmt::Display>(e: E) -> Self {
        Self::InvalidArgument(e.to_string())
    }

    pub fn transport<E: fmt::Display>(e: E) -> Self {
        Self::TransportError(e.to_string())
    }

    pub fn internal<E: fmt::Display>(e: E) -> Self {
        Self::Internal(e.to_string())
    }

    /// Wrap a filesystem error with the operation and path it came from.
    pub fn io(op: &str, path: impl AsRef<std::path::Path>, e: std::io::Error) -> Self {
        Self::Internal(format!("{op} {}: {e}", path.as_ref().display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display() {
        let err = CsiError::MalformedVolumeId("nope".into());
        assert_eq!(err.to_string(), "malformed volume id \"nope\"");
    }

    #[test]
    fn status_codes() {
        assert_eq!(
            CsiError::MalformedVolumeId("x".into()).code(),
            StatusCode::InvalidArgument
        );
        assert_eq!(
            CsiError::MountFailed {
                path: "/mnt".into(),
                reason: "EPERM".into()
            }
            .code(),
            StatusCode::Internal
        );
        assert_eq!(
            CsiError::Unavailable("server down".into()).code(),
            StatusCode::Unavailable
        );
        assert_eq!(
            CsiError::AlreadyExists("/mnt/t".into()).code(),
            StatusCode::AlreadyExists
        );
    }

    #[test]
    fn error_serde_roundtrip() {
        let err = CsiError::MountFailed {
            path: "/mnt/test".into(),
            reason: "permission denied".into(),
        };
        let json = serde_json::to_string(&err).expect("serialize");
        let de: CsiError = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(err.to_string(), de.to_string());
        assert_eq!(de.code(), StatusCode::Internal);
    }

    #[test]
    fn io_error_keeps_path() {
        let e = std::io::Error::from(std::io::ErrorKind::PermissionDenied);
        let err = CsiError::io("create dir", "/export/vol", e);
        assert!(err.to_string().contains("/export/vol"));
        assert_eq!(err.code(), StatusCode::Internal);
    }
}
