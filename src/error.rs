use std::error::Error;
use std::fmt::{Display, Formatter};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ReplicaErrorCode {
    /// A mutation's precondition did not hold when it was replayed.
    PreconditionFailed,
    /// The persistence collaborator could not complete an I/O operation.
    StorageUnavailable,
    /// A watch or write stream closed; reconnecting is expected.
    StreamClosed,
    /// The server sent a malformed or out-of-order message.
    ProtocolViolation,
    /// An existence-filter mismatch could not be resolved by pruning.
    Conflict,
    InvalidArgument,
    PermissionDenied,
    Internal,
    Terminated,
}

impl ReplicaErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReplicaErrorCode::PreconditionFailed => "replica/precondition-failed",
            ReplicaErrorCode::StorageUnavailable => "replica/storage-unavailable",
            ReplicaErrorCode::StreamClosed => "replica/stream-closed",
            ReplicaErrorCode::ProtocolViolation => "replica/protocol-violation",
            ReplicaErrorCode::Conflict => "replica/conflict",
            ReplicaErrorCode::InvalidArgument => "replica/invalid-argument",
            ReplicaErrorCode::PermissionDenied => "replica/permission-denied",
            ReplicaErrorCode::Internal => "replica/internal",
            ReplicaErrorCode::Terminated => "replica/terminated",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReplicaError {
    pub code: ReplicaErrorCode,
    message: String,
}

impl ReplicaError {
    pub fn new(code: ReplicaErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn code_str(&self) -> &'static str {
        self.code.as_str()
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    /// Errors the engine recovers from on its own (reconnect, retry, reopen).
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.code,
            ReplicaErrorCode::StorageUnavailable
                | ReplicaErrorCode::StreamClosed
                | ReplicaErrorCode::ProtocolViolation
        )
    }
}

impl Display for ReplicaError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.message, self.code_str())
    }
}

impl Error for ReplicaError {}

pub type ReplicaResult<T> = Result<T, ReplicaError>;

pub fn precondition_failed(message: impl Into<String>) -> ReplicaError {
    ReplicaError::new(ReplicaErrorCode::PreconditionFailed, message)
}

pub fn storage_unavailable(message: impl Into<String>) -> ReplicaError {
    ReplicaError::new(ReplicaErrorCode::StorageUnavailable, message)
}

pub fn stream_closed(message: impl Into<String>) -> ReplicaError {
    ReplicaError::new(ReplicaErrorCode::StreamClosed, message)
}

pub fn protocol_violation(message: impl Into<String>) -> ReplicaError {
    ReplicaError::new(ReplicaErrorCode::ProtocolViolation, message)
}

pub fn conflict(message: impl Into<String>) -> ReplicaError {
    ReplicaError::new(ReplicaErrorCode::Conflict, message)
}

pub fn invalid_argument(message: impl Into<String>) -> ReplicaError {
    ReplicaError::new(ReplicaErrorCode::InvalidArgument, message)
}

pub fn permission_denied(message: impl Into<String>) -> ReplicaError {
    ReplicaError::new(ReplicaErrorCode::PermissionDenied, message)
}

pub fn internal_error(message: impl Into<String>) -> ReplicaError {
    ReplicaError::new(ReplicaErrorCode::Internal, message)
}

pub fn terminated(message: impl Into<String>) -> ReplicaError {
    ReplicaError::new(ReplicaErrorCode::Terminated, message)
}
