//! Error domain for the streaming client core.
//!
//! Every error surfaced to callers carries one of the canonical gRPC status
//! codes. Transport errors arrive as [`tonic::Status`] and are normalized
//! into this domain preserving code and message; errors from any other
//! source become [`Code::Unknown`] with the original rendered into the
//! message.

use tonic::Code;
use tonic::Status;

pub type Result<T> = std::result::Result<T, Error>;

/// A status-coded error in the client error domain.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{code:?}: {message}")]
pub struct Error {
    pub code: Code,
    pub message: String,
}

impl Error {
    pub fn new(
        code: Code,
        message: impl Into<String>,
    ) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    /// An `Internal` error, used for malformed inbound frames.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(Code::Internal, message)
    }

    /// An `Unknown` error wrapping a failure from outside the rpc domain.
    pub fn unknown(source: impl std::fmt::Display) -> Self {
        Self::new(Code::Unknown, source.to_string())
    }

    pub fn unauthenticated(message: impl Into<String>) -> Self {
        Self::new(Code::Unauthenticated, message)
    }
}

impl From<Status> for Error {
    fn from(status: Status) -> Self {
        Self {
            code: status.code(),
            message: status.message().to_string(),
        }
    }
}

impl From<&Error> for Status {
    fn from(error: &Error) -> Self {
        Status::new(error.code, error.message.clone())
    }
}

/// Whether a failed write should be surfaced to the application rather than
/// retried.
///
/// Transient codes are the ones the stream machinery recovers from by
/// restarting; everything else is permanent. `Aborted` is context-dependent
/// upstream but treated as permanent at this layer; callers that know
/// better can consult [`Error::code`] themselves.
pub fn is_permanent_write_error(code: Code) -> bool {
    !matches!(
        code,
        Code::Cancelled
            | Code::Unknown
            | Code::DeadlineExceeded
            | Code::ResourceExhausted
            | Code::Internal
            | Code::Unavailable
            | Code::Unauthenticated
    )
}
