//! Per-call error types for the proxied data plane.
//!
//! This module defines the central `Error` enum, which captures every way a
//! single proxied call can fail. It implements `From<Error>` for
//! `tonic::Status` so that failures surface to clients as standard gRPC status
//! codes and never escape the call boundary.
//!
//! ## Error Cases
//! - `Unimplemented`: The method is not declared by the service's IDL.
//! - `InvalidArgument`: The envelope was rejected as malformed.
//! - `Unavailable`: No worker capacity, a worker process died, or the service
//!   is draining.
//! - `DeadlineExceeded`: The call's deadline elapsed before a result arrived.
//! - `Cancelled`: The caller (or server shutdown) abandoned the call.
//! - `Internal`: Application errors reported by a worker and anything that
//!   does not map elsewhere.

use crate::pool::{FailureKind, WorkerError};
use tonic::Status;

pub type Result<T> = core::result::Result<T, Error>;

/// Unified error type for a single proxied call.
#[derive(Clone, thiserror::Error, Debug, PartialEq, Eq)]
pub enum Error {
    /// The method is not part of the service's descriptor.
    #[error("Method {service}/{method} is not implemented")]
    Unimplemented { service: String, method: String },

    /// The worker pool rejected the envelope as malformed.
    #[error("Invalid argument: {reason}")]
    InvalidArgument { reason: String },

    /// No worker could take the call.
    #[error("Unavailable: {reason}")]
    Unavailable { reason: String },

    /// The call's deadline elapsed.
    #[error("Deadline exceeded")]
    DeadlineExceeded,

    /// The call was cancelled by the client or by server shutdown.
    #[error("Call cancelled")]
    Cancelled,

    /// Worker-reported application failure, or an unmapped failure kind.
    #[error("Internal error: {context}")]
    Internal { context: String },
}

impl From<WorkerError> for Error {
    /// Maps every [`FailureKind`] to exactly one call error. Unknown kinds
    /// fall into [`Error::Internal`].
    fn from(err: WorkerError) -> Self {
        let WorkerError { kind, message } = err;
        match kind {
            FailureKind::WorkerUnavailable => Error::Unavailable { reason: message },
            FailureKind::MalformedEnvelope => Error::InvalidArgument { reason: message },
            FailureKind::Cancelled => Error::Cancelled,
            FailureKind::DeadlineExceeded => Error::DeadlineExceeded,
            FailureKind::Application => Error::Internal { context: message },
            FailureKind::Unknown(name) => Error::Internal {
                context: format!("{name}: {message}"),
            },
        }
    }
}

impl From<Error> for Status {
    fn from(err: Error) -> Self {
        match err {
            Error::Unimplemented { service, method } => {
                Status::unimplemented(format!("Method {service}/{method} is not implemented"))
            }
            Error::InvalidArgument { reason } => Status::invalid_argument(reason),
            Error::Unavailable { reason } => Status::unavailable(reason),
            Error::DeadlineExceeded => Status::deadline_exceeded("Deadline exceeded"),
            Error::Cancelled => Status::cancelled("Call was cancelled"),
            Error::Internal { context } => Status::internal(context),
        }
    }
}
