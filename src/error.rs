//! Error handling for mpdhub.
//!
//! Provides a unified error type based on gRPC status codes, with mapping
//! from the underlying transport, decode and server errors to the
//! categories the rest of the crate reasons about.
//!
//! # Error Categories
//!
//! * Transport failures: [`Unavailable`], [`DeadlineExceeded`], [`Cancelled`].
//!   These always invalidate the connection that produced them.
//! * Server-reported failures: [`Aborted`], carrying a
//!   [`CommandError`](crate::protocol::CommandError). The connection stays
//!   valid.
//! * Decode failures: [`DataLoss`], carrying a
//!   [`ParseError`](crate::protocol::ParseError). The stream position can no
//!   longer be trusted, so these poison the connection like transport errors.
//! * Control flow of the refresh coalescer: [`AlreadyExists`] and
//!   [`FailedPrecondition`].
//!
//! [`Unavailable`]: ErrorKind::Unavailable
//! [`DeadlineExceeded`]: ErrorKind::DeadlineExceeded
//! [`Cancelled`]: ErrorKind::Cancelled
//! [`Aborted`]: ErrorKind::Aborted
//! [`DataLoss`]: ErrorKind::DataLoss
//! [`AlreadyExists`]: ErrorKind::AlreadyExists
//! [`FailedPrecondition`]: ErrorKind::FailedPrecondition
//!
//! # Example
//!
//! ```rust
//! use mpdhub::error::{Error, ErrorKind, Result};
//!
//! fn check(result: Result<()>) {
//!     match result {
//!         Err(e) if e.is_command_error() => println!("server said no: {e}"),
//!         Err(e) => println!("connection lost: {e}"),
//!         Ok(()) => {}
//!     }
//! }
//! ```

#![allow(clippy::enum_glob_use)]

use std::fmt;
use thiserror::Error;

use crate::protocol::{CommandError, ParseError};

/// Main error type combining error kind and details.
#[derive(Debug)]
pub struct Error {
    /// Classification of the error
    pub kind: ErrorKind,

    /// Details of the underlying error
    pub error: Box<dyn std::error::Error + Send + Sync>,
}

impl Error {
    /// Attempts to downcast the underlying error to a concrete type.
    ///
    /// # Returns
    /// * `Some(&E)` - If the underlying error is of type `E`
    /// * `None` - If the underlying error is not of type `E`
    #[must_use]
    pub fn downcast<E>(&self) -> Option<&E>
    where
        E: std::error::Error + 'static,
    {
        self.error.downcast_ref::<E>()
    }

    /// Returns the server-reported error, if this is one.
    #[must_use]
    pub fn command_error(&self) -> Option<&CommandError> {
        self.downcast::<CommandError>()
    }

    /// Whether the server rejected the command while the connection stayed
    /// usable.
    ///
    /// Every other error means the connection that produced it must be
    /// discarded.
    #[must_use]
    pub fn is_command_error(&self) -> bool {
        self.command_error().is_some()
    }
}

/// Standard result type for mpdhub operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error categories based on gRPC status codes.
///
/// See [gRPC status codes](https://github.com/googleapis/googleapis/blob/master/google/rpc/code.proto)
/// for the original definitions.
#[expect(clippy::module_name_repetitions)]
#[derive(Clone, Copy, Debug, Eq, Error, Hash, Ord, PartialEq, PartialOrd)]
#[repr(u32)]
pub enum ErrorKind {
    /// The caller cancelled the operation.
    #[error("operation was cancelled")]
    Cancelled = 1,

    /// Unclassified failure.
    #[error("unknown error")]
    Unknown = 2,

    /// Malformed input from the caller, such as an invalid address.
    #[error("invalid argument specified")]
    InvalidArgument = 3,

    /// An I/O deadline was reached, either naturally or because it was
    /// forced to expire by cancellation.
    #[error("operation timed out")]
    DeadlineExceeded = 4,

    /// A single-flight job is already running.
    #[error("attempt to create what already exists")]
    AlreadyExists = 6,

    /// The component was shut down or closed.
    #[error("invalid state")]
    FailedPrecondition = 9,

    /// The server rejected the command with an `ACK` line.
    #[error("operation aborted")]
    Aborted = 10,

    /// Broken invariant inside this crate.
    #[error("internal error")]
    Internal = 13,

    /// The server is unreachable or the stream ended.
    #[error("service unavailable")]
    Unavailable = 14,

    /// The response could not be decoded; the stream is out of sync.
    #[error("unrecoverable data loss or corruption")]
    DataLoss = 15,
}

impl Error {
    /// Creates a new error with specified kind and details.
    pub fn new<E>(kind: ErrorKind, error: E) -> Self
    where
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        Self {
            kind,
            error: error.into(),
        }
    }

    /// Creates an error for commands the server refused.
    pub fn aborted<E>(error: E) -> Self
    where
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        Self::new(ErrorKind::Aborted, error)
    }

    /// Creates an error for a job that is already in flight.
    pub fn already_exists<E>(error: E) -> Self
    where
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        Self::new(ErrorKind::AlreadyExists, error)
    }

    /// Creates an error for operations cancelled by the caller.
    pub fn cancelled<E>(error: E) -> Self
    where
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        Self::new(ErrorKind::Cancelled, error)
    }

    /// Creates an error for responses that could not be decoded.
    ///
    /// Use when the stream position can no longer be trusted.
    pub fn data_loss<E>(error: E) -> Self
    where
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        Self::new(ErrorKind::DataLoss, error)
    }

    /// Creates an error for operations that exceeded their deadline.
    pub fn deadline_exceeded<E>(error: E) -> Self
    where
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        Self::new(ErrorKind::DeadlineExceeded, error)
    }

    /// Creates an error for operations on closed or shut down components.
    pub fn failed_precondition<E>(error: E) -> Self
    where
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        Self::new(ErrorKind::FailedPrecondition, error)
    }

    /// Creates an error for broken internal invariants.
    pub fn internal<E>(error: E) -> Self
    where
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        Self::new(ErrorKind::Internal, error)
    }

    /// Creates an error for malformed caller input.
    pub fn invalid_argument<E>(error: E) -> Self
    where
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        Self::new(ErrorKind::InvalidArgument, error)
    }

    /// Creates an error for an unreachable server or a dropped stream.
    pub fn unavailable<E>(error: E) -> Self
    where
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        Self::new(ErrorKind::Unavailable, error)
    }

    /// Creates an error that fits no other category.
    pub fn unknown<E>(error: E) -> Self
    where
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        Self::new(ErrorKind::Unknown, error)
    }
}

/// Returns the underlying error source.
impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.error.source()
    }
}

/// Formats the error for display as `{kind}: {details}`.
impl fmt::Display for Error {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(fmt, "{}: ", self.kind)?;
        self.error.fmt(fmt)
    }
}

/// Converts IO errors into transport error kinds.
///
/// Every IO error is fatal for the connection; the kind only tells timeouts
/// apart from everything else.
impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        use std::io::ErrorKind::*;
        match err.kind() {
            TimedOut => Self::deadline_exceeded(err),
            Interrupted => Self::cancelled(err),
            InvalidInput => Self::invalid_argument(err),
            _ => Self::unavailable(err),
        }
    }
}

/// Server-reported errors map to `Aborted`.
impl From<CommandError> for Error {
    fn from(e: CommandError) -> Self {
        Self::aborted(e)
    }
}

/// Decode errors map to `DataLoss`.
impl From<ParseError> for Error {
    fn from(e: ParseError) -> Self {
        Self::data_loss(e)
    }
}

/// Converts timeout errors to `DeadlineExceeded`.
impl From<tokio::time::error::Elapsed> for Error {
    fn from(e: tokio::time::error::Elapsed) -> Self {
        Self::deadline_exceeded(e.to_string())
    }
}

/// Converts JSON serialization errors to `Internal`.
impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::internal(e)
    }
}

/// Converts configuration file errors to `InvalidArgument`.
impl From<toml::de::Error> for Error {
    fn from(e: toml::de::Error) -> Self {
        Self::invalid_argument(e)
    }
}

/// Converts server version parsing errors to `DataLoss`.
impl From<semver::Error> for Error {
    fn from(e: semver::Error) -> Self {
        Self::data_loss(e)
    }
}

/// Converts HTTP response building errors to `Internal`.
impl From<http::Error> for Error {
    fn from(e: http::Error) -> Self {
        Self::internal(e)
    }
}

/// Converts integer parsing errors to `InvalidArgument`.
impl From<std::num::ParseIntError> for Error {
    fn from(e: std::num::ParseIntError) -> Self {
        Self::invalid_argument(e.to_string())
    }
}

/// Converts mutex poisoning errors to `Internal`.
impl<T> From<std::sync::PoisonError<std::sync::MutexGuard<'_, T>>> for Error {
    fn from(e: std::sync::PoisonError<std::sync::MutexGuard<'_, T>>) -> Self {
        Self::internal(e.to_string())
    }
}

/// Converts task join failures to `Internal`.
impl From<tokio::task::JoinError> for Error {
    fn from(e: tokio::task::JoinError) -> Self {
        Self::internal(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_errors_are_transport_errors() {
        let err = Error::from(std::io::Error::from(std::io::ErrorKind::ConnectionReset));
        assert_eq!(err.kind, ErrorKind::Unavailable);
        assert!(!err.is_command_error());

        let err = Error::from(std::io::Error::from(std::io::ErrorKind::TimedOut));
        assert_eq!(err.kind, ErrorKind::DeadlineExceeded);
    }

    #[test]
    fn command_errors_downcast() {
        let ack = CommandError {
            code: 50,
            index: 0,
            command: "albumart".to_string(),
            message: "No file exists".to_string(),
        };
        let err = Error::from(ack.clone());
        assert_eq!(err.kind, ErrorKind::Aborted);
        assert_eq!(err.command_error(), Some(&ack));
        assert!(err.to_string().starts_with("operation aborted: "));
    }
}
