//! The shared error taxonomy used across listeners, framing, the session
//! registry and the task engine.
//!
//! One flat taxonomy rather than a `thiserror` enum per module: unlike the
//! per-module error enums this crate's ancestor used (`DemuxError`,
//! `StartError`, `OpenError`, ...),
//! [`Error`] is a single enum with a [`Error::kind`] accessor. Administrative
//! operations (listener create/start/stop/destroy, registry/task-engine
//! calls) surface these directly to the caller; transport-level failures on
//! one session are logged and close only that session rather than
//! propagating.

use std::fmt;

/// The high-level classification of an [`Error`], independent of which
/// component raised it. Used for metrics and for the single-byte wire
/// status on explicit reply frames — the wire protocol does not leak the
/// full error string.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    InvalidArgument,
    AlreadyRunning,
    NotRunning,
    NotFound,
    AlreadyExists,
    Memory,
    Io,
    Socket,
    Bind,
    Listen,
    Send,
    Receive,
    Crypto,
    Checksum,
    CompressionInvalid,
    BufferTooSmall,
    Timeout,
    Cancelled,
    Protocol,
    Internal,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::InvalidArgument => "invalid argument",
            ErrorKind::AlreadyRunning => "already running",
            ErrorKind::NotRunning => "not running",
            ErrorKind::NotFound => "not found",
            ErrorKind::AlreadyExists => "already exists",
            ErrorKind::Memory => "memory",
            ErrorKind::Io => "io",
            ErrorKind::Socket => "socket",
            ErrorKind::Bind => "bind",
            ErrorKind::Listen => "listen",
            ErrorKind::Send => "send",
            ErrorKind::Receive => "receive",
            ErrorKind::Crypto => "crypto",
            ErrorKind::Checksum => "checksum",
            ErrorKind::CompressionInvalid => "compression invalid",
            ErrorKind::BufferTooSmall => "buffer too small",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::Protocol => "protocol",
            ErrorKind::Internal => "internal",
        };
        f.write_str(s)
    }
}

/// An error produced by any core component, carrying a [`ErrorKind`] and a
/// human-readable message.
#[derive(Debug, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct Error {
    kind: ErrorKind,
    message: String,
}

impl Error {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidArgument, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotFound, message)
    }

    pub fn already_exists(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::AlreadyExists, message)
    }

    pub fn already_running(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::AlreadyRunning, message)
    }

    pub fn not_running(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotRunning, message)
    }

    pub fn protocol(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Protocol, message)
    }

    pub fn crypto(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Crypto, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Timeout, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Internal, message)
    }
}

impl From<std::io::Error> for Error {
    fn from(value: std::io::Error) -> Self {
        Self::new(ErrorKind::Io, value.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn carries_kind_and_message() {
        let err = Error::not_found("agent 123 not found");
        assert_eq!(err.kind(), ErrorKind::NotFound);
        assert_eq!(err.to_string(), "not found: agent 123 not found");
    }
}
