//! twopence error types
//!
//! Every operation that can fail returns a `TwopenceError` carrying one of the
//! stable negative error codes a caller can match on, mirroring the original
//! library's `TWOPENCE_*` codes.

use std::io;
use thiserror::Error;

/// Main error type for twopence operations.
#[derive(Error, Debug)]
pub enum TwopenceError {
    /// A caller passed a malformed or out-of-range parameter.
    #[error("parameter error: {0}")]
    Parameter(String),

    /// Opening a session with the target failed.
    #[error("unable to open session: {0}")]
    OpenSession(String),

    /// Sending a command packet to the target failed.
    #[error("unable to send command: {0}")]
    SendCommand(String),

    /// Forwarding local input to a sink channel failed.
    #[error("unable to forward input: {0}")]
    ForwardInput(String),

    /// Receiving command results from the target failed.
    #[error("unable to receive results: {0}")]
    ReceiveResults(String),

    /// The transaction's deadline elapsed before completion.
    #[error("command timed out")]
    CommandTimeout,

    /// A local file could not be opened/read/written.
    #[error("local file error: {0}")]
    LocalFile(#[source] io::Error),

    /// Sending a file to the target failed.
    #[error("unable to send file: {0}")]
    SendFile(String),

    /// The target reported an error while handling a remote file.
    #[error("remote file error: {0}")]
    RemoteFile(String),

    /// Receiving an extracted file from the target failed.
    #[error("unable to receive file: {0}")]
    ReceiveFile(String),

    /// Interrupting a running command failed.
    #[error("unable to interrupt command: {0}")]
    InterruptCommand(String),

    /// The target spec string was malformed or named an unknown host/path.
    #[error("invalid target: {0}")]
    InvalidTarget(String),

    /// The target spec named a plugin this binary has no registration for.
    #[error("unknown plugin: {0}")]
    UnknownPlugin(String),

    /// The plugin exists but cannot be used the way it was requested.
    #[error("incompatible plugin: {0}")]
    IncompatiblePlugin(String),

    /// The plugin does not implement the requested capability.
    #[error("unsupported function: {0}")]
    UnsupportedFunction(String),

    /// A packet violated the wire protocol (bad magic, truncated frame, ...).
    #[error("protocol error: {0}")]
    Protocol(String),

    /// A programming-error-class invariant was violated.
    #[error("internal error: {0}")]
    Internal(String),

    /// The underlying transport (socket, pipe, ...) failed.
    #[error("transport error: {0}")]
    Transport(#[from] io::Error),

    /// The peer speaks an incompatible protocol version.
    #[error("incompatible protocol version: {0}")]
    IncompatibleProtocol(String),

    /// An operation referenced a transaction id that does not exist (or no
    /// longer exists) in the connection's arena.
    #[error("invalid transaction id: {0}")]
    InvalidTransaction(u16),

    /// The command was canceled before it completed.
    #[error("command canceled")]
    CommandCanceled,
}

/// Result type alias for twopence operations.
pub type Result<T> = std::result::Result<T, TwopenceError>;

impl TwopenceError {
    /// Stable negative error code, matching the original library's constants.
    #[must_use]
    pub const fn code(&self) -> i32 {
        match self {
            Self::Parameter(_) => -1,
            Self::OpenSession(_) => -2,
            Self::SendCommand(_) => -3,
            Self::ForwardInput(_) => -4,
            Self::ReceiveResults(_) => -5,
            Self::CommandTimeout => -6,
            Self::LocalFile(_) => -7,
            Self::SendFile(_) => -8,
            Self::RemoteFile(_) => -9,
            Self::ReceiveFile(_) => -10,
            Self::InterruptCommand(_) => -11,
            Self::InvalidTarget(_) => -12,
            Self::UnknownPlugin(_) => -13,
            Self::IncompatiblePlugin(_) => -14,
            Self::UnsupportedFunction(_) => -15,
            Self::Protocol(_) => -16,
            Self::Internal(_) => -17,
            Self::Transport(_) => -18,
            Self::IncompatibleProtocol(_) => -19,
            Self::InvalidTransaction(_) => -20,
            Self::CommandCanceled => -21,
        }
    }

    /// `strerror`-equivalent short name for the error code, independent of
    /// any interpolated detail in the `Display` text.
    #[must_use]
    pub const fn strerror(&self) -> &'static str {
        match self {
            Self::Parameter(_) => "parameter error",
            Self::OpenSession(_) => "unable to open session",
            Self::SendCommand(_) => "unable to send command",
            Self::ForwardInput(_) => "unable to forward input",
            Self::ReceiveResults(_) => "unable to receive results",
            Self::CommandTimeout => "command timed out",
            Self::LocalFile(_) => "local file error",
            Self::SendFile(_) => "unable to send file",
            Self::RemoteFile(_) => "remote file error",
            Self::ReceiveFile(_) => "unable to receive file",
            Self::InterruptCommand(_) => "unable to interrupt command",
            Self::InvalidTarget(_) => "invalid target",
            Self::UnknownPlugin(_) => "unknown plugin",
            Self::IncompatiblePlugin(_) => "incompatible plugin",
            Self::UnsupportedFunction(_) => "unsupported function",
            Self::Protocol(_) => "protocol error",
            Self::Internal(_) => "internal error",
            Self::Transport(_) => "transport error",
            Self::IncompatibleProtocol(_) => "incompatible protocol version",
            Self::InvalidTransaction(_) => "invalid transaction id",
            Self::CommandCanceled => "command canceled",
        }
    }

    /// Construct a protocol error with a message.
    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }

    /// Construct an internal error with a message.
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Construct an invalid-target error with a message.
    pub fn invalid_target(msg: impl Into<String>) -> Self {
        Self::InvalidTarget(msg.into())
    }

    /// Whether retrying the same operation might succeed without
    /// intervention (transient I/O conditions only).
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Transport(e) => matches!(
                e.kind(),
                io::ErrorKind::Interrupted | io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
            ),
            _ => false,
        }
    }

    /// Whether this error means the underlying connection is no longer usable.
    #[must_use]
    pub const fn is_connection_error(&self) -> bool {
        matches!(
            self,
            Self::Transport(_) | Self::OpenSession(_) | Self::CommandTimeout
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_stable_and_negative() {
        assert_eq!(TwopenceError::Parameter(String::new()).code(), -1);
        assert_eq!(TwopenceError::CommandCanceled.code(), -21);
        assert!(TwopenceError::InvalidTransaction(7).code() < 0);
    }

    #[test]
    fn strerror_ignores_detail_text() {
        let a = TwopenceError::Protocol("short frame".into());
        let b = TwopenceError::Protocol("bad magic".into());
        assert_eq!(a.strerror(), b.strerror());
    }

    #[test]
    fn transport_wraps_io_error() {
        let io_err = io::Error::new(io::ErrorKind::WouldBlock, "would block");
        let err: TwopenceError = io_err.into();
        assert!(err.is_recoverable());
    }
}
