use std::fmt;
use std::io;

use crate::sftp::protocol::StatusCode;

/// Errors produced by any component of this crate.
#[derive(Debug)]
#[non_exhaustive]
pub enum Error {
    /// A `sendRequest`/`openChannel`/SFTP `INIT` did not get a response
    /// within the configured timeout.
    Timeout,

    /// The peer refused a `CHANNEL_OPEN` with the given reason string.
    ChannelOpenRejected(String),

    /// The channel was closed (locally or by the peer) while an operation on
    /// it was still pending.
    ChannelClosed,

    /// The peer sent something that violates the framing or ordering rules
    /// of the protocol (an out-of-order reply, an oversized packet, a stray
    /// SFTP id, ...). Fatal to the channel it occurred on.
    ProtocolViolation(String),

    /// The SFTP peer negotiated a version below 3.
    UnsupportedVersion(u32),

    /// A remote command exited with a non-zero status.
    CommandFailed {
        /// The exit code reported by the remote process.
        exit_code: u32,
    },

    /// `executeCommand`'s running total would have exceeded
    /// `maxResponseSize`.
    OutputTooLarge,

    /// An SFTP `STATUS` reply other than `OK`/`EOF`.
    SftpStatus {
        /// The wire status code.
        code: StatusCode,
        /// The human-readable message the server attached.
        message: String,
    },

    /// A response of the wrong SFTP message type arrived for a request that
    /// expected a specific one (e.g. `HANDLE` expected, `NAME` received).
    InvalidResponse,

    /// An operation was attempted on an `SftpFileHandle` that was already
    /// closed locally.
    FileHandleInvalid,

    /// The transport reported (or was observed to have) disconnected.
    ConnectionClosed,

    /// The requested capability is not implemented by this side.
    Unsupported,

    /// The calling future was cancelled by its caller.
    Cancelled,

    /// An I/O error bubbled up from the transport or a local file.
    Io(io::Error),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Timeout => write!(f, "operation timed out waiting for a response"),
            Error::ChannelOpenRejected(reason) => {
                write!(f, "channel open was rejected: {reason}")
            }
            Error::ChannelClosed => write!(f, "channel was closed"),
            Error::ProtocolViolation(detail) => write!(f, "protocol violation: {detail}"),
            Error::UnsupportedVersion(v) => {
                write!(f, "sftp server negotiated unsupported version {v}")
            }
            Error::CommandFailed { exit_code } => {
                write!(f, "remote command exited with status {exit_code}")
            }
            Error::OutputTooLarge => write!(f, "command output exceeded the configured limit"),
            Error::SftpStatus { code, message } => {
                write!(f, "sftp error {code:?}: {message}")
            }
            Error::InvalidResponse => write!(f, "sftp response did not match the expected type"),
            Error::FileHandleInvalid => write!(f, "file handle was already closed"),
            Error::ConnectionClosed => write!(f, "the connection was closed"),
            Error::Unsupported => write!(f, "operation is not supported"),
            Error::Cancelled => write!(f, "operation was cancelled"),
            Error::Io(_) => write!(f, "i/o error"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Io(e)
    }
}

/// Convenience alias used throughout this crate.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_is_nonempty_for_every_variant() {
        let variants = [
            Error::Timeout,
            Error::ChannelOpenRejected("administratively prohibited".into()),
            Error::ChannelClosed,
            Error::ProtocolViolation("unexpected id".into()),
            Error::UnsupportedVersion(2),
            Error::CommandFailed { exit_code: 1 },
            Error::OutputTooLarge,
            Error::SftpStatus {
                code: StatusCode::Failure,
                message: "no such file".into(),
            },
            Error::InvalidResponse,
            Error::FileHandleInvalid,
            Error::ConnectionClosed,
            Error::Unsupported,
            Error::Cancelled,
            Error::Io(io::Error::new(io::ErrorKind::Other, "boom")),
        ];

        for e in variants {
            assert!(!format!("{e}").is_empty());
        }
    }

    #[test]
    fn io_error_is_the_source() {
        use std::error::Error as _;

        let e: Error = io::Error::new(io::ErrorKind::Other, "boom").into();
        assert!(e.source().is_some());
    }
}
