//! Error types shared across the client library.

use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Errors surfaced by [`crate::Device`] operations.
#[derive(Debug, Error)]
pub enum Error {
    /// The operation requires an active link.
    #[error("not connected")]
    NotConnected,

    /// A second connect was attempted on a live device.
    #[error("already connected")]
    AlreadyConnected,

    /// The WebREPL password was rejected by the device.
    #[error("WebREPL password rejected")]
    AuthFailed,

    /// An expected banner or landmark did not show up within the bounded wait.
    #[error("handshake failed: {0}")]
    HandshakeFailed(String),

    /// The transport closed while an operation was in flight.
    #[error("connection lost")]
    ConnectionLost,

    /// The caller-supplied deadline elapsed.
    #[error("deadline elapsed")]
    Timeout,

    /// The request was canceled explicitly.
    #[error("request canceled")]
    Canceled,

    /// The device raised an exception while running a script.
    #[error("remote exception: {exception}")]
    Script {
        /// Last non-empty traceback line, e.g. `ValueError: x`.
        exception: String,
        /// The full traceback as printed by the device.
        traceback: String,
    },

    /// A remote `OSError` with a recognized errno.
    #[error("remote OS error {errno}: {exception}")]
    RemoteOs {
        errno: RemoteErrno,
        exception: String,
        traceback: String,
    },

    /// The response violated the raw REPL framing.
    #[error("invalid response: {0}")]
    InvalidResponse(String),

    /// The underlying transport failed to open or operate.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// Host-side filesystem trouble during a recursive copy.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Failure modes of the byte-stream transports.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("transport unavailable: {0}")]
    Unavailable(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("transport handshake failed: {0}")]
    HandshakeFailed(String),

    #[error("peer closed the connection")]
    PeerClosed,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Well-known errnos raised by the device filesystem.
#[derive(Clone, Copy, Debug, Eq, PartialEq, strum::Display, strum::IntoStaticStr)]
#[strum(serialize_all = "UPPERCASE")]
pub enum RemoteErrno {
    /// No such file or directory.
    Enoent,
    /// File or directory exists.
    Eexist,
    /// Is a directory.
    Eisdir,
}

impl RemoteErrno {
    /// Recognize a well-known errno in an exception line such as
    /// `OSError: [Errno 2] ENOENT` or a bare `OSError: 2`.
    pub fn from_exception(line: &str) -> Option<Self> {
        if !line.starts_with("OSError") {
            return None;
        }
        if line.contains("ENOENT") || line.contains("Errno 2]") || line.ends_with(": 2") {
            Some(Self::Enoent)
        } else if line.contains("EEXIST") || line.contains("Errno 17]") || line.ends_with(": 17") {
            Some(Self::Eexist)
        } else if line.contains("EISDIR") || line.contains("Errno 21]") || line.ends_with(": 21") {
            Some(Self::Eisdir)
        } else {
            None
        }
    }
}

impl Error {
    /// Build the error for a failed script: a recognized remote `OSError`
    /// becomes [`Error::RemoteOs`], everything else [`Error::Script`].
    pub(crate) fn from_remote(exception: String, traceback: String) -> Self {
        match RemoteErrno::from_exception(&exception) {
            Some(errno) => Error::RemoteOs {
                errno,
                exception,
                traceback,
            },
            None => Error::Script {
                exception,
                traceback,
            },
        }
    }
}
