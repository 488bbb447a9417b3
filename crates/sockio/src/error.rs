//! Error types for the datagram socket layer.

use std::fmt;
use std::io;
use thiserror::Error;

/// The socket operation an error originated from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    /// Creating or binding the socket
    Bind,
    /// Enabling control messages or offload options
    Configure,
    /// Setting the kernel receive buffer
    SetReceiveCapacity,
    /// Setting the kernel send buffer
    SetSendCapacity,
    /// Reading back the kernel receive buffer
    ReadReceiveCapacity,
    /// Reading back the kernel send buffer
    ReadSendCapacity,
    /// Sending a batch of datagrams
    Send,
    /// Receiving a batch of datagrams
    Receive,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Bind => "bind",
            Self::Configure => "configure",
            Self::SetReceiveCapacity => "set receive capacity",
            Self::SetSendCapacity => "set send capacity",
            Self::ReadReceiveCapacity => "read receive capacity",
            Self::ReadSendCapacity => "read send capacity",
            Self::Send => "send",
            Self::Receive => "receive",
        };
        f.write_str(name)
    }
}

/// Socket layer errors
///
/// Offload rejections never surface here: the send path absorbs them by
/// disabling segmentation offload and resending per datagram.
#[derive(Debug, Error)]
pub enum SocketError {
    /// The kernel refused the operation for lack of privilege
    #[error("{op}: permission denied: {source}")]
    Permission {
        /// Failed operation
        op: Operation,
        /// Underlying OS error
        source: io::Error,
    },

    /// The caller violated a precondition
    #[error("{op}: invalid argument: {reason}")]
    InvalidArgument {
        /// Failed operation
        op: Operation,
        /// What was wrong with the input
        reason: String,
    },

    /// A deadline on the handle expired or a non-blocking call would block
    #[error("{op}: timed out: {source}")]
    Timeout {
        /// Failed operation
        op: Operation,
        /// Underlying OS error
        source: io::Error,
    },

    /// Any other kernel-level failure
    #[error("{op}: I/O error: {source}")]
    Io {
        /// Failed operation
        op: Operation,
        /// Underlying OS error
        source: io::Error,
    },

    /// The kernel accepted the buffer request but reports less than it should
    #[error("{op}: requested {requested} bytes but kernel reports {effective}")]
    CapacityClamped {
        /// Failed operation
        op: Operation,
        /// Requested size in bytes
        requested: usize,
        /// Size the kernel reported afterwards
        effective: usize,
    },
}

/// Result type for socket operations
pub type SocketResult<T> = Result<T, SocketError>;

impl SocketError {
    /// Classify an OS error raised by `op`.
    pub fn from_io(op: Operation, source: io::Error) -> Self {
        match source.kind() {
            io::ErrorKind::PermissionDenied => Self::Permission { op, source },
            io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut => Self::Timeout { op, source },
            _ => Self::Io { op, source },
        }
    }

    pub(crate) fn invalid(op: Operation, reason: impl Into<String>) -> Self {
        Self::InvalidArgument {
            op,
            reason: reason.into(),
        }
    }

    /// The operation that failed.
    #[must_use]
    pub fn operation(&self) -> Operation {
        match self {
            Self::Permission { op, .. }
            | Self::InvalidArgument { op, .. }
            | Self::Timeout { op, .. }
            | Self::Io { op, .. }
            | Self::CapacityClamped { op, .. } => *op,
        }
    }

    /// The raw OS error code, when the failure came from a syscall.
    #[must_use]
    pub fn raw_os_error(&self) -> Option<i32> {
        match self {
            Self::Permission { source, .. }
            | Self::Timeout { source, .. }
            | Self::Io { source, .. } => source.raw_os_error(),
            Self::InvalidArgument { .. } | Self::CapacityClamped { .. } => None,
        }
    }

    /// Whether retrying the same call later may succeed.
    ///
    /// Deadlines and would-block conditions are retryable, as is temporary
    /// kernel resource exhaustion. Permission and argument errors are not.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Timeout { .. } => true,
            Self::Io { source, .. } => {
                source.kind() == io::ErrorKind::Interrupted
                    || matches!(
                        source.raw_os_error(),
                        Some(libc::ENOBUFS) | Some(libc::ENOMEM) | Some(libc::EAGAIN)
                    )
            }
            _ => false,
        }
    }
}
