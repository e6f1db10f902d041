use std::{fmt, io};

/// Error type shared by every layer of the IPC fabric.
///
/// Engine failures never appear here on the worker side; they are turned
/// into `Failure` response statuses and surface to callers through the
/// operation's natural channel (a `bool` or an `Option`). The `Engine`
/// variant exists for the client side, where a response that should have
/// carried data came back with an error status.
#[derive(Debug)]
pub enum IpcError {
    /// A shared-memory or semaphore syscall failed.
    System {
        call: &'static str,
        source: io::Error,
    },
    /// A semaphore wait was interrupted by a signal. Callers retry.
    Interrupted,
    /// Unknown operation code, bad entity size, or a malformed payload.
    Protocol(String),
    /// The request or response would not fit the shared-memory area.
    BufferOverflow { need: u64, capacity: u64 },
    /// The peer tore the channel down while we were using it.
    ChannelClosed,
    /// The storage engine rejected an operation.
    Engine(String),
}

pub type Result<T> = std::result::Result<T, IpcError>;

impl IpcError {
    /// Capture `errno` for a failed libc call.
    pub(crate) fn system(call: &'static str) -> IpcError {
        IpcError::System {
            call,
            source: io::Error::last_os_error(),
        }
    }

    pub(crate) fn protocol(msg: impl Into<String>) -> IpcError {
        IpcError::Protocol(msg.into())
    }
}

impl fmt::Display for IpcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IpcError::System { call, source } => write!(f, "{} failed: {}", call, source),
            IpcError::Interrupted => write!(f, "wait interrupted by signal"),
            IpcError::Protocol(msg) => write!(f, "protocol violation: {}", msg),
            IpcError::BufferOverflow { need, capacity } => {
                write!(f, "message of {} bytes exceeds {} byte buffer", need, capacity)
            }
            IpcError::ChannelClosed => write!(f, "channel closed by peer"),
            IpcError::Engine(msg) => write!(f, "engine error: {}", msg),
        }
    }
}

impl std::error::Error for IpcError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            IpcError::System { source, .. } => Some(source),
            _ => None,
        }
    }
}

impl From<io::Error> for IpcError {
    fn from(err: io::Error) -> Self {
        IpcError::System {
            call: "io",
            source: err,
        }
    }
}
