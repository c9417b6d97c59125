//! Error types for hop-tun

use std::io;
use std::time::Duration;
use thiserror::Error;

/// Result type alias for hop-tun operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur during tunnel adapter, configuration and route operations
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error from underlying system calls
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Argument outside of the accepted range (MTU, ring capacity, netmask, ...)
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A packet operation was attempted without an active session
    #[error("no active packet session")]
    NoSession,

    /// A session is already running on this adapter
    #[error("packet session already active")]
    SessionActive,

    /// Packet exceeds the maximum IP packet size
    #[error("packet too large: {size} > {max}")]
    PacketTooLarge { size: usize, max: usize },

    /// Adapter creation failed
    #[error("adapter creation error: {0}")]
    DeviceCreation(String),

    /// Adapter could not be opened
    #[error("adapter not found: {0}")]
    DeviceNotFound(String),

    /// Packet session could not be started or a ring operation failed
    #[error("session error: {0}")]
    Session(String),

    /// The adapter or its ring went away underneath us and must be recreated
    #[error("tunnel access lost: {0}")]
    AccessLost(String),

    /// External configuration utility exited unsuccessfully
    #[error("`{command}` failed (exit code {code:?}): {output}")]
    CommandFailed {
        command: String,
        code: Option<i32>,
        output: String,
    },

    /// External configuration utility did not finish in time
    #[error("`{command}` timed out after {timeout:?}")]
    Timeout { command: String, timeout: Duration },

    /// No usable physical default route
    #[error("route not found: {0}")]
    RouteNotFound(String),

    /// Operation not supported on this platform
    #[error("operation not supported: {0}")]
    NotSupported(String),
}

impl Error {
    /// Check if the error is a caller-side precondition violation
    pub fn is_precondition(&self) -> bool {
        matches!(
            self,
            Error::InvalidArgument(_)
                | Error::NoSession
                | Error::SessionActive
                | Error::PacketTooLarge { .. }
        )
    }

    /// Check if the error is a not-found error
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::DeviceNotFound(_) | Error::RouteNotFound(_))
            || matches!(self, Error::Io(e) if e.kind() == io::ErrorKind::NotFound)
    }

    /// Check if the adapter must be discarded and recreated by the caller
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::AccessLost(_))
    }
}
