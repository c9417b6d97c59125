//! Error types for the guard

use thiserror::Error;

/// Result type alias for guard operations
pub type Result<T> = std::result::Result<T, Error>;

/// Coarse classification shared by every layer of the guard
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// The caller asked for something the current state or input forbids
    PreconditionViolation,
    /// A native or external call reported failure
    PlatformCallFailure,
    /// A required object (route, adapter, config item) is absent
    NotFound,
    /// The tunnel resource must be discarded and recreated by the caller
    TransientAccessLoss,
}

/// Errors that can occur while guarding a tunnel
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Failed to parse configuration file
    #[error("failed to parse config: {0}")]
    ConfigParse(#[from] toml::de::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Tunnel adapter, netsh or route error
    #[error("tunnel error: {0}")]
    Tun(#[from] hop_tun::Error),

    /// Filter engine or kill-switch error
    #[error("firewall error: {0}")]
    Firewall(#[from] hop_firewall::Error),

    /// Invalid state
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// A failed connect could not be fully undone
    #[error("{original}; rollback failed: {rollback}")]
    RollbackFailed {
        original: Box<Error>,
        rollback: Box<Error>,
    },
}

impl Error {
    /// Classify the error
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Config(_) | Error::ConfigParse(_) | Error::InvalidState(_) => {
                ErrorKind::PreconditionViolation
            }
            Error::Io(e) if e.kind() == std::io::ErrorKind::NotFound => ErrorKind::NotFound,
            Error::Io(_) => ErrorKind::PlatformCallFailure,
            Error::Tun(e) if e.is_precondition() => ErrorKind::PreconditionViolation,
            Error::Tun(e) if e.is_not_found() => ErrorKind::NotFound,
            Error::Tun(e) if e.is_transient() => ErrorKind::TransientAccessLoss,
            Error::Tun(_) => ErrorKind::PlatformCallFailure,
            Error::Firewall(e) if e.is_precondition() => ErrorKind::PreconditionViolation,
            Error::Firewall(e) if e.is_not_found() => ErrorKind::NotFound,
            Error::Firewall(_) => ErrorKind::PlatformCallFailure,
            Error::RollbackFailed { original, .. } => original.kind(),
        }
    }

    /// Check if the caller should recreate the adapter and try again
    pub fn is_recoverable(&self) -> bool {
        self.kind() == ErrorKind::TransientAccessLoss
    }

    /// Check if this is a configuration error
    pub fn is_config_error(&self) -> bool {
        matches!(self, Error::Config(_) | Error::ConfigParse(_))
    }
}
