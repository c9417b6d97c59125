//! Error types for hop-firewall

use thiserror::Error;

/// Result type alias for hop-firewall operations
pub type Result<T> = std::result::Result<T, Error>;

/// Native status codes reported by the filter engine
pub mod codes {
    /// The object already exists
    pub const FWP_E_ALREADY_EXISTS: u32 = 0x8032_0009;
    /// The filter does not exist
    pub const FWP_E_FILTER_NOT_FOUND: u32 = 0x8032_0003;
    /// The sublayer does not exist
    pub const FWP_E_SUBLAYER_NOT_FOUND: u32 = 0x8032_0007;
    /// The object is referenced by other objects and cannot be deleted
    pub const FWP_E_IN_USE: u32 = 0x8032_0006;
    /// The call is not allowed from within an explicit transaction
    pub const FWP_E_TXN_IN_PROGRESS: u32 = 0x8032_000D;
    /// The call must be made from within an explicit transaction
    pub const FWP_E_NO_TXN_IN_PROGRESS: u32 = 0x8032_000C;
    /// The engine handle is invalid (ERROR_INVALID_HANDLE)
    pub const ERROR_INVALID_HANDLE: u32 = 6;
}

/// Errors that can occur while driving the filter engine
#[derive(Debug, Error)]
pub enum Error {
    /// `enable` called while the kill-switch is already active
    #[error("kill-switch is already enabled")]
    AlreadyEnabled,

    /// Operation requires an active kill-switch
    #[error("kill-switch is not enabled")]
    NotEnabled,

    /// The engine session was closed
    #[error("filter engine is closed")]
    EngineClosed,

    /// The requested allow-list cannot be installed
    #[error("invalid kill-switch policy: {0}")]
    InvalidPolicy(String),

    /// Native filter-engine call failed
    #[error("{op} failed: 0x{code:08X}")]
    Platform { op: &'static str, code: u32 },

    /// A failed step could not be rolled back either
    #[error("{original}; rollback also failed: {cleanup}")]
    CleanupFailed {
        original: Box<Error>,
        cleanup: Box<Error>,
    },

    /// Rules are still installed after a failed disable
    #[error("kill-switch disable failed with {remaining} rule(s) still installed: {source}")]
    DisableFailed {
        remaining: usize,
        #[source]
        source: Box<Error>,
    },
}

impl Error {
    /// Shorthand for a native failure
    pub fn platform(op: &'static str, code: u32) -> Self {
        Error::Platform { op, code }
    }

    /// Native status code, looking through wrappers
    pub fn code(&self) -> Option<u32> {
        match self {
            Error::Platform { code, .. } => Some(*code),
            Error::CleanupFailed { original, .. } => original.code(),
            Error::DisableFailed { source, .. } => source.code(),
            _ => None,
        }
    }

    /// Check if the engine reported an existing object
    pub fn is_already_exists(&self) -> bool {
        matches!(self, Error::Platform { code, .. } if *code == codes::FWP_E_ALREADY_EXISTS)
    }

    /// Check if the engine reported a missing filter or sublayer
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Error::Platform { code, .. }
                if *code == codes::FWP_E_FILTER_NOT_FOUND || *code == codes::FWP_E_SUBLAYER_NOT_FOUND
        )
    }

    /// Check if the error is a caller-side precondition violation
    pub fn is_precondition(&self) -> bool {
        matches!(
            self,
            Error::AlreadyEnabled | Error::NotEnabled | Error::EngineClosed | Error::InvalidPolicy(_)
        )
    }
}
