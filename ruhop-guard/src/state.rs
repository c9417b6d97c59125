//! Guard state

/// Connection state of a [`Guard`](crate::Guard)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuardState {
    /// Nothing is installed
    Disconnected,
    /// Bringing the tunnel and kill-switch up
    Connecting,
    /// Tunnel configured and kill-switch active
    Connected,
    /// Removing the kill-switch and ending the session
    Disconnecting,
    /// A step failed and something may still be installed
    Error,
}

impl GuardState {
    /// Check if the guard is in a transitional or connected state
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            GuardState::Connecting | GuardState::Connected | GuardState::Disconnecting
        )
    }

    pub fn is_connected(&self) -> bool {
        matches!(self, GuardState::Connected)
    }

    /// Check if `connect` may be called
    pub fn can_connect(&self) -> bool {
        matches!(self, GuardState::Disconnected | GuardState::Error)
    }

    /// Get a human-readable description
    pub fn description(&self) -> &'static str {
        match self {
            GuardState::Disconnected => "Disconnected",
            GuardState::Connecting => "Connecting...",
            GuardState::Connected => "Connected",
            GuardState::Disconnecting => "Disconnecting...",
            GuardState::Error => "Error",
        }
    }
}

impl std::fmt::Display for GuardState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.description())
    }
}
