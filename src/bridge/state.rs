use parking_lot::Mutex;
use serde::Serialize;
use std::fmt;

/// Lifecycle of a bridge connection.
///
/// `Disconnected -> Connecting -> Connected -> Disconnecting -> Disconnected`.
/// A failed start goes straight from `Connecting` back to `Disconnected`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
}

impl ConnectionState {
    fn can_move_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Disconnected, Self::Connecting)
                | (Self::Connecting, Self::Connected | Self::Disconnected)
                | (Self::Connected, Self::Disconnecting)
                | (Self::Disconnecting, Self::Disconnected)
        )
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Disconnecting => "disconnecting",
        };
        f.write_str(label)
    }
}

/// Shared, transition-checked connection state.
#[derive(Debug)]
pub struct ConnectionStatus {
    state: Mutex<ConnectionState>,
}

impl Default for ConnectionStatus {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionStatus {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(ConnectionState::Disconnected),
        }
    }

    pub fn get(&self) -> ConnectionState {
        *self.state.lock()
    }

    pub fn is_connected(&self) -> bool {
        self.get() == ConnectionState::Connected
    }

    /// Move to `next` if that is a legal edge from the current state.
    ///
    /// Returns the previous state on success, or the current state when the
    /// transition is refused.
    pub fn transition(&self, next: ConnectionState) -> Result<ConnectionState, ConnectionState> {
        let mut state = self.state.lock();
        let current = *state;
        if current.can_move_to(next) {
            *state = next;
            Ok(current)
        } else {
            Err(current)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_lifecycle_is_accepted() {
        let status = ConnectionStatus::new();
        assert_eq!(status.get(), ConnectionState::Disconnected);
        assert!(status.transition(ConnectionState::Connecting).is_ok());
        assert!(status.transition(ConnectionState::Connected).is_ok());
        assert!(status.is_connected());
        assert!(status.transition(ConnectionState::Disconnecting).is_ok());
        assert!(status.transition(ConnectionState::Disconnected).is_ok());
    }

    #[test]
    fn failed_start_returns_to_disconnected() {
        let status = ConnectionStatus::new();
        status.transition(ConnectionState::Connecting).unwrap();
        assert_eq!(
            status.transition(ConnectionState::Disconnected),
            Ok(ConnectionState::Connecting)
        );
    }

    #[test]
    fn skipping_states_is_refused() {
        let status = ConnectionStatus::new();
        assert_eq!(
            status.transition(ConnectionState::Connected),
            Err(ConnectionState::Disconnected)
        );
        assert_eq!(
            status.transition(ConnectionState::Disconnecting),
            Err(ConnectionState::Disconnected)
        );
        status.transition(ConnectionState::Connecting).unwrap();
        assert!(status.transition(ConnectionState::Connecting).is_err());
    }
}
