use serde::{Deserialize, Serialize};

use crate::error::SyncError;

/// Per-namespace connection lifecycle state.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ConnectionState {
    /// No connection requested yet.
    Idle,
    /// Initial connect in flight.
    Connecting,
    /// Transport established; session-mutating traffic allowed.
    Connected,
    /// Transport lost; bounded reconnect attempts running.
    Reconnecting,
    /// Reconnect bound exceeded; terminal until a new connect request.
    GaveUp,
    /// Explicitly disconnected by the user.
    Disconnected,
}

/// State machine guarding connection lifecycle transitions.
///
/// Session-mutating commands are only accepted in [`ConnectionState::Connected`];
/// callers outside that state receive a stable `not_connected` error rather
/// than a partial mutation.
#[derive(Debug, Clone)]
pub struct ConnectionStateMachine {
    state: ConnectionState,
}

impl Default for ConnectionStateMachine {
    fn default() -> Self {
        Self {
            state: ConnectionState::Idle,
        }
    }
}

impl ConnectionStateMachine {
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected
    }

    /// Guard for commands that mutate session state.
    pub fn require_connected(&self, action: &str) -> Result<(), SyncError> {
        if self.is_connected() {
            Ok(())
        } else {
            Err(SyncError::not_connected(action))
        }
    }

    /// User requested a connection (fresh, after disconnect, or after give-up).
    pub fn on_connect_requested(&mut self) -> Result<ConnectionState, SyncError> {
        self.transition_from_any_of(
            &[
                ConnectionState::Idle,
                ConnectionState::Disconnected,
                ConnectionState::GaveUp,
            ],
            ConnectionState::Connecting,
            "connect",
        )
    }

    /// Transport established (first connect or a successful reconnect).
    pub fn on_connected(&mut self) -> Result<ConnectionState, SyncError> {
        self.transition_from_any_of(
            &[ConnectionState::Connecting, ConnectionState::Reconnecting],
            ConnectionState::Connected,
            "connected",
        )
    }

    /// Transport dropped; reconnect attempts begin.
    pub fn on_connection_lost(&mut self) -> Result<ConnectionState, SyncError> {
        self.transition_from_any_of(
            &[ConnectionState::Connected, ConnectionState::Connecting],
            ConnectionState::Reconnecting,
            "connection_lost",
        )
    }

    /// Reconnect bound exceeded.
    pub fn on_retry_exhausted(&mut self) -> Result<ConnectionState, SyncError> {
        self.transition_from_any_of(
            &[ConnectionState::Reconnecting, ConnectionState::Connecting],
            ConnectionState::GaveUp,
            "retry_exhausted",
        )
    }

    /// Explicit user disconnect, valid from any state.
    pub fn on_disconnect(&mut self) -> ConnectionState {
        self.state = ConnectionState::Disconnected;
        self.state
    }

    fn transition_from_any_of(
        &mut self,
        expected: &[ConnectionState],
        next: ConnectionState,
        action: &str,
    ) -> Result<ConnectionState, SyncError> {
        if !expected.contains(&self.state) {
            return Err(SyncError::invalid_state(self.state, action));
        }
        self.state = next;
        Ok(next)
    }
}
