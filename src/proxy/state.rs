//! Connection state shared by both legs.
//!
//! # Responsibilities
//! - Enumerate the states that govern message dispatch
//! - Store the active state atomically so cross-task writers can observe it

use std::sync::atomic::{AtomicU8, Ordering};

/// State of a client or server connection.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    /// Connected and awaiting the head of a new message.
    AwaitingInitial = 0,
    /// Connected and awaiting body chunks of the current message.
    AwaitingChunk = 1,
    /// Waiting for the client to retry with valid proxy credentials.
    AwaitingProxyAuthentication = 2,
    /// Dialing the next hop.
    Connecting = 3,
    /// Performing a TLS or proxy-authentication handshake.
    Handshaking = 4,
    /// Relaying raw bytes (CONNECT tunnel or switched protocol).
    Tunneling = 5,
    /// Disconnect was asked for but the transport has not closed yet.
    DisconnectRequested = 6,
    Disconnected = 7,
}

impl ConnectionState {
    /// States that occur while a connection is being set up.
    pub fn is_part_of_connect_flow(self) -> bool {
        matches!(self, ConnectionState::Connecting | ConnectionState::Handshaking)
    }

    pub fn is_disconnecting(self) -> bool {
        matches!(
            self,
            ConnectionState::DisconnectRequested | ConnectionState::Disconnected
        )
    }
}

impl From<u8> for ConnectionState {
    fn from(val: u8) -> Self {
        match val {
            0 => ConnectionState::AwaitingInitial,
            1 => ConnectionState::AwaitingChunk,
            2 => ConnectionState::AwaitingProxyAuthentication,
            3 => ConnectionState::Connecting,
            4 => ConnectionState::Handshaking,
            5 => ConnectionState::Tunneling,
            6 => ConnectionState::DisconnectRequested,
            _ => ConnectionState::Disconnected,
        }
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ConnectionState::AwaitingInitial => "AWAITING_INITIAL",
            ConnectionState::AwaitingChunk => "AWAITING_CHUNK",
            ConnectionState::AwaitingProxyAuthentication => "AWAITING_PROXY_AUTHENTICATION",
            ConnectionState::Connecting => "CONNECTING",
            ConnectionState::Handshaking => "HANDSHAKING",
            ConnectionState::Tunneling => "TUNNELING",
            ConnectionState::DisconnectRequested => "DISCONNECT_REQUESTED",
            ConnectionState::Disconnected => "DISCONNECTED",
        };
        f.write_str(name)
    }
}

/// Atomic holder for a [`ConnectionState`].
#[derive(Debug)]
pub struct StateCell(AtomicU8);

impl StateCell {
    pub fn new(state: ConnectionState) -> Self {
        Self(AtomicU8::new(state as u8))
    }

    pub fn get(&self) -> ConnectionState {
        ConnectionState::from(self.0.load(Ordering::Acquire))
    }

    /// Store `state`, returning the previous one.
    pub fn set(&self, state: ConnectionState) -> ConnectionState {
        ConnectionState::from(self.0.swap(state as u8, Ordering::AcqRel))
    }

    /// Store `new` only if the current state is still `expected`.
    pub fn transition(&self, expected: ConnectionState, new: ConnectionState) -> bool {
        self.0
            .compare_exchange(expected as u8, new as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_u8() {
        for state in [
            ConnectionState::AwaitingInitial,
            ConnectionState::AwaitingChunk,
            ConnectionState::AwaitingProxyAuthentication,
            ConnectionState::Connecting,
            ConnectionState::Handshaking,
            ConnectionState::Tunneling,
            ConnectionState::DisconnectRequested,
            ConnectionState::Disconnected,
        ] {
            assert_eq!(ConnectionState::from(state as u8), state);
        }
    }

    #[test]
    fn connect_flow_states() {
        assert!(ConnectionState::Connecting.is_part_of_connect_flow());
        assert!(ConnectionState::Handshaking.is_part_of_connect_flow());
        assert!(!ConnectionState::AwaitingInitial.is_part_of_connect_flow());
    }

    #[test]
    fn cell_reports_previous_state() {
        let cell = StateCell::new(ConnectionState::Disconnected);
        assert_eq!(cell.set(ConnectionState::Connecting), ConnectionState::Disconnected);
        assert_eq!(cell.get(), ConnectionState::Connecting);
    }

    #[test]
    fn transition_requires_expected_state() {
        let cell = StateCell::new(ConnectionState::AwaitingChunk);
        assert!(!cell.transition(ConnectionState::AwaitingInitial, ConnectionState::Tunneling));
        assert!(cell.transition(ConnectionState::AwaitingChunk, ConnectionState::AwaitingInitial));
        assert_eq!(cell.get(), ConnectionState::AwaitingInitial);
    }
}
