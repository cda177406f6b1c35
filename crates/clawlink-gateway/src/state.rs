//! Connection state types.

use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};

/// Lifecycle of a [`GatewayClient`](crate::GatewayClient) connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No socket; either not started, waiting to reconnect, or stopped.
    Disconnected,
    /// Opening the socket (and verifying the TLS pin, if any).
    Connecting,
    /// Socket open, `connect` queued or sent, waiting for `hello-ok`.
    AwaitingHello,
    /// Handshake complete.
    Ready,
    /// Tearing the socket down.
    Closing,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::AwaitingHello => "awaiting-hello",
            Self::Ready => "ready",
            Self::Closing => "closing",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Atomic wrapper so client handles can observe the driver's state.
#[derive(Debug)]
pub struct AtomicConnectionState(AtomicU8);

impl AtomicConnectionState {
    #[must_use]
    pub const fn new(state: ConnectionState) -> Self {
        Self(AtomicU8::new(state as u8))
    }

    #[must_use]
    pub fn load(&self) -> ConnectionState {
        match self.0.load(Ordering::SeqCst) {
            0 => ConnectionState::Disconnected,
            1 => ConnectionState::Connecting,
            2 => ConnectionState::AwaitingHello,
            3 => ConnectionState::Ready,
            _ => ConnectionState::Closing,
        }
    }

    pub fn store(&self, state: ConnectionState) {
        self.0.store(state as u8, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_atomic_connection_state() {
        let state = AtomicConnectionState::new(ConnectionState::Disconnected);
        assert_eq!(state.load(), ConnectionState::Disconnected);

        for next in [
            ConnectionState::Connecting,
            ConnectionState::AwaitingHello,
            ConnectionState::Ready,
            ConnectionState::Closing,
        ] {
            state.store(next);
            assert_eq!(state.load(), next);
        }
    }

    #[test]
    fn test_state_display() {
        assert_eq!(ConnectionState::AwaitingHello.to_string(), "awaiting-hello");
    }
}
