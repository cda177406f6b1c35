//! Events surfaced by the client to its owner.

use std::time::Duration;

use clawlink_core::protocol::{HelloOk, StateVersion};
use serde_json::Value;

use crate::error::GatewayError;

#[derive(Debug, Clone)]
pub enum ClientEvent {
    /// Handshake completed.
    HelloOk(Box<HelloOk>),
    /// A server event, forwarded verbatim. `connect.challenge` never appears here.
    Event {
        event: String,
        payload: Option<Value>,
        seq: Option<u64>,
        state_version: Option<StateVersion>,
    },
    /// Event sequence numbers skipped ahead.
    Gap { expected: u64, received: u64 },
    /// The `connect` request failed or could not be sent.
    ConnectError(GatewayError),
    /// The socket closed.
    Closed { code: u16, reason: String },
    /// A reconnect is scheduled after `delay`.
    Reconnecting { delay: Duration },
}
