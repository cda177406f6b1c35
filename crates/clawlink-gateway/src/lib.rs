//! Gateway client implementing OpenClaw protocol v3.
//!
//! [`GatewayClient`] owns one logical connection to a gateway: it performs the
//! signed `connect` handshake, correlates requests with responses, forwards
//! events, watches server ticks, and reconnects with exponential backoff.
//! [`call_gateway`] wraps it for one-shot CLI round trips.

pub mod backoff;
pub mod call;
pub mod client;
pub mod connection_details;
pub mod error;
pub mod events;
pub mod state;
pub mod tls;
pub mod transport;

pub use call::{CallGatewayOptions, call_gateway};
pub use client::{GatewayClient, GatewayClientOptions, RequestOptions};
pub use error::{CallError, GatewayError};
pub use events::ClientEvent;
pub use state::ConnectionState;
pub use transport::{Connection, Connector, WireMessage, WsConnector};
