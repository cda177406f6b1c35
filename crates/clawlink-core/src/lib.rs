//! Core types for clawlink: wire protocol, schema validation, device
//! identity, device auth tokens, and configuration loading.

pub mod config;
pub mod device_auth;
pub mod device_identity;
pub mod error;
pub mod fingerprint;
mod fsutil;
pub mod paths;
pub mod protocol;
pub mod schema;
