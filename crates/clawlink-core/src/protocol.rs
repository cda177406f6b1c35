//! OpenClaw gateway wire protocol v3.
//!
//! All gateway communication uses JSON-over-WebSocket with three frame types:
//! Request, Response, and Event. Field names on the wire are camelCase.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Protocol version spoken by this client.
pub const PROTOCOL_VERSION: u32 = 3;

/// Default policy values a server advertises when it has no overrides.
pub const DEFAULT_MAX_PAYLOAD: u64 = 512 * 1024;
pub const DEFAULT_MAX_BUFFERED_BYTES: u64 = 1536 * 1024;
pub const DEFAULT_TICK_INTERVAL_MS: u64 = 30_000;

/// Top-level gateway wire frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum GatewayFrame {
    /// Client -> Server request.
    #[serde(rename = "req")]
    Request {
        id: String,
        method: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        params: Option<serde_json::Value>,
    },

    /// Server -> Client response.
    #[serde(rename = "res")]
    Response {
        id: String,
        ok: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        payload: Option<serde_json::Value>,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<ErrorShape>,
    },

    /// Server -> Client event broadcast.
    #[serde(rename = "event")]
    Event {
        event: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        payload: Option<serde_json::Value>,
        #[serde(skip_serializing_if = "Option::is_none")]
        seq: Option<u64>,
        #[serde(rename = "stateVersion", skip_serializing_if = "Option::is_none")]
        state_version: Option<StateVersion>,
    },
}

impl GatewayFrame {
    pub fn request(
        id: impl Into<String>,
        method: impl Into<String>,
        params: Option<serde_json::Value>,
    ) -> Self {
        Self::Request {
            id: id.into(),
            method: method.into(),
            params,
        }
    }
}

/// Error shape returned in response frames.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorShape {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retryable: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after_ms: Option<u64>,
}

impl ErrorShape {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            details: None,
            retryable: None,
            retry_after_ms: None,
        }
    }
}

/// Monotonic state version counters for client staleness detection.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateVersion {
    pub presence: u64,
    pub health: u64,
}

/// Client handshake parameters carried by the `connect` request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectParams {
    pub min_protocol: u32,
    pub max_protocol: u32,
    pub client: ClientInfo,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub caps: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub commands: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub permissions: Option<BTreeMap<String, bool>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path_env: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scopes: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device: Option<DeviceParams>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auth: Option<AuthParams>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub locale: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_agent: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientInfo {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    pub version: String,
    pub platform: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_family: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model_identifier: Option<String>,
    pub mode: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instance_id: Option<String>,
}

/// Shared-secret credentials presented during the handshake.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AuthParams {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
}

impl AuthParams {
    pub fn is_empty(&self) -> bool {
        self.token.is_none() && self.password.is_none()
    }
}

/// Signed device block proving possession of the device key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceParams {
    pub id: String,
    /// Raw 32-byte Ed25519 public key, base64url without padding.
    pub public_key: String,
    pub signature: String,
    pub signed_at: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nonce: Option<String>,
}

/// Server hello response after a successful handshake.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HelloOk {
    #[serde(rename = "type")]
    pub kind: String,
    pub protocol: u32,
    pub server: ServerInfo,
    pub features: Features,
    pub snapshot: serde_json::Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub canvas_host_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auth: Option<HelloAuth>,
    pub policy: Policy,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerInfo {
    pub version: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub commit: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    pub conn_id: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Features {
    pub methods: Vec<String>,
    pub events: Vec<String>,
}

/// Device token issued by the gateway in `hello-ok`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HelloAuth {
    pub device_token: String,
    pub role: String,
    pub scopes: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub issued_at_ms: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Policy {
    pub max_payload: u64,
    pub max_buffered_bytes: u64,
    pub tick_interval_ms: u64,
}

impl Default for Policy {
    fn default() -> Self {
        Self {
            max_payload: DEFAULT_MAX_PAYLOAD,
            max_buffered_bytes: DEFAULT_MAX_BUFFERED_BYTES,
            tick_interval_ms: DEFAULT_TICK_INTERVAL_MS,
        }
    }
}

/// Payload of the `connect.challenge` event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChallengePayload {
    pub nonce: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ts: Option<u64>,
}

/// Well-known event names.
pub mod events {
    pub const CONNECT_CHALLENGE: &str = "connect.challenge";
    pub const TICK: &str = "tick";
}

/// Well-known client ids.
pub mod client_ids {
    pub const GATEWAY_CLIENT: &str = "gateway-client";
    pub const CLI: &str = "cli";
    pub const NODE_HOST: &str = "node-host";
}

/// Client modes.
pub mod client_modes {
    pub const BACKEND: &str = "backend";
    pub const CLI: &str = "cli";
    pub const NODE: &str = "node";
    pub const UI: &str = "ui";
}

pub mod roles {
    pub const OPERATOR: &str = "operator";
    pub const NODE: &str = "node";
}

pub mod scopes {
    pub const ADMIN: &str = "operator.admin";
    pub const READ: &str = "operator.read";
    pub const WRITE: &str = "operator.write";
    pub const APPROVALS: &str = "operator.approvals";
    pub const PAIRING: &str = "operator.pairing";
}

pub mod error_codes {
    pub const INVALID_REQUEST: &str = "INVALID_REQUEST";
    pub const NOT_LINKED: &str = "NOT_LINKED";
    pub const NOT_PAIRED: &str = "NOT_PAIRED";
    pub const AGENT_TIMEOUT: &str = "AGENT_TIMEOUT";
    pub const UNAVAILABLE: &str = "UNAVAILABLE";
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_request_frame_wire_shape() {
        let frame = GatewayFrame::request("r1", "agents.list", Some(json!({})));
        let value = serde_json::to_value(&frame).unwrap();
        assert_eq!(
            value,
            json!({"type": "req", "id": "r1", "method": "agents.list", "params": {}})
        );
    }

    #[test]
    fn test_event_frame_state_version_is_camel_case() {
        let raw = r#"{"type":"event","event":"presence","seq":7,"stateVersion":{"presence":2,"health":1}}"#;
        let frame: GatewayFrame = serde_json::from_str(raw).unwrap();
        match frame {
            GatewayFrame::Event {
                seq, state_version, ..
            } => {
                assert_eq!(seq, Some(7));
                assert_eq!(state_version.unwrap().presence, 2);
            }
            other => panic!("unexpected frame {other:?}"),
        }
    }

    #[test]
    fn test_connect_params_camel_case() {
        let params = ConnectParams {
            min_protocol: PROTOCOL_VERSION,
            max_protocol: PROTOCOL_VERSION,
            client: ClientInfo {
                id: client_ids::CLI.into(),
                display_name: None,
                version: "dev".into(),
                platform: "linux".into(),
                device_family: None,
                model_identifier: None,
                mode: client_modes::CLI.into(),
                instance_id: Some("inst-1".into()),
            },
            caps: None,
            commands: None,
            permissions: None,
            path_env: None,
            role: Some(roles::OPERATOR.into()),
            scopes: Some(vec![scopes::ADMIN.into()]),
            device: None,
            auth: Some(AuthParams {
                token: Some("t".into()),
                password: None,
            }),
            locale: None,
            user_agent: None,
        };
        let value = serde_json::to_value(&params).unwrap();
        assert_eq!(value["minProtocol"], 3);
        assert_eq!(value["client"]["instanceId"], "inst-1");
        assert_eq!(value["auth"], json!({"token": "t"}));
        assert!(value.get("device").is_none());
    }

    #[test]
    fn test_hello_ok_parse() {
        let raw = json!({
            "type": "hello-ok",
            "protocol": 3,
            "server": {"version": "1.2.3", "connId": "c1"},
            "features": {"methods": ["health"], "events": ["tick"]},
            "snapshot": {},
            "auth": {"deviceToken": "dt", "role": "operator", "scopes": ["operator.admin"]},
            "policy": {"maxPayload": 1, "maxBufferedBytes": 2, "tickIntervalMs": 100}
        });
        let hello: HelloOk = serde_json::from_value(raw).unwrap();
        assert_eq!(hello.kind, "hello-ok");
        assert_eq!(hello.server.conn_id, "c1");
        assert_eq!(hello.policy.tick_interval_ms, 100);
        assert_eq!(hello.auth.unwrap().device_token, "dt");
    }
}
