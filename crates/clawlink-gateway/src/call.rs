//! One-shot gateway calls.
//!
//! Connects, waits for the handshake, issues exactly one request, and stops.
//! Unlike a long-lived [`GatewayClient`], a close or timeout before the
//! response arrives is final: there is no retry at this layer.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clawlink_core::config::{Config, ConfigLoader, GatewayMode};
use clawlink_core::device_auth::DeviceAuthStore;
use clawlink_core::device_identity::DeviceIdentity;
use clawlink_core::paths;
use clawlink_core::protocol::{client_ids, client_modes, scopes};
use serde_json::Value;
use tracing::debug;

use crate::client::{GatewayClient, GatewayClientOptions, RequestOptions};
use crate::connection_details::{ConnectionDetails, build_connection_details};
use crate::error::{CallError, GatewayError};
use crate::events::ClientEvent;
use crate::transport::{Connector, WsConnector};

pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(10);
pub const GATEWAY_TOKEN_ENV: &str = "OPENCLAW_GATEWAY_TOKEN";
pub const GATEWAY_PASSWORD_ENV: &str = "OPENCLAW_GATEWAY_PASSWORD";

#[derive(Debug, Clone)]
pub struct CallGatewayOptions {
    pub method: String,
    pub params: Option<Value>,
    pub expect_final: bool,
    pub timeout: Duration,
    /// Explicit URL; beats every configured target.
    pub url: Option<String>,
    pub token: Option<String>,
    pub password: Option<String>,
    pub tls_fingerprint: Option<String>,
    pub client_name: String,
    pub client_display_name: Option<String>,
    pub mode: String,
    pub instance_id: Option<String>,
    pub scopes: Vec<String>,
    /// Preloaded config; loaded from disk when absent.
    pub config: Option<Arc<Config>>,
    pub config_path: Option<PathBuf>,
    pub device_identity: Option<DeviceIdentity>,
    pub token_store: Option<DeviceAuthStore>,
}

impl CallGatewayOptions {
    pub fn new(method: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            params: None,
            expect_final: false,
            timeout: DEFAULT_CALL_TIMEOUT,
            url: None,
            token: None,
            password: None,
            tls_fingerprint: None,
            client_name: client_ids::CLI.to_string(),
            client_display_name: None,
            mode: client_modes::CLI.to_string(),
            instance_id: None,
            scopes: vec![
                scopes::ADMIN.to_string(),
                scopes::APPROVALS.to_string(),
                scopes::PAIRING.to_string(),
            ],
            config: None,
            config_path: None,
            device_identity: None,
            token_store: None,
        }
    }

    pub fn params(mut self, params: Value) -> Self {
        self.params = Some(params);
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CallAuth {
    /// Supplied by the caller; outranks stored device tokens.
    pub explicit_token: Option<String>,
    /// From the environment or config; used when no device token is stored.
    pub shared_token: Option<String>,
    pub password: Option<String>,
}

fn trimmed(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// Resolve credentials: explicit options, then environment, then config.
/// Remote targets use `gateway.remote.*`; local ones use `gateway.auth.*`.
pub fn resolve_call_auth(
    options: &CallGatewayOptions,
    config: &Config,
    is_remote: bool,
    env: impl Fn(&str) -> Option<String>,
) -> CallAuth {
    let gateway = config.gateway.clone().unwrap_or_default();
    let remote = gateway.remote.unwrap_or_default();
    let auth = gateway.auth.unwrap_or_default();

    let shared_token = trimmed(env(GATEWAY_TOKEN_ENV)).or_else(|| {
        if is_remote {
            remote.resolve_token()
        } else {
            auth.resolve_token()
        }
    });
    let password = trimmed(options.password.clone())
        .or_else(|| trimmed(env(GATEWAY_PASSWORD_ENV)))
        .or_else(|| {
            if is_remote {
                remote.resolve_password()
            } else {
                auth.resolve_password()
            }
        });

    CallAuth {
        explicit_token: trimmed(options.token.clone()),
        shared_token,
        password,
    }
}

/// Call `options.method` once over a WebSocket.
pub async fn call_gateway(options: CallGatewayOptions) -> Result<Value, CallError> {
    call_gateway_with(options, Arc::new(WsConnector)).await
}

/// Call `options.method` once over the given transport.
pub async fn call_gateway_with(
    options: CallGatewayOptions,
    connector: Arc<dyn Connector>,
) -> Result<Value, CallError> {
    let config_path = options
        .config_path
        .clone()
        .unwrap_or_else(paths::resolve_config_path);
    let config = match &options.config {
        Some(config) => Arc::clone(config),
        None => ConfigLoader::new(config_path.clone()).load_config(),
    };
    let details = build_connection_details(&config, &config_path, options.url.as_deref());
    let auth = resolve_call_auth(&options, &config, details.is_remote, |name| {
        std::env::var(name).ok()
    });
    let tls_fingerprint = trimmed(options.tls_fingerprint.clone()).or_else(|| {
        details
            .is_remote
            .then(|| {
                config
                    .gateway
                    .as_ref()
                    .and_then(|g| g.remote.as_ref())
                    .and_then(|r| r.tls_fingerprint.clone())
            })
            .flatten()
    });
    debug!(
        url = %details.url,
        source = %details.url_source,
        method = %options.method,
        remote = config.gateway.as_ref().and_then(|g| g.mode) == Some(GatewayMode::Remote),
        "Calling gateway"
    );

    let client_options = GatewayClientOptions {
        url: details.url.clone(),
        token: auth.explicit_token,
        shared_token: auth.shared_token,
        password: auth.password,
        tls_fingerprint,
        instance_id: options.instance_id.clone(),
        client_name: options.client_name.clone(),
        client_display_name: options.client_display_name.clone(),
        mode: options.mode.clone(),
        scopes: options.scopes.clone(),
        device_identity: options.device_identity.clone(),
        token_store: options.token_store.clone(),
        ..Default::default()
    };
    run_once(options, client_options, connector, &details).await
}

async fn run_once(
    options: CallGatewayOptions,
    client_options: GatewayClientOptions,
    connector: Arc<dyn Connector>,
    details: &ConnectionDetails,
) -> Result<Value, CallError> {
    let (client, mut events) = GatewayClient::new(client_options, connector);
    client.start();

    let CallGatewayOptions {
        method,
        params,
        expect_final,
        timeout,
        ..
    } = options;
    let exchange = async {
        loop {
            match events.recv().await {
                Some(ClientEvent::HelloOk(_)) => {
                    return client
                        .request(&method, params, RequestOptions { expect_final })
                        .await;
                }
                Some(ClientEvent::ConnectError(err)) => return Err(err),
                Some(ClientEvent::Closed { code, reason }) => {
                    return Err(GatewayError::Closed { code, reason });
                }
                Some(_) => {}
                None => return Err(GatewayError::Stopped),
            }
        }
    };
    let outcome = match tokio::time::timeout(timeout, exchange).await {
        Ok(outcome) => outcome,
        Err(_) => Err(GatewayError::Timeout(timeout.as_millis() as u64)),
    };
    client.stop();

    outcome.map_err(|error| CallError {
        error,
        details: details.message(),
    })
}
