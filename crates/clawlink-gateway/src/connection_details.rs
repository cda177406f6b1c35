//! Gateway target resolution for CLI calls.
//!
//! Precedence: an explicit `--url`, then `gateway.remote.url` when the gateway
//! runs in remote mode, then a local URL derived from the bind mode and port.
//! The resolved details double as the diagnostic block printed when a call
//! fails.

use std::net::{IpAddr, Ipv4Addr, UdpSocket};
use std::path::{Path, PathBuf};

use clawlink_core::config::{Config, GatewayBind, GatewayMode};
use clawlink_core::paths::resolve_gateway_port;
use tracing::warn;

pub const REMOTE_MISCONFIGURED_NOTE: &str = "Warn: gateway.mode=remote but gateway.remote.url is missing; set gateway.remote.url or switch gateway.mode=local.";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionDetails {
    pub url: String,
    /// Where `url` came from, e.g. `cli --url` or `local loopback`.
    pub url_source: String,
    pub config_path: PathBuf,
    /// `Bind: <mode>`, only for locally derived URLs.
    pub bind_detail: Option<String>,
    pub remote_fallback_note: Option<String>,
    /// Whether `url` points at a configured remote gateway.
    pub is_remote: bool,
}

impl ConnectionDetails {
    /// Multi-line diagnostic block.
    pub fn message(&self) -> String {
        let mut lines = vec![
            format!("Gateway target: {}", self.url),
            format!("Source: {}", self.url_source),
            format!("Config: {}", self.config_path.display()),
        ];
        lines.extend(self.bind_detail.clone());
        lines.extend(self.remote_fallback_note.clone());
        lines.join("\n")
    }
}

/// Address the default route leaves from. No packets are sent: connecting a
/// UDP socket only selects the outbound interface.
fn outbound_ipv4(probe: (Ipv4Addr, u16)) -> Option<Ipv4Addr> {
    let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).ok()?;
    socket.connect(probe).ok()?;
    match socket.local_addr().ok()?.ip() {
        IpAddr::V4(ip) if !ip.is_unspecified() => Some(ip),
        _ => None,
    }
}

fn is_tailnet(ip: Ipv4Addr) -> bool {
    // 100.64.0.0/10 carrier-grade NAT range used by Tailscale.
    let [a, b, ..] = ip.octets();
    a == 100 && (64..=127).contains(&b)
}

/// Primary private LAN address, if the host has one.
pub fn pick_primary_lan_ipv4() -> Option<Ipv4Addr> {
    outbound_ipv4((Ipv4Addr::new(8, 8, 8, 8), 80))
        .filter(|ip| ip.is_private() && !ip.is_loopback())
}

/// Tailnet address, probed via the Tailscale resolver address.
pub fn pick_primary_tailnet_ipv4() -> Option<Ipv4Addr> {
    outbound_ipv4((Ipv4Addr::new(100, 100, 100, 100), 53)).filter(|ip| is_tailnet(*ip))
}

fn non_empty(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(String::from)
}

pub fn build_connection_details(
    config: &Config,
    config_path: &Path,
    url_override: Option<&str>,
) -> ConnectionDetails {
    build_connection_details_with(
        config,
        config_path,
        url_override,
        pick_primary_lan_ipv4,
        pick_primary_tailnet_ipv4,
    )
}

fn build_connection_details_with(
    config: &Config,
    config_path: &Path,
    url_override: Option<&str>,
    lan_ip: impl FnOnce() -> Option<Ipv4Addr>,
    tailnet_ip: impl FnOnce() -> Option<Ipv4Addr>,
) -> ConnectionDetails {
    let gateway = config.gateway.clone().unwrap_or_default();
    let is_remote_mode = gateway.mode == Some(GatewayMode::Remote);
    let remote_url = is_remote_mode
        .then(|| gateway.remote.as_ref().and_then(|r| r.resolve_url()))
        .flatten();
    let remote_misconfigured = is_remote_mode && remote_url.is_none();
    let url_override = non_empty(url_override);

    let tls_enabled = gateway
        .tls
        .as_ref()
        .and_then(|t| t.enabled)
        .unwrap_or(false);
    let scheme = if tls_enabled { "wss" } else { "ws" };
    let port = resolve_gateway_port(config);
    let bind = config.gateway_bind();

    let (host, local_source) = match bind {
        GatewayBind::Tailnet => match tailnet_ip() {
            Some(ip) => (ip.to_string(), format!("local tailnet {ip}")),
            None => ("127.0.0.1".to_string(), "local loopback".to_string()),
        },
        GatewayBind::Lan => match lan_ip() {
            Some(ip) => (ip.to_string(), format!("local lan {ip}")),
            None => ("127.0.0.1".to_string(), "local loopback".to_string()),
        },
        GatewayBind::Custom => match non_empty(gateway.custom_bind_host.as_deref())
            .filter(|h| h != "0.0.0.0" && h != "::")
        {
            Some(host) => {
                let source = format!("local custom {host}");
                (host, source)
            }
            None => ("127.0.0.1".to_string(), "local loopback".to_string()),
        },
        GatewayBind::Auto | GatewayBind::Loopback => {
            ("127.0.0.1".to_string(), "local loopback".to_string())
        }
    };
    let local_url = format!("{scheme}://{host}:{port}");

    if remote_misconfigured && url_override.is_none() {
        warn!(
            config = %config_path.display(),
            "gateway.mode=remote without gateway.remote.url, falling back to local gateway"
        );
    }

    let locally_derived = url_override.is_none() && remote_url.is_none();
    let (url, url_source, is_remote) = match (url_override, remote_url) {
        (Some(url), _) => (url, "cli --url".to_string(), false),
        (None, Some(url)) => (url, "config gateway.remote.url".to_string(), true),
        (None, None) if remote_misconfigured => (
            local_url,
            "missing gateway.remote.url (fallback local)".to_string(),
            false,
        ),
        (None, None) => (local_url, local_source, false),
    };

    let bind_detail = locally_derived.then(|| format!("Bind: {}", bind.as_str()));

    ConnectionDetails {
        url,
        url_source,
        config_path: config_path.to_path_buf(),
        bind_detail,
        remote_fallback_note: remote_misconfigured.then(|| REMOTE_MISCONFIGURED_NOTE.to_string()),
        is_remote,
    }
}
