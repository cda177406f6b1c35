//! State directory and config path resolution.
//!
//! Every persisted artifact (config, device identity, device auth tokens)
//! lives under the state directory unless an environment override relocates it.

use std::path::{Path, PathBuf};

/// Environment variable relocating the state directory.
pub const STATE_DIR_ENV: &str = "OPENCLAW_STATE_DIR";
/// Environment variable pointing at an explicit config file.
pub const CONFIG_PATH_ENV: &str = "OPENCLAW_CONFIG_PATH";
/// Environment variable overriding the gateway port.
pub const GATEWAY_PORT_ENV: &str = "OPENCLAW_GATEWAY_PORT";

pub const DEFAULT_GATEWAY_PORT: u16 = 18789;

const STATE_DIR_NAME: &str = ".openclaw";
const CONFIG_FILE_NAME: &str = "openclaw.json";

fn process_env(name: &str) -> Option<String> {
    std::env::var(name).ok()
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn expand_user(raw: &str) -> PathBuf {
    PathBuf::from(shellexpand::tilde(raw).as_ref())
}

/// Resolve the state directory: `$OPENCLAW_STATE_DIR` or `~/.openclaw`.
pub fn resolve_state_dir() -> PathBuf {
    resolve_state_dir_with(process_env)
}

pub fn resolve_state_dir_with(env: impl Fn(&str) -> Option<String>) -> PathBuf {
    if let Some(dir) = non_empty(env(STATE_DIR_ENV)) {
        return expand_user(&dir);
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(STATE_DIR_NAME)
}

/// Resolve the config file path: `$OPENCLAW_CONFIG_PATH` or `<state>/openclaw.json`.
pub fn resolve_config_path() -> PathBuf {
    resolve_config_path_with(process_env)
}

pub fn resolve_config_path_with(env: impl Fn(&str) -> Option<String>) -> PathBuf {
    if let Some(path) = non_empty(env(CONFIG_PATH_ENV)) {
        return expand_user(&path);
    }
    config_path_in(&resolve_state_dir_with(&env))
}

pub fn config_path_in(state_dir: &Path) -> PathBuf {
    state_dir.join(CONFIG_FILE_NAME)
}

/// Path of the persisted device identity.
pub fn resolve_identity_path() -> PathBuf {
    identity_path_in(&resolve_state_dir())
}

pub fn identity_path_in(state_dir: &Path) -> PathBuf {
    state_dir.join("identity").join("device.json")
}

/// Path of the persisted device auth token store.
pub fn resolve_device_auth_path() -> PathBuf {
    device_auth_path_in(&resolve_state_dir())
}

pub fn device_auth_path_in(state_dir: &Path) -> PathBuf {
    state_dir.join("identity").join("device-auth.json")
}

/// Resolve the gateway port: `$OPENCLAW_GATEWAY_PORT` > `gateway.port` > 18789.
pub fn resolve_gateway_port(config: &crate::config::Config) -> u16 {
    resolve_gateway_port_with(config, process_env)
}

pub fn resolve_gateway_port_with(
    config: &crate::config::Config,
    env: impl Fn(&str) -> Option<String>,
) -> u16 {
    if let Some(port) = non_empty(env(GATEWAY_PORT_ENV))
        .and_then(|p| p.parse::<u16>().ok())
        .filter(|p| *p > 0)
    {
        return port;
    }
    config
        .gateway
        .as_ref()
        .and_then(|g| g.port)
        .filter(|p| *p > 0)
        .unwrap_or(DEFAULT_GATEWAY_PORT)
}
