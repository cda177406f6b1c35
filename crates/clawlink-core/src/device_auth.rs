//! Device auth token cache.
//!
//! The gateway may issue a device token in `hello-ok`. Tokens are cached per
//! device and role so reconnects can reuse them instead of the shared secret.
//! A store written for one device id never answers for another.

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::Result;
use crate::fsutil;
use crate::paths;

const STORE_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceAuthEntry {
    pub token: String,
    pub role: String,
    pub scopes: Vec<String>,
    pub updated_at_ms: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DeviceAuthFile {
    version: u32,
    device_id: String,
    #[serde(default)]
    tokens: BTreeMap<String, DeviceAuthEntry>,
}

/// Dedupe, trim, and sort scopes so stored entries compare stably.
pub fn normalize_scopes(scopes: &[String]) -> Vec<String> {
    let mut out: Vec<String> = scopes
        .iter()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect();
    out.sort();
    out.dedup();
    out
}

fn normalize_role(role: &str) -> String {
    role.trim().to_string()
}

/// Persistent store for gateway-issued device tokens.
#[derive(Debug, Clone)]
pub struct DeviceAuthStore {
    path: PathBuf,
}

impl DeviceAuthStore {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn default_path() -> PathBuf {
        paths::resolve_device_auth_path()
    }

    pub fn path(&self) -> &std::path::Path {
        &self.path
    }

    fn read(&self) -> Option<DeviceAuthFile> {
        let raw = std::fs::read_to_string(&self.path).ok()?;
        let parsed: DeviceAuthFile = serde_json::from_str(&raw).ok()?;
        (parsed.version == STORE_VERSION && !parsed.device_id.is_empty()).then_some(parsed)
    }

    fn write(&self, file: &DeviceAuthFile) -> Result<()> {
        fsutil::write_private_json(&self.path, file)?;
        Ok(())
    }

    /// Cached token for `(device_id, role)`, if the store belongs to `device_id`.
    pub fn load(&self, device_id: &str, role: &str) -> Option<DeviceAuthEntry> {
        let file = self.read()?;
        if file.device_id != device_id {
            return None;
        }
        let entry = file.tokens.get(&normalize_role(role))?;
        (!entry.token.is_empty()).then(|| entry.clone())
    }

    /// Upsert one role's token. Scopes are normalized before storing.
    pub fn store(
        &self,
        device_id: &str,
        role: &str,
        token: &str,
        scopes: &[String],
    ) -> Result<DeviceAuthEntry> {
        let role = normalize_role(role);
        let mut file = match self.read() {
            Some(existing) if existing.device_id == device_id => existing,
            _ => DeviceAuthFile {
                version: STORE_VERSION,
                device_id: device_id.to_string(),
                tokens: BTreeMap::new(),
            },
        };
        let entry = DeviceAuthEntry {
            token: token.to_string(),
            role: role.clone(),
            scopes: normalize_scopes(scopes),
            updated_at_ms: chrono::Utc::now().timestamp_millis(),
        };
        file.tokens.insert(role.clone(), entry.clone());
        self.write(&file)?;
        debug!(device_id, role = %role, "Stored device auth token");
        Ok(entry)
    }

    /// Remove one role's token. A store for another device is left untouched.
    pub fn clear(&self, device_id: &str, role: &str) -> Result<()> {
        let Some(mut file) = self.read() else {
            return Ok(());
        };
        if file.device_id != device_id {
            return Ok(());
        }
        let role = normalize_role(role);
        if file.tokens.remove(&role).is_some() {
            self.write(&file)?;
            debug!(device_id, role = %role, "Cleared device auth token");
        }
        Ok(())
    }
}
