//! Device identity: an Ed25519 keypair identifying this installation.
//!
//! The identity is created lazily on first use and persisted as JSON with
//! owner-only permissions. The device id is the hex SHA-256 of the raw
//! 32-byte public key. Keys are stored as PEM (SPKI public, PKCS#8 private) through
//! `ed25519-dalek`'s `pkcs8` support.

use std::path::Path;

use base64::Engine;
use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};
use ed25519_dalek::pkcs8::{
    DecodePrivateKey, DecodePublicKey, EncodePrivateKey, EncodePublicKey,
    spki::der::pem::LineEnding,
};
use ed25519_dalek::{Signature, Signer, SigningKey, VerifyingKey};
use rand_core::OsRng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{info, warn};

use crate::error::{ClawlinkError, Result};
use crate::fsutil;

const IDENTITY_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceIdentity {
    pub device_id: String,
    pub public_key_pem: String,
    pub private_key_pem: String,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StoredIdentity {
    version: u32,
    device_id: String,
    public_key_pem: String,
    private_key_pem: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    created_at_ms: Option<i64>,
}

/// Fields covered by the device signature sent in the `connect` handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceAuthPayload {
    pub device_id: String,
    pub client_id: String,
    pub client_mode: String,
    pub role: String,
    pub scopes: Vec<String>,
    pub signed_at_ms: u64,
    pub token: Option<String>,
    pub nonce: Option<String>,
}

/// Build the canonical `|`-joined string that gets signed.
///
/// The version tag is `v2` when a server nonce is present, `v1` otherwise.
/// The server rebuilds this string byte-for-byte to verify the signature.
pub fn build_device_auth_payload(params: &DeviceAuthPayload) -> String {
    let version = if params.nonce.is_some() { "v2" } else { "v1" };
    let scopes = params.scopes.join(",");
    let signed_at = params.signed_at_ms.to_string();
    let mut parts: Vec<&str> = vec![
        version,
        params.device_id.as_str(),
        params.client_id.as_str(),
        params.client_mode.as_str(),
        params.role.as_str(),
        scopes.as_str(),
        signed_at.as_str(),
        params.token.as_deref().unwrap_or_default(),
    ];
    if let Some(nonce) = params.nonce.as_deref() {
        parts.push(nonce);
    }
    parts.join("|")
}

/// Extract the raw 32-byte Ed25519 public key from an SPKI PEM.
pub fn public_key_raw_from_pem(public_key_pem: &str) -> Result<[u8; 32]> {
    Ok(verifying_key_from_pem(public_key_pem)?.to_bytes())
}

fn verifying_key_from_pem(public_key_pem: &str) -> Result<VerifyingKey> {
    VerifyingKey::from_public_key_pem(public_key_pem)
        .map_err(|e| ClawlinkError::Identity(format!("invalid Ed25519 public key: {e}")))
}

fn signing_key_from_pem(private_key_pem: &str) -> Result<SigningKey> {
    SigningKey::from_pkcs8_pem(private_key_pem)
        .map_err(|e| ClawlinkError::Identity(format!("invalid Ed25519 private key: {e}")))
}

fn public_key_pem_for(key: &VerifyingKey) -> Result<String> {
    key.to_public_key_pem(LineEnding::LF)
        .map_err(|e| ClawlinkError::Identity(format!("cannot encode public key: {e}")))
}

fn private_key_pem_for(key: &SigningKey) -> Result<String> {
    let pem = key
        .to_pkcs8_pem(LineEnding::LF)
        .map_err(|e| ClawlinkError::Identity(format!("cannot encode private key: {e}")))?;
    Ok(pem.as_str().to_owned())
}

/// Check that both PEMs parse and describe the same keypair.
fn check_keypair(identity: &StoredIdentity) -> Result<()> {
    let public = verifying_key_from_pem(&identity.public_key_pem)?;
    let signing = signing_key_from_pem(&identity.private_key_pem)?;
    if signing.verifying_key() != public {
        return Err(ClawlinkError::Identity(
            "private key does not match public key".into(),
        ));
    }
    Ok(())
}

/// Hex SHA-256 of a raw public key.
pub fn derive_device_id(raw_public_key: &[u8]) -> String {
    hex::encode(Sha256::digest(raw_public_key))
}

/// Device id derived from a PEM public key.
pub fn fingerprint_public_key(public_key_pem: &str) -> Result<String> {
    Ok(derive_device_id(&public_key_raw_from_pem(public_key_pem)?))
}

/// Raw public key as base64url without padding, the form sent on the wire.
pub fn public_key_raw_base64url(public_key_pem: &str) -> Result<String> {
    Ok(URL_SAFE_NO_PAD.encode(public_key_raw_from_pem(public_key_pem)?))
}

/// Sign `payload` (raw UTF-8 bytes, no pre-hash) and return a base64url signature.
pub fn sign_device_payload(private_key_pem: &str, payload: &str) -> Result<String> {
    let key = signing_key_from_pem(private_key_pem)?;
    let signature = key.sign(payload.as_bytes());
    Ok(URL_SAFE_NO_PAD.encode(signature.to_bytes()))
}

fn decode_base64_any(input: &str) -> Option<Vec<u8>> {
    URL_SAFE_NO_PAD
        .decode(input.trim_end_matches('='))
        .ok()
        .or_else(|| STANDARD.decode(input).ok())
}

/// Verify a device signature. `public_key` may be a PEM or raw base64url key.
pub fn verify_device_signature(public_key: &str, payload: &str, signature: &str) -> bool {
    let raw = if public_key.contains("BEGIN") {
        match public_key_raw_from_pem(public_key) {
            Ok(raw) => raw,
            Err(_) => return false,
        }
    } else {
        match decode_base64_any(public_key).and_then(|b| <[u8; 32]>::try_from(b).ok()) {
            Some(raw) => raw,
            None => return false,
        }
    };
    let Ok(key) = VerifyingKey::from_bytes(&raw) else {
        return false;
    };
    let Some(sig_bytes) = decode_base64_any(signature).and_then(|b| <[u8; 64]>::try_from(b).ok())
    else {
        return false;
    };
    key.verify_strict(payload.as_bytes(), &Signature::from_bytes(&sig_bytes))
        .is_ok()
}

fn generate_identity() -> Result<DeviceIdentity> {
    let signing_key = SigningKey::generate(&mut OsRng);
    let verifying_key = signing_key.verifying_key();
    Ok(DeviceIdentity {
        device_id: derive_device_id(verifying_key.as_bytes()),
        public_key_pem: public_key_pem_for(&verifying_key)?,
        private_key_pem: private_key_pem_for(&signing_key)?,
    })
}

fn store_identity(path: &Path, identity: &DeviceIdentity, created_at_ms: Option<i64>) -> Result<()> {
    let stored = StoredIdentity {
        version: IDENTITY_VERSION,
        device_id: identity.device_id.clone(),
        public_key_pem: identity.public_key_pem.clone(),
        private_key_pem: identity.private_key_pem.clone(),
        created_at_ms,
    };
    fsutil::write_private_json(path, &stored)?;
    Ok(())
}

fn read_stored(path: &Path) -> Option<StoredIdentity> {
    let raw = std::fs::read_to_string(path).ok()?;
    let stored: StoredIdentity = serde_json::from_str(&raw).ok()?;
    let usable = stored.version == IDENTITY_VERSION
        && !stored.device_id.is_empty()
        && !stored.public_key_pem.is_empty()
        && !stored.private_key_pem.is_empty();
    usable.then_some(stored)
}

/// Load the identity at `path`, creating it if absent or unreadable.
///
/// A stored identity whose `deviceId` no longer matches its public key is
/// rewritten once with the recomputed id. A keypair that does not parse, or
/// whose private half does not match the public half, is replaced.
pub fn load_or_create_device_identity(path: &Path) -> Result<DeviceIdentity> {
    if let Some(stored) = read_stored(path) {
        match check_keypair(&stored).and_then(|()| fingerprint_public_key(&stored.public_key_pem)) {
            Ok(derived) if derived == stored.device_id => {
                return Ok(DeviceIdentity {
                    device_id: stored.device_id,
                    public_key_pem: stored.public_key_pem,
                    private_key_pem: stored.private_key_pem,
                });
            }
            Ok(derived) => {
                info!(
                    path = %path.display(),
                    stored = %stored.device_id,
                    derived = %derived,
                    "Device id does not match public key, rewriting identity"
                );
                let healed = DeviceIdentity {
                    device_id: derived,
                    public_key_pem: stored.public_key_pem,
                    private_key_pem: stored.private_key_pem,
                };
                store_identity(path, &healed, stored.created_at_ms)?;
                return Ok(healed);
            }
            Err(e) => {
                warn!(path = %path.display(), %e, "Stored device identity is unusable, regenerating");
            }
        }
    } else if path.exists() {
        warn!(path = %path.display(), "Device identity file is invalid, regenerating");
    }

    let identity = generate_identity()?;
    store_identity(path, &identity, Some(chrono::Utc::now().timestamp_millis()))?;
    info!(path = %path.display(), device_id = %identity.device_id, "Created device identity");
    Ok(identity)
}
