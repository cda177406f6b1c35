//! Certificate fingerprint helpers shared by config validation and TLS pinning.

use sha2::{Digest, Sha256};

/// Normalize a SHA-256 fingerprint for comparison.
///
/// Accepts `sha256:AB:CD:...`, `AB CD ...`, or bare hex; returns lowercase hex.
pub fn normalize_fingerprint(raw: &str) -> String {
    let trimmed = raw.trim();
    let without_prefix = match trimmed.get(..7) {
        Some(prefix) if prefix.eq_ignore_ascii_case("sha256:") => &trimmed[7..],
        _ => trimmed,
    };
    without_prefix
        .chars()
        .filter(char::is_ascii_hexdigit)
        .map(|c| c.to_ascii_lowercase())
        .collect()
}

/// Lowercase hex SHA-256 of DER certificate bytes.
pub fn sha256_fingerprint(der: &[u8]) -> String {
    hex::encode(Sha256::digest(der))
}

/// Whether `raw` normalizes to a full 64-digit SHA-256 fingerprint.
pub fn is_valid_fingerprint(raw: &str) -> bool {
    normalize_fingerprint(raw).len() == 64
}
