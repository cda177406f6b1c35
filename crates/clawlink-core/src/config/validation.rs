//! Config validation. Any issue blocks the load.

use std::fmt;

use serde::Serialize;
use serde_json::{Map, Value};

use super::{Config, GatewayBind, KNOWN_ROOT_KEYS};
use crate::fingerprint::is_valid_fingerprint;

/// A single validation failure, keyed by dotted config path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConfigIssue {
    pub path: String,
    pub message: String,
}

impl ConfigIssue {
    pub fn new(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for ConfigIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.path.is_empty() {
            write!(f, "<root>: {}", self.message)
        } else {
            write!(f, "{}: {}", self.path, self.message)
        }
    }
}

/// Deserialize each root section on its own so a type error names the
/// section it came from.
fn section_issues(root: &Map<String, Value>) -> Vec<ConfigIssue> {
    let mut issues = Vec::new();
    for (key, value) in root {
        if !KNOWN_ROOT_KEYS.contains(&key.as_str()) {
            issues.push(ConfigIssue::new(key.clone(), "Unrecognized key"));
            continue;
        }
        let mut single = Map::new();
        single.insert(key.clone(), value.clone());
        if let Err(e) = serde_json::from_value::<Config>(Value::Object(single)) {
            issues.push(ConfigIssue::new(key.clone(), e.to_string()));
        }
    }
    issues
}

fn semantic_issues(config: &Config) -> Vec<ConfigIssue> {
    let mut issues = Vec::new();

    if let Some(gateway) = &config.gateway {
        if gateway.port == Some(0) {
            issues.push(ConfigIssue::new("gateway.port", "must be between 1 and 65535"));
        }

        if gateway.bind == Some(GatewayBind::Custom)
            && gateway
                .custom_bind_host
                .as_deref()
                .is_none_or(|h| h.trim().is_empty())
        {
            issues.push(ConfigIssue::new(
                "gateway.customBindHost",
                "required when gateway.bind is \"custom\"",
            ));
        }

        if let Some(remote) = &gateway.remote {
            if let Some(url) = remote.resolve_url()
                && !(url.starts_with("ws://") || url.starts_with("wss://"))
            {
                issues.push(ConfigIssue::new(
                    "gateway.remote.url",
                    "must start with ws:// or wss://",
                ));
            }
            if let Some(fp) = remote.tls_fingerprint.as_deref()
                && !is_valid_fingerprint(fp)
            {
                issues.push(ConfigIssue::new(
                    "gateway.remote.tlsFingerprint",
                    "must be a SHA-256 fingerprint (64 hex characters)",
                ));
            }
        }

        if let Some(tls) = &gateway.tls
            && tls.cert_path.is_some() != tls.key_path.is_some()
        {
            issues.push(ConfigIssue::new(
                "gateway.tls",
                "certPath and keyPath must be set together",
            ));
        }
    }

    if let Some(defaults) = config.agents.as_ref().and_then(|a| a.defaults.as_ref()) {
        if defaults.max_concurrent == Some(0) {
            issues.push(ConfigIssue::new(
                "agents.defaults.maxConcurrent",
                "must be at least 1",
            ));
        }
        if defaults
            .subagents
            .as_ref()
            .and_then(|s| s.max_concurrent)
            == Some(0)
        {
            issues.push(ConfigIssue::new(
                "agents.defaults.subagents.maxConcurrent",
                "must be at least 1",
            ));
        }
    }

    issues
}

/// Validate a raw (already migrated) config tree.
pub fn validate_config_value(value: &Value) -> Result<Config, Vec<ConfigIssue>> {
    let Value::Object(root) = value else {
        return Err(vec![ConfigIssue::new("", "config must be an object")]);
    };

    let issues = section_issues(root);
    if !issues.is_empty() {
        return Err(issues);
    }

    let config: Config = serde_json::from_value(value.clone())
        .map_err(|e| vec![ConfigIssue::new("", e.to_string())])?;

    let issues = semantic_issues(&config);
    if issues.is_empty() {
        Ok(config)
    } else {
        Err(issues)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_valid_config() {
        let value = json!({
            "gateway": {"port": 18789, "mode": "remote", "remote": {"url": "wss://gw:443"}},
            "agents": {"defaults": {"maxConcurrent": 2}}
        });
        let config = validate_config_value(&value).unwrap();
        assert_eq!(config.gateway.unwrap().port, Some(18789));
    }

    #[test]
    fn test_empty_object_is_valid() {
        assert_eq!(validate_config_value(&json!({})).unwrap(), Config::default());
    }

    #[test]
    fn test_non_object_root() {
        let issues = validate_config_value(&json!([1])).unwrap_err();
        assert_eq!(issues[0].to_string(), "<root>: config must be an object");
    }

    #[test]
    fn test_unknown_key_and_bad_type_reported_per_section() {
        let value = json!({"bogus": 1, "gateway": {"port": "nope"}});
        let issues = validate_config_value(&value).unwrap_err();
        let paths: Vec<_> = issues.iter().map(|i| i.path.as_str()).collect();
        assert_eq!(paths, vec!["bogus", "gateway"]);
        assert_eq!(issues[0].to_string(), "bogus: Unrecognized key");
    }

    #[test]
    fn test_semantic_checks() {
        let value = json!({
            "gateway": {
                "port": 0,
                "bind": "custom",
                "remote": {"url": "http://gw", "tlsFingerprint": "abc"},
                "tls": {"certPath": "/c.pem"}
            }
        });
        let issues = validate_config_value(&value).unwrap_err();
        let paths: Vec<_> = issues.iter().map(|i| i.path.as_str()).collect();
        assert_eq!(
            paths,
            vec![
                "gateway.port",
                "gateway.customBindHost",
                "gateway.remote.url",
                "gateway.remote.tlsFingerprint",
                "gateway.tls",
            ]
        );
    }

    #[test]
    fn test_fingerprint_with_prefix_accepted() {
        let fp = format!("SHA256:{}", "AB:".repeat(31) + "AB");
        let value = json!({"gateway": {"remote": {"url": "wss://gw", "tlsFingerprint": fp}}});
        assert!(validate_config_value(&value).is_ok());
    }
}
