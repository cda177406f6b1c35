//! Legacy config migration.
//!
//! Rewrite rules run in order over the raw tree before validation. Each rule
//! reports what it moved so the loader can surface it. A separate list of
//! read-only checks flags keys that are no longer migrated automatically.

use serde::Serialize;
use serde_json::{Map, Value};

/// Channel ids that used to live at the top level of the config.
const LEGACY_CHANNEL_KEYS: &[&str] = &[
    "whatsapp",
    "telegram",
    "discord",
    "slack",
    "signal",
    "imessage",
    "msteams",
    "googlechat",
    "mattermost",
    "matrix",
];

/// A legacy key that is reported but not rewritten.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LegacyIssue {
    pub path: String,
    pub message: String,
}

struct MigrationRule {
    id: &'static str,
    apply: fn(&mut Map<String, Value>, &mut Vec<String>),
}

const MIGRATIONS: &[MigrationRule] = &[
    MigrationRule {
        id: "channels-top-level",
        apply: migrate_top_level_channels,
    },
    MigrationRule {
        id: "gateway-token",
        apply: migrate_gateway_token,
    },
    MigrationRule {
        id: "gateway-bind-address",
        apply: migrate_gateway_bind,
    },
    MigrationRule {
        id: "agent-to-agents-defaults",
        apply: migrate_agent_defaults,
    },
    MigrationRule {
        id: "routing-allow-from",
        apply: migrate_routing_allow_from,
    },
];

struct LegacyCheck {
    path: &'static str,
    message: &'static str,
}

const CHECKS: &[LegacyCheck] = &[
    LegacyCheck {
        path: "routing.groupChat",
        message: "routing.groupChat is no longer supported; configure group behavior per channel under channels.<id>.groups",
    },
    LegacyCheck {
        path: "identity",
        message: "top-level identity moved to agents.list[].identity; move it manually",
    },
    LegacyCheck {
        path: "providers",
        message: "top-level providers moved to models.providers; move it manually",
    },
];

fn ensure_object<'a>(map: &'a mut Map<String, Value>, key: &str) -> &'a mut Map<String, Value> {
    let slot = map
        .entry(key.to_string())
        .or_insert_with(|| Value::Object(Map::new()));
    if !slot.is_object() {
        *slot = Value::Object(Map::new());
    }
    match slot {
        Value::Object(inner) => inner,
        _ => unreachable!("slot was just made an object"),
    }
}

/// Move `whatsapp`, `telegram`, ... from the root into `channels.<id>`. An
/// entry already present under `channels` wins.
fn migrate_top_level_channels(root: &mut Map<String, Value>, changes: &mut Vec<String>) {
    for key in LEGACY_CHANNEL_KEYS {
        let Some(value) = root.remove(*key) else {
            continue;
        };
        let channels = ensure_object(root, "channels");
        if channels.contains_key(*key) {
            changes.push(format!(
                "Removed {key} (channels.{key} already set)."
            ));
        } else {
            channels.insert(key.to_string(), value);
            changes.push(format!("Moved {key} → channels.{key}."));
        }
    }
}

/// `gateway.token` → `gateway.auth.token` with `mode: "token"`.
fn migrate_gateway_token(root: &mut Map<String, Value>, changes: &mut Vec<String>) {
    let Some(Value::Object(gateway)) = root.get_mut("gateway") else {
        return;
    };
    let Some(token) = gateway.remove("token") else {
        return;
    };
    let auth = ensure_object(gateway, "auth");
    if auth.contains_key("token") {
        changes.push("Removed gateway.token (gateway.auth.token already set).".into());
        return;
    }
    auth.insert("token".into(), token);
    auth.entry("mode").or_insert_with(|| Value::String("token".into()));
    changes.push("Moved gateway.token → gateway.auth.token.".into());
}

/// Raw bind addresses become bind modes.
fn migrate_gateway_bind(root: &mut Map<String, Value>, changes: &mut Vec<String>) {
    let Some(Value::Object(gateway)) = root.get_mut("gateway") else {
        return;
    };
    let Some(Value::String(bind)) = gateway.get("bind") else {
        return;
    };
    let mode = match bind.trim() {
        "0.0.0.0" | "::" => "lan",
        "127.0.0.1" | "localhost" | "::1" => "loopback",
        _ => return,
    };
    let old = bind.clone();
    gateway.insert("bind".into(), Value::String(mode.into()));
    changes.push(format!("Rewrote gateway.bind \"{old}\" → \"{mode}\"."));
}

/// The single `agent` section became `agents.defaults`.
fn migrate_agent_defaults(root: &mut Map<String, Value>, changes: &mut Vec<String>) {
    let Some(agent) = root.remove("agent") else {
        return;
    };
    let Value::Object(agent) = agent else {
        changes.push("Removed agent (expected an object).".into());
        return;
    };
    let agents = ensure_object(root, "agents");
    let defaults = ensure_object(agents, "defaults");
    for (key, value) in agent {
        defaults.entry(key).or_insert(value);
    }
    changes.push("Moved agent → agents.defaults.".into());
}

/// `routing.allowFrom` applied to WhatsApp only.
fn migrate_routing_allow_from(root: &mut Map<String, Value>, changes: &mut Vec<String>) {
    let allow_from = match root.get_mut("routing") {
        Some(Value::Object(routing)) => routing.remove("allowFrom"),
        _ => None,
    };
    let Some(allow_from) = allow_from else {
        return;
    };
    if matches!(root.get("routing"), Some(Value::Object(r)) if r.is_empty()) {
        root.remove("routing");
    }
    let channels = ensure_object(root, "channels");
    let whatsapp = ensure_object(channels, "whatsapp");
    if whatsapp.contains_key("allowFrom") {
        changes.push(
            "Removed routing.allowFrom (channels.whatsapp.allowFrom already set).".into(),
        );
    } else {
        whatsapp.insert("allowFrom".into(), allow_from);
        changes.push("Moved routing.allowFrom → channels.whatsapp.allowFrom.".into());
    }
}

/// Apply every migration rule in order. Returns one line per change made.
pub fn migrate_legacy_config(value: &mut Value) -> Vec<String> {
    let mut changes = Vec::new();
    let Value::Object(root) = value else {
        return changes;
    };
    for rule in MIGRATIONS {
        let before = changes.len();
        (rule.apply)(root, &mut changes);
        if changes.len() > before {
            tracing::debug!(rule = rule.id, "Applied legacy config migration");
        }
    }
    changes
}

/// Legacy keys present in `value` that need manual attention.
pub fn find_legacy_issues(value: &Value) -> Vec<LegacyIssue> {
    CHECKS
        .iter()
        .filter(|check| super::get_path(value, check.path).is_some())
        .map(|check| LegacyIssue {
            path: check.path.to_string(),
            message: check.message.to_string(),
        })
        .collect()
}
