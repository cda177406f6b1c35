//! Default-filling passes run after validation.
//!
//! Every pass only fills fields that are unset, so applying a pass twice
//! yields the same config as applying it once.

use super::{
    AgentDefaults, AgentsConfig, CompactionConfig, Config, LoggingConfig, ModelCost,
    SessionConfig, SubagentDefaults,
};

pub const DEFAULT_AGENT_MAX_CONCURRENT: u32 = 4;
pub const DEFAULT_SUBAGENT_MAX_CONCURRENT: u32 = 8;
pub const DEFAULT_MAIN_KEY: &str = "main";
pub const DEFAULT_REDACT_SENSITIVE: &str = "tools";
pub const DEFAULT_COMPACTION_MODE: &str = "safeguard";
pub const DEFAULT_CONTEXT_PRUNING_MODE: &str = "off";
pub const DEFAULT_CACHE_TTL: &str = "1h";
pub const DEFAULT_CONTEXT_WINDOW: u64 = 200_000;
pub const DEFAULT_MAX_TOKENS: u64 = 8192;

fn agent_defaults(config: &mut Config) -> &mut AgentDefaults {
    config
        .agents
        .get_or_insert_with(AgentsConfig::default)
        .defaults
        .get_or_insert_with(AgentDefaults::default)
}

/// Fill per-model metadata for every configured provider model.
pub fn apply_model_defaults(config: &mut Config) {
    let Some(providers) = config.models.as_mut().and_then(|m| m.providers.as_mut()) else {
        return;
    };
    for provider in providers.values_mut() {
        for model in &mut provider.models {
            if model.name.as_deref().is_none_or(str::is_empty) {
                model.name = Some(model.id.clone());
            }
            model.reasoning.get_or_insert(false);
            model.input.get_or_insert_with(|| vec!["text".to_string()]);
            model.cost.get_or_insert_with(ModelCost::default);
            model.context_window.get_or_insert(DEFAULT_CONTEXT_WINDOW);
            model.max_tokens.get_or_insert(DEFAULT_MAX_TOKENS);
        }
    }
}

pub fn apply_agent_defaults(config: &mut Config) {
    let defaults = agent_defaults(config);
    defaults
        .max_concurrent
        .get_or_insert(DEFAULT_AGENT_MAX_CONCURRENT);
    defaults
        .subagents
        .get_or_insert_with(SubagentDefaults::default)
        .max_concurrent
        .get_or_insert(DEFAULT_SUBAGENT_MAX_CONCURRENT);
}

pub fn apply_session_defaults(config: &mut Config) {
    let session = config.session.get_or_insert_with(SessionConfig::default);
    if session.main_key.as_deref().is_none_or(|k| k.trim().is_empty()) {
        session.main_key = Some(DEFAULT_MAIN_KEY.to_string());
    }
}

pub fn apply_logging_defaults(config: &mut Config) {
    config
        .logging
        .get_or_insert_with(LoggingConfig::default)
        .redact_sensitive
        .get_or_insert_with(|| DEFAULT_REDACT_SENSITIVE.to_string());
}

pub fn apply_compaction_defaults(config: &mut Config) {
    agent_defaults(config)
        .compaction
        .get_or_insert_with(CompactionConfig::default)
        .mode
        .get_or_insert_with(|| DEFAULT_COMPACTION_MODE.to_string());
}

/// Context pruning is only touched when the section exists. `cache-ttl`
/// pruning gets a one hour TTL unless one is set.
pub fn apply_context_pruning_defaults(config: &mut Config) {
    let Some(pruning) = config
        .agents
        .as_mut()
        .and_then(|a| a.defaults.as_mut())
        .and_then(|d| d.context_pruning.as_mut())
    else {
        return;
    };
    let mode = pruning
        .mode
        .get_or_insert_with(|| DEFAULT_CONTEXT_PRUNING_MODE.to_string());
    if mode.as_str() == "cache-ttl" && pruning.ttl.is_none() {
        pruning.ttl = Some(DEFAULT_CACHE_TTL.to_string());
    }
}

/// Run every default pass in load order.
pub fn apply_all(config: &mut Config) {
    apply_model_defaults(config);
    apply_agent_defaults(config);
    apply_session_defaults(config);
    apply_logging_defaults(config);
    apply_compaction_defaults(config);
    apply_context_pruning_defaults(config);
}
