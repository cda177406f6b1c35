//! `${VAR}` substitution over every string in the config tree.
//!
//! Only uppercase names (`[A-Z_][A-Z0-9_]*`) are substituted. `$${VAR}` is an
//! escape that yields the literal text `${VAR}`. A reference to an unset or
//! empty variable is an error naming the variable and its config path.

use std::sync::LazyLock;

use regex::{Captures, Regex};
use serde_json::{Map, Value};

use super::ConfigError;

static ENV_REF: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\$(\$)?\{([A-Z_][A-Z0-9_]*)\}").expect("env reference pattern is valid")
});

fn substitute_string(
    input: &str,
    path: &str,
    env: &dyn Fn(&str) -> Option<String>,
) -> Result<String, ConfigError> {
    if !input.contains('$') {
        return Ok(input.to_string());
    }
    let mut missing: Option<String> = None;
    let out = ENV_REF.replace_all(input, |caps: &Captures| {
        let name = &caps[2];
        if caps.get(1).is_some() {
            return format!("${{{name}}}");
        }
        match env(name).filter(|v| !v.is_empty()) {
            Some(value) => value,
            None => {
                missing.get_or_insert_with(|| name.to_string());
                String::new()
            }
        }
    });
    match missing {
        Some(name) => Err(ConfigError::MissingEnvVar {
            name,
            path: path.to_string(),
        }),
        None => Ok(out.into_owned()),
    }
}

fn walk(value: Value, path: &str, env: &dyn Fn(&str) -> Option<String>) -> Result<Value, ConfigError> {
    match value {
        Value::String(s) => substitute_string(&s, path, env).map(Value::String),
        Value::Array(items) => items
            .into_iter()
            .enumerate()
            .map(|(i, v)| walk(v, &format!("{path}[{i}]"), env))
            .collect::<Result<Vec<_>, _>>()
            .map(Value::Array),
        Value::Object(map) => {
            let mut out = Map::new();
            for (key, v) in map {
                let child = if path.is_empty() {
                    key.clone()
                } else {
                    format!("{path}.{key}")
                };
                out.insert(key, walk(v, &child, env)?);
            }
            Ok(Value::Object(out))
        }
        other => Ok(other),
    }
}

/// Substitute `${VAR}` references in every string value, reading variables via `env`.
pub fn substitute_env_vars(
    value: Value,
    env: &dyn Fn(&str) -> Option<String>,
) -> Result<Value, ConfigError> {
    walk(value, "", env)
}

/// Environment lookup backed by the process environment.
pub fn process_env(name: &str) -> Option<String> {
    std::env::var(name).ok()
}
