//! `$include` resolution.
//!
//! An object carrying `$include` (a path or an array of paths) is replaced by
//! the deep-merged contents of the referenced files. Sibling keys are merged
//! on top of the included content. Paths resolve relative to the including
//! file.

use std::path::{Path, PathBuf};

use serde_json::{Map, Value};

use super::{ConfigError, deep_merge};

pub const INCLUDE_KEY: &str = "$include";
pub const MAX_INCLUDE_DEPTH: usize = 10;

struct IncludeResolver {
    /// Files currently being expanded, root first.
    chain: Vec<PathBuf>,
}

fn normalize(path: &Path) -> PathBuf {
    std::fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf())
}

fn child_path(parent: &str, key: &str) -> String {
    if parent.is_empty() {
        key.to_string()
    } else {
        format!("{parent}.{key}")
    }
}

impl IncludeResolver {
    fn resolve(&mut self, value: Value, base_dir: &Path, path: &str) -> Result<Value, ConfigError> {
        match value {
            Value::Array(items) => items
                .into_iter()
                .enumerate()
                .map(|(i, v)| self.resolve(v, base_dir, &format!("{path}[{i}]")))
                .collect::<Result<Vec<_>, _>>()
                .map(Value::Array),
            Value::Object(mut map) => {
                let include = map.remove(INCLUDE_KEY);
                let mut rest = Map::new();
                for (key, v) in map {
                    let resolved = self.resolve(v, base_dir, &child_path(path, &key))?;
                    rest.insert(key, resolved);
                }
                let Some(include) = include else {
                    return Ok(Value::Object(rest));
                };

                let include_path = child_path(path, INCLUDE_KEY);
                let included = self.load_target(include, base_dir, &include_path)?;
                if rest.is_empty() {
                    return Ok(included);
                }
                if !included.is_object() {
                    return Err(ConfigError::InvalidInclude {
                        path: include_path,
                        message: "sibling keys require the included content to be an object".into(),
                    });
                }
                Ok(deep_merge(included, Value::Object(rest)))
            }
            other => Ok(other),
        }
    }

    fn load_target(&mut self, target: Value, base_dir: &Path, path: &str) -> Result<Value, ConfigError> {
        match target {
            Value::String(target) => self.load_file(&target, base_dir, path),
            Value::Array(targets) => {
                let mut merged = Value::Object(Map::new());
                for (i, target) in targets.into_iter().enumerate() {
                    let Value::String(target) = target else {
                        return Err(ConfigError::InvalidInclude {
                            path: format!("{path}[{i}]"),
                            message: "expected a file path string".into(),
                        });
                    };
                    let loaded = self.load_file(&target, base_dir, path)?;
                    merged = deep_merge(merged, loaded);
                }
                Ok(merged)
            }
            _ => Err(ConfigError::InvalidInclude {
                path: path.to_string(),
                message: "expected a string or an array of strings".into(),
            }),
        }
    }

    fn load_file(&mut self, target: &str, base_dir: &Path, path: &str) -> Result<Value, ConfigError> {
        let trimmed = target.trim();
        if trimmed.is_empty() {
            return Err(ConfigError::InvalidInclude {
                path: path.to_string(),
                message: "empty include path".into(),
            });
        }
        let expanded = PathBuf::from(shellexpand::tilde(trimmed).as_ref());
        let resolved = if expanded.is_absolute() {
            expanded
        } else {
            base_dir.join(expanded)
        };
        let normalized = normalize(&resolved);

        if self.chain.contains(&normalized) {
            let mut chain = self.chain.clone();
            chain.push(normalized);
            return Err(ConfigError::CircularInclude { chain });
        }
        // The root file sits at depth 0, so the chain length is the new depth.
        if self.chain.len() > MAX_INCLUDE_DEPTH {
            return Err(ConfigError::IncludeDepth {
                max: MAX_INCLUDE_DEPTH,
                path: normalized,
            });
        }

        let raw = std::fs::read_to_string(&normalized).map_err(|source| ConfigError::Read {
            path: normalized.clone(),
            source,
        })?;
        let parsed: Value = json5::from_str(&raw).map_err(|e| ConfigError::Parse {
            path: normalized.clone(),
            message: e.to_string(),
        })?;

        let dir = normalized
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| base_dir.to_path_buf());
        self.chain.push(normalized);
        let result = self.resolve(parsed, &dir, "");
        self.chain.pop();
        result
    }
}

/// Expand every `$include` in `value`, which was read from `config_path`.
pub fn resolve_includes(value: Value, config_path: &Path) -> Result<Value, ConfigError> {
    let root = normalize(config_path);
    let base_dir = root
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));
    let mut resolver = IncludeResolver { chain: vec![root] };
    resolver.resolve(value, &base_dir, "")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn write(dir: &Path, name: &str, contents: &str) -> PathBuf {
        let path = dir.join(name);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        std::fs::write(&path, contents).unwrap();
        path
    }

    fn load(path: &Path) -> Result<Value, ConfigError> {
        let raw = std::fs::read_to_string(path).unwrap();
        resolve_includes(json5::from_str(&raw).unwrap(), path)
    }

    #[test]
    fn test_no_include_passthrough() {
        let value = json!({"gateway": {"port": 1}, "list": [1, 2]});
        let out = resolve_includes(value.clone(), Path::new("/nonexistent/openclaw.json")).unwrap();
        assert_eq!(out, value);
    }

    #[test]
    fn test_siblings_override_included() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "base.json5", "{ gateway: { port: 1, bind: 'lan' } }");
        let root = write(
            dir.path(),
            "openclaw.json",
            r#"{ "$include": "./base.json5", gateway: { port: 2 } }"#,
        );
        let out = load(&root).unwrap();
        assert_eq!(out, json!({"gateway": {"port": 2, "bind": "lan"}}));
    }

    #[test]
    fn test_nested_include_in_section_relative_to_file() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "conf/channels.json5", r#"{ "$include": "telegram.json5" }"#);
        write(dir.path(), "conf/telegram.json5", "{ telegram: { enabled: true } }");
        let root = write(
            dir.path(),
            "openclaw.json",
            r#"{ channels: { "$include": "conf/channels.json5" } }"#,
        );
        let out = load(&root).unwrap();
        assert_eq!(out, json!({"channels": {"telegram": {"enabled": true}}}));
    }

    #[test]
    fn test_array_include_merges_in_order() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "a.json", r#"{"x": 1, "y": 1}"#);
        write(dir.path(), "b.json", r#"{"y": 2}"#);
        let root = write(dir.path(), "openclaw.json", r#"{"$include": ["a.json", "b.json"]}"#);
        assert_eq!(load(&root).unwrap(), json!({"x": 1, "y": 2}));
    }

    #[test]
    fn test_self_include_is_circular() {
        let dir = tempfile::tempdir().unwrap();
        let root = write(dir.path(), "openclaw.json", r#"{"$include": "openclaw.json"}"#);
        match load(&root) {
            Err(ConfigError::CircularInclude { chain }) => {
                assert_eq!(chain.len(), 2);
                assert_eq!(chain.first(), chain.last());
            }
            other => panic!("expected circular include, got {other:?}"),
        }
    }

    #[test]
    fn test_transitive_cycle_reports_chain() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "a.json", r#"{"$include": "b.json"}"#);
        write(dir.path(), "b.json", r#"{"$include": "a.json"}"#);
        let root = write(dir.path(), "openclaw.json", r#"{"$include": "a.json"}"#);
        let err = load(&root).unwrap_err();
        let ConfigError::CircularInclude { chain } = &err else {
            panic!("expected circular include, got {err:?}");
        };
        let names: Vec<_> = chain
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().to_string())
            .collect();
        assert_eq!(names, vec!["openclaw.json", "a.json", "b.json", "a.json"]);
        assert!(err.to_string().contains("Circular include detected"));
    }

    fn write_chain(dir: &Path, length: usize) -> PathBuf {
        for i in 1..=length {
            let body = if i == length {
                r#"{"leaf": true}"#.to_string()
            } else {
                format!(r#"{{"$include": "f{}.json"}}"#, i + 1)
            };
            write(dir, &format!("f{i}.json"), &body);
        }
        write(dir, "openclaw.json", r#"{"$include": "f1.json"}"#)
    }

    #[test]
    fn test_depth_ten_allowed() {
        let dir = tempfile::tempdir().unwrap();
        let root = write_chain(dir.path(), 10);
        assert_eq!(load(&root).unwrap(), json!({"leaf": true}));
    }

    #[test]
    fn test_depth_eleven_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let root = write_chain(dir.path(), 11);
        match load(&root) {
            Err(ConfigError::IncludeDepth { max, path }) => {
                assert_eq!(max, MAX_INCLUDE_DEPTH);
                assert!(path.ends_with("f11.json"));
            }
            other => panic!("expected depth error, got {other:?}"),
        }
    }

    #[test]
    fn test_invalid_include_value() {
        let value = json!({"gateway": {"$include": 5}});
        let err = resolve_includes(value, Path::new("/tmp/openclaw.json")).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidInclude { ref path, .. } if path == "gateway.$include"));
    }

    #[test]
    fn test_missing_include_file() {
        let dir = tempfile::tempdir().unwrap();
        let root = write(dir.path(), "openclaw.json", r#"{"$include": "nope.json"}"#);
        assert!(matches!(load(&root), Err(ConfigError::Read { .. })));
    }
}
