//! Config file I/O: the load pipeline, the TTL cache, and atomic writes.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use serde::Serialize;
use serde_json::{Map, Value};
use tracing::{debug, error, info, warn};

use super::legacy::{LegacyIssue, find_legacy_issues, migrate_legacy_config};
use super::validation::{ConfigIssue, validate_config_value};
use super::{Config, ConfigError, defaults, env_subst, includes};
use crate::{fsutil, paths};

/// Cache lifetime override in milliseconds; `0` disables the cache.
pub const CACHE_MS_ENV: &str = "OPENCLAW_CONFIG_CACHE_MS";
/// Any non-empty value disables the cache.
pub const DISABLE_CACHE_ENV: &str = "OPENCLAW_DISABLE_CONFIG_CACHE";
pub const DEFAULT_CACHE_TTL: Duration = Duration::from_millis(200);
/// Number of rotated backups kept next to the config file.
pub const BACKUP_COUNT: usize = 5;

type EnvLookup = Arc<dyn Fn(&str) -> Option<String> + Send + Sync>;

/// Everything known about the config file, valid or not. Used by
/// diagnostics commands that must not fail on a broken config.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigSnapshot {
    pub path: PathBuf,
    pub exists: bool,
    pub raw: Option<String>,
    /// Tree after includes, env substitution, and migration.
    pub parsed: Option<Value>,
    pub config: Option<Config>,
    pub valid: bool,
    pub issues: Vec<ConfigIssue>,
    pub legacy_changes: Vec<String>,
    pub legacy_issues: Vec<LegacyIssue>,
    /// Non-validation failure (read, parse, include, env).
    pub error: Option<String>,
}

struct CacheEntry {
    loaded_at: Instant,
    config: Arc<Config>,
}

/// Loads and caches the config file at one path.
pub struct ConfigLoader {
    config_path: PathBuf,
    env: EnvLookup,
    cache_ttl: Option<Duration>,
    cache: Mutex<Option<CacheEntry>>,
    logged_failures: Mutex<HashSet<PathBuf>>,
}

impl std::fmt::Debug for ConfigLoader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConfigLoader")
            .field("config_path", &self.config_path)
            .field("cache_ttl", &self.cache_ttl)
            .finish_non_exhaustive()
    }
}

fn cache_ttl_from_env(env: &dyn Fn(&str) -> Option<String>) -> Option<Duration> {
    if env(DISABLE_CACHE_ENV).is_some_and(|v| !v.trim().is_empty()) {
        return None;
    }
    match env(CACHE_MS_ENV).and_then(|v| v.trim().parse::<u64>().ok()) {
        Some(0) => None,
        Some(ms) => Some(Duration::from_millis(ms)),
        None => Some(DEFAULT_CACHE_TTL),
    }
}

/// The resolved tree plus the legacy rewrites applied to it.
struct Resolved {
    value: Value,
    legacy_changes: Vec<String>,
}

impl ConfigLoader {
    pub fn new(config_path: impl Into<PathBuf>) -> Self {
        let env: EnvLookup = Arc::new(env_subst::process_env);
        let cache_ttl = cache_ttl_from_env(env.as_ref());
        Self {
            config_path: config_path.into(),
            env,
            cache_ttl,
            cache: Mutex::new(None),
            logged_failures: Mutex::new(HashSet::new()),
        }
    }

    /// Loader for `$OPENCLAW_CONFIG_PATH` or `<state>/openclaw.json`.
    pub fn from_env() -> Self {
        Self::new(paths::resolve_config_path())
    }

    /// Replace the variable lookup used for `${VAR}` substitution.
    pub fn with_env(mut self, env: impl Fn(&str) -> Option<String> + Send + Sync + 'static) -> Self {
        self.env = Arc::new(env);
        self
    }

    /// Override the cache lifetime; `None` disables caching.
    pub fn with_cache_ttl(mut self, ttl: Option<Duration>) -> Self {
        self.cache_ttl = ttl.filter(|t| !t.is_zero());
        self
    }

    pub fn config_path(&self) -> &Path {
        &self.config_path
    }

    fn read_raw(&self) -> Result<Option<String>, ConfigError> {
        match std::fs::read_to_string(&self.config_path) {
            Ok(raw) => Ok(Some(raw)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(source) => Err(ConfigError::Read {
                path: self.config_path.clone(),
                source,
            }),
        }
    }

    fn resolve_raw(&self, raw: &str) -> Result<Resolved, ConfigError> {
        let parsed: Value = json5::from_str(raw).map_err(|e| ConfigError::Parse {
            path: self.config_path.clone(),
            message: e.to_string(),
        })?;
        let included = includes::resolve_includes(parsed, &self.config_path)?;
        let mut value = env_subst::substitute_env_vars(included, self.env.as_ref())?;
        let legacy_changes = migrate_legacy_config(&mut value);
        Ok(Resolved {
            value,
            legacy_changes,
        })
    }

    /// The config tree after includes, env substitution, and migration,
    /// before validation. A missing file resolves to `{}`.
    pub fn resolve_value(&self) -> Result<Value, ConfigError> {
        match self.read_raw()? {
            Some(raw) => Ok(self.resolve_raw(&raw)?.value),
            None => Ok(Value::Object(Map::new())),
        }
    }

    /// Run the full pipeline, surfacing every failure.
    pub fn try_load(&self) -> Result<Config, ConfigError> {
        let Some(raw) = self.read_raw()? else {
            debug!(path = %self.config_path.display(), "Config file not found, using defaults");
            let mut config = Config::default();
            defaults::apply_all(&mut config);
            return Ok(config);
        };

        let resolved = self.resolve_raw(&raw)?;
        for change in &resolved.legacy_changes {
            info!(path = %self.config_path.display(), "Legacy config migrated: {change}");
        }
        for issue in find_legacy_issues(&resolved.value) {
            warn!(path = %issue.path, "Legacy config key: {}", issue.message);
        }

        let mut config =
            validate_config_value(&resolved.value).map_err(|issues| ConfigError::Validation {
                path: self.config_path.clone(),
                issues,
            })?;
        defaults::apply_all(&mut config);
        Ok(config)
    }

    /// Cached load that never fails. A broken config yields an empty config,
    /// with the failure logged once per path.
    pub fn load_config(&self) -> Arc<Config> {
        if let Some(ttl) = self.cache_ttl {
            let cache = self.cache.lock().unwrap_or_else(PoisonError::into_inner);
            if let Some(entry) = cache.as_ref()
                && entry.loaded_at.elapsed() < ttl
            {
                return Arc::clone(&entry.config);
            }
        }

        match self.try_load() {
            Ok(config) => {
                let config = Arc::new(config);
                if self.cache_ttl.is_some() {
                    *self.cache.lock().unwrap_or_else(PoisonError::into_inner) = Some(CacheEntry {
                        loaded_at: Instant::now(),
                        config: Arc::clone(&config),
                    });
                }
                config
            }
            Err(e) => {
                let first = self
                    .logged_failures
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .insert(self.config_path.clone());
                if first {
                    error!("{e}");
                } else {
                    debug!(path = %self.config_path.display(), "Config still invalid");
                }
                Arc::new(Config::default())
            }
        }
    }

    /// Drop the cached config so the next load re-reads the file.
    pub fn invalidate(&self) {
        *self.cache.lock().unwrap_or_else(PoisonError::into_inner) = None;
    }

    /// Read the config for diagnostics without failing.
    pub fn read_snapshot(&self) -> ConfigSnapshot {
        let mut snapshot = ConfigSnapshot {
            path: self.config_path.clone(),
            exists: false,
            raw: None,
            parsed: None,
            config: None,
            valid: false,
            issues: Vec::new(),
            legacy_changes: Vec::new(),
            legacy_issues: Vec::new(),
            error: None,
        };

        let raw = match self.read_raw() {
            Ok(Some(raw)) => raw,
            Ok(None) => {
                let mut config = Config::default();
                defaults::apply_all(&mut config);
                snapshot.parsed = Some(Value::Object(Map::new()));
                snapshot.config = Some(config);
                snapshot.valid = true;
                return snapshot;
            }
            Err(e) => {
                snapshot.exists = true;
                snapshot.error = Some(e.to_string());
                return snapshot;
            }
        };
        snapshot.exists = true;
        snapshot.raw = Some(raw.clone());

        let resolved = match self.resolve_raw(&raw) {
            Ok(resolved) => resolved,
            Err(e) => {
                snapshot.error = Some(e.to_string());
                return snapshot;
            }
        };
        snapshot.legacy_issues = find_legacy_issues(&resolved.value);
        snapshot.legacy_changes = resolved.legacy_changes;

        match validate_config_value(&resolved.value) {
            Ok(mut config) => {
                defaults::apply_all(&mut config);
                snapshot.config = Some(config);
                snapshot.valid = true;
            }
            Err(issues) => snapshot.issues = issues,
        }
        snapshot.parsed = Some(resolved.value);
        snapshot
    }

    /// Validate and atomically write `value`, then drop the cache.
    pub fn write_config(&self, value: &Value) -> Result<(), ConfigError> {
        validate_config_value(value).map_err(|issues| ConfigError::Validation {
            path: self.config_path.clone(),
            issues,
        })?;
        write_config_file(&self.config_path, value)?;
        self.invalidate();
        self.logged_failures
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.config_path);
        Ok(())
    }
}

fn backup_path(path: &Path, index: usize) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    if index == 0 {
        name.push(".bak");
    } else {
        name.push(format!(".bak.{index}"));
    }
    PathBuf::from(name)
}

/// Shift `.bak` → `.bak.1` → ... and copy the current file to `.bak`.
/// Rotation is best effort; a failure never blocks the write.
fn rotate_backups(path: &Path) {
    if !path.exists() {
        return;
    }
    let _ = std::fs::remove_file(backup_path(path, BACKUP_COUNT - 1));
    for index in (0..BACKUP_COUNT - 1).rev() {
        let from = backup_path(path, index);
        if from.exists() {
            let _ = std::fs::rename(&from, backup_path(path, index + 1));
        }
    }
    if let Err(e) = std::fs::copy(path, backup_path(path, 0)) {
        warn!(path = %path.display(), "Failed to back up config: {e}");
    }
}

/// Write `value` to `path` as pretty JSON via a temp file and rename.
///
/// The previous file is rotated into `<path>.bak` (up to five backups). If the
/// rename is refused, the temp file is copied over the target instead.
pub fn write_config_file(path: &Path, value: &Value) -> Result<(), ConfigError> {
    let write_err = |source| ConfigError::Write {
        path: path.to_path_buf(),
        source,
    };
    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(dir).map_err(write_err)?;

    let mut json = serde_json::to_string_pretty(value)
        .map_err(|e| write_err(std::io::Error::other(e)))?;
    json.push('\n');

    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "config".to_string());
    let tmp = dir.join(format!(
        ".{file_name}.{}.{}.tmp",
        std::process::id(),
        uuid::Uuid::new_v4().simple()
    ));
    fsutil::write_private(&tmp, &json).map_err(write_err)?;

    rotate_backups(path);

    match std::fs::rename(&tmp, path) {
        Ok(()) => {}
        Err(e)
            if matches!(
                e.kind(),
                std::io::ErrorKind::PermissionDenied | std::io::ErrorKind::AlreadyExists
            ) =>
        {
            debug!(path = %path.display(), "Rename refused, copying config into place: {e}");
            let copied = std::fs::copy(&tmp, path).and_then(|_| fsutil::restrict_permissions(path));
            let _ = std::fs::remove_file(&tmp);
            copied.map_err(write_err)?;
        }
        Err(e) => {
            let _ = std::fs::remove_file(&tmp);
            return Err(write_err(e));
        }
    }
    debug!(path = %path.display(), "Wrote config");
    Ok(())
}
