//! Engine configuration: the JSON document, its validation, and the store
//! that publishes immutable snapshots to the rest of the engine.

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{error, info};

pub const DEFAULT_WORKER_COUNT: usize = 4;
pub const DEFAULT_QUEUE_CAPACITY: usize = 1024;
pub const DEFAULT_HEALTH_PORT: u16 = 8080;
pub const DEFAULT_MAX_FILE_BYTES: u64 = 10 * 1024 * 1024;

/// Free-form action parameters, exactly as written in the config.
pub type Params = serde_json::Map<String, serde_json::Value>;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config JSON: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("config_version must not be empty")]
    MissingVersion,
    #[error("rule id must not be empty (rule #{index})")]
    EmptyRuleId { index: usize },
    #[error("duplicate rule id: {0}")]
    DuplicateRuleId(String),
    #[error("rule {0} has no actions")]
    NoActions(String),
    #[error("rule {rule_id}: invalid file_glob {glob:?}: {reason}")]
    InvalidGlob {
        rule_id: String,
        glob: String,
        reason: String,
    },
    #[error("rule {rule_id}: invalid trigger_pattern: {reason}")]
    InvalidPattern { rule_id: String, reason: String },
    #[error("rule {rule_id}: {field} must be at least 1")]
    InvalidThreshold {
        rule_id: String,
        field: &'static str,
    },
    #[error("engine_settings.{field}: {reason}")]
    InvalidSetting {
        field: &'static str,
        reason: String,
    },
    #[error("security.dangerous_patterns: invalid regex {pattern:?}: {reason}")]
    InvalidDangerousPattern { pattern: String, reason: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ScribeConfig {
    pub config_version: String,
    pub engine_settings: EngineSettings,
    #[serde(default)]
    pub security: SecuritySettings,
    #[serde(default)]
    pub rules: Vec<RuleConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineSettings {
    pub log_level: String,
    pub quarantine_path: String,
    pub pause_file: String,
    #[serde(default = "default_worker_count")]
    pub worker_count: usize,
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    #[serde(default = "default_health_port")]
    pub health_port: u16,
    /// Roots to watch. Empty means the directory holding the config file.
    #[serde(default)]
    pub watch_paths: Vec<String>,
    #[serde(default)]
    pub ignore_globs: Vec<String>,
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,
    #[serde(default = "default_drain_timeout")]
    pub drain_timeout_seconds: u64,
    #[serde(default = "default_command_timeout")]
    pub command_timeout_seconds: u64,
    #[serde(default)]
    pub plugin_dir: Option<String>,
    #[serde(default = "default_true")]
    pub hot_reload: bool,
    #[serde(default = "default_max_file_bytes")]
    pub max_file_bytes: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SecuritySettings {
    #[serde(default)]
    pub allowed_commands: Vec<String>,
    #[serde(default)]
    pub restricted_paths: Vec<String>,
    #[serde(default)]
    pub dangerous_patterns: Vec<String>,
    #[serde(default)]
    pub env_allowlist: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleConfig {
    pub id: String,
    pub name: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub file_glob: String,
    pub trigger_pattern: String,
    pub actions: Vec<ActionSpec>,
    #[serde(default)]
    pub error_handling: ErrorHandling,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionSpec {
    #[serde(rename = "type")]
    pub action_type: String,
    #[serde(default)]
    pub params: Params,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ErrorHandling {
    #[serde(default)]
    pub circuit_breaker: BreakerSettings,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BreakerSettings {
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    #[serde(default = "default_recovery_timeout")]
    pub recovery_timeout_seconds: u64,
    #[serde(default = "default_success_threshold")]
    pub success_threshold: u32,
}

impl Default for BreakerSettings {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            recovery_timeout_seconds: default_recovery_timeout(),
            success_threshold: default_success_threshold(),
        }
    }
}

fn default_worker_count() -> usize {
    DEFAULT_WORKER_COUNT
}
fn default_queue_capacity() -> usize {
    DEFAULT_QUEUE_CAPACITY
}
fn default_health_port() -> u16 {
    DEFAULT_HEALTH_PORT
}
fn default_debounce_ms() -> u64 {
    100
}
fn default_drain_timeout() -> u64 {
    10
}
fn default_command_timeout() -> u64 {
    30
}
fn default_max_file_bytes() -> u64 {
    DEFAULT_MAX_FILE_BYTES
}
fn default_true() -> bool {
    true
}
fn default_failure_threshold() -> u32 {
    5
}
fn default_recovery_timeout() -> u64 {
    60
}
fn default_success_threshold() -> u32 {
    3
}

/// Parse and validate a config document.
pub fn parse_config(text: &str) -> Result<ScribeConfig, ConfigError> {
    let config: ScribeConfig = serde_json::from_str(text)?;
    validate(&config)?;
    Ok(config)
}

/// Checks serde cannot express: uniqueness, ranges, and that every glob and
/// regex compiles.
pub fn validate(config: &ScribeConfig) -> Result<(), ConfigError> {
    if config.config_version.trim().is_empty() {
        return Err(ConfigError::MissingVersion);
    }

    let settings = &config.engine_settings;
    if settings.worker_count < 1 {
        return Err(ConfigError::InvalidSetting {
            field: "worker_count",
            reason: "must be at least 1".into(),
        });
    }
    if settings.queue_capacity < 1 {
        return Err(ConfigError::InvalidSetting {
            field: "queue_capacity",
            reason: "must be at least 1".into(),
        });
    }
    if settings.quarantine_path.trim().is_empty() {
        return Err(ConfigError::InvalidSetting {
            field: "quarantine_path",
            reason: "must not be empty".into(),
        });
    }
    for pattern in &settings.ignore_globs {
        glob::Pattern::new(pattern).map_err(|e| ConfigError::InvalidSetting {
            field: "ignore_globs",
            reason: format!("{pattern:?}: {e}"),
        })?;
    }

    for pattern in &config.security.dangerous_patterns {
        Regex::new(pattern).map_err(|e| ConfigError::InvalidDangerousPattern {
            pattern: pattern.clone(),
            reason: e.to_string(),
        })?;
    }

    let mut seen = HashSet::new();
    for (index, rule) in config.rules.iter().enumerate() {
        if rule.id.trim().is_empty() {
            return Err(ConfigError::EmptyRuleId { index });
        }
        if !seen.insert(rule.id.as_str()) {
            return Err(ConfigError::DuplicateRuleId(rule.id.clone()));
        }
        if rule.actions.is_empty() {
            return Err(ConfigError::NoActions(rule.id.clone()));
        }

        let breaker = &rule.error_handling.circuit_breaker;
        let thresholds = [
            ("failure_threshold", breaker.failure_threshold as u64),
            ("recovery_timeout_seconds", breaker.recovery_timeout_seconds),
            ("success_threshold", breaker.success_threshold as u64),
        ];
        for (field, value) in thresholds {
            if value < 1 {
                return Err(ConfigError::InvalidThreshold {
                    rule_id: rule.id.clone(),
                    field,
                });
            }
        }

        glob::Pattern::new(&rule.file_glob).map_err(|e| ConfigError::InvalidGlob {
            rule_id: rule.id.clone(),
            glob: rule.file_glob.clone(),
            reason: e.to_string(),
        })?;
        Regex::new(&rule.trigger_pattern).map_err(|e| ConfigError::InvalidPattern {
            rule_id: rule.id.clone(),
            reason: e.to_string(),
        })?;
    }
    Ok(())
}

/// An immutable, validated configuration plus where it came from.
#[derive(Debug, Clone)]
pub struct ConfigSnapshot {
    pub config: ScribeConfig,
    /// Directory relative paths in the config are resolved against.
    pub base_dir: PathBuf,
    pub loaded_at: DateTime<Utc>,
    pub generation: u64,
}

impl ConfigSnapshot {
    pub fn version(&self) -> &str {
        &self.config.config_version
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.config.engine_settings
    }

    pub fn resolve(&self, path: &str) -> PathBuf {
        let p = Path::new(path);
        if p.is_absolute() {
            p.to_path_buf()
        } else {
            self.base_dir.join(p)
        }
    }

    pub fn quarantine_dir(&self) -> PathBuf {
        self.resolve(&self.settings().quarantine_path)
    }

    pub fn pause_file(&self) -> PathBuf {
        self.resolve(&self.settings().pause_file)
    }

    pub fn plugin_dir(&self) -> Option<PathBuf> {
        self.settings().plugin_dir.as_deref().map(|d| self.resolve(d))
    }

    pub fn watch_roots(&self) -> Vec<PathBuf> {
        let paths = &self.settings().watch_paths;
        if paths.is_empty() {
            vec![self.base_dir.clone()]
        } else {
            paths.iter().map(|p| self.resolve(p)).collect()
        }
    }
}

/// Holds the current snapshot. Readers clone the `Arc` under a short read
/// lock; a reload builds the new snapshot first and swaps it in whole.
#[derive(Debug)]
pub struct ConfigStore {
    path: Option<PathBuf>,
    base_dir: PathBuf,
    current: RwLock<Arc<ConfigSnapshot>>,
}

impl ConfigStore {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = absolute(path.as_ref());
        let config = read_config(&path)?;
        let base_dir = path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        let store = Self::build(config, base_dir, Some(path));
        info!(
            event = "config.loaded",
            config_version = %store.current().version(),
            rules = store.current().config.rules.len(),
            "configuration loaded"
        );
        Ok(store)
    }

    /// Store backed by an in-memory config; `reload` is a no-op error.
    pub fn from_config(
        config: ScribeConfig,
        base_dir: impl Into<PathBuf>,
    ) -> Result<Self, ConfigError> {
        validate(&config)?;
        Ok(Self::build(config, base_dir.into(), None))
    }

    fn build(config: ScribeConfig, base_dir: PathBuf, path: Option<PathBuf>) -> Self {
        let snapshot = ConfigSnapshot {
            config,
            base_dir: base_dir.clone(),
            loaded_at: Utc::now(),
            generation: 1,
        };
        Self {
            path,
            base_dir,
            current: RwLock::new(Arc::new(snapshot)),
        }
    }

    pub fn current(&self) -> Arc<ConfigSnapshot> {
        self.current.read().clone()
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Re-read the backing file. On any error the previous snapshot stays
    /// current.
    pub fn reload(&self) -> Result<Arc<ConfigSnapshot>, ConfigError> {
        let Some(path) = &self.path else {
            return Ok(self.current());
        };
        match read_config(path) {
            Ok(config) => {
                let snapshot = self.publish(config);
                info!(
                    event = "config.reloaded",
                    config_version = %snapshot.version(),
                    generation = snapshot.generation,
                    "configuration reloaded"
                );
                Ok(snapshot)
            }
            Err(err) => {
                error!(
                    event = "config.reload_failed",
                    path = %path.display(),
                    error = %err,
                    "config reload rejected, keeping previous configuration"
                );
                Err(err)
            }
        }
    }

    /// Swap in an already-validated config.
    pub fn publish(&self, config: ScribeConfig) -> Arc<ConfigSnapshot> {
        let mut guard = self.current.write();
        let snapshot = Arc::new(ConfigSnapshot {
            config,
            base_dir: self.base_dir.clone(),
            loaded_at: Utc::now(),
            generation: guard.generation + 1,
        });
        *guard = snapshot.clone();
        snapshot
    }
}

fn read_config(path: &Path) -> Result<ScribeConfig, ConfigError> {
    let text = fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    parse_config(&text)
}

fn absolute(path: &Path) -> PathBuf {
    if path.is_absolute() {
        return path.to_path_buf();
    }
    std::env::current_dir()
        .map(|cwd| cwd.join(path))
        .unwrap_or_else(|_| path.to_path_buf())
}
