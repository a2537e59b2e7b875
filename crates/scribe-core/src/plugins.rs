//! Action plugins and the registry that resolves an action type to one.
//!
//! Built-in actions are registered at construction. When a plugin directory
//! is configured, JSON manifests found there add external-command actions
//! that run through the [`SecurityManager`].

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::actions::{self, ExternalCommandAction};
use crate::atomic::AtomicWriter;
use crate::config::Params;
use crate::rules::MatchInfo;
use crate::security::{SecurityManager, SecurityViolation};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ActionError {
    #[error("{0}")]
    Execution(String),
    #[error(transparent)]
    Security(#[from] SecurityViolation),
}

impl ActionError {
    pub fn execution(msg: impl Into<String>) -> Self {
        ActionError::Execution(msg.into())
    }
}

/// An action a rule can dispatch. Instances are shared by every worker.
pub trait ActionPlugin: Send + Sync {
    fn action_type(&self) -> &str;

    /// Returns the (possibly transformed) file content.
    fn execute(
        &self,
        file_content: &str,
        match_info: &MatchInfo,
        file_path: &Path,
        params: &Params,
    ) -> Result<String, ActionError>;

    fn get_required_params(&self) -> Vec<String> {
        Vec::new()
    }

    fn validate_params(&self, params: &Params) -> bool {
        self.get_required_params()
            .iter()
            .all(|p| params.contains_key(p))
    }
}

type Factory = Box<dyn Fn() -> Arc<dyn ActionPlugin> + Send + Sync>;

struct Entry {
    factory: Factory,
    instance: OnceLock<Arc<dyn ActionPlugin>>,
    builtin: bool,
}

/// What the built-in actions need from the engine.
#[derive(Clone)]
pub struct BuiltinDeps {
    pub security: Arc<SecurityManager>,
    pub writer: AtomicWriter,
    pub quarantine_root: PathBuf,
    pub command_timeout: Duration,
}

#[derive(Default)]
pub struct PluginLoader {
    entries: HashMap<String, Entry>,
}

impl std::fmt::Debug for PluginLoader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginLoader")
            .field("action_types", &self.action_types())
            .finish()
    }
}

impl PluginLoader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_builtins(deps: BuiltinDeps) -> Self {
        let mut loader = Self::new();
        actions::register_builtins(&mut loader, deps);
        loader
    }

    /// Register a ready instance. Replaces any previous plugin of that type.
    pub fn register(&mut self, plugin: Arc<dyn ActionPlugin>) {
        let action_type = plugin.action_type().to_string();
        let instance = OnceLock::new();
        let _ = instance.set(plugin.clone());
        self.entries.insert(
            action_type,
            Entry {
                factory: Box::new(move || plugin.clone()),
                instance,
                builtin: false,
            },
        );
    }

    /// Register a lazily constructed plugin; the factory runs on first `get`.
    pub fn register_factory<F>(&mut self, action_type: &str, factory: F)
    where
        F: Fn() -> Arc<dyn ActionPlugin> + Send + Sync + 'static,
    {
        self.insert(action_type, Box::new(factory), false);
    }

    pub(crate) fn register_builtin<F>(&mut self, action_type: &str, factory: F)
    where
        F: Fn() -> Arc<dyn ActionPlugin> + Send + Sync + 'static,
    {
        self.insert(action_type, Box::new(factory), true);
    }

    fn insert(&mut self, action_type: &str, factory: Factory, builtin: bool) {
        self.entries.insert(
            action_type.to_string(),
            Entry {
                factory,
                instance: OnceLock::new(),
                builtin,
            },
        );
    }

    pub fn get(&self, action_type: &str) -> Option<Arc<dyn ActionPlugin>> {
        let entry = self.entries.get(action_type)?;
        Some(
            entry
                .instance
                .get_or_init(|| {
                    debug!(action_type, "instantiating action plugin");
                    (entry.factory)()
                })
                .clone(),
        )
    }

    pub fn contains(&self, action_type: &str) -> bool {
        self.entries.contains_key(action_type)
    }

    pub fn is_builtin(&self, action_type: &str) -> bool {
        self.entries.get(action_type).map(|e| e.builtin).unwrap_or(false)
    }

    pub fn action_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.entries.keys().cloned().collect();
        types.sort();
        types
    }

    /// Register every valid `*.json` manifest in `dir`. Returns how many were
    /// added. Bad manifests are logged and skipped.
    pub fn discover(
        &mut self,
        dir: &Path,
        security: Arc<SecurityManager>,
        default_timeout: Duration,
    ) -> usize {
        let entries = match fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(err) => {
                warn!(dir = %dir.display(), error = %err, "plugin directory unreadable");
                return 0;
            }
        };

        let mut paths: Vec<PathBuf> = entries
            .flatten()
            .map(|e| e.path())
            .filter(|p| p.extension().map(|e| e == "json").unwrap_or(false))
            .collect();
        paths.sort();

        let mut added = 0;
        for path in paths {
            let manifest = match PluginManifest::read(&path) {
                Ok(m) => m,
                Err(reason) => {
                    warn!(manifest = %path.display(), %reason, "skipping invalid plugin manifest");
                    continue;
                }
            };
            if self.is_builtin(&manifest.action_type) {
                warn!(
                    manifest = %path.display(),
                    action_type = %manifest.action_type,
                    "plugin manifest shadows a built-in action, rejected"
                );
                continue;
            }
            info!(
                action_type = %manifest.action_type,
                manifest = %path.display(),
                "external plugin registered"
            );
            let action_type = manifest.action_type.clone();
            let security = security.clone();
            self.register_factory(&action_type, move || {
                Arc::new(ExternalCommandAction::new(
                    manifest.clone(),
                    security.clone(),
                    default_timeout,
                ))
            });
            added += 1;
        }
        added
    }
}

/// On-disk description of an external-command action.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PluginManifest {
    pub action_type: String,
    pub command: Vec<String>,
    #[serde(default)]
    pub required_params: Vec<String>,
    #[serde(default)]
    pub timeout_seconds: Option<u64>,
}

impl PluginManifest {
    pub fn read(path: &Path) -> Result<Self, String> {
        let text = fs::read_to_string(path).map_err(|e| e.to_string())?;
        let manifest: Self = serde_json::from_str(&text).map_err(|e| e.to_string())?;
        if manifest.action_type.trim().is_empty() {
            return Err("action_type must not be empty".into());
        }
        if manifest.command.is_empty() {
            return Err("command must not be empty".into());
        }
        Ok(manifest)
    }
}
