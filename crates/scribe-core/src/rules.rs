//! Rule compilation and matching.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use glob::Pattern;
use regex::{Captures, Regex};
use serde::Serialize;
use tracing::{debug, error};
use uuid::Uuid;

use crate::config::{ActionSpec, BreakerSettings, ConfigError, ConfigSnapshot, RuleConfig};

/// An owned view of one regex match, handed to action plugins.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MatchInfo {
    pub matched: String,
    pub start: usize,
    pub end: usize,
    /// Positional groups, excluding group 0.
    pub groups: Vec<Option<String>>,
    pub named: BTreeMap<String, String>,
}

impl MatchInfo {
    fn from_captures(re: &Regex, caps: &Captures<'_>) -> Self {
        let whole = caps.get(0);
        let groups = (1..caps.len())
            .map(|i| caps.get(i).map(|m| m.as_str().to_string()))
            .collect();
        let named = re
            .capture_names()
            .flatten()
            .filter_map(|name| caps.name(name).map(|m| (name.to_string(), m.as_str().to_string())))
            .collect();
        Self {
            matched: whole.map(|m| m.as_str().to_string()).unwrap_or_default(),
            start: whole.map(|m| m.start()).unwrap_or(0),
            end: whole.map(|m| m.end()).unwrap_or(0),
            groups,
            named,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CompiledRule {
    pub id: String,
    pub name: String,
    pub enabled: bool,
    pub file_glob: Pattern,
    pub trigger: Regex,
    pub actions: Vec<ActionSpec>,
    pub breaker: BreakerSettings,
}

impl CompiledRule {
    pub fn compile(rule: &RuleConfig) -> Result<Self, ConfigError> {
        let file_glob = Pattern::new(&rule.file_glob).map_err(|e| ConfigError::InvalidGlob {
            rule_id: rule.id.clone(),
            glob: rule.file_glob.clone(),
            reason: e.to_string(),
        })?;
        let trigger = Regex::new(&rule.trigger_pattern).map_err(|e| ConfigError::InvalidPattern {
            rule_id: rule.id.clone(),
            reason: e.to_string(),
        })?;
        Ok(Self {
            id: rule.id.clone(),
            name: rule.name.clone(),
            enabled: rule.enabled,
            file_glob,
            trigger,
            actions: rule.actions.clone(),
            breaker: rule.error_handling.circuit_breaker,
        })
    }

    /// Glob test against the full path, the path relative to each root, and
    /// the bare file name.
    pub fn matches_path(&self, path: &Path, roots: &[PathBuf]) -> bool {
        if self.file_glob.matches_path(path) {
            return true;
        }
        if roots
            .iter()
            .filter_map(|root| path.strip_prefix(root).ok())
            .any(|rel| self.file_glob.matches_path(rel))
        {
            return true;
        }
        !self.file_glob.as_str().contains('/')
            && path
                .file_name()
                .and_then(|n| n.to_str())
                .map(|n| self.file_glob.matches(n))
                .unwrap_or(false)
    }

    pub fn find(&self, content: &str) -> Option<MatchInfo> {
        self.trigger
            .captures(content)
            .map(|caps| MatchInfo::from_captures(&self.trigger, &caps))
    }
}

#[derive(Debug, Clone)]
pub struct RuleMatch {
    pub rule: Arc<CompiledRule>,
    pub match_info: MatchInfo,
    pub file_path: PathBuf,
    pub file_content: String,
    pub event_id: String,
}

/// Rules compiled once per config snapshot.
#[derive(Debug, Default)]
pub struct RuleProcessor {
    rules: Vec<Arc<CompiledRule>>,
    roots: Vec<PathBuf>,
}

impl RuleProcessor {
    /// Compile `rules`. A rule that fails to compile is left out with an
    /// error log; the remaining rules are unaffected.
    pub fn compile(rules: &[RuleConfig], roots: Vec<PathBuf>) -> Self {
        let compiled = rules
            .iter()
            .filter_map(|rule| match CompiledRule::compile(rule) {
                Ok(c) => Some(Arc::new(c)),
                Err(err) => {
                    error!(
                        event = "rule.disabled",
                        rule_id = %rule.id,
                        error = %err,
                        "rule disabled: failed to compile"
                    );
                    None
                }
            })
            .collect();
        Self {
            rules: compiled,
            roots,
        }
    }

    pub fn from_snapshot(snapshot: &ConfigSnapshot) -> Self {
        Self::compile(&snapshot.config.rules, snapshot.watch_roots())
    }

    pub fn rules(&self) -> &[Arc<CompiledRule>] {
        &self.rules
    }

    pub fn rule(&self, id: &str) -> Option<&Arc<CompiledRule>> {
        self.rules.iter().find(|r| r.id == id)
    }

    /// Enabled rules whose glob covers `path`, in declaration order.
    pub fn rules_for_path<'a>(
        &'a self,
        path: &'a Path,
    ) -> impl Iterator<Item = &'a Arc<CompiledRule>> + 'a {
        self.rules
            .iter()
            .filter(move |r| r.enabled && r.matches_path(path, &self.roots))
    }

    pub fn process(&self, file_path: &Path, file_content: &str) -> Vec<RuleMatch> {
        self.process_event(&Uuid::new_v4().to_string(), file_path, file_content)
    }

    /// At most one match per rule (the first), in declaration order.
    pub fn process_event(
        &self,
        event_id: &str,
        file_path: &Path,
        file_content: &str,
    ) -> Vec<RuleMatch> {
        let matches: Vec<RuleMatch> = self
            .rules_for_path(file_path)
            .filter_map(|rule| {
                rule.find(file_content).map(|match_info| RuleMatch {
                    rule: rule.clone(),
                    match_info,
                    file_path: file_path.to_path_buf(),
                    file_content: file_content.to_string(),
                    event_id: event_id.to_string(),
                })
            })
            .collect();
        debug!(event_id, path = %file_path.display(), matches = matches.len(), "rules evaluated");
        matches
    }
}
