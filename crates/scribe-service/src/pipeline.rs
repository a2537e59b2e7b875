//! Per-event processing shared by every worker.
//!
//! **Self-write suppression**: after the engine persists content it records
//! the content hash for that path. The watcher event caused by that very
//! write carries the same hash and is consumed silently, so a rule that
//! rewrites a file never feeds on its own output.

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant, SystemTime};

use anyhow::Result;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, trace, warn};

use scribe_core::atomic::{AtomicWriter, WriteMode};
use scribe_core::breaker::BreakerRegistry;
use scribe_core::config::{ConfigSnapshot, ConfigStore};
use scribe_core::dispatcher::{DispatchResult, Dispatcher};
use scribe_core::metrics::Metrics;
use scribe_core::plugins::{BuiltinDeps, PluginLoader};
use scribe_core::rules::{RuleMatch, RuleProcessor};
use scribe_core::security::{SecurityManager, SecurityPolicy};

use crate::bus::BusPublisher;
use crate::watcher::{Event, EventKind};

/// Last content hash the engine wrote, per path.
#[derive(Debug, Default)]
pub struct WriteLedger {
    written: Mutex<HashMap<PathBuf, blake3::Hash>>,
}

impl WriteLedger {
    /// Remember `content` as about to be written to `path`.
    pub fn record(&self, path: &Path, content: &[u8]) {
        self.written.lock().insert(path.to_path_buf(), blake3::hash(content));
    }

    pub fn forget(&self, path: &Path) {
        self.written.lock().remove(path);
    }

    /// True if `content` is exactly what the engine last wrote to `path`.
    /// The entry is consumed either way.
    pub fn is_own_write(&self, path: &Path, content: &[u8]) -> bool {
        match self.written.lock().remove(path) {
            Some(hash) => hash == blake3::hash(content),
            None => false,
        }
    }
}

/// What happened to one event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventOutcome {
    Skipped(&'static str),
    Suppressed,
    NoMatch,
    Dispatched { matches: usize, written: bool },
}

/// Everything a worker needs to turn one event into dispatches and a write.
pub struct Pipeline {
    config: Arc<ConfigStore>,
    rules: RwLock<Arc<RuleProcessor>>,
    dispatcher: Dispatcher,
    security: Arc<SecurityManager>,
    breakers: Arc<BreakerRegistry>,
    metrics: Arc<Metrics>,
    writer: AtomicWriter,
    ledger: WriteLedger,
    /// Set when a drain overruns its deadline; in-flight chains stop
    /// between actions.
    cancel: Arc<AtomicBool>,
    bus: OnceLock<BusPublisher>,
}

impl Pipeline {
    /// Build the security manager, plugin registry, breakers and dispatcher
    /// from the current snapshot. Plugin discovery runs once, here.
    pub fn new(
        config: Arc<ConfigStore>,
        metrics: Arc<Metrics>,
        cancel: Arc<AtomicBool>,
    ) -> Result<Self> {
        let snapshot = config.current();
        let settings = snapshot.settings();
        let command_timeout = Duration::from_secs(settings.command_timeout_seconds);
        let policy = SecurityPolicy::from_settings(&snapshot.config.security)?;
        let security = Arc::new(
            SecurityManager::new(policy)
                .with_default_timeout(command_timeout)
                .with_metrics(metrics.clone()),
        );
        let writer = AtomicWriter::new();
        let deps = BuiltinDeps {
            security: security.clone(),
            writer: writer.clone(),
            quarantine_root: snapshot.quarantine_dir(),
            command_timeout,
        };
        let mut plugins = PluginLoader::with_builtins(deps);
        if let Some(dir) = snapshot.plugin_dir() {
            let added = plugins.discover(&dir, security.clone(), command_timeout);
            info!(dir = %dir.display(), added, "plugin discovery finished");
        }

        let breakers = Arc::new(BreakerRegistry::new().with_metrics(metrics.clone()));
        let dispatcher = Dispatcher::new(
            Arc::new(plugins),
            breakers.clone(),
            security.clone(),
            metrics.clone(),
        )
        .with_shutdown(cancel.clone());

        Ok(Self {
            rules: RwLock::new(Arc::new(RuleProcessor::from_snapshot(&snapshot))),
            config,
            dispatcher,
            security,
            breakers,
            metrics,
            writer,
            ledger: WriteLedger::default(),
            cancel,
            bus: OnceLock::new(),
        })
    }

    /// Publish dispatch summaries from now on. Only the first call counts.
    pub fn attach_bus(&self, bus: BusPublisher) {
        let _ = self.bus.set(bus);
    }

    pub fn config(&self) -> &Arc<ConfigStore> {
        &self.config
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    pub fn breakers(&self) -> &Arc<BreakerRegistry> {
        &self.breakers
    }

    pub fn security(&self) -> &Arc<SecurityManager> {
        &self.security
    }

    pub fn ledger(&self) -> &WriteLedger {
        &self.ledger
    }

    pub fn rules(&self) -> Arc<RuleProcessor> {
        self.rules.read().clone()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.load(Ordering::Acquire)
    }

    /// Bring rules, breakers and security policy in line with a freshly
    /// published snapshot. Breakers of surviving rules keep their state.
    pub fn apply_snapshot(&self, snapshot: &ConfigSnapshot) -> Result<()> {
        let policy = SecurityPolicy::from_settings(&snapshot.config.security)?;
        self.security.update_policy(policy);
        let processor = Arc::new(RuleProcessor::from_snapshot(snapshot));
        self.breakers
            .retain(snapshot.config.rules.iter().map(|r| r.id.as_str()));
        *self.rules.write() = processor;
        info!(
            config_version = %snapshot.version(),
            rules = snapshot.config.rules.len(),
            "rules recompiled"
        );
        Ok(())
    }

    /// Read the file, run every matching rule in order and persist the final
    /// content atomically when it changed. Always counts the event.
    pub fn process_event(&self, event: &Event) -> EventOutcome {
        let outcome = self.process_inner(event);
        match &outcome {
            EventOutcome::Skipped(_) | EventOutcome::Suppressed => {
                Metrics::incr(&self.metrics.events_skipped)
            }
            _ => {}
        }
        Metrics::incr(&self.metrics.events_processed);
        outcome
    }

    fn process_inner(&self, event: &Event) -> EventOutcome {
        if event.kind == EventKind::Deleted {
            return EventOutcome::Skipped("deleted");
        }
        let path = &event.path;
        let snapshot = self.config.current();
        if *path == snapshot.pause_file() {
            return EventOutcome::Skipped("pause_file");
        }
        let rules = self.rules();

        let content = match read_event_file(path, snapshot.settings().max_file_bytes) {
            Ok(c) => c,
            Err(ReadSkip::Missing) => {
                info!(
                    event = "worker.skipped",
                    event_id = %event.event_id,
                    path = %path.display(),
                    reason = "missing",
                    "file vanished before processing"
                );
                return EventOutcome::Skipped("missing");
            }
            Err(ReadSkip::Directory) => return EventOutcome::Skipped("directory"),
            Err(ReadSkip::TooLarge(size)) => {
                info!(
                    event = "worker.skipped",
                    event_id = %event.event_id,
                    path = %path.display(),
                    size,
                    reason = "too_large",
                    "file exceeds max_file_bytes"
                );
                return EventOutcome::Skipped("too_large");
            }
            Err(ReadSkip::NotUtf8) => {
                debug!(
                    event = "worker.skipped",
                    event_id = %event.event_id,
                    path = %path.display(),
                    reason = "not_utf8",
                    "binary file skipped"
                );
                return EventOutcome::Skipped("not_utf8");
            }
            Err(ReadSkip::Io(err)) => {
                warn!(
                    event_id = %event.event_id,
                    path = %path.display(),
                    error = %err,
                    "cannot read event file"
                );
                // System failure for every rule whose glob covers the file.
                for rule in rules.rules_for_path(path) {
                    let breaker = self.breakers.get_or_create(&rule.id, &rule.breaker);
                    if breaker.try_acquire().is_ok() {
                        breaker.record_failure();
                    }
                }
                return EventOutcome::Skipped("io_error");
            }
        };

        if self.ledger.is_own_write(path, content.as_bytes()) {
            trace!(path = %path.display(), "suppressed event for our own write");
            return EventOutcome::Suppressed;
        }

        let matches = rules.process_event(&event.event_id, path, &content);
        if matches.is_empty() {
            return EventOutcome::NoMatch;
        }

        let mut current = content.clone();
        let mut any_success = false;
        let mut dispatched = 0;
        for mut rule_match in matches {
            if self.is_cancelled() {
                break;
            }
            // Later rules see the content earlier rules produced.
            if current != rule_match.file_content {
                match rule_match.rule.find(&current) {
                    Some(info) => {
                        rule_match.match_info = info;
                        rule_match.file_content = current.clone();
                    }
                    None => continue,
                }
            }
            Metrics::incr(&self.metrics.rule_matches);
            info!(
                event = "rule.matched",
                event_id = %event.event_id,
                rule_id = %rule_match.rule.id,
                path = %path.display(),
                matched = %rule_match.match_info.matched,
                "rule matched"
            );
            let result = self.dispatcher.dispatch(&rule_match);
            dispatched += 1;
            if result.successful_actions > 0 {
                any_success = true;
                current = result.final_content.clone();
            }
            self.publish(&rule_match, &result);
        }

        let written = any_success && current != content && self.persist(event, &current);
        EventOutcome::Dispatched {
            matches: dispatched,
            written,
        }
    }

    fn persist(&self, event: &Event, content: &str) -> bool {
        let path = &event.path;
        // An action such as quarantine may have moved the file away.
        if !path.exists() {
            debug!(path = %path.display(), "file gone after dispatch, nothing to persist");
            return false;
        }
        let started_at = SystemTime::now();
        let started = Instant::now();
        self.ledger.record(path, content.as_bytes());
        let result = self.writer.write(path, content.as_bytes(), WriteMode::Text);
        let ok = result.is_ok();
        match result {
            Ok(()) => {
                Metrics::incr(&self.metrics.files_written);
                info!(
                    event_id = %event.event_id,
                    path = %path.display(),
                    bytes = content.len(),
                    "transformed content written"
                );
            }
            Err(err) => {
                self.ledger.forget(path);
                warn!(
                    event_id = %event.event_id,
                    path = %path.display(),
                    error = %err,
                    "failed to persist transformed content"
                );
            }
        }
        let attributes = BTreeMap::from([
            ("path".to_string(), path.display().to_string()),
            ("event_id".to_string(), event.event_id.clone()),
        ]);
        self.metrics
            .spans
            .record("file.write", started_at, started.elapsed(), ok, attributes);
        ok
    }

    fn publish(&self, rule_match: &RuleMatch, result: &DispatchResult) {
        if let Some(bus) = self.bus.get() {
            bus.publish(&rule_match.file_path, result);
        }
    }
}

enum ReadSkip {
    Missing,
    Directory,
    TooLarge(u64),
    NotUtf8,
    Io(io::Error),
}

fn read_event_file(path: &Path, max_bytes: u64) -> std::result::Result<String, ReadSkip> {
    let meta = match fs::metadata(path) {
        Ok(m) => m,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Err(ReadSkip::Missing),
        Err(err) => return Err(ReadSkip::Io(err)),
    };
    if meta.is_dir() {
        return Err(ReadSkip::Directory);
    }
    if meta.len() > max_bytes {
        return Err(ReadSkip::TooLarge(meta.len()));
    }
    let bytes = match fs::read(path) {
        Ok(b) => b,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Err(ReadSkip::Missing),
        Err(err) => return Err(ReadSkip::Io(err)),
    };
    String::from_utf8(bytes).map_err(|_| ReadSkip::NotUtf8)
}

#[cfg(test)]
mod tests {
    use super::*;
    use scribe_core::config::parse_config;
    use serde_json::json;
    use tempfile::tempdir;

    fn pipeline(dir: &Path, rules: serde_json::Value) -> Pipeline {
        let config = parse_config(
            &json!({
                "config_version": "t1",
                "engine_settings": {
                    "log_level": "info",
                    "quarantine_path": "quarantine",
                    "pause_file": ".pause",
                    "max_file_bytes": 64
                },
                "security": {"allowed_commands": [], "restricted_paths": [], "dangerous_patterns": []},
                "rules": rules
            })
            .to_string(),
        )
        .unwrap();
        let store = Arc::new(ConfigStore::from_config(config, dir).unwrap());
        Pipeline::new(store, Arc::new(Metrics::new()), Arc::new(AtomicBool::new(false))).unwrap()
    }

    fn replace_rule() -> serde_json::Value {
        json!([{
            "id": "todo",
            "name": "todo to done",
            "file_glob": "*.md",
            "trigger_pattern": "TODO",
            "actions": [{"type": "replace", "params": {"replacement": "DONE"}}]
        }])
    }

    #[test]
    fn transforms_and_suppresses_own_write() {
        let dir = tempdir().unwrap();
        let file = dir.path().join("a.md");
        fs::write(&file, "x TODO").unwrap();
        let p = pipeline(dir.path(), replace_rule());

        let outcome = p.process_event(&Event::new(EventKind::Modified, file.clone()));
        assert_eq!(outcome, EventOutcome::Dispatched { matches: 1, written: true });
        assert_eq!(fs::read_to_string(&file).unwrap(), "x DONE");

        let echo = p.process_event(&Event::new(EventKind::Modified, file.clone()));
        assert_eq!(echo, EventOutcome::Suppressed);
        assert_eq!(p.metrics().snapshot().files_written, 1);
    }

    #[test]
    fn skips_what_it_cannot_process() {
        let dir = tempdir().unwrap();
        let p = pipeline(dir.path(), replace_rule());

        let big = dir.path().join("big.md");
        fs::write(&big, "TODO ".repeat(40)).unwrap();
        let bin = dir.path().join("bin.md");
        fs::write(&bin, [0xffu8, 0xfe, b'T']).unwrap();

        let gone = dir.path().join("gone.md");
        assert_eq!(p.process_event(&Event::new(EventKind::Modified, gone.clone())), EventOutcome::Skipped("missing"));
        assert_eq!(p.process_event(&Event::new(EventKind::Deleted, gone)), EventOutcome::Skipped("deleted"));
        assert_eq!(p.process_event(&Event::new(EventKind::Modified, big)), EventOutcome::Skipped("too_large"));
        assert_eq!(p.process_event(&Event::new(EventKind::Modified, bin)), EventOutcome::Skipped("not_utf8"));
        assert_eq!(
            p.process_event(&Event::new(EventKind::Created, dir.path().to_path_buf())),
            EventOutcome::Skipped("directory")
        );
    }

    #[test]
    fn reload_keeps_surviving_breakers() {
        let dir = tempdir().unwrap();
        let p = pipeline(dir.path(), replace_rule());
        let rule = p.rules().rule("todo").unwrap().clone();
        let breaker = p.breakers().get_or_create(&rule.id, &rule.breaker);

        let mut config = p.config().current().config.clone();
        config.config_version = "t2".into();
        let snap = p.config().publish(config.clone());
        p.apply_snapshot(&snap).unwrap();
        assert!(Arc::ptr_eq(&breaker, &p.breakers().get("todo").unwrap()));

        config.rules.clear();
        let snap = p.config().publish(config);
        p.apply_snapshot(&snap).unwrap();
        assert!(p.breakers().get("todo").is_none());
        assert!(p.rules().rules().is_empty());
    }

    #[test]
    fn later_rules_see_earlier_output() {
        let dir = tempdir().unwrap();
        let file = dir.path().join("a.md");
        fs::write(&file, "TODO").unwrap();
        let rules = json!([
            {"id": "one", "name": "one", "file_glob": "*.md", "trigger_pattern": "TODO",
             "actions": [{"type": "replace", "params": {"replacement": "DOING"}}]},
            {"id": "two", "name": "two", "file_glob": "*.md", "trigger_pattern": "TODO",
             "actions": [{"type": "replace", "params": {"replacement": "never"}}]}
        ]);
        let p = pipeline(dir.path(), rules);
        let outcome = p.process_event(&Event::new(EventKind::Modified, file.clone()));
        assert_eq!(outcome, EventOutcome::Dispatched { matches: 1, written: true });
        assert_eq!(fs::read_to_string(&file).unwrap(), "DOING");
    }
}
