//! Integration tests for dispatch and circuit breaking.
//!
//! Tests cover:
//!  1. A single failing action opens the breaker on the sixth dispatch
//!  2. A chain that half-fails never opens the breaker
//!  3. Recovery through HALF_OPEN with a manual clock
//!  4. Commands run as argv lists, never through a shell
//!  5. A missing plugin opens the breaker after exactly failure_threshold dispatches
//!  6. Transformed content flows through the chain in order
//!  7. A panicking plugin is contained as a system failure
//!  8. A security violation stops the chain
//!  9. A relative path param cannot escape into a restricted directory
//! 10. A command that outlives its timeout fails the action with a reason

use std::io;
use std::path::Path;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde_json::json;

use scribe_core::actions::RunCommandAction;
use scribe_core::atomic::AtomicWriter;
use scribe_core::breaker::{BreakerRegistry, BreakerState, Clock};
use scribe_core::config::{ActionSpec, BreakerSettings, Params, RuleConfig};
use scribe_core::dispatcher::{Dispatcher, FailureKind, CIRCUIT_BREAKER_ACTION};
use scribe_core::metrics::Metrics;
use scribe_core::plugins::{ActionError, ActionPlugin, BuiltinDeps, PluginLoader};
use scribe_core::rules::{MatchInfo, RuleMatch, RuleProcessor};
use scribe_core::security::{
    ProcessOutput, ProcessSpawner, SecurityManager, SecurityPolicy, SpawnRequest, SystemSpawner,
};

struct ManualClock {
    base: Instant,
    offset: Mutex<Duration>,
}

impl ManualClock {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            base: Instant::now(),
            offset: Mutex::new(Duration::ZERO),
        })
    }

    fn advance(&self, by: Duration) {
        *self.offset.lock() += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.base + *self.offset.lock()
    }
}

struct Fails;

impl ActionPlugin for Fails {
    fn action_type(&self) -> &str {
        "fails"
    }

    fn execute(&self, _: &str, _: &MatchInfo, _: &Path, _: &Params) -> Result<String, ActionError> {
        Err(ActionError::execution("always fails"))
    }
}

struct Append(&'static str);

impl ActionPlugin for Append {
    fn action_type(&self) -> &str {
        self.0
    }

    fn execute(&self, content: &str, _: &MatchInfo, _: &Path, _: &Params) -> Result<String, ActionError> {
        Ok(format!("{content}+{}", self.0))
    }
}

/// Fails while the switch is on.
struct Flaky(Arc<AtomicBool>);

impl ActionPlugin for Flaky {
    fn action_type(&self) -> &str {
        "flaky"
    }

    fn execute(&self, content: &str, _: &MatchInfo, _: &Path, _: &Params) -> Result<String, ActionError> {
        if self.0.load(std::sync::atomic::Ordering::SeqCst) {
            Err(ActionError::execution("still broken"))
        } else {
            Ok(content.to_string())
        }
    }
}

struct Panics;

impl ActionPlugin for Panics {
    fn action_type(&self) -> &str {
        "panics"
    }

    fn execute(&self, _: &str, _: &MatchInfo, _: &Path, _: &Params) -> Result<String, ActionError> {
        panic!("plugin bug")
    }
}

#[derive(Default)]
struct RecordingSpawner {
    requests: Mutex<Vec<SpawnRequest>>,
}

impl ProcessSpawner for RecordingSpawner {
    fn run(&self, request: &SpawnRequest) -> io::Result<ProcessOutput> {
        self.requests.lock().push(request.clone());
        SystemSpawner.run(request)
    }
}

struct Harness {
    dispatcher: Dispatcher,
    breakers: Arc<BreakerRegistry>,
    metrics: Arc<Metrics>,
}

fn harness(loader: PluginLoader, clock: Arc<dyn Clock>) -> Harness {
    let metrics = Arc::new(Metrics::new());
    let breakers = Arc::new(
        BreakerRegistry::new()
            .with_clock(clock)
            .with_metrics(metrics.clone()),
    );
    let security = Arc::new(SecurityManager::new(SecurityPolicy::default()).with_metrics(metrics.clone()));
    let dispatcher = Dispatcher::new(Arc::new(loader), breakers.clone(), security, metrics.clone());
    Harness {
        dispatcher,
        breakers,
        metrics,
    }
}

fn rule_match(actions: &[&str], breaker: BreakerSettings) -> RuleMatch {
    let specs = actions
        .iter()
        .map(|t| ActionSpec {
            action_type: t.to_string(),
            params: Params::new(),
        })
        .collect();
    rule_match_at(Path::new("/w/a.md"), specs, breaker)
}

fn rule_match_at(file: &Path, actions: Vec<ActionSpec>, breaker: BreakerSettings) -> RuleMatch {
    let mut rule = RuleConfig {
        id: "r1".into(),
        name: "rule one".into(),
        enabled: true,
        file_glob: "*.md".into(),
        trigger_pattern: "TODO".into(),
        actions,
        error_handling: Default::default(),
    };
    rule.error_handling.circuit_breaker = breaker;
    let processor = RuleProcessor::compile(&[rule], vec![]);
    processor
        .process(file, "x TODO y")
        .into_iter()
        .next()
        .expect("rule should match")
}

fn action(action_type: &str, params: serde_json::Value) -> ActionSpec {
    ActionSpec {
        action_type: action_type.into(),
        params: params.as_object().cloned().unwrap_or_default(),
    }
}

fn builtin_dispatcher(policy: SecurityPolicy, quarantine_root: &Path) -> (Dispatcher, Arc<Metrics>) {
    let metrics = Arc::new(Metrics::new());
    let security = Arc::new(SecurityManager::new(policy).with_metrics(metrics.clone()));
    let loader = PluginLoader::with_builtins(BuiltinDeps {
        security: security.clone(),
        writer: AtomicWriter::new(),
        quarantine_root: quarantine_root.to_path_buf(),
        command_timeout: Duration::from_secs(5),
    });
    let dispatcher = Dispatcher::new(Arc::new(loader), Arc::new(BreakerRegistry::new()), security, metrics.clone());
    (dispatcher, metrics)
}

fn breaker(failure: u32, recovery: u64, success: u32) -> BreakerSettings {
    BreakerSettings {
        failure_threshold: failure,
        recovery_timeout_seconds: recovery,
        success_threshold: success,
    }
}

// ─── Test 1: single failing action trips on dispatch six ────────────────────

#[test]
fn test_single_failing_action_opens_breaker() {
    let mut loader = PluginLoader::new();
    loader.register(Arc::new(Fails));
    let h = harness(loader, ManualClock::new());
    let m = rule_match(&["fails"], breaker(5, 60, 3));

    for i in 1..=5 {
        let result = h.dispatcher.dispatch(&m);
        assert!(!result.success);
        assert_eq!(result.action_results[0].action_type, "fails", "dispatch {i}");
        assert_eq!(result.action_results[0].failure_kind, Some(FailureKind::Action));
    }
    assert_eq!(h.breakers.snapshot()["r1"], BreakerState::Open);

    let sixth = h.dispatcher.dispatch(&m);
    assert!(!sixth.success);
    assert!(sixth.rejected_by_breaker());
    assert_eq!(sixth.action_results.len(), 1);
    assert_eq!(sixth.action_results[0].action_type, CIRCUIT_BREAKER_ACTION);
    assert_eq!(h.metrics.snapshot().breaker_rejections, 1);
}

// ─── Test 2: ≤50% failures never trip ───────────────────────────────────────

#[test]
fn test_half_failing_chain_never_opens() {
    let mut loader = PluginLoader::new();
    loader.register(Arc::new(Fails));
    loader.register(Arc::new(Append("ok")));
    let h = harness(loader, ManualClock::new());
    let m = rule_match(&["ok", "fails"], breaker(2, 60, 1));

    for _ in 0..20 {
        let result = h.dispatcher.dispatch(&m);
        assert!(!result.success);
        assert_eq!(result.failed_actions, 1);
        assert_eq!(result.successful_actions, 1);
    }
    assert_eq!(h.breakers.snapshot()["r1"], BreakerState::Closed);
    assert_eq!(h.breakers.get("r1").unwrap().failure_count(), 0);
}

// ─── Test 3: recovery with a manual clock ───────────────────────────────────

#[test]
fn test_breaker_recovers_after_timeout() {
    let broken = Arc::new(AtomicBool::new(true));
    let mut loader = PluginLoader::new();
    loader.register(Arc::new(Flaky(broken.clone())));
    let clock = ManualClock::new();
    let h = harness(loader, clock.clone());
    let m = rule_match(&["flaky"], breaker(2, 30, 2));

    h.dispatcher.dispatch(&m);
    h.dispatcher.dispatch(&m);
    assert_eq!(h.breakers.snapshot()["r1"], BreakerState::Open);
    assert!(h.dispatcher.dispatch(&m).rejected_by_breaker());

    broken.store(false, std::sync::atomic::Ordering::SeqCst);
    clock.advance(Duration::from_secs(29));
    assert!(h.dispatcher.dispatch(&m).rejected_by_breaker());
    clock.advance(Duration::from_secs(1));
    assert_eq!(h.breakers.snapshot()["r1"], BreakerState::HalfOpen);

    assert!(h.dispatcher.dispatch(&m).success);
    assert_eq!(h.breakers.snapshot()["r1"], BreakerState::HalfOpen);
    assert!(h.dispatcher.dispatch(&m).success);
    assert_eq!(h.breakers.snapshot()["r1"], BreakerState::Closed);
    // CLOSED → OPEN → HALF_OPEN → CLOSED
    assert_eq!(h.metrics.snapshot().breaker_transitions, 3);
}

// ─── Test 4: shell-free execution ───────────────────────────────────────────

#[cfg(unix)]
#[test]
fn test_commands_never_use_a_shell() {
    let spawner = Arc::new(RecordingSpawner::default());
    let mut policy = SecurityPolicy::default();
    policy.allowed_commands.insert("echo".into());
    let security = SecurityManager::new(policy).with_spawner(spawner.clone());

    let argv: Vec<String> = ["echo", "a; rm -rf ~", "$(id)"].iter().map(|s| s.to_string()).collect();
    let out = security.execute_command_safely(&argv, None, None).unwrap();
    assert!(out.success);
    // Shell metacharacters reach echo verbatim.
    assert_eq!(out.stdout.trim_end(), "a; rm -rf ~ $(id)");

    let err = security
        .execute_command_safely(&["rm".to_string(), "-rf".to_string(), "/".to_string()], None, None)
        .unwrap_err();
    assert!(err.reason.contains("rm"));

    let requests = spawner.requests.lock();
    assert_eq!(requests.len(), 1);
    assert!(requests.iter().all(|r| !r.shell));
    assert_eq!(requests[0].program, "echo");
}

#[cfg(unix)]
#[test]
fn test_run_command_action_receives_placeholders_as_single_args() {
    let spawner = Arc::new(RecordingSpawner::default());
    let mut policy = SecurityPolicy::default();
    policy.allowed_commands.insert("echo".into());
    let security = Arc::new(SecurityManager::new(policy).with_spawner(spawner.clone()));
    let action = RunCommandAction::new(security, Duration::from_secs(5));

    let params = json!({"command": ["echo", "{file_path}"]});
    let out = action
        .execute(
            "body",
            &MatchInfo::default(),
            Path::new("/w/name with spaces;.md"),
            params.as_object().unwrap(),
        )
        .unwrap();
    assert_eq!(out, "body");
    assert_eq!(spawner.requests.lock()[0].args, vec!["/w/name with spaces;.md".to_string()]);
}

// ─── Test 5: missing plugin ─────────────────────────────────────────────────

#[test]
fn test_missing_plugin_opens_breaker_after_threshold() {
    let h = harness(PluginLoader::new(), ManualClock::new());
    let m = rule_match(&["does_not_exist"], breaker(3, 60, 1));

    for i in 1..=3 {
        let result = h.dispatcher.dispatch(&m);
        assert_eq!(result.action_results[0].failure_kind, Some(FailureKind::System));
        let expected = if i < 3 { BreakerState::Closed } else { BreakerState::Open };
        assert_eq!(h.breakers.snapshot()["r1"], expected, "after dispatch {i}");
    }
    assert!(h.dispatcher.dispatch(&m).rejected_by_breaker());
}

// ─── Test 6: content threads through the chain ──────────────────────────────

#[test]
fn test_chain_threads_content_and_skips_failures() {
    let mut loader = PluginLoader::new();
    loader.register(Arc::new(Append("one")));
    loader.register(Arc::new(Fails));
    loader.register(Arc::new(Append("two")));
    let h = harness(loader, ManualClock::new());
    let m = rule_match(&["one", "fails", "two"], breaker(5, 60, 1));

    let result = h.dispatcher.dispatch(&m);
    assert_eq!(result.final_content, "x TODO y+one+two");
    assert_eq!(result.action_results[2].modified_content.as_deref(), Some("x TODO y+one+two"));
    assert_eq!(result.failed_actions, 1);
}

// ─── Test 7: panics are contained ───────────────────────────────────────────

#[test]
fn test_panicking_plugin_is_system_failure() {
    let mut loader = PluginLoader::new();
    loader.register(Arc::new(Panics));
    loader.register(Arc::new(Append("after")));
    let h = harness(loader, ManualClock::new());
    let m = rule_match(&["panics", "after"], breaker(1, 60, 1));

    let result = h.dispatcher.dispatch(&m);
    assert_eq!(result.action_results.len(), 1);
    assert_eq!(result.action_results[0].failure_kind, Some(FailureKind::System));
    assert!(result.action_results[0].error.as_deref().unwrap().contains("plugin bug"));
    assert_eq!(h.breakers.snapshot()["r1"], BreakerState::Open);
}

// ─── Test 8: security violations stop the chain ─────────────────────────────

#[test]
fn test_security_violation_stops_chain() {
    let mut loader = PluginLoader::new();
    loader.register(Arc::new(Append("after")));
    let metrics = Arc::new(Metrics::new());
    let mut policy = SecurityPolicy::default();
    policy.restricted_path_fragments.push("/w/".into());
    let security = Arc::new(SecurityManager::new(policy).with_metrics(metrics.clone()));
    let dispatcher = Dispatcher::new(Arc::new(loader), Arc::new(BreakerRegistry::new()), security, metrics.clone());
    let m = rule_match(&["after", "after"], breaker(5, 60, 1));

    let result = dispatcher.dispatch(&m);
    assert_eq!(result.action_results.len(), 1);
    assert_eq!(result.action_results[0].failure_kind, Some(FailureKind::Security));
    assert_eq!(metrics.snapshot().security_violations, 1);
}

// ─── Test 9: relative escapes are resolved before the check ─────────────────

#[test]
fn test_relative_path_param_cannot_escape_into_restricted_dir() {
    let dir = tempfile::tempdir().unwrap();
    let kb = dir.path().join("kb");
    let secret = dir.path().join("secret");
    std::fs::create_dir_all(&kb).unwrap();
    std::fs::create_dir_all(&secret).unwrap();
    let file = kb.join("a.md");
    std::fs::write(&file, "x TODO y").unwrap();

    let mut policy = SecurityPolicy::default();
    policy
        .restricted_path_fragments
        .push(secret.to_string_lossy().to_string());
    let (dispatcher, metrics) = builtin_dispatcher(policy, &dir.path().join("q"));
    let m = rule_match_at(
        &file,
        vec![
            action("write_file", json!({"path": "../secret/x"})),
            action("log", json!({"message": "after"})),
        ],
        breaker(5, 60, 1),
    );

    let result = dispatcher.dispatch(&m);
    assert!(!result.success);
    assert_eq!(result.action_results.len(), 1);
    assert_eq!(result.action_results[0].failure_kind, Some(FailureKind::Security));
    assert_eq!(metrics.snapshot().security_violations, 1);
    assert!(!secret.join("x").exists());
}

// ─── Test 10: command timeout ───────────────────────────────────────────────

#[cfg(unix)]
#[test]
fn test_command_timeout_fails_action_with_reason() {
    let dir = tempfile::tempdir().unwrap();
    let file = dir.path().join("a.md");
    std::fs::write(&file, "x TODO y").unwrap();

    let mut policy = SecurityPolicy::default();
    policy.allowed_commands.insert("sh".into());
    let (dispatcher, _) = builtin_dispatcher(policy, &dir.path().join("q"));
    let m = rule_match_at(
        &file,
        vec![action(
            "run_command",
            json!({"command": ["sh", "-c", "sleep 30 & sleep 60"], "timeout_seconds": 1}),
        )],
        breaker(5, 60, 1),
    );

    let started = Instant::now();
    let result = dispatcher.dispatch(&m);
    assert!(started.elapsed() < Duration::from_secs(6), "took {:?}", started.elapsed());
    assert!(!result.success);
    let failed = &result.action_results[0];
    assert_eq!(failed.failure_kind, Some(FailureKind::Action));
    assert!(failed.error.as_deref().unwrap().contains("timed out"));
}
