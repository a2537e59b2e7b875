//! Runs a rule's action chain against one match and feeds the outcome to the
//! rule's circuit breaker.
//!
//! Failure classes:
//! - action failure: bad params or `ActionError::Execution`; the chain
//!   continues with the content unchanged.
//! - security failure: the chain stops.
//! - system failure: unknown action type or a panicking plugin; the chain
//!   stops and the breaker always counts it.

use std::collections::BTreeMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Instant, SystemTime};

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::breaker::{BreakerError, BreakerRegistry};
use crate::metrics::Metrics;
use crate::plugins::{ActionError, PluginLoader};
use crate::rules::RuleMatch;
use crate::security::SecurityManager;

/// Pseudo action type reported when the breaker refuses a dispatch.
pub const CIRCUIT_BREAKER_ACTION: &str = "circuit_breaker";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Action,
    Security,
    System,
}

/// Outcome of one action in a chain.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ActionResult {
    pub action_type: String,
    pub success: bool,
    pub modified_content: Option<String>,
    pub error: Option<String>,
    pub duration_ms: f64,
    pub failure_kind: Option<FailureKind>,
}

impl ActionResult {
    fn ok(action_type: &str, content: String, started: Instant) -> Self {
        Self {
            action_type: action_type.to_string(),
            success: true,
            modified_content: Some(content),
            error: None,
            duration_ms: elapsed_ms(started),
            failure_kind: None,
        }
    }

    fn failed(
        action_type: &str,
        kind: FailureKind,
        error: impl Into<String>,
        started: Instant,
    ) -> Self {
        Self {
            action_type: action_type.to_string(),
            success: false,
            modified_content: None,
            error: Some(error.into()),
            duration_ms: elapsed_ms(started),
            failure_kind: Some(kind),
        }
    }
}

/// Outcome of one rule's chain for one event. `success` means no action failed.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DispatchResult {
    pub rule_id: String,
    pub event_id: String,
    pub success: bool,
    pub action_results: Vec<ActionResult>,
    pub failed_actions: usize,
    pub successful_actions: usize,
    /// Content after the last successful action.
    #[serde(skip)]
    pub final_content: String,
}

impl DispatchResult {
    fn new(
        rule_id: &str,
        event_id: &str,
        results: Vec<ActionResult>,
        final_content: String,
    ) -> Self {
        let successful_actions = results.iter().filter(|r| r.success).count();
        let failed_actions = results.len() - successful_actions;
        Self {
            rule_id: rule_id.to_string(),
            event_id: event_id.to_string(),
            success: failed_actions == 0,
            action_results: results,
            failed_actions,
            successful_actions,
            final_content,
        }
    }

    /// True when the breaker refused the dispatch and no action ran.
    pub fn rejected_by_breaker(&self) -> bool {
        self.action_results
            .first()
            .map(|r| r.action_type == CIRCUIT_BREAKER_ACTION)
            .unwrap_or(false)
    }

    fn first_error(&self) -> Option<&str> {
        self.action_results.iter().find_map(|r| r.error.as_deref())
    }
}

/// What the breaker should make of a finished chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionOutcome {
    Ok,
    ActionFailed,
    SecurityViolation,
    SystemFailure,
}

/// Shared by all workers; holds no per-dispatch state.
pub struct Dispatcher {
    plugins: Arc<PluginLoader>,
    breakers: Arc<BreakerRegistry>,
    security: Arc<SecurityManager>,
    metrics: Arc<Metrics>,
    shutdown: Arc<AtomicBool>,
}

impl Dispatcher {
    pub fn new(
        plugins: Arc<PluginLoader>,
        breakers: Arc<BreakerRegistry>,
        security: Arc<SecurityManager>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            plugins,
            breakers,
            security,
            metrics,
            shutdown: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Once `shutdown` is set, running chains stop before their next action.
    pub fn with_shutdown(mut self, shutdown: Arc<AtomicBool>) -> Self {
        self.shutdown = shutdown;
        self
    }

    pub fn plugins(&self) -> &Arc<PluginLoader> {
        &self.plugins
    }

    /// Run the rule's actions in order through the breaker and the security
    /// gate. Never panics; plugin panics become system failures.
    pub fn dispatch(&self, rule_match: &RuleMatch) -> DispatchResult {
        let rule = &rule_match.rule;
        let started_at = SystemTime::now();
        let started = Instant::now();
        Metrics::incr(&self.metrics.dispatches_total);

        let breaker = self.breakers.get_or_create(&rule.id, &rule.breaker);
        if let Err(err) = breaker.try_acquire() {
            Metrics::incr(&self.metrics.breaker_rejections);
            Metrics::incr(&self.metrics.dispatches_failed);
            let retry_in = match &err {
                BreakerError::Open { retry_in, .. } => retry_in.as_secs_f64(),
                BreakerError::ProbeInFlight { .. } => 0.0,
            };
            warn!(
                event = "dispatch.failed",
                rule_id = %rule.id,
                event_id = %rule_match.event_id,
                reason = "circuit_open",
                retry_in_secs = retry_in,
                "dispatch rejected by circuit breaker"
            );
            let result = ActionResult::failed(
                CIRCUIT_BREAKER_ACTION,
                FailureKind::System,
                err.to_string(),
                started,
            );
            return DispatchResult::new(
                &rule.id,
                &rule_match.event_id,
                vec![result],
                rule_match.file_content.clone(),
            );
        }

        info!(
            event = "dispatch.started",
            rule_id = %rule.id,
            event_id = %rule_match.event_id,
            path = %rule_match.file_path.display(),
            actions = rule.actions.len(),
            "dispatch started"
        );

        let (results, final_content, outcome) = self.run_chain(rule_match);
        let result = DispatchResult::new(&rule.id, &rule_match.event_id, results, final_content);

        match breaker_verdict(outcome, rule.actions.len(), &result) {
            Some(true) => breaker.record_success(),
            Some(false) => breaker.record_failure(),
            None => breaker.release(),
        }

        let duration_ms = elapsed_ms(started);
        if result.success {
            Metrics::incr(&self.metrics.dispatches_succeeded);
            info!(
                event = "dispatch.completed",
                rule_id = %rule.id,
                event_id = %rule_match.event_id,
                actions = result.successful_actions,
                duration_ms,
                "dispatch completed"
            );
        } else {
            Metrics::incr(&self.metrics.dispatches_failed);
            warn!(
                event = "dispatch.failed",
                rule_id = %rule.id,
                event_id = %rule_match.event_id,
                reason = outcome_reason(outcome),
                failed = result.failed_actions,
                succeeded = result.successful_actions,
                error = result.first_error().unwrap_or(""),
                duration_ms,
                "dispatch failed"
            );
        }

        let attributes = BTreeMap::from([
            ("rule_id".to_string(), rule.id.clone()),
            ("event_id".to_string(), rule_match.event_id.clone()),
        ]);
        self.metrics
            .spans
            .record("dispatch", started_at, started.elapsed(), result.success, attributes);
        result
    }

    fn run_chain(&self, rule_match: &RuleMatch) -> (Vec<ActionResult>, String, ActionOutcome) {
        let rule = &rule_match.rule;
        let mut content = rule_match.file_content.clone();
        let mut results = Vec::with_capacity(rule.actions.len());
        let mut outcome = ActionOutcome::Ok;

        for spec in &rule.actions {
            if self.shutdown.load(Ordering::Acquire) {
                debug!(rule_id = %rule.id, "shutdown requested, stopping action chain");
                break;
            }
            let action_type = spec.action_type.as_str();
            let started = Instant::now();
            info!(
                event = "action.started",
                rule_id = %rule.id,
                action = action_type,
                "action started"
            );

            let Some(plugin) = self.plugins.get(action_type) else {
                let r = ActionResult::failed(
                    action_type,
                    FailureKind::System,
                    format!("unknown action type {action_type}"),
                    started,
                );
                self.log_failure(&rule.id, &r);
                results.push(r);
                outcome = ActionOutcome::SystemFailure;
                break;
            };

            if !plugin.validate_params(&spec.params) {
                let required = plugin.get_required_params().join(", ");
                let r = ActionResult::failed(
                    action_type,
                    FailureKind::Action,
                    format!("invalid params (required: {required})"),
                    started,
                );
                self.log_failure(&rule.id, &r);
                results.push(r);
                outcome = ActionOutcome::ActionFailed;
                continue;
            }

            if let Err(violation) = self.security.apply_security_restrictions(
                action_type,
                &spec.params,
                &rule_match.file_path,
            ) {
                let r = ActionResult::failed(
                    action_type,
                    FailureKind::Security,
                    violation.to_string(),
                    started,
                );
                self.log_failure(&rule.id, &r);
                results.push(r);
                outcome = ActionOutcome::SecurityViolation;
                break;
            }

            let executed = panic::catch_unwind(AssertUnwindSafe(|| {
                plugin.execute(
                    &content,
                    &rule_match.match_info,
                    &rule_match.file_path,
                    &spec.params,
                )
            }));
            match executed {
                Ok(Ok(next)) => {
                    let r = ActionResult::ok(action_type, next.clone(), started);
                    info!(
                        event = "action.completed",
                        rule_id = %rule.id,
                        action = action_type,
                        changed = next != content,
                        duration_ms = r.duration_ms,
                        "action completed"
                    );
                    content = next;
                    results.push(r);
                }
                Ok(Err(ActionError::Execution(msg))) => {
                    let r = ActionResult::failed(action_type, FailureKind::Action, msg, started);
                    self.log_failure(&rule.id, &r);
                    results.push(r);
                    outcome = ActionOutcome::ActionFailed;
                }
                Ok(Err(ActionError::Security(violation))) => {
                    // Already logged and counted by the security manager.
                    let r = ActionResult::failed(
                        action_type,
                        FailureKind::Security,
                        violation.to_string(),
                        started,
                    );
                    self.log_failure(&rule.id, &r);
                    results.push(r);
                    outcome = ActionOutcome::SecurityViolation;
                    break;
                }
                Err(panic) => {
                    let r = ActionResult::failed(
                        action_type,
                        FailureKind::System,
                        format!("action panicked: {}", panic_message(&panic)),
                        started,
                    );
                    self.log_failure(&rule.id, &r);
                    results.push(r);
                    outcome = ActionOutcome::SystemFailure;
                    break;
                }
            }
        }
        (results, content, outcome)
    }

    fn log_failure(&self, rule_id: &str, result: &ActionResult) {
        Metrics::incr(&self.metrics.actions_failed);
        warn!(
            event = "action.failed",
            rule_id,
            action = %result.action_type,
            kind = ?result.failure_kind,
            error = result.error.as_deref().unwrap_or(""),
            "action failed"
        );
    }
}

/// `Some(true)` counts as a breaker success, `Some(false)` as a failure,
/// `None` leaves the breaker untouched.
pub fn breaker_verdict(
    outcome: ActionOutcome,
    declared_actions: usize,
    result: &DispatchResult,
) -> Option<bool> {
    if outcome == ActionOutcome::SystemFailure {
        return Some(false);
    }
    if result.success && !result.action_results.is_empty() {
        return Some(true);
    }
    if result.failed_actions == 0 {
        return None;
    }
    let recorded = result.action_results.len();
    if declared_actions <= 1 {
        return Some(false);
    }
    if result.failed_actions * 2 > recorded {
        Some(false)
    } else {
        None
    }
}

fn outcome_reason(outcome: ActionOutcome) -> &'static str {
    match outcome {
        ActionOutcome::Ok => "ok",
        ActionOutcome::ActionFailed => "action_failed",
        ActionOutcome::SecurityViolation => "security_violation",
        ActionOutcome::SystemFailure => "system_failure",
    }
}

pub fn panic_message(panic: &Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

fn elapsed_ms(started: Instant) -> f64 {
    started.elapsed().as_secs_f64() * 1000.0
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result(outcomes: &[bool]) -> DispatchResult {
        let started = Instant::now();
        let results = outcomes
            .iter()
            .map(|ok| {
                if *ok {
                    ActionResult::ok("a", String::new(), started)
                } else {
                    ActionResult::failed("a", FailureKind::Action, "x", started)
                }
            })
            .collect();
        DispatchResult::new("r", "e", results, String::new())
    }

    #[test]
    fn verdicts() {
        assert_eq!(breaker_verdict(ActionOutcome::Ok, 2, &result(&[true, true])), Some(true));
        assert_eq!(breaker_verdict(ActionOutcome::ActionFailed, 1, &result(&[false])), Some(false));
        assert_eq!(breaker_verdict(ActionOutcome::ActionFailed, 2, &result(&[true, false])), None);
        assert_eq!(breaker_verdict(ActionOutcome::ActionFailed, 3, &result(&[false, false, true])), Some(false));
        assert_eq!(breaker_verdict(ActionOutcome::SystemFailure, 3, &result(&[true, false])), Some(false));
        // A security stop with no failure majority leaves the breaker alone.
        assert_eq!(breaker_verdict(ActionOutcome::SecurityViolation, 4, &result(&[true, false])), None);
        // Shutdown before any action ran.
        assert_eq!(breaker_verdict(ActionOutcome::Ok, 2, &result(&[])), None);
    }

    #[test]
    fn dispatch_result_counts() {
        let r = result(&[true, false, true]);
        assert!(!r.success);
        assert_eq!(r.failed_actions, 1);
        assert_eq!(r.successful_actions, 2);
        assert!(!r.rejected_by_breaker());
    }

    #[test]
    fn panic_messages() {
        let p = std::panic::catch_unwind(|| panic!("kaboom {}", 7)).unwrap_err();
        assert_eq!(panic_message(&p), "kaboom 7");
    }
}
