//! Per-rule circuit breakers.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;
use tracing::{info, warn};

use crate::config::BreakerSettings;
use crate::metrics::Metrics;

/// Time source for breakers; tests drive it by hand.
pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl BreakerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            BreakerState::Closed => "CLOSED",
            BreakerState::Open => "OPEN",
            BreakerState::HalfOpen => "HALF_OPEN",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BreakerError {
    #[error("circuit open for rule {rule_id}; retry in {retry_in:?}")]
    Open { rule_id: String, retry_in: Duration },
    #[error("circuit half-open for rule {rule_id}; probe already in flight")]
    ProbeInFlight { rule_id: String },
}

#[derive(Debug)]
struct Inner {
    state: BreakerState,
    failure_count: u32,
    success_count: u32,
    opened_at: Option<Instant>,
    probe_in_flight: bool,
}

/// Call protocol: `try_acquire`, run the work, then exactly one of
/// `record_success`, `record_failure` or `release`.
pub struct CircuitBreaker {
    rule_id: String,
    settings: BreakerSettings,
    clock: Arc<dyn Clock>,
    metrics: Option<Arc<Metrics>>,
    inner: Mutex<Inner>,
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("rule_id", &self.rule_id)
            .field("settings", &self.settings)
            .field("inner", &*self.inner.lock())
            .finish()
    }
}

impl CircuitBreaker {
    pub fn new(rule_id: impl Into<String>, settings: BreakerSettings) -> Self {
        Self::with_clock(rule_id, settings, Arc::new(SystemClock))
    }

    pub fn with_clock(
        rule_id: impl Into<String>,
        settings: BreakerSettings,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            rule_id: rule_id.into(),
            settings,
            clock,
            metrics: None,
            inner: Mutex::new(Inner {
                state: BreakerState::Closed,
                failure_count: 0,
                success_count: 0,
                opened_at: None,
                probe_in_flight: false,
            }),
        }
    }

    fn with_metrics(mut self, metrics: Option<Arc<Metrics>>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn rule_id(&self) -> &str {
        &self.rule_id
    }

    pub fn settings(&self) -> BreakerSettings {
        self.settings
    }

    /// Current state, advancing OPEN to HALF_OPEN if the recovery timeout has
    /// elapsed.
    pub fn state(&self) -> BreakerState {
        let mut inner = self.inner.lock();
        self.maybe_half_open(&mut inner);
        inner.state
    }

    pub fn failure_count(&self) -> u32 {
        self.inner.lock().failure_count
    }

    pub fn try_acquire(&self) -> Result<(), BreakerError> {
        let mut inner = self.inner.lock();
        self.maybe_half_open(&mut inner);
        match inner.state {
            BreakerState::Closed => Ok(()),
            BreakerState::Open => {
                let elapsed = inner
                    .opened_at
                    .map(|t| self.clock.now().saturating_duration_since(t))
                    .unwrap_or_default();
                Err(BreakerError::Open {
                    rule_id: self.rule_id.clone(),
                    retry_in: self.recovery_timeout().saturating_sub(elapsed),
                })
            }
            BreakerState::HalfOpen if inner.probe_in_flight => Err(BreakerError::ProbeInFlight {
                rule_id: self.rule_id.clone(),
            }),
            BreakerState::HalfOpen => {
                inner.probe_in_flight = true;
                Ok(())
            }
        }
    }

    pub fn record_success(&self) {
        let mut inner = self.inner.lock();
        inner.probe_in_flight = false;
        match inner.state {
            BreakerState::Closed => inner.failure_count = 0,
            BreakerState::HalfOpen => {
                inner.success_count += 1;
                if inner.success_count >= self.settings.success_threshold {
                    inner.failure_count = 0;
                    inner.success_count = 0;
                    inner.opened_at = None;
                    self.transition(&mut inner, BreakerState::Closed);
                }
            }
            BreakerState::Open => {}
        }
    }

    pub fn record_failure(&self) {
        let mut inner = self.inner.lock();
        inner.probe_in_flight = false;
        match inner.state {
            BreakerState::Closed => {
                inner.failure_count += 1;
                if inner.failure_count >= self.settings.failure_threshold {
                    self.open(&mut inner);
                }
            }
            BreakerState::HalfOpen => self.open(&mut inner),
            BreakerState::Open => {}
        }
    }

    /// End a call without counting it either way.
    pub fn release(&self) {
        self.inner.lock().probe_in_flight = false;
    }

    fn recovery_timeout(&self) -> Duration {
        Duration::from_secs(self.settings.recovery_timeout_seconds)
    }

    fn maybe_half_open(&self, inner: &mut Inner) {
        if inner.state != BreakerState::Open {
            return;
        }
        let due = inner
            .opened_at
            .map(|t| self.clock.now().saturating_duration_since(t) >= self.recovery_timeout())
            .unwrap_or(true);
        if due {
            inner.success_count = 0;
            inner.probe_in_flight = false;
            self.transition(inner, BreakerState::HalfOpen);
        }
    }

    fn open(&self, inner: &mut Inner) {
        inner.opened_at = Some(self.clock.now());
        inner.success_count = 0;
        self.transition(inner, BreakerState::Open);
    }

    fn transition(&self, inner: &mut Inner, to: BreakerState) {
        let from = inner.state;
        if from == to {
            return;
        }
        inner.state = to;
        if let Some(metrics) = &self.metrics {
            Metrics::incr(&metrics.breaker_transitions);
        }
        if to == BreakerState::Open {
            warn!(
                event = "breaker.state_changed",
                rule_id = %self.rule_id,
                from = from.as_str(),
                to = to.as_str(),
                failure_count = inner.failure_count,
                "circuit breaker opened"
            );
        } else {
            info!(
                event = "breaker.state_changed",
                rule_id = %self.rule_id,
                from = from.as_str(),
                to = to.as_str(),
                "circuit breaker state changed"
            );
        }
    }
}

/// Breakers keyed by rule id, created on first use.
pub struct BreakerRegistry {
    breakers: Mutex<HashMap<String, Arc<CircuitBreaker>>>,
    clock: Arc<dyn Clock>,
    metrics: Option<Arc<Metrics>>,
}

impl Default for BreakerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl BreakerRegistry {
    pub fn new() -> Self {
        Self {
            breakers: Mutex::new(HashMap::new()),
            clock: Arc::new(SystemClock),
            metrics: None,
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// The breaker for `rule_id`. A rule whose thresholds changed since its
    /// breaker was created gets a fresh one.
    pub fn get_or_create(&self, rule_id: &str, settings: &BreakerSettings) -> Arc<CircuitBreaker> {
        let mut breakers = self.breakers.lock();
        if let Some(existing) = breakers.get(rule_id) {
            if existing.settings == *settings {
                return existing.clone();
            }
            info!(rule_id, "breaker thresholds changed, resetting breaker");
        }
        let breaker = Arc::new(
            CircuitBreaker::with_clock(rule_id, *settings, self.clock.clone())
                .with_metrics(self.metrics.clone()),
        );
        breakers.insert(rule_id.to_string(), breaker.clone());
        breaker
    }

    pub fn get(&self, rule_id: &str) -> Option<Arc<CircuitBreaker>> {
        self.breakers.lock().get(rule_id).cloned()
    }

    /// Drop breakers for rules that no longer exist.
    pub fn retain<'a>(&self, rule_ids: impl IntoIterator<Item = &'a str>) {
        let keep: std::collections::HashSet<&str> = rule_ids.into_iter().collect();
        self.breakers.lock().retain(|id, _| keep.contains(id.as_str()));
    }

    pub fn snapshot(&self) -> BTreeMap<String, BreakerState> {
        let breakers: Vec<Arc<CircuitBreaker>> = self.breakers.lock().values().cloned().collect();
        breakers
            .into_iter()
            .map(|b| (b.rule_id.clone(), b.state()))
            .collect()
    }
}

#[cfg(test)]
pub(crate) mod test_clock {
    use super::*;

    /// Manually advanced clock.
    pub struct ManualClock {
        base: Instant,
        offset: Mutex<Duration>,
    }

    impl ManualClock {
        pub fn new() -> Arc<Self> {
            Arc::new(Self {
                base: Instant::now(),
                offset: Mutex::new(Duration::ZERO),
            })
        }

        pub fn advance(&self, by: Duration) {
            *self.offset.lock() += by;
        }
    }

    impl Clock for ManualClock {
        fn now(&self) -> Instant {
            self.base + *self.offset.lock()
        }
    }
}
