//! Process-wide counters and the span buffer used by the optional OTLP
//! exporter. Counters are plain atomics so hot paths never take a lock.

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use rand::RngCore;
use serde::Serialize;

const DEFAULT_SPAN_CAPACITY: usize = 2048;

#[derive(Debug, Default)]
pub struct Metrics {
    pub events_received: AtomicU64,
    pub events_processed: AtomicU64,
    pub events_dropped: AtomicU64,
    pub events_skipped: AtomicU64,
    pub rule_matches: AtomicU64,
    pub dispatches_total: AtomicU64,
    pub dispatches_succeeded: AtomicU64,
    pub dispatches_failed: AtomicU64,
    pub actions_failed: AtomicU64,
    pub breaker_transitions: AtomicU64,
    pub breaker_rejections: AtomicU64,
    pub security_violations: AtomicU64,
    pub files_written: AtomicU64,
    pub config_reloads: AtomicU64,
    pub config_reload_failures: AtomicU64,
    pub worker_panics: AtomicU64,
    pub exporter_failures: AtomicU64,
    pub spans: SpanBuffer,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct MetricsSnapshot {
    pub events_received: u64,
    pub events_processed: u64,
    pub events_dropped: u64,
    pub events_skipped: u64,
    pub rule_matches: u64,
    pub dispatches_total: u64,
    pub dispatches_succeeded: u64,
    pub dispatches_failed: u64,
    pub actions_failed: u64,
    pub breaker_transitions: u64,
    pub breaker_rejections: u64,
    pub security_violations: u64,
    pub files_written: u64,
    pub config_reloads: u64,
    pub config_reload_failures: u64,
    pub worker_panics: u64,
    pub exporter_failures: u64,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let get = |c: &AtomicU64| c.load(Ordering::Relaxed);
        MetricsSnapshot {
            events_received: get(&self.events_received),
            events_processed: get(&self.events_processed),
            events_dropped: get(&self.events_dropped),
            events_skipped: get(&self.events_skipped),
            rule_matches: get(&self.rule_matches),
            dispatches_total: get(&self.dispatches_total),
            dispatches_succeeded: get(&self.dispatches_succeeded),
            dispatches_failed: get(&self.dispatches_failed),
            actions_failed: get(&self.actions_failed),
            breaker_transitions: get(&self.breaker_transitions),
            breaker_rejections: get(&self.breaker_rejections),
            security_violations: get(&self.security_violations),
            files_written: get(&self.files_written),
            config_reloads: get(&self.config_reloads),
            config_reload_failures: get(&self.config_reload_failures),
            worker_panics: get(&self.worker_panics),
            exporter_failures: get(&self.exporter_failures),
        }
    }
}

impl MetricsSnapshot {
    /// Fraction of dispatches that fully succeeded; 1.0 before the first one.
    pub fn dispatch_success_rate(&self) -> f64 {
        if self.dispatches_total == 0 {
            1.0
        } else {
            self.dispatches_succeeded as f64 / self.dispatches_total as f64
        }
    }

    /// Counter name → value, in the naming used by the OTLP exporter.
    pub fn counters(&self) -> BTreeMap<&'static str, u64> {
        BTreeMap::from([
            ("scribe.events.received", self.events_received),
            ("scribe.events.processed", self.events_processed),
            ("scribe.events.dropped", self.events_dropped),
            ("scribe.rule.matches", self.rule_matches),
            ("scribe.dispatches", self.dispatches_total),
            ("scribe.dispatches.failed", self.dispatches_failed),
            ("scribe.breaker.transitions", self.breaker_transitions),
            ("scribe.security.violations", self.security_violations),
            ("scribe.files.written", self.files_written),
        ])
    }
}

/// A finished span, kept until the exporter drains it.
#[derive(Debug, Clone, Serialize)]
pub struct SpanRecord {
    pub trace_id: String,
    pub span_id: String,
    pub name: String,
    pub start_unix_nanos: u64,
    pub end_unix_nanos: u64,
    pub ok: bool,
    pub attributes: BTreeMap<String, String>,
}

/// Bounded FIFO of finished spans. Recording is a no-op until enabled, so an
/// engine without an exporter never accumulates spans.
#[derive(Debug)]
pub struct SpanBuffer {
    enabled: AtomicBool,
    capacity: usize,
    inner: Mutex<VecDeque<SpanRecord>>,
}

impl Default for SpanBuffer {
    fn default() -> Self {
        Self {
            enabled: AtomicBool::new(false),
            capacity: DEFAULT_SPAN_CAPACITY,
            inner: Mutex::new(VecDeque::new()),
        }
    }
}

impl SpanBuffer {
    pub fn enable(&self) {
        self.enabled.store(true, Ordering::Release);
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    pub fn record(
        &self,
        name: &str,
        started: SystemTime,
        elapsed: Duration,
        ok: bool,
        attributes: BTreeMap<String, String>,
    ) {
        if !self.is_enabled() {
            return;
        }
        let start = unix_nanos(started);
        let record = SpanRecord {
            trace_id: random_hex(16),
            span_id: random_hex(8),
            name: name.to_string(),
            start_unix_nanos: start,
            end_unix_nanos: start.saturating_add(elapsed.as_nanos() as u64),
            ok,
            attributes,
        };
        let mut spans = self.inner.lock();
        if spans.len() >= self.capacity {
            spans.pop_front();
        }
        spans.push_back(record);
    }

    pub fn drain(&self) -> Vec<SpanRecord> {
        self.inner.lock().drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

pub fn unix_nanos(t: SystemTime) -> u64 {
    t.duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0)
}

fn random_hex(bytes: usize) -> String {
    let mut buf = vec![0u8; bytes];
    rand::thread_rng().fill_bytes(&mut buf);
    hex::encode(buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn success_rate_defaults_to_one() {
        let m = Metrics::new();
        assert_eq!(m.snapshot().dispatch_success_rate(), 1.0);
        Metrics::incr(&m.dispatches_total);
        Metrics::incr(&m.dispatches_total);
        Metrics::incr(&m.dispatches_succeeded);
        assert!((m.snapshot().dispatch_success_rate() - 0.5).abs() < f64::EPSILON);
    }

    #[test]
    fn spans_only_recorded_when_enabled_and_bounded() {
        let buf = SpanBuffer {
            capacity: 3,
            ..SpanBuffer::default()
        };
        buf.record("dispatch", SystemTime::now(), Duration::from_millis(1), true, BTreeMap::new());
        assert!(buf.is_empty());

        buf.enable();
        for i in 0..5 {
            let attrs = BTreeMap::from([("i".to_string(), i.to_string())]);
            buf.record("dispatch", SystemTime::now(), Duration::from_millis(1), true, attrs);
        }
        let spans = buf.drain();
        assert_eq!(spans.len(), 3);
        assert_eq!(spans[0].attributes["i"], "2");
        assert_eq!(spans[0].trace_id.len(), 32);
        assert!(spans[0].end_unix_nanos >= spans[0].start_unix_nanos);
        assert!(buf.is_empty());
    }
}
