//! Log subscriber setup and the optional OTLP/HTTP exporter.

use std::env;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant, SystemTime};

use anyhow::{anyhow, Context, Result};
use clap::ValueEnum;
use serde_json::{json, Value};
use tracing::{debug, info, warn, Subscriber};
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::EnvFilter;

use scribe_core::metrics::{unix_nanos, Metrics, MetricsSnapshot, SpanRecord};

const EXPORT_INTERVAL: Duration = Duration::from_secs(10);
const EXPORT_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    #[default]
    Json,
    Pretty,
}

/// `RUST_LOG` wins over the configured level.
pub fn log_filter(level: &str) -> Result<EnvFilter> {
    match EnvFilter::try_from_default_env() {
        Ok(filter) => Ok(filter),
        Err(_) => EnvFilter::try_new(level.to_ascii_lowercase())
            .with_context(|| format!("invalid log level {level:?}")),
    }
}

/// JSON-lines subscriber writing to `writer`.
pub fn json_subscriber<W>(filter: EnvFilter, writer: W) -> impl Subscriber + Send + Sync
where
    W: for<'a> MakeWriter<'a> + Send + Sync + 'static,
{
    tracing_subscriber::fmt()
        .json()
        .with_env_filter(filter)
        .with_current_span(false)
        .with_span_list(false)
        .with_writer(writer)
        .finish()
}

pub fn init_logging(level: &str, format: LogFormat) -> Result<()> {
    let filter = log_filter(level)?;
    let installed = match format {
        LogFormat::Json => {
            tracing::subscriber::set_global_default(json_subscriber(filter, std::io::stdout))
        }
        LogFormat::Pretty => tracing::subscriber::set_global_default(
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_thread_names(true)
                .finish(),
        ),
    };
    installed.map_err(|err| anyhow!("failed to install log subscriber: {err}"))
}

/// Process environment that switches optional subsystems on.
#[derive(Debug, Clone, Default)]
pub struct TelemetryEnv {
    pub otlp_endpoint: Option<String>,
    pub service_name: String,
    pub nats_url: Option<String>,
    pub mtls: Option<MtlsPaths>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MtlsPaths {
    pub ca: PathBuf,
    pub cert: PathBuf,
    pub key: PathBuf,
}

impl TelemetryEnv {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let mtls_enabled = non_empty("SCRIBE_MTLS_ENABLED")
            .map(|v| matches!(v.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes"))
            .unwrap_or(false);
        let mtls = if mtls_enabled {
            let path = |key: &str| {
                non_empty(key)
                    .map(PathBuf::from)
                    .ok_or_else(|| anyhow!("SCRIBE_MTLS_ENABLED is set but {key} is missing"))
            };
            Some(MtlsPaths {
                ca: path("SCRIBE_TLS_CA")?,
                cert: path("SCRIBE_TLS_CERT")?,
                key: path("SCRIBE_TLS_KEY")?,
            })
        } else {
            None
        };
        Ok(Self {
            otlp_endpoint: non_empty("OTEL_EXPORTER_OTLP_ENDPOINT"),
            service_name: non_empty("OTEL_SERVICE_NAME").unwrap_or_else(|| "scribe".to_string()),
            nats_url: non_empty("NATS_URL"),
            mtls,
        })
    }
}

/// Periodically pushes counters and finished spans to an OTLP/HTTP collector.
pub struct OtlpExporter {
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl OtlpExporter {
    pub fn start(endpoint: &str, service_name: &str, metrics: Arc<Metrics>) -> Result<Self> {
        Self::start_with_interval(endpoint, service_name, metrics, EXPORT_INTERVAL)
    }

    pub fn start_with_interval(
        endpoint: &str,
        service_name: &str,
        metrics: Arc<Metrics>,
        interval: Duration,
    ) -> Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(EXPORT_TIMEOUT)
            .build()
            .context("failed to build OTLP client")?;
        metrics.spans.enable();

        let base = endpoint.trim_end_matches('/').to_string();
        let service = service_name.to_string();
        let stop = Arc::new(AtomicBool::new(false));
        let start_nanos = unix_nanos(SystemTime::now());
        let thread = {
            let stop = stop.clone();
            thread::Builder::new()
                .name("otlp-exporter".into())
                .spawn(move || {
                    let exporter = Export {
                        client,
                        base,
                        service,
                        metrics,
                        start_nanos,
                    };
                    let mut next = Instant::now() + interval;
                    while !stop.load(Ordering::Acquire) {
                        if Instant::now() >= next {
                            exporter.flush();
                            next = Instant::now() + interval;
                        }
                        thread::sleep(Duration::from_millis(100));
                    }
                    exporter.flush();
                })
                .context("failed to spawn OTLP exporter")?
        };
        info!(endpoint, service_name, "OTLP export enabled");
        Ok(Self {
            stop,
            thread: Some(thread),
        })
    }

    /// Flush once more and join the thread.
    pub fn stop(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(handle) = self.thread.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for OtlpExporter {
    fn drop(&mut self) {
        self.stop();
    }
}

struct Export {
    client: reqwest::blocking::Client,
    base: String,
    service: String,
    metrics: Arc<Metrics>,
    start_nanos: u64,
}

impl Export {
    fn flush(&self) {
        let now = unix_nanos(SystemTime::now());
        let body = metrics_payload(&self.service, &self.metrics.snapshot(), self.start_nanos, now);
        self.post("/v1/metrics", &body);

        let spans = self.metrics.spans.drain();
        if !spans.is_empty() {
            let body = traces_payload(&self.service, &spans);
            self.post("/v1/traces", &body);
        }
    }

    fn post(&self, path: &str, body: &Value) {
        let url = format!("{}{}", self.base, path);
        let result = self
            .client
            .post(&url)
            .json(body)
            .send()
            .and_then(|r| r.error_for_status());
        match result {
            Ok(_) => debug!(%url, "OTLP export succeeded"),
            Err(err) => {
                Metrics::incr(&self.metrics.exporter_failures);
                warn!(%url, error = %err, "OTLP export failed");
            }
        }
    }
}

fn resource(service: &str) -> Value {
    json!({
        "attributes": [
            {"key": "service.name", "value": {"stringValue": service}}
        ]
    })
}

/// OTLP/JSON `ExportMetricsServiceRequest` with every counter as a
/// cumulative monotonic sum.
pub fn metrics_payload(
    service: &str,
    snapshot: &MetricsSnapshot,
    start_nanos: u64,
    now_nanos: u64,
) -> Value {
    let metrics: Vec<Value> = snapshot
        .counters()
        .into_iter()
        .map(|(name, value)| {
            json!({
                "name": name,
                "sum": {
                    "aggregationTemporality": 2,
                    "isMonotonic": true,
                    "dataPoints": [{
                        "asInt": value.to_string(),
                        "startTimeUnixNano": start_nanos.to_string(),
                        "timeUnixNano": now_nanos.to_string()
                    }]
                }
            })
        })
        .collect();
    json!({
        "resourceMetrics": [{
            "resource": resource(service),
            "scopeMetrics": [{"scope": {"name": "scribe"}, "metrics": metrics}]
        }]
    })
}

pub fn traces_payload(service: &str, spans: &[SpanRecord]) -> Value {
    let spans: Vec<Value> = spans
        .iter()
        .map(|span| {
            let attributes: Vec<Value> = span
                .attributes
                .iter()
                .map(|(k, v)| json!({"key": k, "value": {"stringValue": v}}))
                .collect();
            json!({
                "traceId": span.trace_id,
                "spanId": span.span_id,
                "name": span.name,
                "kind": 1,
                "startTimeUnixNano": span.start_unix_nanos.to_string(),
                "endTimeUnixNano": span.end_unix_nanos.to_string(),
                "attributes": attributes,
                "status": {"code": if span.ok { 1 } else { 2 }}
            })
        })
        .collect();
    json!({
        "resourceSpans": [{
            "resource": resource(service),
            "scopeSpans": [{"scope": {"name": "scribe"}, "spans": spans}]
        }]
    })
}
