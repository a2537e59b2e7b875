//! `GET /health` on a dedicated thread with its own single-threaded runtime.
//!
//! With mTLS configured, connections are accepted through rustls with a
//! WebPKI client verifier and served by hyper directly; otherwise
//! `axum::serve` handles plain HTTP.

use std::collections::BTreeMap;
use std::fs;
use std::io::BufReader;
use std::net::{SocketAddr, TcpListener as StdTcpListener};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use anyhow::{anyhow, Context, Result};
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Json, Router};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto;
use serde::Serialize;
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio_rustls::TlsAcceptor;
use tower::ServiceExt;
use tracing::{debug, info, warn};

use scribe_core::breaker::BreakerState;

use crate::pipeline::Pipeline;
use crate::queue::EventQueue;
use crate::telemetry::MtlsPaths;
use crate::worker::WorkerControl;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineStatus {
    Healthy,
    Paused,
    Stopping,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub status: EngineStatus,
    pub timestamp: f64,
    pub uptime_seconds: f64,
    pub queue_size: usize,
    pub events_received: u64,
    pub events_processed: u64,
    pub events_dropped: u64,
    pub rule_matches: u64,
    pub dispatches_total: u64,
    pub dispatch_success_rate: f64,
    pub security_violations: u64,
    pub files_written: u64,
    pub config_version: String,
    pub breakers: BTreeMap<String, BreakerState>,
}

/// Everything the health endpoint reads.
pub struct HealthState {
    started: Instant,
    queue: Arc<EventQueue>,
    pipeline: Arc<Pipeline>,
    control: Arc<WorkerControl>,
}

impl HealthState {
    pub fn new(
        queue: Arc<EventQueue>,
        pipeline: Arc<Pipeline>,
        control: Arc<WorkerControl>,
    ) -> Self {
        Self {
            started: Instant::now(),
            queue,
            pipeline,
            control,
        }
    }

    pub fn report(&self) -> HealthReport {
        let snapshot = self.pipeline.config().current();
        let counters = self.pipeline.metrics().snapshot();
        let status = if self.control.shutdown.load(Ordering::Acquire) {
            EngineStatus::Stopping
        } else if snapshot.pause_file().exists() {
            EngineStatus::Paused
        } else {
            EngineStatus::Healthy
        };
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs_f64())
            .unwrap_or(0.0);
        HealthReport {
            status,
            timestamp,
            uptime_seconds: self.started.elapsed().as_secs_f64(),
            queue_size: self.queue.len(),
            events_received: counters.events_received,
            events_processed: counters.events_processed,
            events_dropped: counters.events_dropped,
            rule_matches: counters.rule_matches,
            dispatches_total: counters.dispatches_total,
            dispatch_success_rate: counters.dispatch_success_rate(),
            security_violations: counters.security_violations,
            files_written: counters.files_written,
            config_version: snapshot.version().to_string(),
            breakers: self.pipeline.breakers().snapshot(),
        }
    }
}

pub fn router(state: Arc<HealthState>) -> Router {
    Router::new()
        // HEAD would otherwise be answered by the GET handler.
        .route("/health", get(health).head(not_found).fallback(not_found))
        .fallback(not_found)
        .with_state(state)
}

async fn health(State(state): State<Arc<HealthState>>) -> Json<HealthReport> {
    Json(state.report())
}

async fn not_found() -> (StatusCode, Json<Value>) {
    (StatusCode::NOT_FOUND, Json(json!({"error": "not found"})))
}

/// Server config requiring a client certificate signed by `paths.ca`.
pub fn load_server_config(paths: &MtlsPaths) -> Result<Arc<rustls::ServerConfig>> {
    use rustls_pemfile::{certs, pkcs8_private_keys};

    let ca_pem = fs::read(&paths.ca)
        .with_context(|| format!("Failed to read CA cert: {}", paths.ca.display()))?;
    let ca_certs = certs(&mut BufReader::new(&ca_pem[..]))
        .collect::<Result<Vec<_>, _>>()
        .context("Failed to parse CA certificate")?;
    if ca_certs.is_empty() {
        return Err(anyhow!("No certificates found in CA file"));
    }
    let mut root_store = rustls::RootCertStore::empty();
    for cert in ca_certs {
        root_store.add(cert).context("Failed to add CA cert to root store")?;
    }

    let cert_pem = fs::read(&paths.cert)
        .with_context(|| format!("Failed to read server cert: {}", paths.cert.display()))?;
    let server_certs = certs(&mut BufReader::new(&cert_pem[..]))
        .collect::<Result<Vec<_>, _>>()
        .context("Failed to parse server certificate")?;
    if server_certs.is_empty() {
        return Err(anyhow!("No certificates found in server cert file"));
    }

    let key_pem = fs::read(&paths.key)
        .with_context(|| format!("Failed to read server key: {}", paths.key.display()))?;
    let mut keys = pkcs8_private_keys(&mut BufReader::new(&key_pem[..]))
        .collect::<Result<Vec<_>, _>>()
        .context("Failed to parse server private key")?;
    if keys.is_empty() {
        return Err(anyhow!("No private keys found in server key file"));
    }
    let private_key = rustls::pki_types::PrivateKeyDer::Pkcs8(keys.remove(0));

    let verifier = rustls::server::WebPkiClientVerifier::builder(Arc::new(root_store))
        .build()
        .context("Failed to build client verifier")?;
    let config = rustls::ServerConfig::builder()
        .with_client_cert_verifier(verifier)
        .with_single_cert(server_certs, private_key)
        .context("Failed to build server config")?;
    Ok(Arc::new(config))
}

pub struct HealthServer {
    addr: SocketAddr,
    shutdown: Option<oneshot::Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl HealthServer {
    /// Bind synchronously so the caller learns the port (and any bind error)
    /// before the server thread starts. Port 0 picks an ephemeral port.
    /// Bind `addr` now, so the caller learns the real port immediately, and
    /// serve on a background thread until [`stop`](Self::stop).
    pub fn start(
        addr: SocketAddr,
        state: Arc<HealthState>,
        tls: Option<Arc<rustls::ServerConfig>>,
    ) -> Result<Self> {
        let listener = StdTcpListener::bind(addr)
            .with_context(|| format!("failed to bind health server on {addr}"))?;
        listener.set_nonblocking(true)?;
        let local = listener.local_addr()?;
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .context("failed to build health runtime")?;
        let (tx, rx) = oneshot::channel();
        let app = router(state);
        let secure = tls.is_some();

        let thread = thread::Builder::new()
            .name("health-server".into())
            .spawn(move || {
                runtime.block_on(async move {
                    let listener = match TcpListener::from_std(listener) {
                        Ok(l) => l,
                        Err(err) => {
                            warn!(error = %err, "health listener unusable");
                            return;
                        }
                    };
                    match tls {
                        Some(config) => {
                            serve_tls(listener, app, TlsAcceptor::from(config), rx).await
                        }
                        None => {
                            let served = axum::serve(listener, app)
                                .with_graceful_shutdown(async move {
                                    let _ = rx.await;
                                })
                                .await;
                            if let Err(err) = served {
                                warn!(error = %err, "health server failed");
                            }
                        }
                    }
                });
            })
            .context("failed to spawn health server thread")?;

        info!(addr = %local, mtls = secure, "health server listening");
        Ok(Self {
            addr: local,
            shutdown: Some(tx),
            thread: Some(thread),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn stop(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.thread.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for HealthServer {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn serve_tls(
    listener: TcpListener,
    app: Router,
    acceptor: TlsAcceptor,
    mut shutdown: oneshot::Receiver<()>,
) {
    loop {
        let (stream, peer) = tokio::select! {
            _ = &mut shutdown => break,
            accepted = listener.accept() => match accepted {
                Ok(conn) => conn,
                Err(err) => {
                    warn!(error = %err, "health accept failed");
                    continue;
                }
            },
        };
        let acceptor = acceptor.clone();
        let app = app.clone();
        tokio::spawn(async move {
            let tls = match acceptor.accept(stream).await {
                Ok(tls) => tls,
                Err(err) => {
                    debug!(%peer, error = %err, "TLS handshake rejected");
                    return;
                }
            };
            let service =
                hyper::service::service_fn(move |req: hyper::Request<hyper::body::Incoming>| {
                    app.clone().oneshot(req)
                });
            if let Err(err) = auto::Builder::new(TokioExecutor::new())
                .serve_connection(TokioIo::new(tls), service)
                .await
            {
                debug!(%peer, error = %err, "health connection ended with error");
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use scribe_core::config::{parse_config, ConfigStore};
    use scribe_core::metrics::Metrics;
    use serde_json::json;
    use tempfile::tempdir;

    fn state(dir: &std::path::Path) -> (Arc<HealthState>, Arc<WorkerControl>) {
        let config = parse_config(
            &json!({
                "config_version": "h-7",
                "engine_settings": {"log_level": "info", "quarantine_path": "q", "pause_file": ".pause"},
                "rules": [{
                    "id": "todo", "name": "todo", "file_glob": "*.md", "trigger_pattern": "TODO",
                    "actions": [{"type": "log", "params": {"message": "seen"}}]
                }]
            })
            .to_string(),
        )
        .unwrap();
        let store = Arc::new(ConfigStore::from_config(config, dir).unwrap());
        let metrics = Arc::new(Metrics::new());
        let control = Arc::new(WorkerControl::new());
        let pipeline = Arc::new(Pipeline::new(store, metrics.clone(), control.cancel.clone()).unwrap());
        let queue = Arc::new(EventQueue::new(8, metrics));
        (Arc::new(HealthState::new(queue, pipeline, control.clone())), control)
    }

    #[test]
    fn status_follows_pause_and_shutdown() {
        let dir = tempdir().unwrap();
        let (state, control) = state(dir.path());
        let report = state.report();
        assert_eq!(report.status, EngineStatus::Healthy);
        assert_eq!(report.config_version, "h-7");
        assert_eq!(report.dispatch_success_rate, 1.0);

        fs::write(dir.path().join(".pause"), "").unwrap();
        assert_eq!(state.report().status, EngineStatus::Paused);

        control.shutdown.store(true, Ordering::Release);
        assert_eq!(state.report().status, EngineStatus::Stopping);
    }

    #[test]
    fn uptime_never_decreases() {
        let dir = tempdir().unwrap();
        let (state, _) = state(dir.path());
        let a = state.report().uptime_seconds;
        let b = state.report().uptime_seconds;
        assert!(b >= a);
    }

    #[tokio::test]
    async fn only_get_reaches_the_report() {
        use axum::body::Body;
        use axum::http::Request;

        let dir = tempdir().unwrap();
        let (state, _) = state(dir.path());
        let app = router(state);
        for (method, path, expected) in [
            ("GET", "/health", 200),
            ("HEAD", "/health", 404),
            ("POST", "/health", 404),
            ("GET", "/metrics", 404),
        ] {
            let req = Request::builder().method(method).uri(path).body(Body::empty()).unwrap();
            let resp = app.clone().oneshot(req).await.unwrap();
            assert_eq!(resp.status().as_u16(), expected, "{method} {path}");
        }
    }

    #[test]
    fn missing_tls_files_are_an_error() {
        let dir = tempdir().unwrap();
        let paths = MtlsPaths {
            ca: dir.path().join("ca.pem"),
            cert: dir.path().join("cert.pem"),
            key: dir.path().join("key.pem"),
        };
        let err = load_server_config(&paths).unwrap_err();
        assert!(err.to_string().contains("CA cert"));
    }
}
