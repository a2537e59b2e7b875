use std::net::{Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use parking_lot::Mutex;
use tracing::{error, info, warn};
use walkdir::WalkDir;

use scribe_core::atomic::cleanup_orphans;
use scribe_core::config::{ConfigSnapshot, ConfigStore};
use scribe_core::metrics::Metrics;

use crate::bus::Bus;
use crate::health::{load_server_config, HealthServer, HealthState};
use crate::pipeline::Pipeline;
use crate::queue::EventQueue;
use crate::telemetry::{OtlpExporter, TelemetryEnv};
use crate::watcher::{ConfigWatcher, EventFilter, Watcher};
use crate::worker::{WorkerControl, WorkerPool};

const DRAIN_POLL: Duration = Duration::from_millis(50);

/// Threads and servers that exist only between `start` and `stop`. Fields are
/// filled in start order so a failed start can tear down what did come up.
#[derive(Default)]
struct Running {
    watcher: Option<Watcher>,
    config_watcher: Option<ConfigWatcher>,
    workers: Option<WorkerPool>,
    health: Option<HealthServer>,
    exporter: Option<OtlpExporter>,
    bus: Option<Bus>,
}

impl Running {
    /// Stop producing events.
    fn stop_sources(&mut self) {
        if let Some(watcher) = self.watcher.as_mut() {
            watcher.stop();
        }
        if let Some(cw) = self.config_watcher.as_mut() {
            cw.stop();
        }
    }

    /// Join the workers, then stop the outward-facing services.
    fn stop_services(&mut self) {
        if let Some(workers) = self.workers.take() {
            workers.join();
        }
        if let Some(bus) = self.bus.as_mut() {
            bus.stop();
        }
        if let Some(exporter) = self.exporter.as_mut() {
            exporter.stop();
        }
        if let Some(health) = self.health.as_mut() {
            health.stop();
        }
    }
}

/// Owns the queue, the pipeline and, while running, every thread and server.
/// One start/stop cycle per instance.
pub struct Engine {
    store: Arc<ConfigStore>,
    env: TelemetryEnv,
    metrics: Arc<Metrics>,
    queue: Arc<EventQueue>,
    control: Arc<WorkerControl>,
    pipeline: Arc<Pipeline>,
    health_bind: Option<SocketAddr>,
    running: Mutex<Option<Running>>,
    bound: Mutex<Option<SocketAddr>>,
}

impl Engine {
    /// Build an engine around an already loaded config. Nothing runs until
    /// [`start`](Self::start).
    pub fn new(store: Arc<ConfigStore>, env: TelemetryEnv) -> Result<Self> {
        let snapshot = store.current();
        let metrics = Arc::new(Metrics::new());
        let queue = Arc::new(EventQueue::new(snapshot.settings().queue_capacity, metrics.clone()));
        let control = Arc::new(WorkerControl::new());
        let pipeline = Arc::new(
            Pipeline::new(store.clone(), metrics.clone(), control.cancel.clone())
                .context("failed to build processing pipeline")?,
        );
        Ok(Self {
            store,
            env,
            metrics,
            queue,
            control,
            pipeline,
            health_bind: None,
            running: Mutex::new(None),
            bound: Mutex::new(None),
        })
    }

    /// Load the config file and read telemetry switches from the environment.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let store = ConfigStore::load(path)
            .with_context(|| format!("failed to load config {}", path.display()))?;
        Self::new(Arc::new(store), TelemetryEnv::from_env()?)
    }

    /// Override where the health server binds. Port 0 picks a free port.
    pub fn with_health_addr(mut self, addr: SocketAddr) -> Self {
        self.health_bind = Some(addr);
        self
    }

    /// The live config store; hot reloads publish into it.
    pub fn config(&self) -> &Arc<ConfigStore> {
        &self.store
    }

    pub fn pipeline(&self) -> &Arc<Pipeline> {
        &self.pipeline
    }

    /// Pending events, fed by the watcher and drained by the workers.
    pub fn queue(&self) -> &Arc<EventQueue> {
        &self.queue
    }

    /// Counters shared with `/health` and the OTLP exporter.
    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    /// Address the health server actually bound, once started.
    pub fn health_addr(&self) -> Option<SocketAddr> {
        *self.bound.lock()
    }

    pub fn is_running(&self) -> bool {
        self.running.lock().is_some()
    }

    /// Bring up workers, watchers, the health server and optional exporters.
    /// Fails if already running or already stopped; a partial start is torn
    /// down before the error is returned.
    pub fn start(&self) -> Result<()> {
        let mut running = self.running.lock();
        if running.is_some() {
            bail!("engine already running");
        }
        if self.control.shutdown.load(Ordering::Acquire) {
            bail!("engine was stopped and cannot be restarted");
        }
        let mut parts = Running::default();
        if let Err(err) = self.start_components(&mut parts) {
            self.control.shutdown.store(true, Ordering::Release);
            self.control.cancel.store(true, Ordering::Release);
            self.queue.close();
            parts.stop_sources();
            parts.stop_services();
            error!(error = %err, "engine failed to start");
            return Err(err);
        }
        *self.bound.lock() = parts.health.as_ref().map(HealthServer::local_addr);
        *running = Some(parts);

        let snapshot = self.store.current();
        info!(
            event = "engine.started",
            config_version = %snapshot.version(),
            rules = snapshot.config.rules.len(),
            workers = snapshot.settings().worker_count,
            health = ?self.health_addr(),
            "engine started"
        );
        Ok(())
    }

    fn start_components(&self, parts: &mut Running) -> Result<()> {
        let snapshot = self.store.current();
        let settings = snapshot.settings();
        let roots = snapshot.watch_roots();
        let quarantine = snapshot.quarantine_dir();

        let removed = clean_orphans(&roots, &quarantine);
        if removed > 0 {
            info!(removed, "removed orphaned temp files");
        }

        if let Some(endpoint) = &self.env.otlp_endpoint {
            parts.exporter = Some(OtlpExporter::start(
                endpoint,
                &self.env.service_name,
                self.metrics.clone(),
            )?);
        }
        if let Some(url) = &self.env.nats_url {
            let (bus, publisher) = Bus::start(url)?;
            self.pipeline.attach_bus(publisher);
            parts.bus = Some(bus);
        }

        parts.workers = Some(WorkerPool::spawn(
            settings.worker_count,
            self.queue.clone(),
            self.pipeline.clone(),
            self.control.clone(),
        )?);

        let filter = EventFilter::new(roots.clone(), &settings.ignore_globs)
            .with_quarantine_dir(quarantine)
            .with_pause_file(snapshot.pause_file());
        parts.watcher = Some(
            Watcher::start(
                &roots,
                filter,
                Duration::from_millis(settings.debounce_ms),
                self.queue.clone(),
            )
            .context("failed to start file watcher")?,
        );

        let tls = self
            .env
            .mtls
            .as_ref()
            .map(load_server_config)
            .transpose()
            .context("failed to load mTLS material")?;
        let addr = self
            .health_bind
            .unwrap_or_else(|| SocketAddr::from((Ipv4Addr::UNSPECIFIED, settings.health_port)));
        let state = Arc::new(HealthState::new(
            self.queue.clone(),
            self.pipeline.clone(),
            self.control.clone(),
        ));
        parts.health = Some(HealthServer::start(addr, state, tls)?);

        if let (true, Some(path)) = (settings.hot_reload, self.store.path()) {
            let debounce = Duration::from_millis(settings.debounce_ms);
            parts.config_watcher = Some(self.watch_config(path, debounce)?);
        }
        Ok(())
    }

    fn watch_config(&self, path: &Path, debounce: Duration) -> Result<ConfigWatcher> {
        let store = self.store.clone();
        let pipeline = self.pipeline.clone();
        let metrics = self.metrics.clone();
        ConfigWatcher::start(path, debounce, move || {
            let applied = store
                .reload()
                .map_err(anyhow::Error::from)
                .and_then(|snapshot| apply(&pipeline, &snapshot));
            match applied {
                Ok(()) => Metrics::incr(&metrics.config_reloads),
                Err(err) => {
                    Metrics::incr(&metrics.config_reload_failures);
                    warn!(error = %err, "configuration change not applied");
                }
            }
        })
        .context("failed to watch config file")
    }

    /// Stop accepting events, drain the queue within `drain_timeout_seconds`
    /// and tear everything down. Safe to call more than once.
    pub fn stop(&self) {
        let Some(mut running) = self.running.lock().take() else {
            return;
        };
        let drain_timeout =
            Duration::from_secs(self.store.current().settings().drain_timeout_seconds);
        info!(queued = self.queue.len(), "engine stopping");

        self.control.shutdown.store(true, Ordering::Release);
        running.stop_sources();
        self.queue.close();

        let deadline = Instant::now() + drain_timeout;
        while !self.queue.is_empty() && Instant::now() < deadline {
            thread::sleep(DRAIN_POLL);
        }
        if !self.queue.is_empty() {
            self.control.cancel.store(true, Ordering::Release);
            let dropped = self.queue.drain_remaining();
            warn!(dropped, "drain timeout reached, remaining events dropped");
        }
        running.stop_services();

        let counters = self.metrics.snapshot();
        info!(
            event = "engine.stopped",
            events_processed = counters.events_processed,
            events_dropped = counters.events_dropped,
            dispatches_total = counters.dispatches_total,
            "engine stopped"
        );
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.stop();
    }
}

fn apply(pipeline: &Pipeline, snapshot: &ConfigSnapshot) -> Result<()> {
    pipeline.apply_snapshot(snapshot).map_err(|err| {
        error!(
            event = "config.reload_failed",
            error = %err,
            "reloaded configuration could not be applied"
        );
        err
    })
}

/// Remove leftover atomic-write temp files under every watch root.
fn clean_orphans(roots: &[PathBuf], quarantine: &Path) -> usize {
    roots
        .iter()
        .filter(|root| root.is_dir())
        .flat_map(|root| {
            WalkDir::new(root)
                .into_iter()
                .filter_entry(|e| e.path() != quarantine)
                .filter_map(|e| e.ok())
                .filter(|e| e.file_type().is_dir())
        })
        .map(|dir| cleanup_orphans(dir.path()))
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use scribe_core::atomic::temp_path_for;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn orphan_cleanup_walks_subdirectories_but_not_quarantine() {
        let dir = tempdir().unwrap();
        let nested = dir.path().join("a/b");
        let quarantine = dir.path().join("quarantine");
        fs::create_dir_all(&nested).unwrap();
        fs::create_dir_all(&quarantine).unwrap();

        fs::write(temp_path_for(&dir.path().join("top.md")), "x").unwrap();
        fs::write(temp_path_for(&nested.join("deep.md")), "x").unwrap();
        let kept = temp_path_for(&quarantine.join("q.md"));
        fs::write(&kept, "x").unwrap();
        fs::write(nested.join("real.md"), "keep").unwrap();

        assert_eq!(clean_orphans(&[dir.path().to_path_buf()], &quarantine), 2);
        assert!(kept.exists());
        assert!(nested.join("real.md").exists());
    }
}
