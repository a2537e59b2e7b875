use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{debug, error, info};

use scribe_core::dispatcher::panic_message;
use scribe_core::metrics::Metrics;

use crate::pipeline::Pipeline;
use crate::queue::EventQueue;

const POP_TIMEOUT: Duration = Duration::from_millis(100);
const PAUSE_POLL: Duration = Duration::from_millis(200);

/// Shared between the engine and its workers.
#[derive(Default)]
pub struct WorkerControl {
    /// No more events will arrive; exit once the queue is empty.
    pub shutdown: AtomicBool,
    /// Drain deadline passed; exit now and abandon what is left.
    pub cancel: Arc<AtomicBool>,
}

impl WorkerControl {
    pub fn new() -> Self {
        Self::default()
    }

    fn should_exit(&self, queue: &EventQueue) -> bool {
        self.shutdown.load(Ordering::Acquire)
            && (queue.is_empty() || self.cancel.load(Ordering::Acquire))
    }
}

pub struct WorkerPool {
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    pub fn spawn(
        count: usize,
        queue: Arc<EventQueue>,
        pipeline: Arc<Pipeline>,
        control: Arc<WorkerControl>,
    ) -> Result<Self> {
        let mut handles = Vec::with_capacity(count);
        for n in 0..count.max(1) {
            let queue = queue.clone();
            let pipeline = pipeline.clone();
            let control = control.clone();
            let handle = thread::Builder::new()
                .name(format!("scribe-worker-{n}"))
                .spawn(move || worker_loop(n, &queue, &pipeline, &control))
                .with_context(|| format!("failed to spawn worker {n}"))?;
            handles.push(handle);
        }
        info!(workers = handles.len(), "worker pool started");
        Ok(Self { handles })
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    pub fn join(self) {
        for handle in self.handles {
            if handle.join().is_err() {
                error!("worker thread terminated abnormally");
            }
        }
    }
}

/// The pause path comes from the live config, so a reload that moves it
/// applies here as it does on `/health`.
fn worker_loop(n: usize, queue: &EventQueue, pipeline: &Pipeline, control: &WorkerControl) {
    let metrics = pipeline.metrics();
    let mut paused = false;
    loop {
        if control.should_exit(queue) {
            break;
        }
        let stopping = control.shutdown.load(Ordering::Acquire);

        // Paused workers keep draining on shutdown so stop() stays bounded.
        let pause_file = pipeline.config().current().pause_file();
        if !stopping && pause_file.exists() {
            if !paused {
                info!(
                    worker = n,
                    pause_file = %pause_file.display(),
                    "pause file present, worker idle"
                );
                paused = true;
            }
            thread::sleep(PAUSE_POLL);
            continue;
        }
        if paused {
            info!(worker = n, "pause file removed, worker resuming");
            paused = false;
        }

        let Some(event) = queue.pop_timeout(POP_TIMEOUT) else {
            continue;
        };
        debug!(
            event = "worker.dequeued",
            worker = n,
            event_id = %event.event_id,
            kind = event.kind.as_str(),
            path = %event.path.display(),
            "event dequeued"
        );
        let processed = panic::catch_unwind(AssertUnwindSafe(|| pipeline.process_event(&event)));
        if let Err(panic) = processed {
            Metrics::incr(&metrics.worker_panics);
            error!(
                worker = n,
                event_id = %event.event_id,
                path = %event.path.display(),
                panic = %panic_message(&panic),
                "event processing panicked"
            );
        }
    }
    debug!(worker = n, "worker exiting");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::watcher::{Event, EventKind};
    use scribe_core::config::{parse_config, ConfigStore};
    use serde_json::json;
    use std::fs;
    use std::time::Instant;
    use tempfile::tempdir;

    fn setup(dir: &std::path::Path) -> (Arc<EventQueue>, Arc<Pipeline>, Arc<WorkerControl>) {
        let config = parse_config(
            &json!({
                "config_version": "w1",
                "engine_settings": {"log_level": "info", "quarantine_path": "q", "pause_file": ".pause"},
                "rules": [{
                    "id": "todo", "name": "todo", "file_glob": "*.md", "trigger_pattern": "TODO",
                    "actions": [{"type": "replace", "params": {"replacement": "DONE"}}]
                }]
            })
            .to_string(),
        )
        .unwrap();
        let store = Arc::new(ConfigStore::from_config(config, dir).unwrap());
        let metrics = Arc::new(Metrics::new());
        let control = Arc::new(WorkerControl::new());
        let pipeline = Arc::new(Pipeline::new(store, metrics.clone(), control.cancel.clone()).unwrap());
        let queue = Arc::new(EventQueue::new(16, metrics));
        (queue, pipeline, control)
    }

    #[test]
    fn drains_queue_before_exiting() {
        let dir = tempdir().unwrap();
        for i in 0..5 {
            fs::write(dir.path().join(format!("{i}.md")), "TODO").unwrap();
        }
        let (queue, pipeline, control) = setup(dir.path());
        for i in 0..5 {
            queue.push(Event::new(EventKind::Modified, dir.path().join(format!("{i}.md"))));
        }
        let pool = WorkerPool::spawn(2, queue.clone(), pipeline.clone(), control.clone()).unwrap();
        control.shutdown.store(true, Ordering::Release);
        pool.join();

        assert!(queue.is_empty());
        assert_eq!(pipeline.metrics().snapshot().events_processed, 5);
        for i in 0..5 {
            assert_eq!(fs::read_to_string(dir.path().join(format!("{i}.md"))).unwrap(), "DONE");
        }
    }

    #[test]
    fn pause_file_holds_work_until_removed() {
        let dir = tempdir().unwrap();
        let file = dir.path().join("a.md");
        fs::write(&file, "TODO").unwrap();
        let pause = dir.path().join(".pause");
        fs::write(&pause, "").unwrap();

        let (queue, pipeline, control) = setup(dir.path());
        let pool = WorkerPool::spawn(1, queue.clone(), pipeline.clone(), control.clone()).unwrap();
        queue.push(Event::new(EventKind::Modified, file.clone()));
        thread::sleep(Duration::from_millis(500));
        assert_eq!(queue.len(), 1);
        assert_eq!(fs::read_to_string(&file).unwrap(), "TODO");

        fs::remove_file(&pause).unwrap();
        let deadline = Instant::now() + Duration::from_secs(5);
        while fs::read_to_string(&file).unwrap() != "DONE" && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(20));
        }
        control.shutdown.store(true, Ordering::Release);
        pool.join();
        assert_eq!(fs::read_to_string(&file).unwrap(), "DONE");
    }

    #[test]
    fn reloaded_pause_file_is_honoured() {
        let dir = tempdir().unwrap();
        let file = dir.path().join("a.md");
        fs::write(&file, "TODO").unwrap();
        let (queue, pipeline, control) = setup(dir.path());

        let moved = parse_config(
            &json!({
                "config_version": "w2",
                "engine_settings": {"log_level": "info", "quarantine_path": "q", "pause_file": ".hold"},
                "rules": [{
                    "id": "todo", "name": "todo", "file_glob": "*.md", "trigger_pattern": "TODO",
                    "actions": [{"type": "replace", "params": {"replacement": "DONE"}}]
                }]
            })
            .to_string(),
        )
        .unwrap();
        pipeline.config().publish(moved);
        let hold = dir.path().join(".hold");
        fs::write(&hold, "").unwrap();

        let pool = WorkerPool::spawn(1, queue.clone(), pipeline.clone(), control.clone()).unwrap();
        queue.push(Event::new(EventKind::Modified, file.clone()));
        thread::sleep(Duration::from_millis(500));
        assert_eq!(queue.len(), 1);

        fs::remove_file(&hold).unwrap();
        let deadline = Instant::now() + Duration::from_secs(5);
        while fs::read_to_string(&file).unwrap() != "DONE" && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(20));
        }
        control.shutdown.store(true, Ordering::Release);
        pool.join();
        assert_eq!(fs::read_to_string(&file).unwrap(), "DONE");
    }
}
