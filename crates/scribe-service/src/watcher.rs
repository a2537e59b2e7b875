//! Filesystem watching using the `notify` crate.
//!
//! A bridge thread turns raw notify events into [`Event`]s, filters out
//! paths the engine must not react to, debounces per path and pushes the
//! survivors onto the [`EventQueue`].

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, OnceLock};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use notify::event::{ModifyKind, RenameMode};
use notify::{Config, RecommendedWatcher, RecursiveMode, Watcher as _};
use serde::Serialize;
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

use scribe_core::atomic::is_temp_artifact;

use crate::queue::EventQueue;

const FLUSH_INTERVAL: Duration = Duration::from_millis(25);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Created,
    Modified,
    Deleted,
    Moved,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Created => "created",
            EventKind::Modified => "modified",
            EventKind::Deleted => "deleted",
            EventKind::Moved => "moved",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Event {
    pub event_id: String,
    pub kind: EventKind,
    /// Destination for `Moved`.
    pub path: PathBuf,
    pub from: Option<PathBuf>,
    /// Monotonic nanoseconds since process start.
    pub timestamp: u64,
}

impl Event {
    pub fn new(kind: EventKind, path: PathBuf) -> Self {
        Self {
            event_id: Uuid::new_v4().to_string(),
            kind,
            path,
            from: None,
            timestamp: monotonic_ns(),
        }
    }

    pub fn moved(from: PathBuf, to: PathBuf) -> Self {
        Self {
            from: Some(from),
            ..Self::new(EventKind::Moved, to)
        }
    }
}

fn monotonic_ns() -> u64 {
    static START: OnceLock<Instant> = OnceLock::new();
    START.get_or_init(Instant::now).elapsed().as_nanos() as u64
}

/// Decides which paths are worth an event.
#[derive(Debug, Clone, Default)]
pub struct EventFilter {
    pub roots: Vec<PathBuf>,
    pub ignore: Vec<glob::Pattern>,
    pub quarantine_dir: Option<PathBuf>,
    pub pause_file: Option<PathBuf>,
}

impl EventFilter {
    pub fn new(roots: Vec<PathBuf>, ignore_globs: &[String]) -> Self {
        let ignore = ignore_globs
            .iter()
            .filter_map(|g| match glob::Pattern::new(g) {
                Ok(p) => Some(p),
                Err(err) => {
                    warn!(glob = %g, error = %err, "ignoring invalid ignore glob");
                    None
                }
            })
            .collect();
        Self {
            roots,
            ignore,
            quarantine_dir: None,
            pause_file: None,
        }
    }

    pub fn with_quarantine_dir(mut self, dir: PathBuf) -> Self {
        self.quarantine_dir = Some(dir);
        self
    }

    pub fn with_pause_file(mut self, path: PathBuf) -> Self {
        self.pause_file = Some(path);
        self
    }

    pub fn accepts(&self, path: &Path) -> bool {
        if is_temp_artifact(path) {
            return false;
        }
        if let Some(q) = &self.quarantine_dir {
            if path.starts_with(q) {
                return false;
            }
        }
        if self.pause_file.as_deref() == Some(path) {
            return false;
        }
        let name = path.file_name().and_then(|n| n.to_str());
        !self.ignore.iter().any(|pattern| {
            pattern.matches_path(path)
                || self
                    .roots
                    .iter()
                    .filter_map(|r| path.strip_prefix(r).ok())
                    .any(|rel| pattern.matches_path(rel))
                || name.map(|n| pattern.matches(n)).unwrap_or(false)
        })
    }
}

/// Map a notify event onto ours. Metadata-only and access events are dropped.
pub fn classify_event(event: &notify::Event) -> Vec<Event> {
    use notify::EventKind as N;

    match &event.kind {
        N::Create(_) => event
            .paths
            .iter()
            .map(|p| Event::new(EventKind::Created, p.clone()))
            .collect(),
        N::Modify(ModifyKind::Name(mode)) => match (mode, event.paths.as_slice()) {
            (RenameMode::Both, [from, to, ..]) => vec![Event::moved(from.clone(), to.clone())],
            (RenameMode::From, paths) => paths
                .iter()
                .map(|p| Event::new(EventKind::Deleted, p.clone()))
                .collect(),
            (RenameMode::To, paths) => paths
                .iter()
                .map(|p| Event::new(EventKind::Created, p.clone()))
                .collect(),
            (_, paths) => paths
                .iter()
                .map(|p| {
                    let kind = if p.exists() {
                        EventKind::Created
                    } else {
                        EventKind::Deleted
                    };
                    Event::new(kind, p.clone())
                })
                .collect(),
        },
        N::Modify(ModifyKind::Metadata(_)) => Vec::new(),
        N::Modify(_) => event
            .paths
            .iter()
            .map(|p| Event::new(EventKind::Modified, p.clone()))
            .collect(),
        N::Remove(_) => event
            .paths
            .iter()
            .map(|p| Event::new(EventKind::Deleted, p.clone()))
            .collect(),
        _ => Vec::new(),
    }
}

/// Collapse a burst of events on one path into the one worth processing.
fn merge(previous: Event, next: Event) -> Event {
    match (previous.kind, next.kind) {
        (EventKind::Created, EventKind::Modified) => Event {
            timestamp: next.timestamp,
            ..previous
        },
        _ => next,
    }
}

/// Per-path debounce buffer.
struct Debouncer {
    window: Duration,
    pending: HashMap<PathBuf, (Event, Instant)>,
}

impl Debouncer {
    fn new(window: Duration) -> Self {
        Self {
            window,
            pending: HashMap::new(),
        }
    }

    fn insert(&mut self, event: Event) {
        let now = Instant::now();
        let key = event.path.clone();
        let merged = match self.pending.remove(&key) {
            Some((previous, _)) => merge(previous, event),
            None => event,
        };
        self.pending.insert(key, (merged, now));
    }

    fn ready(&mut self) -> Vec<Event> {
        let now = Instant::now();
        let window = self.window;
        let due: Vec<PathBuf> = self
            .pending
            .iter()
            .filter(|(_, (_, ts))| now.duration_since(*ts) >= window)
            .map(|(p, _)| p.clone())
            .collect();
        let mut out: Vec<Event> = due
            .into_iter()
            .filter_map(|p| self.pending.remove(&p).map(|(e, _)| e))
            .collect();
        out.sort_by_key(|e| e.timestamp);
        out
    }
}

pub struct Watcher {
    watcher: Option<RecommendedWatcher>,
    bridge: Option<JoinHandle<()>>,
    stop: Arc<AtomicBool>,
}

impl Watcher {
    pub fn start(
        roots: &[PathBuf],
        filter: EventFilter,
        debounce: Duration,
        queue: Arc<EventQueue>,
    ) -> Result<Self> {
        let (sync_tx, sync_rx) = mpsc::channel::<notify::Result<notify::Event>>();
        let mut watcher = RecommendedWatcher::new(
            move |res| {
                let _ = sync_tx.send(res);
            },
            Config::default().with_poll_interval(Duration::from_secs(2)),
        )?;

        for root in roots {
            if root.exists() {
                let mode = if root.is_dir() {
                    RecursiveMode::Recursive
                } else {
                    RecursiveMode::NonRecursive
                };
                watcher
                    .watch(root, mode)
                    .with_context(|| format!("watch {}", root.display()))?;
                info!(path = %root.display(), "watching");
            } else {
                warn!(path = %root.display(), "watch root does not exist, skipping");
            }
        }

        let stop = Arc::new(AtomicBool::new(false));
        let stop_flag = stop.clone();
        let bridge = std::thread::Builder::new()
            .name("file-watcher-bridge".into())
            .spawn(move || {
                let mut debouncer = Debouncer::new(debounce);
                let tick = FLUSH_INTERVAL.min(debounce.max(Duration::from_millis(1)));
                while !stop_flag.load(Ordering::Acquire) {
                    match sync_rx.recv_timeout(tick) {
                        Ok(Ok(raw)) => {
                            for event in classify_event(&raw) {
                                if filter.accepts(&event.path) {
                                    debouncer.insert(event);
                                } else {
                                    trace!(path = %event.path.display(), "filtered watcher event");
                                }
                            }
                        }
                        Ok(Err(err)) => error!(error = %err, "file watcher error"),
                        Err(RecvTimeoutError::Timeout) => {}
                        Err(RecvTimeoutError::Disconnected) => {
                            debug!("watcher channel closed");
                            return;
                        }
                    }
                    for event in debouncer.ready() {
                        info!(
                            event = "watcher.event",
                            event_id = %event.event_id,
                            kind = event.kind.as_str(),
                            path = %event.path.display(),
                            "file change observed"
                        );
                        if !queue.push(event) {
                            return;
                        }
                    }
                }
            })?;

        Ok(Self {
            watcher: Some(watcher),
            bridge: Some(bridge),
            stop,
        })
    }

    /// Stop watching and join the bridge thread. Idempotent.
    pub fn stop(&mut self) {
        self.stop.store(true, Ordering::Release);
        // Dropping the notify watcher closes the channel feeding the bridge.
        self.watcher.take();
        if let Some(bridge) = self.bridge.take() {
            let _ = bridge.join();
        }
    }
}

impl Drop for Watcher {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Watches one config file and calls `on_change` after a quiet period.
pub struct ConfigWatcher {
    inner: Watcher,
}

impl ConfigWatcher {
    pub fn start<F>(config_path: &Path, debounce: Duration, on_change: F) -> Result<Self>
    where
        F: Fn() + Send + 'static,
    {
        let dir = config_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        let file_name = config_path.file_name().map(|n| n.to_os_string());

        let (sync_tx, sync_rx) = mpsc::channel::<notify::Result<notify::Event>>();
        let mut watcher = RecommendedWatcher::new(
            move |res| {
                let _ = sync_tx.send(res);
            },
            Config::default(),
        )?;
        // The directory, not the file: editors replace files by rename.
        watcher
            .watch(&dir, RecursiveMode::NonRecursive)
            .with_context(|| format!("watch config dir {}", dir.display()))?;

        let stop = Arc::new(AtomicBool::new(false));
        let stop_flag = stop.clone();
        let bridge = std::thread::Builder::new()
            .name("config-watcher".into())
            .spawn(move || {
                let mut dirty_since: Option<Instant> = None;
                while !stop_flag.load(Ordering::Acquire) {
                    match sync_rx.recv_timeout(FLUSH_INTERVAL) {
                        Ok(Ok(raw)) => {
                            let touches_config = raw
                                .paths
                                .iter()
                                .any(|p| p.file_name().map(|n| n.to_os_string()) == file_name);
                            if touches_config && !classify_event(&raw).is_empty() {
                                dirty_since = Some(Instant::now());
                            }
                        }
                        Ok(Err(err)) => error!(error = %err, "config watcher error"),
                        Err(RecvTimeoutError::Timeout) => {}
                        Err(RecvTimeoutError::Disconnected) => return,
                    }
                    if dirty_since.is_some_and(|t| t.elapsed() >= debounce) {
                        dirty_since = None;
                        on_change();
                    }
                }
            })?;

        Ok(Self {
            inner: Watcher {
                watcher: Some(watcher),
                bridge: Some(bridge),
                stop,
            },
        })
    }

    pub fn stop(&mut self) {
        self.inner.stop();
    }
}
