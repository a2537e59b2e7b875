//! Bounded FIFO between the watcher and the workers.
//!
//! `push` never blocks: when full, the oldest event is dropped so the
//! watcher thread keeps up with the filesystem.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use tracing::warn;

use scribe_core::metrics::Metrics;

use crate::watcher::Event;

struct State {
    events: VecDeque<Event>,
    closed: bool,
}

pub struct EventQueue {
    capacity: usize,
    state: Mutex<State>,
    available: Condvar,
    metrics: Arc<Metrics>,
}

impl EventQueue {
    pub fn new(capacity: usize, metrics: Arc<Metrics>) -> Self {
        Self {
            capacity: capacity.max(1),
            state: Mutex::new(State {
                events: VecDeque::with_capacity(capacity.min(4096)),
                closed: false,
            }),
            available: Condvar::new(),
            metrics,
        }
    }

    /// Enqueue, evicting the oldest event when full. Returns `false` once the
    /// queue is closed.
    pub fn push(&self, event: Event) -> bool {
        let mut state = self.state.lock();
        if state.closed {
            return false;
        }
        if state.events.len() >= self.capacity {
            if let Some(dropped) = state.events.pop_front() {
                Metrics::incr(&self.metrics.events_dropped);
                warn!(
                    event = "queue.overflow",
                    dropped_event_id = %dropped.event_id,
                    dropped_path = %dropped.path.display(),
                    capacity = self.capacity,
                    "event queue full, dropped oldest event"
                );
            }
        }
        state.events.push_back(event);
        Metrics::incr(&self.metrics.events_received);
        drop(state);
        self.available.notify_one();
        true
    }

    /// Wait up to `timeout` for an event. `None` on timeout or when the queue
    /// is closed and empty.
    pub fn pop_timeout(&self, timeout: Duration) -> Option<Event> {
        let mut state = self.state.lock();
        if state.events.is_empty() && !state.closed {
            self.available.wait_for(&mut state, timeout);
        }
        state.events.pop_front()
    }

    pub fn len(&self) -> usize {
        self.state.lock().events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Refuse new events and wake every waiting worker.
    pub fn close(&self) {
        self.state.lock().closed = true;
        self.available.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Discard whatever is left; returns how many events were dropped.
    pub fn drain_remaining(&self) -> usize {
        let mut state = self.state.lock();
        let n = state.events.len();
        state.events.clear();
        Metrics::add(&self.metrics.events_dropped, n as u64);
        n
    }
}
