//! Dedup-and-defer queue core.
//!
//! A port of the kubernetes workqueue contract: an item added while it is
//! already queued is coalesced, an item added while it is being processed is
//! deferred until that run completes, and at most one worker holds a given
//! item at any time. Shutdown lets queued and in-flight items drain.

use std::collections::{HashSet, VecDeque};
use std::hash::Hash;
use std::sync::Mutex;

use tokio::sync::Notify;

pub(crate) struct QueueCore<T> {
    state: Mutex<CoreState<T>>,
    notify: Notify,
}

struct CoreState<T> {
    queue: VecDeque<T>,
    dirty: HashSet<T>,
    processing: HashSet<T>,
    shutting_down: bool,
}

impl<T: Clone + Eq + Hash> QueueCore<T> {
    pub(crate) fn new() -> Self {
        Self {
            state: Mutex::new(CoreState {
                queue: VecDeque::new(),
                dirty: HashSet::new(),
                processing: HashSet::new(),
                shutting_down: false,
            }),
            notify: Notify::new(),
        }
    }

    /// Enqueue an item. No-op while shutting down or while the same item is
    /// already pending; an item currently in flight is re-queued once its
    /// worker calls [`QueueCore::done`].
    pub(crate) fn add(&self, item: T) {
        let mut state = self.state.lock().expect("queue mutex poisoned");
        if state.shutting_down {
            return;
        }
        if !state.dirty.insert(item.clone()) {
            return;
        }
        if state.processing.contains(&item) {
            return;
        }
        state.queue.push_back(item);
        drop(state);
        self.notify.notify_one();
    }

    /// Dequeue the next item, marking it in flight. Returns `None` once the
    /// queue is shut down and drained.
    pub(crate) async fn get(&self) -> Option<T> {
        loop {
            {
                let mut state = self.state.lock().expect("queue mutex poisoned");
                if let Some(item) = state.queue.pop_front() {
                    state.dirty.remove(&item);
                    state.processing.insert(item.clone());
                    return Some(item);
                }
                if state.shutting_down {
                    drop(state);
                    // Cascade the wakeup so workers that raced past
                    // notify_waiters also observe the shutdown.
                    self.notify.notify_one();
                    return None;
                }
            }
            self.notify.notified().await;
        }
    }

    /// Mark an in-flight item finished. If the item was re-added while it was
    /// being processed it goes back on the queue now.
    pub(crate) fn done(&self, item: &T) {
        let mut state = self.state.lock().expect("queue mutex poisoned");
        state.processing.remove(item);
        if state.dirty.contains(item) && !state.shutting_down {
            state.queue.push_back(item.clone());
            drop(state);
            self.notify.notify_one();
        }
    }

    /// Stop accepting new items and wake every blocked worker so queued items
    /// drain and the workers exit.
    pub(crate) fn shutdown(&self) {
        let mut state = self.state.lock().expect("queue mutex poisoned");
        state.shutting_down = true;
        drop(state);
        self.notify.notify_waiters();
        self.notify.notify_one();
    }

    pub(crate) fn len(&self) -> usize {
        self.state.lock().expect("queue mutex poisoned").queue.len()
    }
}
