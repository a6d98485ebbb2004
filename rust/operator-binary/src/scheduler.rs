//! Delayed triggers for reconciliation passes.
//!
//! Each key has at most one pending entry: scheduling a key again replaces the previous entry
//! instead of adding a second timer.

use std::{
    collections::{BTreeMap, HashMap},
    hash::Hash,
    sync::{Mutex, MutexGuard},
    time::Duration,
};

use tokio::{
    sync::Notify,
    time::{sleep_until, Instant},
};
use tokio_util::sync::CancellationToken;

/// Orders entries by fire time, ties broken by insertion order.
type Slot = (Instant, u64);

struct State<K> {
    queue: BTreeMap<Slot, K>,
    /// The queue slot of every pending key.
    pending: HashMap<K, Slot>,
    next_generation: u64,
}

impl<K: Clone + Eq + Hash> State<K> {
    fn insert(&mut self, key: K, fire_at: Instant) {
        let slot = (fire_at, self.next_generation);
        self.next_generation += 1;
        if let Some(previous) = self.pending.insert(key.clone(), slot) {
            self.queue.remove(&previous);
        }
        self.queue.insert(slot, key);
    }

    fn remove(&mut self, key: &K) {
        if let Some(slot) = self.pending.remove(key) {
            self.queue.remove(&slot);
        }
    }
}

/// A time-ordered queue of keys that become due after a delay.
pub struct Scheduler<K> {
    state: Mutex<State<K>>,
    changed: Notify,
}

impl<K: Clone + Eq + Hash> Default for Scheduler<K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Clone + Eq + Hash> Scheduler<K> {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State {
                queue: BTreeMap::new(),
                pending: HashMap::new(),
                next_generation: 0,
            }),
            changed: Notify::new(),
        }
    }

    fn lock(&self) -> MutexGuard<State<K>> {
        // Poisoning is ignored, every critical section leaves the state consistent
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Schedules `key` to fire after `delay`, replacing any pending entry for `key`.
    pub fn add(&self, key: K, delay: Duration) {
        let fire_at = Instant::now() + delay;
        self.lock().insert(key, fire_at);
        self.changed.notify_one();
    }

    /// Removes the pending entry for `key`, if any.
    pub fn cancel(&self, key: &K) {
        self.lock().remove(key);
    }

    /// When `key` is due to fire, if it is scheduled at all.
    pub fn scheduled_at(&self, key: &K) -> Option<Instant> {
        self.lock().pending.get(key).map(|(fire_at, _)| *fire_at)
    }

    pub fn len(&self) -> usize {
        self.lock().pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[cfg(test)]
    fn queued(&self) -> usize {
        self.lock().queue.len()
    }

    /// Removes and returns every key that is due at `now`, in firing order.
    pub fn pop_due(&self, now: Instant) -> Vec<K> {
        let mut state = self.lock();
        let mut due = Vec::new();
        while let Some(entry) = state.queue.first_entry() {
            if entry.key().0 > now {
                break;
            }
            let key = entry.remove();
            state.pending.remove(&key);
            due.push(key);
        }
        due
    }

    fn next_deadline(&self) -> Option<Instant> {
        self.lock()
            .queue
            .first_key_value()
            .map(|((fire_at, _), _)| *fire_at)
    }

    fn clear(&self) {
        let mut state = self.lock();
        state.queue.clear();
        state.pending.clear();
    }

    /// Hands every key to `fire` once it becomes due, until `shutdown` is cancelled.
    ///
    /// All pending entries are dropped on shutdown.
    pub async fn run(&self, mut fire: impl FnMut(K), shutdown: CancellationToken) {
        loop {
            for key in self.pop_due(Instant::now()) {
                fire(key);
            }
            let changed = self.changed.notified();
            let deadline = self.next_deadline();
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = changed => {}
                _ = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {}
            }
        }
        self.clear();
    }
}
