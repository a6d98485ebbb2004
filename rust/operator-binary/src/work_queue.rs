//! A deduplicating work queue that never hands out the same key to two workers at once.
//!
//! Keys added while they are being processed are remembered and redelivered once the current
//! pass is [`WorkQueue::done`].

use std::{
    collections::{HashMap, HashSet, VecDeque},
    hash::Hash,
    pin::pin,
    sync::{Mutex, MutexGuard},
    time::Duration,
};

use tokio::sync::Notify;

const BASE_BACKOFF: Duration = Duration::from_millis(500);
const MAX_BACKOFF: Duration = Duration::from_secs(5 * 60);

struct State<K> {
    queue: VecDeque<K>,
    /// Keys that need (another) pass, whether queued or waiting for an in-flight pass.
    dirty: HashSet<K>,
    processing: HashSet<K>,
    failures: HashMap<K, u32>,
    shutting_down: bool,
}

pub struct WorkQueue<K> {
    state: Mutex<State<K>>,
    available: Notify,
}

impl<K: Clone + Eq + Hash> Default for WorkQueue<K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Clone + Eq + Hash> WorkQueue<K> {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State {
                queue: VecDeque::new(),
                dirty: HashSet::new(),
                processing: HashSet::new(),
                failures: HashMap::new(),
                shutting_down: false,
            }),
            available: Notify::new(),
        }
    }

    fn lock(&self) -> MutexGuard<State<K>> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Queues `key`, unless it is already waiting to be processed.
    pub fn add(&self, key: K) {
        let mut state = self.lock();
        if state.shutting_down || !state.dirty.insert(key.clone()) {
            return;
        }
        if state.processing.contains(&key) {
            // redelivered by `done`
            return;
        }
        state.queue.push_back(key);
        drop(state);
        self.available.notify_one();
    }

    /// Waits for the next key to process, or returns `None` once the queue is shut down.
    ///
    /// Every key returned must be passed back to [`Self::done`].
    pub async fn get(&self) -> Option<K> {
        loop {
            let mut notified = pin!(self.available.notified());
            notified.as_mut().enable();
            {
                let mut state = self.lock();
                if state.shutting_down {
                    return None;
                }
                if let Some(key) = state.queue.pop_front() {
                    state.dirty.remove(&key);
                    state.processing.insert(key.clone());
                    let more = !state.queue.is_empty();
                    drop(state);
                    if more {
                        self.available.notify_one();
                    }
                    return Some(key);
                }
            }
            notified.await;
        }
    }

    /// Marks the pass for `key` as finished, requeueing it if it was added in the meantime.
    pub fn done(&self, key: &K) {
        let mut state = self.lock();
        state.processing.remove(key);
        if state.dirty.contains(key) && !state.shutting_down {
            state.queue.push_back(key.clone());
            drop(state);
            self.available.notify_one();
        }
    }

    /// Records a failed pass for `key` and returns how long to wait before retrying it.
    ///
    /// The delay doubles with every consecutive failure.
    pub fn failure_backoff(&self, key: &K) -> Duration {
        let mut state = self.lock();
        let failures = state.failures.entry(key.clone()).or_insert(0);
        let backoff = BASE_BACKOFF
            .checked_mul(2u32.saturating_pow(*failures))
            .map_or(MAX_BACKOFF, |backoff| backoff.min(MAX_BACKOFF));
        *failures = failures.saturating_add(1);
        backoff
    }

    /// Resets the failure count of `key` after a successful pass.
    pub fn forget(&self, key: &K) {
        self.lock().failures.remove(key);
    }

    pub fn len(&self) -> usize {
        self.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stops handing out keys, waking up all waiting workers.
    pub fn shutdown(&self) {
        self.lock().shutting_down = true;
        self.available.notify_waiters();
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, time::Duration};

    use super::WorkQueue;

    #[tokio::test]
    async fn queued_keys_are_deduplicated() {
        let queue = WorkQueue::new();
        queue.add("a");
        queue.add("b");
        queue.add("a");
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.get().await, Some("a"));
        assert_eq!(queue.get().await, Some("b"));
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn keys_added_while_processing_are_redelivered_after_done() {
        let queue = WorkQueue::new();
        queue.add("a");
        let key = queue.get().await.unwrap();

        queue.add("a");
        queue.add("a");
        // not handed out while the first pass is in flight
        assert!(queue.is_empty());

        queue.done(&key);
        assert_eq!(queue.get().await, Some("a"));
        queue.done(&"a");
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn waiting_workers_are_woken() {
        let queue = Arc::new(WorkQueue::new());
        let worker = tokio::spawn({
            let queue = queue.clone();
            async move { queue.get().await }
        });
        tokio::task::yield_now().await;
        queue.add(7);
        assert_eq!(worker.await.unwrap(), Some(7));
    }

    #[tokio::test]
    async fn shutdown_releases_workers() {
        let queue = Arc::new(WorkQueue::<u32>::new());
        let worker = tokio::spawn({
            let queue = queue.clone();
            async move { queue.get().await }
        });
        tokio::task::yield_now().await;
        queue.shutdown();
        assert_eq!(worker.await.unwrap(), None);
        queue.add(1);
        assert!(queue.is_empty());
    }

    #[test]
    fn backoff_grows_exponentially_until_reset() {
        let queue = WorkQueue::new();
        assert_eq!(queue.failure_backoff(&"a"), Duration::from_millis(500));
        assert_eq!(queue.failure_backoff(&"a"), Duration::from_secs(1));
        assert_eq!(queue.failure_backoff(&"a"), Duration::from_secs(2));
        assert_eq!(queue.failure_backoff(&"b"), Duration::from_millis(500));
        for _ in 0..20 {
            queue.failure_backoff(&"a");
        }
        assert_eq!(queue.failure_backoff(&"a"), Duration::from_secs(300));
        queue.forget(&"a");
        assert_eq!(queue.failure_backoff(&"a"), Duration::from_millis(500));
    }
}
