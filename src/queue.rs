//! De-duplicating work queue.
//!
//! A key is queued at most once and handed to at most one worker at a time.
//! Keys added while being processed are re-queued when the worker calls
//! [`WorkQueue::done`]. Delayed adds keep only the earliest pending deadline
//! per key.

use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt::Debug;
use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::metrics;

const BASE_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// Work queue shared by the watch feeder and the workers.
#[derive(Debug)]
pub struct WorkQueue<K> {
    inner: Arc<Mutex<QueueInner<K>>>,
    notify: Arc<Notify>,
    shutdown: CancellationToken,
}

impl<K> Clone for WorkQueue<K> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            notify: self.notify.clone(),
            shutdown: self.shutdown.clone(),
        }
    }
}

#[derive(Debug)]
struct QueueInner<K> {
    queue: VecDeque<K>,
    dirty: HashSet<K>,
    processing: HashSet<K>,
    waiting: HashMap<K, Instant>,
    failures: HashMap<K, u32>,
}

impl<K> WorkQueue<K>
where
    K: Clone + Eq + Hash + Debug + Send + Sync + 'static,
{
    /// Create a queue that stops handing out keys once `shutdown` fires.
    pub fn new(shutdown: CancellationToken) -> Self {
        Self {
            inner: Arc::new(Mutex::new(QueueInner {
                queue: VecDeque::new(),
                dirty: HashSet::new(),
                processing: HashSet::new(),
                waiting: HashMap::new(),
                failures: HashMap::new(),
            })),
            notify: Arc::new(Notify::new()),
            shutdown,
        }
    }

    /// Queue a key for immediate processing.
    pub fn add(&self, key: K) {
        let mut inner = self.inner.lock();
        if !inner.dirty.insert(key.clone()) {
            return;
        }
        if inner.processing.contains(&key) {
            return;
        }
        inner.queue.push_back(key);
        metrics::record_queue_depth(inner.queue.len());
        drop(inner);
        self.notify.notify_one();
    }

    /// Queue a key once `delay` has passed.
    pub fn add_after(&self, key: K, delay: Duration) {
        if delay.is_zero() {
            self.add(key);
            return;
        }
        let deadline = Instant::now() + delay;
        {
            let mut inner = self.inner.lock();
            match inner.waiting.get(&key) {
                Some(pending) if *pending <= deadline => return,
                _ => {
                    inner.waiting.insert(key.clone(), deadline);
                }
            }
        }

        let queue = self.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = queue.shutdown.cancelled() => {}
                _ = sleep_until(deadline) => {
                    let due = {
                        let mut inner = queue.inner.lock();
                        match inner.waiting.get(&key) {
                            Some(pending) if *pending == deadline => {
                                inner.waiting.remove(&key);
                                true
                            }
                            _ => false,
                        }
                    };
                    if due {
                        queue.add(key);
                    }
                }
            }
        });
    }

    /// Queue a key after its per-key backoff (1s, doubling, capped at 30s).
    pub fn add_rate_limited(&self, key: K) -> Duration {
        let delay = {
            let mut inner = self.inner.lock();
            let failures = inner.failures.entry(key.clone()).or_insert(0);
            let delay = BASE_BACKOFF
                .saturating_mul(2u32.saturating_pow(*failures))
                .min(MAX_BACKOFF);
            *failures = failures.saturating_add(1);
            delay
        };
        debug!(?key, delay_ms = delay.as_millis() as u64, "requeue with backoff");
        self.add_after(key, delay);
        delay
    }

    /// Reset the backoff of a key.
    pub fn forget(&self, key: &K) {
        self.inner.lock().failures.remove(key);
    }

    /// Next key to process; `None` after shutdown.
    pub async fn get(&self) -> Option<K> {
        loop {
            let notified = self.notify.notified();
            if self.shutdown.is_cancelled() {
                return None;
            }
            {
                let mut inner = self.inner.lock();
                if let Some(key) = inner.queue.pop_front() {
                    inner.dirty.remove(&key);
                    inner.processing.insert(key.clone());
                    let more = !inner.queue.is_empty();
                    metrics::record_queue_depth(inner.queue.len());
                    drop(inner);
                    if more {
                        self.notify.notify_one();
                    }
                    return Some(key);
                }
            }
            tokio::select! {
                _ = notified => {}
                _ = self.shutdown.cancelled() => return None,
            }
        }
    }

    /// Mark a key as processed; re-queues it if it was added meanwhile.
    pub fn done(&self, key: &K) {
        let mut inner = self.inner.lock();
        inner.processing.remove(key);
        if inner.dirty.contains(key) {
            inner.queue.push_back(key.clone());
            drop(inner);
            self.notify.notify_one();
        }
    }

    /// Number of keys ready for processing.
    pub fn len(&self) -> usize {
        self.inner.lock().queue.len()
    }

    /// Whether no key is ready for processing.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
