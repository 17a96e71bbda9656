//! Write-behind flusher
//!
//! Tasks are marked into a pending queue deduplicated by key and executed by
//! a single background worker. The worker wakes when the oldest pending task
//! has waited `delay`, when the pending queue reaches `max_pending`, once per
//! `period` (which also runs the retry lane), on an explicit flush request
//! and on shutdown.
//!
//! Tasks failing with a retryable error move to the retry queue; any other
//! failure drops the task with an error log. Closing the flusher drains both
//! queues; after that `mark` runs tasks synchronously.

use crate::queue::KeyedQueue;
use parking_lot::{Condvar, Mutex};
use persistio_common::{Error, FlusherConfig, Result};
use std::collections::HashSet;
use std::fmt::Debug;
use std::hash::Hash;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Unit of deferred work
pub trait FlushTask: Send + 'static {
    type Key: Clone + Eq + Hash + Debug + Send + 'static;

    /// Deduplication key; a newer task replaces a queued one with the same key
    fn key(&self) -> Self::Key;

    /// Perform the work
    fn flush(&self) -> Result<()>;
}

/// Flusher tuning
#[derive(Debug, Clone)]
pub struct FlusherOptions {
    pub delay: Duration,
    pub max_pending: usize,
    pub period: Duration,
    /// Failed attempts before a task is dropped (0 = retry forever)
    pub retry_limit: u32,
    pub drain_attempts: u32,
    pub oom_backoff: Duration,
    /// Ignore marks for keys whose task is currently executing
    pub dedup_in_flight: bool,
}

impl From<&FlusherConfig> for FlusherOptions {
    fn from(config: &FlusherConfig) -> Self {
        Self {
            delay: config.delay(),
            max_pending: config.max_pending.max(1),
            period: config.period(),
            retry_limit: config.retry_limit,
            drain_attempts: config.drain_attempts,
            oom_backoff: config.oom_backoff(),
            dedup_in_flight: false,
        }
    }
}

impl Default for FlusherOptions {
    fn default() -> Self {
        Self::from(&FlusherConfig::default())
    }
}

/// Flusher statistics for monitoring
#[derive(Debug, Default)]
pub struct FlusherStats {
    /// Tasks accepted by `mark`
    pub marked: AtomicU64,
    /// Marks folded into an already queued task
    pub coalesced: AtomicU64,
    /// Successful executions
    pub executed: AtomicU64,
    /// Failed executions
    pub failed: AtomicU64,
    /// Executions from the retry queue
    pub retried: AtomicU64,
    /// Tasks given up on
    pub dropped: AtomicU64,
}

struct Retry<T> {
    task: T,
    attempts: u32,
}

struct State<T: FlushTask> {
    pending: KeyedQueue<T::Key, T>,
    retry: KeyedQueue<T::Key, Retry<T>>,
    in_flight: HashSet<T::Key>,
    /// Flush requests issued, started and completed
    requested: u64,
    started: u64,
    completed: u64,
    shutdown: bool,
    closed: bool,
}

struct Shared<T: FlushTask> {
    name: String,
    options: FlusherOptions,
    state: Mutex<State<T>>,
    /// Wakes the worker
    wake: Condvar,
    /// Signals completed flush cycles
    done: Condvar,
    stats: FlusherStats,
}

/// Single-worker write-behind queue
pub struct Flusher<T: FlushTask> {
    shared: Arc<Shared<T>>,
    worker: Mutex<Option<thread::JoinHandle<()>>>,
}

impl<T: FlushTask> Flusher<T> {
    /// Create a flusher and start its worker thread
    pub fn new(name: impl Into<String>, options: FlusherOptions) -> Result<Self> {
        let name = name.into();
        let shared = Arc::new(Shared {
            name: name.clone(),
            options,
            state: Mutex::new(State {
                pending: KeyedQueue::new(),
                retry: KeyedQueue::new(),
                in_flight: HashSet::new(),
                requested: 0,
                started: 0,
                completed: 0,
                shutdown: false,
                closed: false,
            }),
            wake: Condvar::new(),
            done: Condvar::new(),
            stats: FlusherStats::default(),
        });

        let worker = Arc::clone(&shared);
        let handle = thread::Builder::new()
            .name(format!("{name}-flusher"))
            .spawn(move || worker.run())
            .map_err(|e| Error::internal(format!("failed to spawn {name} flusher: {e}")))?;

        Ok(Self {
            shared,
            worker: Mutex::new(Some(handle)),
        })
    }

    /// Queue a task, replacing any queued task with the same key
    ///
    /// Once the flusher is closed the task runs synchronously on the
    /// caller's thread and its result is returned.
    pub fn mark(&self, task: T) -> Result<()> {
        let key = task.key();
        let mut state = self.shared.state.lock();
        if state.closed {
            drop(state);
            warn!(
                "{} flusher is closed; flushing {:?} synchronously",
                self.shared.name, key
            );
            return task.flush();
        }

        if self.shared.options.dedup_in_flight && state.in_flight.contains(&key) {
            self.shared.stats.coalesced.fetch_add(1, Ordering::Relaxed);
            return Ok(());
        }

        self.shared.stats.marked.fetch_add(1, Ordering::Relaxed);
        // The new payload supersedes a failed one
        state.retry.remove(&key);
        if !state.pending.push(key, task) {
            self.shared.stats.coalesced.fetch_add(1, Ordering::Relaxed);
        }
        drop(state);
        self.shared.wake.notify_one();
        Ok(())
    }

    /// Drop any queued or retrying task for `key`
    pub fn cancel(&self, key: &T::Key) -> bool {
        let mut state = self.shared.state.lock();
        let pending = state.pending.remove(key).is_some();
        let retry = state.retry.remove(key).is_some();
        pending || retry
    }

    /// Whether a task for `key` is queued or executing
    pub fn is_scheduled(&self, key: &T::Key) -> bool {
        let state = self.shared.state.lock();
        state.pending.contains(key) || state.in_flight.contains(key)
    }

    /// Run everything queued, including the retry lane, and wait for it
    pub fn flush_now(&self) {
        let mut state = self.shared.state.lock();
        if state.closed {
            return;
        }
        state.requested += 1;
        let wanted = state.requested;
        self.shared.wake.notify_one();
        while state.completed < wanted && !state.closed {
            self.shared.done.wait(&mut state);
        }
    }

    pub fn pending_len(&self) -> usize {
        self.shared.state.lock().pending.len()
    }

    pub fn retry_len(&self) -> usize {
        self.shared.state.lock().retry.len()
    }

    pub fn is_closed(&self) -> bool {
        self.shared.state.lock().closed
    }

    /// Get flusher statistics
    pub fn stats(&self) -> &FlusherStats {
        &self.shared.stats
    }

    /// Drain both queues and stop the worker
    pub fn close(&self) {
        {
            let mut state = self.shared.state.lock();
            if state.shutdown {
                return;
            }
            state.shutdown = true;
        }
        self.shared.wake.notify_one();

        if let Some(handle) = self.worker.lock().take() {
            // Dropped from one of its own tasks; the worker drains and exits by itself
            if handle.thread().id() == thread::current().id() {
                return;
            }
            if handle.join().is_err() {
                error!("{} flusher worker panicked", self.shared.name);
            }
        }
    }
}

impl<T: FlushTask> Drop for Flusher<T> {
    fn drop(&mut self) {
        self.close();
    }
}

impl<T: FlushTask> Shared<T> {
    fn run(&self) {
        info!("{} flusher started", self.name);
        let mut next_period = Instant::now() + self.options.period;

        loop {
            let (batch, retries) = {
                let mut state = self.state.lock();
                while !self.should_wake(&state, next_period) {
                    let deadline = state
                        .pending
                        .oldest()
                        .map_or(next_period, |since| (since + self.options.delay).min(next_period));
                    self.wake.wait_until(&mut state, deadline);
                }
                if state.shutdown {
                    break;
                }

                let now = Instant::now();
                let requested = state.requested > state.started;
                let periodic = now >= next_period;
                if periodic {
                    next_period = now + self.options.period;
                }
                state.started = state.requested;

                let batch = state.pending.take_all();
                if self.options.dedup_in_flight {
                    state.in_flight.extend(batch.iter().map(|(key, _)| key.clone()));
                }
                let retries = if periodic || requested {
                    state.retry.take_all()
                } else {
                    Vec::new()
                };
                (batch, retries)
            };

            if !batch.is_empty() || !retries.is_empty() {
                debug!(
                    "{} flusher running {} pending, {} retry tasks",
                    self.name,
                    batch.len(),
                    retries.len()
                );
            }
            for (key, task) in batch {
                self.execute(key, task, 0);
            }
            for (key, retry) in retries {
                self.stats.retried.fetch_add(1, Ordering::Relaxed);
                self.execute(key, retry.task, retry.attempts);
            }

            let mut state = self.state.lock();
            state.completed = state.started;
            drop(state);
            self.done.notify_all();
        }

        self.drain();
        info!("{} flusher stopped", self.name);
    }

    fn should_wake(&self, state: &State<T>, next_period: Instant) -> bool {
        let now = Instant::now();
        state.shutdown
            || state.requested > state.started
            || state.pending.len() >= self.options.max_pending
            || state
                .pending
                .oldest()
                .is_some_and(|since| now >= since + self.options.delay)
            || now >= next_period
    }

    fn execute(&self, key: T::Key, task: T, attempts: u32) {
        let result = task.flush();
        let mut state = self.state.lock();
        state.in_flight.remove(&key);

        let err = match result {
            Ok(()) => {
                self.stats.executed.fetch_add(1, Ordering::Relaxed);
                return;
            }
            Err(e) => e,
        };

        self.stats.failed.fetch_add(1, Ordering::Relaxed);
        let attempts = attempts + 1;
        let limit = self.options.retry_limit;

        // Only transient errors are retried
        if !err.is_retryable() || (limit > 0 && attempts >= limit) {
            error!(
                "{} flusher dropping {:?} after {} attempts: {}",
                self.name, key, attempts, err
            );
            self.stats.dropped.fetch_add(1, Ordering::Relaxed);
        } else if state.pending.contains(&key) {
            debug!("{} flusher: {:?} failed but a newer task is queued", self.name, key);
        } else {
            warn!(
                "{} flusher: {:?} failed (attempt {}), will retry: {}",
                self.name, key, attempts, err
            );
            state.retry.push(key, Retry { task, attempts });
        }
        drop(state);

        if matches!(err, Error::ResourceExhausted(_)) {
            warn!(
                "{} flusher backing off for {:?} after resource exhaustion",
                self.name, self.options.oom_backoff
            );
            thread::sleep(self.options.oom_backoff);
        }
    }

    /// Run everything left, giving retry tasks a bounded number of attempts
    fn drain(&self) {
        loop {
            let batch = {
                let mut state = self.state.lock();
                if state.pending.is_empty() {
                    break;
                }
                state.pending.take_all()
            };
            for (key, task) in batch {
                self.execute(key, task, 0);
            }
        }

        for _ in 0..self.options.drain_attempts {
            let retries = self.state.lock().retry.take_all();
            if retries.is_empty() {
                break;
            }
            for (key, retry) in retries {
                self.stats.retried.fetch_add(1, Ordering::Relaxed);
                self.execute(key, retry.task, retry.attempts);
            }
        }

        let mut state = self.state.lock();
        // Marks that raced with the drain still get one attempt
        let late = state.pending.take_all();
        let abandoned = state.retry.len();
        state.closed = true;
        state.completed = state.requested;
        drop(state);
        self.done.notify_all();

        for (_, task) in late {
            if let Err(e) = task.flush() {
                error!("{} flusher: late task failed during shutdown: {}", self.name, e);
            }
        }
        if abandoned > 0 {
            error!(
                "{} flusher closed with {} tasks still failing",
                self.name, abandoned
            );
            self.stats
                .dropped
                .fetch_add(abandoned as u64, Ordering::Relaxed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex as PlMutex;

    /// Records every payload written per key
    #[derive(Default)]
    struct Sink {
        writes: PlMutex<Vec<(String, u32)>>,
        failures_left: AtomicU64,
    }

    struct Write {
        key: String,
        payload: u32,
        sink: Arc<Sink>,
    }

    impl FlushTask for Write {
        type Key = String;

        fn key(&self) -> String {
            self.key.clone()
        }

        fn flush(&self) -> Result<()> {
            let left = self.sink.failures_left.load(Ordering::SeqCst);
            if left > 0 {
                self.sink.failures_left.store(left - 1, Ordering::SeqCst);
                return Err(Error::backend("unavailable"));
            }
            self.sink
                .writes
                .lock()
                .push((self.key.clone(), self.payload));
            Ok(())
        }
    }

    fn write(sink: &Arc<Sink>, key: &str, payload: u32) -> Write {
        Write {
            key: key.to_string(),
            payload,
            sink: Arc::clone(sink),
        }
    }

    fn options(delay_ms: u64) -> FlusherOptions {
        FlusherOptions {
            delay: Duration::from_millis(delay_ms),
            max_pending: 100,
            period: Duration::from_secs(60),
            retry_limit: 0,
            drain_attempts: 3,
            oom_backoff: Duration::from_millis(1),
            dedup_in_flight: false,
        }
    }

    #[test]
    fn test_marks_coalesce_to_latest_payload() {
        let sink = Arc::new(Sink::default());
        let flusher = Flusher::new("test", options(200)).unwrap();

        flusher.mark(write(&sink, "y", 1)).unwrap();
        flusher.mark(write(&sink, "y", 2)).unwrap();
        assert_eq!(flusher.pending_len(), 1);

        flusher.flush_now();
        assert_eq!(*sink.writes.lock(), vec![("y".to_string(), 2)]);
        assert_eq!(flusher.stats().coalesced.load(Ordering::Relaxed), 1);
        assert_eq!(flusher.stats().executed.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_delay_elapses_without_request() {
        let sink = Arc::new(Sink::default());
        let flusher = Flusher::new("test", options(20)).unwrap();
        flusher.mark(write(&sink, "a", 1)).unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        while sink.writes.lock().is_empty() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(sink.writes.lock().len(), 1);
    }

    #[test]
    fn test_max_pending_triggers_early_flush() {
        let sink = Arc::new(Sink::default());
        let flusher = Flusher::new(
            "test",
            FlusherOptions {
                max_pending: 3,
                ..options(60_000)
            },
        )
        .unwrap();
        for i in 0..3 {
            flusher.mark(write(&sink, &format!("k{i}"), i)).unwrap();
        }

        let deadline = Instant::now() + Duration::from_secs(5);
        while sink.writes.lock().len() < 3 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        let keys: Vec<String> = sink.writes.lock().iter().map(|(k, _)| k.clone()).collect();
        assert_eq!(keys, vec!["k0", "k1", "k2"]);
    }

    #[test]
    fn test_failure_goes_to_retry_lane() {
        let sink = Arc::new(Sink::default());
        sink.failures_left.store(1, Ordering::SeqCst);
        let flusher = Flusher::new("test", options(60_000)).unwrap();

        flusher.mark(write(&sink, "a", 1)).unwrap();
        flusher.flush_now();
        // Retries for a cycle are detached before its pending tasks run
        assert!(sink.writes.lock().is_empty());
        assert_eq!(flusher.retry_len(), 1);

        flusher.flush_now();
        assert_eq!(*sink.writes.lock(), vec![("a".to_string(), 1)]);
        assert_eq!(flusher.retry_len(), 0);
        assert_eq!(flusher.stats().retried.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_resource_exhaustion_backs_off_and_continues() {
        /// Fails with resource exhaustion while `fail` is set
        struct Alloc {
            key: &'static str,
            fail: Arc<AtomicU64>,
            log: Arc<PlMutex<Vec<(&'static str, bool, Instant)>>>,
        }

        impl FlushTask for Alloc {
            type Key = &'static str;

            fn key(&self) -> &'static str {
                self.key
            }

            fn flush(&self) -> Result<()> {
                let failed = self.fail.swap(0, Ordering::SeqCst) > 0;
                self.log.lock().push((self.key, failed, Instant::now()));
                if failed {
                    return Err(Error::ResourceExhausted("heap".into()));
                }
                Ok(())
            }
        }

        let log = Arc::new(PlMutex::new(Vec::new()));
        let task = |key, fail: u64| Alloc {
            key,
            fail: Arc::new(AtomicU64::new(fail)),
            log: Arc::clone(&log),
        };
        let backoff = Duration::from_millis(100);
        let flusher = Flusher::new(
            "test",
            FlusherOptions {
                oom_backoff: backoff,
                ..options(60_000)
            },
        )
        .unwrap();

        flusher.mark(task("a", 1)).unwrap();
        flusher.mark(task("b", 0)).unwrap();
        flusher.mark(task("c", 0)).unwrap();
        flusher.flush_now();

        {
            let log = log.lock();
            let order: Vec<(&str, bool)> = log.iter().map(|(k, f, _)| (*k, *f)).collect();
            assert_eq!(order, vec![("a", true), ("b", false), ("c", false)]);
            // The worker paused before the rest of the batch
            assert!(log[1].2.duration_since(log[0].2) >= backoff);
        }
        assert_eq!(flusher.retry_len(), 1);
        assert_eq!(flusher.stats().failed.load(Ordering::Relaxed), 1);

        flusher.flush_now();
        assert_eq!(flusher.retry_len(), 0);
        assert_eq!(log.lock().last().map(|(k, f, _)| (*k, *f)), Some(("a", false)));
        assert_eq!(flusher.stats().executed.load(Ordering::Relaxed), 3);
    }

    #[test]
    fn test_retry_limit_drops_task() {
        let sink = Arc::new(Sink::default());
        sink.failures_left.store(10, Ordering::SeqCst);
        let flusher = Flusher::new(
            "test",
            FlusherOptions {
                retry_limit: 2,
                ..options(60_000)
            },
        )
        .unwrap();

        flusher.mark(write(&sink, "a", 1)).unwrap();
        flusher.flush_now();
        flusher.flush_now();
        assert_eq!(flusher.retry_len(), 0);
        assert_eq!(flusher.stats().dropped.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_newer_mark_replaces_failed_task() {
        let sink = Arc::new(Sink::default());
        sink.failures_left.store(1, Ordering::SeqCst);
        let flusher = Flusher::new("test", options(60_000)).unwrap();

        flusher.mark(write(&sink, "a", 1)).unwrap();
        flusher.flush_now();
        assert_eq!(flusher.retry_len(), 1);

        flusher.mark(write(&sink, "a", 2)).unwrap();
        assert_eq!(flusher.retry_len(), 0);
        flusher.flush_now();
        assert_eq!(*sink.writes.lock(), vec![("a".to_string(), 2)]);
    }

    #[test]
    fn test_cancel() {
        let sink = Arc::new(Sink::default());
        let flusher = Flusher::new("test", options(60_000)).unwrap();
        flusher.mark(write(&sink, "a", 1)).unwrap();
        assert!(flusher.is_scheduled(&"a".to_string()));
        assert!(flusher.cancel(&"a".to_string()));
        assert!(!flusher.cancel(&"a".to_string()));
        flusher.flush_now();
        assert!(sink.writes.lock().is_empty());
    }

    #[test]
    fn test_close_drains_and_then_runs_synchronously() {
        let sink = Arc::new(Sink::default());
        sink.failures_left.store(2, Ordering::SeqCst);
        let flusher = Flusher::new("test", options(60_000)).unwrap();

        flusher.mark(write(&sink, "a", 1)).unwrap();
        flusher.mark(write(&sink, "b", 2)).unwrap();
        flusher.close();
        assert!(flusher.is_closed());

        let mut writes = sink.writes.lock().clone();
        writes.sort();
        assert_eq!(writes, vec![("a".to_string(), 1), ("b".to_string(), 2)]);

        flusher.mark(write(&sink, "c", 3)).unwrap();
        assert_eq!(sink.writes.lock().len(), 3);
        assert_eq!(flusher.pending_len(), 0);
    }

    #[test]
    fn test_dedup_in_flight() {
        struct Slow {
            started: Arc<AtomicU64>,
        }

        impl FlushTask for Slow {
            type Key = u8;

            fn key(&self) -> u8 {
                0
            }

            fn flush(&self) -> Result<()> {
                self.started.fetch_add(1, Ordering::SeqCst);
                thread::sleep(Duration::from_millis(50));
                Ok(())
            }
        }

        let started = Arc::new(AtomicU64::new(0));
        let flusher = Flusher::new(
            "test",
            FlusherOptions {
                dedup_in_flight: true,
                ..options(0)
            },
        )
        .unwrap();

        flusher
            .mark(Slow {
                started: Arc::clone(&started),
            })
            .unwrap();
        let deadline = Instant::now() + Duration::from_secs(5);
        while started.load(Ordering::SeqCst) == 0 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(1));
        }
        // Already executing: this mark is folded into it
        flusher
            .mark(Slow {
                started: Arc::clone(&started),
            })
            .unwrap();
        flusher.close();
        assert_eq!(started.load(Ordering::SeqCst), 1);
    }
}
