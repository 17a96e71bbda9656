//! Background reload queue
//!
//! A delay-loader is a flusher with no coalescing delay whose tasks reload
//! remote objects. At most one reload per identity is queued or running at
//! any time. One loader can be shared by every proxy in the process or each
//! proxy can own a private one.

use crate::flusher::{FlushTask, Flusher, FlusherOptions};
use persistio_common::{Identity, Result};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

type ReloadFn = Arc<dyn Fn() -> Result<()> + Send + Sync>;

/// Reload of one remote object
pub struct ReloadTask {
    key: Identity,
    run: ReloadFn,
}

impl ReloadTask {
    pub fn new(key: Identity, run: impl Fn() -> Result<()> + Send + Sync + 'static) -> Self {
        Self {
            key,
            run: Arc::new(run),
        }
    }
}

impl fmt::Debug for ReloadTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReloadTask").field("key", &self.key).finish()
    }
}

impl FlushTask for ReloadTask {
    type Key = Identity;

    fn key(&self) -> Identity {
        self.key.clone()
    }

    fn flush(&self) -> Result<()> {
        (self.run)()
    }
}

/// Single-worker background reload queue
pub struct DelayLoader {
    flusher: Flusher<ReloadTask>,
}

impl DelayLoader {
    /// Start a loader; `name` labels its worker thread and log lines
    pub fn new(name: impl Into<String>) -> Result<Self> {
        let options = FlusherOptions {
            delay: Duration::ZERO,
            max_pending: usize::MAX,
            period: Duration::from_secs(60),
            // Reload callbacks handle their own failures
            retry_limit: 1,
            drain_attempts: 0,
            oom_backoff: Duration::from_millis(500),
            dedup_in_flight: true,
        };
        Ok(Self {
            flusher: Flusher::new(name, options)?,
        })
    }

    /// Start a loader meant to be handed to several owners
    pub fn shared(name: impl Into<String>) -> Result<Arc<Self>> {
        Self::new(name).map(Arc::new)
    }

    /// Queue a reload unless one is already queued or running for `key`
    pub fn schedule(&self, key: Identity, run: impl Fn() -> Result<()> + Send + Sync + 'static) -> Result<()> {
        self.flusher.mark(ReloadTask::new(key, run))
    }

    pub fn is_scheduled(&self, key: &Identity) -> bool {
        self.flusher.is_scheduled(key)
    }

    pub fn pending_len(&self) -> usize {
        self.flusher.pending_len()
    }

    /// Wait until everything queued so far has run
    pub fn drain(&self) {
        self.flusher.flush_now();
    }

    /// Run queued reloads and stop the worker
    pub fn close(&self) {
        self.flusher.close();
    }
}
