//! Cache-aside proxy for a remote value object
//!
//! A proxy keeps the last value fetched from a [`RemoteSource`] together
//! with its lineage and a freshness stamp. Reads consult the expiry policy:
//! blocking proxies reload on the caller's thread, background proxies hand
//! the reload to a delay-loader and keep answering with the cached value.
//! A failed reload never takes a cached value away; the stale value is
//! served and re-stamped so that callers do not all retry at once.

use crate::expiry::{ExpiryPolicy, Freshness, Stamp};
use crate::source::{OfflineCache, RemoteSource, RemoteValue};
use parking_lot::Mutex;
use persistio_cache::DelayLoader;
use persistio_common::{Clock, Config, Error, Identity, Result, SystemClock};
use persistio_version::VersionLineage;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, info, warn};

/// Proxy statistics
#[derive(Debug, Default)]
pub struct ProxyStats {
    /// Calls to the remote source
    pub loads: AtomicU64,
    /// Reloads run by the delay-loader
    pub background_reloads: AtomicU64,
    /// Failed reloads answered with the cached value
    pub stale_served: AtomicU64,
    /// Failed loads answered from the offline cache
    pub offline_hits: AtomicU64,
    /// Successful local writes
    pub writes: AtomicU64,
}

struct ProxyState<V> {
    value: Option<Arc<V>>,
    version: VersionLineage,
    owner: Option<String>,
    stamp: Stamp,
    pending_writes: usize,
}

struct Inner<V> {
    id: Identity,
    node: String,
    max_run: usize,
    policy: ExpiryPolicy,
    source: Arc<dyn RemoteSource<V>>,
    offline: Option<Arc<dyn OfflineCache<V>>>,
    loader: Arc<DelayLoader>,
    private_loader: bool,
    clock: Arc<dyn Clock>,
    state: Mutex<ProxyState<V>>,
    /// Serializes reloads
    load_lock: Mutex<()>,
    /// Serializes local writes
    write_lock: Mutex<()>,
    stats: ProxyStats,
}

/// Builder for [`RemoteProxy`]
pub struct RemoteProxyBuilder<V> {
    id: Identity,
    source: Arc<dyn RemoteSource<V>>,
    config: Config,
    offline: Option<Arc<dyn OfflineCache<V>>>,
    loader: Option<Arc<DelayLoader>>,
    clock: Arc<dyn Clock>,
}

impl<V: Clone + Send + Sync + 'static> RemoteProxyBuilder<V> {
    #[must_use]
    pub fn config(mut self, config: &Config) -> Self {
        self.config = config.clone();
        self
    }

    #[must_use]
    pub fn offline_cache(mut self, offline: Arc<dyn OfflineCache<V>>) -> Self {
        self.offline = Some(offline);
        self
    }

    /// Use a delay-loader shared with other proxies
    ///
    /// Without one the proxy starts a private loader.
    #[must_use]
    pub fn loader(mut self, loader: Arc<DelayLoader>) -> Self {
        self.loader = Some(loader);
        self
    }

    #[must_use]
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn build(self) -> Result<RemoteProxy<V>> {
        self.config.validate()?;
        let (loader, private_loader) = match self.loader {
            Some(loader) => (loader, false),
            None => (DelayLoader::shared(format!("proxy-{}", self.id))?, true),
        };
        Ok(RemoteProxy {
            inner: Arc::new(Inner {
                id: self.id,
                node: self.config.node.id.clone(),
                max_run: self.config.version.max_same_node_run,
                policy: ExpiryPolicy::from_millis(self.config.proxy.expiry_ms),
                source: self.source,
                offline: self.offline,
                loader,
                private_loader,
                clock: self.clock,
                state: Mutex::new(ProxyState {
                    value: None,
                    version: VersionLineage::new(),
                    owner: None,
                    stamp: Stamp::ForceExpired,
                    pending_writes: 0,
                }),
                load_lock: Mutex::new(()),
                write_lock: Mutex::new(()),
                stats: ProxyStats::default(),
            }),
        })
    }
}

/// Cache-aside handle on one remote object
///
/// Clones share the cached value.
pub struct RemoteProxy<V> {
    inner: Arc<Inner<V>>,
}

impl<V> Clone for RemoteProxy<V> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<V: Clone + Send + Sync + 'static> RemoteProxy<V> {
    pub fn builder(id: Identity, source: Arc<dyn RemoteSource<V>>) -> RemoteProxyBuilder<V> {
        RemoteProxyBuilder {
            id,
            source,
            config: Config::default(),
            offline: None,
            loader: None,
            clock: Arc::new(SystemClock),
        }
    }

    pub fn id(&self) -> &Identity {
        &self.inner.id
    }

    pub fn policy(&self) -> ExpiryPolicy {
        self.inner.policy
    }

    /// Current value, reloading first when the policy requires it
    ///
    /// `None` when the remote has no such object.
    pub fn value(&self) -> Result<Option<Arc<V>>> {
        let (current, freshness) = {
            let state = self.inner.state.lock();
            let freshness = self
                .inner
                .policy
                .freshness(state.stamp, self.inner.clock.now_millis());
            (state.value.clone(), freshness)
        };
        match freshness {
            Freshness::Fresh => Ok(current),
            Freshness::Refresh => {
                self.inner.schedule_reload();
                Ok(current)
            }
            Freshness::Reload => self.inner.load_blocking(),
        }
    }

    /// Cached value without touching the remote
    pub fn peek(&self) -> Option<Arc<V>> {
        self.inner.state.lock().value.clone()
    }

    pub fn version(&self) -> VersionLineage {
        self.inner.state.lock().version.clone()
    }

    pub fn owner(&self) -> Option<String> {
        self.inner.state.lock().owner.clone()
    }

    pub fn stamp(&self) -> Stamp {
        self.inner.state.lock().stamp
    }

    pub fn is_write_pending(&self) -> bool {
        self.inner.state.lock().pending_writes > 0
    }

    /// Force the next read to reload
    ///
    /// Ignored while a local write is pending.
    pub fn expire(&self) -> bool {
        let mut state = self.inner.state.lock();
        if state.pending_writes > 0 {
            warn!("Not expiring {}: local write pending", self.inner.id);
            return false;
        }
        state.stamp = Stamp::ForceExpired;
        true
    }

    /// Treat the value as past its freshness window
    ///
    /// Ignored while a local write is pending.
    pub fn weak_expire(&self) -> bool {
        let mut state = self.inner.state.lock();
        if state.pending_writes > 0 {
            warn!("Not weak-expiring {}: local write pending", self.inner.id);
            return false;
        }
        if state.stamp != Stamp::ForceExpired {
            state.stamp = Stamp::WeakExpired;
        }
        true
    }

    /// Install a value pushed by the remote; ignored when the lineage is unchanged
    pub fn update_vo(&self, value: V, version: VersionLineage) -> bool {
        let owner = self.owner();
        self.inner.apply(
            RemoteValue {
                value,
                version,
                owner,
            },
            true,
        )
    }

    /// Write a new value through to the remote
    ///
    /// The value is proposed with the cached lineage extended by this node.
    /// A conflict force-expires the proxy so the next read picks up the
    /// winning value.
    pub fn write(&self, value: V) -> Result<VersionLineage> {
        let inner = &self.inner;
        let _write = inner.write_lock.lock();
        let (previous, owner) = {
            let mut state = inner.state.lock();
            state.pending_writes += 1;
            (state.version.clone(), state.owner.clone())
        };
        let next = previous.append(&inner.node, false, inner.max_run);
        let result = inner.source.store(&inner.id, &value, &previous, &next);

        let mut state = inner.state.lock();
        state.pending_writes -= 1;
        let stored = match result {
            Ok(stored) => stored,
            Err(e) => {
                if e.is_conflict() {
                    state.stamp = Stamp::ForceExpired;
                }
                return Err(e);
            }
        };
        state.value = Some(Arc::new(value.clone()));
        state.version = stored.clone();
        state.stamp = Stamp::At(inner.clock.now_millis());
        drop(state);
        inner.stats.writes.fetch_add(1, Ordering::Relaxed);

        let remote = RemoteValue {
            value,
            version: stored.clone(),
            owner,
        };
        inner.write_offline(&remote);
        debug!("Wrote {} at {}", inner.id, stored);
        Ok(stored)
    }

    /// Get proxy statistics
    pub fn stats(&self) -> &ProxyStats {
        &self.inner.stats
    }

    /// Whether both handles proxy the same cached state
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Stop a private delay-loader; shared loaders are closed by their owner
    pub fn close(&self) {
        if self.inner.private_loader {
            self.inner.loader.close();
        }
    }
}

impl<V: Clone + Send + Sync + 'static> Inner<V> {
    fn load_blocking(&self) -> Result<Option<Arc<V>>> {
        let _load = self.load_lock.lock();
        {
            // Another caller may have reloaded while we waited
            let state = self.state.lock();
            if self.policy.freshness(state.stamp, self.clock.now_millis()) != Freshness::Reload {
                return Ok(state.value.clone());
            }
        }
        self.reload()
    }

    fn schedule_reload(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        let scheduled = self.loader.schedule(self.id.clone(), move || {
            if let Some(inner) = weak.upgrade() {
                inner.reload_in_background();
            }
            Ok(())
        });
        if let Err(e) = scheduled {
            warn!("Failed to schedule reload of {}: {}", self.id, e);
        }
    }

    fn reload_in_background(&self) {
        let _load = self.load_lock.lock();
        {
            let state = self.state.lock();
            if self.policy.freshness(state.stamp, self.clock.now_millis()) == Freshness::Fresh {
                return;
            }
        }
        self.stats.background_reloads.fetch_add(1, Ordering::Relaxed);
        if let Err(e) = self.reload() {
            warn!("Background reload of {} failed: {}", self.id, e);
        }
    }

    fn reload(&self) -> Result<Option<Arc<V>>> {
        self.stats.loads.fetch_add(1, Ordering::Relaxed);
        match self.source.load(&self.id) {
            Ok(Some(remote)) => {
                self.apply(remote, true);
                Ok(self.state.lock().value.clone())
            }
            Ok(None) => {
                let mut state = self.state.lock();
                if state.pending_writes == 0 {
                    state.value = None;
                    state.version = VersionLineage::new();
                    state.owner = None;
                }
                state.stamp = Stamp::At(self.clock.now_millis());
                Ok(state.value.clone())
            }
            Err(e) => self.load_failed(e),
        }
    }

    fn load_failed(&self, err: Error) -> Result<Option<Arc<V>>> {
        {
            let mut state = self.state.lock();
            if let Some(value) = &state.value {
                let value = Arc::clone(value);
                state.stamp = Stamp::At(self.clock.now_millis());
                drop(state);
                self.stats.stale_served.fetch_add(1, Ordering::Relaxed);
                warn!("Reload of {} failed, serving stale value: {}", self.id, err);
                return Ok(Some(value));
            }
        }

        if let Some(offline) = &self.offline {
            match offline.get(&self.id) {
                Ok(Some(remote)) => {
                    info!(
                        "{} unreachable ({}), using offline copy at {}",
                        self.id, err, remote.version
                    );
                    self.stats.offline_hits.fetch_add(1, Ordering::Relaxed);
                    self.apply(remote, false);
                    return Ok(self.state.lock().value.clone());
                }
                Ok(None) => {}
                Err(e) => warn!("Offline cache lookup for {} failed: {}", self.id, e),
            }
        }
        Err(err)
    }

    /// Install a value unless its lineage is already cached
    fn apply(&self, remote: RemoteValue<V>, write_offline: bool) -> bool {
        let offline_copy = (write_offline && self.offline.is_some()).then(|| remote.clone());
        {
            let mut state = self.state.lock();
            state.stamp = Stamp::At(self.clock.now_millis());
            if state.value.is_some() && state.pending_writes > 0 {
                debug!("Reload of {} ignored: local write pending", self.id);
                return false;
            }
            if state.value.is_some() && state.version == remote.version {
                return false;
            }
            state.value = Some(Arc::new(remote.value));
            state.version = remote.version;
            state.owner = remote.owner;
        }
        if let Some(copy) = offline_copy {
            self.write_offline(&copy);
        }
        true
    }

    fn write_offline(&self, remote: &RemoteValue<V>) {
        let Some(offline) = &self.offline else {
            return;
        };
        if let Err(e) = offline.update(&self.id, remote) {
            warn!("Offline cache update for {} failed: {}", self.id, e);
        }
    }
}
