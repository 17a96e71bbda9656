//! One proxy per remote identity

use crate::proxy::RemoteProxy;
use crate::source::{OfflineCache, RemoteSource};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use persistio_cache::DelayLoader;
use persistio_common::{Clock, Config, Identity, LoaderMode, Result, SystemClock};
use std::sync::Arc;
use tracing::info;

/// Registry handing out the proxy for each identity
///
/// In [`LoaderMode::Shared`] every proxy reloads through one delay-loader
/// owned by the registry; in [`LoaderMode::Private`] each proxy starts its
/// own.
pub struct ProxyRegistry<V> {
    proxies: DashMap<Identity, RemoteProxy<V>>,
    source: Arc<dyn RemoteSource<V>>,
    offline: Option<Arc<dyn OfflineCache<V>>>,
    config: Config,
    clock: Arc<dyn Clock>,
    shared_loader: Option<Arc<DelayLoader>>,
}

impl<V: Clone + Send + Sync + 'static> ProxyRegistry<V> {
    pub fn new(config: &Config, source: Arc<dyn RemoteSource<V>>) -> Result<Self> {
        config.validate()?;
        let shared_loader = match config.proxy.loader {
            LoaderMode::Shared => Some(DelayLoader::shared("remote-proxy")?),
            LoaderMode::Private => None,
        };
        info!(
            "Proxy registry ready (expiry {} ms, {:?} loader)",
            config.proxy.expiry_ms, config.proxy.loader
        );
        Ok(Self {
            proxies: DashMap::new(),
            source,
            offline: None,
            config: config.clone(),
            clock: Arc::new(SystemClock),
            shared_loader,
        })
    }

    #[must_use]
    pub fn with_offline_cache(mut self, offline: Arc<dyn OfflineCache<V>>) -> Self {
        self.offline = Some(offline);
        self
    }

    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// The proxy for `id`, created on first use
    pub fn proxy(&self, id: &Identity) -> Result<RemoteProxy<V>> {
        if let Some(proxy) = self.proxies.get(id) {
            return Ok(proxy.clone());
        }
        match self.proxies.entry(id.clone()) {
            Entry::Occupied(entry) => Ok(entry.get().clone()),
            Entry::Vacant(entry) => {
                let proxy = self.build(id)?;
                entry.insert(proxy.clone());
                Ok(proxy)
            }
        }
    }

    fn build(&self, id: &Identity) -> Result<RemoteProxy<V>> {
        let mut builder = RemoteProxy::builder(id.clone(), Arc::clone(&self.source))
            .config(&self.config)
            .clock(Arc::clone(&self.clock));
        if let Some(offline) = &self.offline {
            builder = builder.offline_cache(Arc::clone(offline));
        }
        if let Some(loader) = &self.shared_loader {
            builder = builder.loader(Arc::clone(loader));
        }
        builder.build()
    }

    /// Shorthand for `proxy(id)?.value()`
    pub fn value(&self, id: &Identity) -> Result<Option<Arc<V>>> {
        self.proxy(id)?.value()
    }

    /// Forget the proxy for `id`
    pub fn remove(&self, id: &Identity) -> bool {
        match self.proxies.remove(id) {
            Some((_, proxy)) => {
                proxy.close();
                true
            }
            None => false,
        }
    }

    /// Force every proxy to reload on its next read
    ///
    /// Returns how many were expired; proxies with a pending write are skipped.
    pub fn expire_all(&self) -> usize {
        self.proxies.iter().filter(|entry| entry.value().expire()).count()
    }

    pub fn len(&self) -> usize {
        self.proxies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.proxies.is_empty()
    }

    /// Wait for every queued background reload
    pub fn drain(&self) {
        if let Some(loader) = &self.shared_loader {
            loader.drain();
        }
    }

    /// Stop all delay-loaders
    pub fn close(&self) {
        for entry in &self.proxies {
            entry.value().close();
        }
        if let Some(loader) = &self.shared_loader {
            loader.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::{MemorySource, RemoteValue};
    use persistio_common::ManualClock;
    use persistio_version::VersionLineage;
    use std::time::Duration;

    fn id(key: &str) -> Identity {
        Identity::new("quote", key).unwrap()
    }

    fn registry(mode: LoaderMode) -> (ProxyRegistry<String>, Arc<MemorySource<String>>, Arc<ManualClock>) {
        let source = Arc::new(MemorySource::new());
        for key in ["a", "b", "c"] {
            source.put(
                id(key),
                RemoteValue::new(format!("value-{key}"), VersionLineage::parse("r+1")),
            );
        }
        let clock = Arc::new(ManualClock::new(0));
        let mut config = Config::default();
        config.proxy.expiry_ms = 500;
        config.proxy.loader = mode;
        let registry = ProxyRegistry::new(&config, source.clone())
            .unwrap()
            .with_clock(clock.clone());
        (registry, source, clock)
    }

    #[test]
    fn test_one_proxy_per_identity() {
        let (registry, source, _) = registry(LoaderMode::Shared);
        let first = registry.proxy(&id("a")).unwrap();
        let second = registry.proxy(&id("a")).unwrap();
        assert!(first.ptr_eq(&second));
        assert_eq!(registry.len(), 1);

        assert_eq!(*registry.value(&id("a")).unwrap().unwrap(), "value-a");
        assert_eq!(*second.peek().unwrap(), "value-a");
        assert_eq!(source.load_count(), 1);
    }

    #[test]
    fn test_shared_loader_refreshes_all() {
        let (registry, source, clock) = registry(LoaderMode::Shared);
        for key in ["a", "b", "c"] {
            registry.value(&id(key)).unwrap();
        }
        for key in ["a", "b", "c"] {
            source.put(
                id(key),
                RemoteValue::new(format!("new-{key}"), VersionLineage::parse("r+1;r+2")),
            );
        }
        clock.advance(Duration::from_secs(1));
        for key in ["a", "b", "c"] {
            assert_eq!(*registry.value(&id(key)).unwrap().unwrap(), format!("value-{key}"));
        }
        registry.drain();
        for key in ["a", "b", "c"] {
            let proxy = registry.proxy(&id(key)).unwrap();
            assert_eq!(*proxy.peek().unwrap(), format!("new-{key}"));
        }
        registry.close();
    }

    #[test]
    fn test_private_loaders() {
        let (registry, _, _) = registry(LoaderMode::Private);
        assert_eq!(*registry.value(&id("b")).unwrap().unwrap(), "value-b");
        assert!(registry.remove(&id("b")));
        assert!(!registry.remove(&id("b")));
        assert!(registry.is_empty());
        registry.close();
    }

    #[test]
    fn test_expire_all() {
        let (registry, source, _) = registry(LoaderMode::Shared);
        registry.value(&id("a")).unwrap();
        registry.value(&id("b")).unwrap();
        assert_eq!(registry.expire_all(), 2);
        registry.value(&id("a")).unwrap();
        assert_eq!(source.load_count(), 3);
    }
}
