//! Agent-facing cache of attach info and fabric topology.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tracing::debug;

use super::attach::{AttachInfoCache, attach_info_key};
use super::fabric::{FABRIC_KEY, FabricInfoCache};
use super::keyed::{CacheItem, KeyedCache};
use crate::config::AgentConfig;
use crate::fabric::{FabricInterface, FabricScanner, NetDevClass, NumaFabric};
use crate::mgmt::{AttachInfo, ConnectionInfoFetcher, DEFAULT_SYSTEM};
use crate::{AgentError, Result};

/// Attach-info and fabric caches behind one object.
///
/// Either cache can be disabled, in which case every request goes straight
/// to the fetcher or scanner and nothing is memoized.
pub struct InfoCache {
    cache: KeyedCache,
    fetcher: Arc<dyn ConnectionInfoFetcher>,
    scanner: Option<Arc<dyn FabricScanner>>,
    static_fabric: Option<Arc<NumaFabric>>,
    providers: Vec<String>,
    refresh_interval: Duration,
    attach_info_enabled: AtomicBool,
    fabric_enabled: AtomicBool,
}

impl InfoCache {
    pub fn builder() -> InfoCacheBuilder {
        InfoCacheBuilder::new()
    }

    pub fn is_attach_info_cache_enabled(&self) -> bool {
        self.attach_info_enabled.load(Ordering::Acquire)
    }

    pub fn is_fabric_cache_enabled(&self) -> bool {
        self.fabric_enabled.load(Ordering::Acquire)
    }

    pub fn enable_attach_info_cache(&self) {
        self.attach_info_enabled.store(true, Ordering::Release);
    }

    /// Stop memoizing attach info and drop whatever was cached.
    pub fn disable_attach_info_cache(&self) {
        self.attach_info_enabled.store(false, Ordering::Release);
        for key in self.cache.keys() {
            if key != FABRIC_KEY {
                let _ = self.cache.delete(&key);
            }
        }
    }

    pub fn enable_fabric_cache(&self) {
        self.fabric_enabled.store(true, Ordering::Release);
    }

    pub fn disable_fabric_cache(&self) {
        self.fabric_enabled.store(false, Ordering::Release);
    }

    /// Connection info for `system` (the default system when empty).
    pub async fn get_attach_info(&self, system: &str) -> Result<Arc<AttachInfo>> {
        let system = if system.is_empty() {
            DEFAULT_SYSTEM
        } else {
            system
        };

        if !self.is_attach_info_cache_enabled() {
            debug!(system, "attach info cache disabled, fetching directly");
            let info = self.fetcher.fetch_connection_info(system).await?;
            return Ok(Arc::new(info));
        }

        let guard = self
            .cache
            .get_or_create(&attach_info_key(system), || async {
                Ok(Arc::new(AttachInfoCache::new(
                    system,
                    self.refresh_interval,
                    Arc::clone(&self.fetcher),
                )) as Arc<dyn CacheItem>)
            })
            .await?;
        guard
            .downcast_ref::<AttachInfoCache>()
            .and_then(AttachInfoCache::attach_info)
            .ok_or_else(|| AgentError::Upstream(format!("no attach info cached for {system}")))
    }

    /// The current fabric topology, scanning it on first use.
    pub async fn fabric(&self) -> Result<Arc<NumaFabric>> {
        if !self.is_fabric_cache_enabled() {
            if let Some(fabric) = &self.static_fabric {
                return Ok(Arc::clone(fabric));
            }
            debug!("fabric cache disabled, scanning directly");
            let scanner = self.scanner()?;
            return Ok(Arc::new(scanner.scan(&self.providers).await?));
        }

        let guard = self
            .cache
            .get_or_create(FABRIC_KEY, || async {
                let scanner = self.scanner()?;
                Ok(Arc::new(FabricInfoCache::new(
                    Arc::clone(scanner),
                    self.providers.clone(),
                )) as Arc<dyn CacheItem>)
            })
            .await?;
        guard
            .downcast_ref::<FabricInfoCache>()
            .and_then(FabricInfoCache::fabric)
            .ok_or_else(|| AgentError::Upstream("no fabric topology cached".to_string()))
    }

    /// Select a fabric device for a client on `numa_node`.
    pub async fn get_fabric_device(
        &self,
        numa_node: u32,
        class: NetDevClass,
        provider: &str,
    ) -> Result<FabricInterface> {
        if provider.is_empty() {
            return Err(AgentError::InvalidInput("provider is required".to_string()));
        }
        self.fabric().await?.get_device(numa_node, class, provider)
    }

    /// Select a device for a client of `system`, using the provider and
    /// device class the servers advertise.
    pub async fn select_fabric_device(
        &self,
        system: &str,
        numa_node: u32,
    ) -> Result<FabricInterface> {
        let info = self.get_attach_info(system).await?;
        let hint = &info.client_net_hint;
        if hint.provider.is_empty() {
            return Err(AgentError::Upstream(format!(
                "system {:?} did not advertise a provider",
                info.system
            )));
        }
        self.get_fabric_device(numa_node, NetDevClass(hint.net_dev_class), &hint.provider)
            .await
    }

    /// Look up a device the client pinned by name.
    pub async fn find_fabric_device(
        &self,
        name: &str,
        domain: Option<&str>,
        provider: &str,
    ) -> Result<FabricInterface> {
        self.fabric().await?.find_device(name, domain, provider)
    }

    /// Refetch attach info for `system` now. Does nothing while the
    /// attach-info cache is disabled.
    pub async fn refresh_attach_info(&self, system: &str) -> Result<()> {
        if !self.is_attach_info_cache_enabled() {
            return Ok(());
        }
        let system = if system.is_empty() {
            DEFAULT_SYSTEM
        } else {
            system
        };
        let key = attach_info_key(system);
        if !self.cache.has(&key) {
            // First use fetches anyway.
            return self.get_attach_info(system).await.map(|_| ());
        }
        self.cache.refresh(&[key.as_str()]).await
    }

    /// Rescan the fabric now. A no-op for a statically configured fabric.
    pub async fn refresh_fabric(&self) -> Result<()> {
        if !self.is_fabric_cache_enabled() {
            return Ok(());
        }
        if !self.cache.has(FABRIC_KEY) {
            return self.fabric().await.map(|_| ());
        }
        self.cache.refresh(&[FABRIC_KEY]).await
    }

    /// Keys of everything currently cached.
    pub fn cached_keys(&self) -> Vec<String> {
        self.cache.keys()
    }

    fn scanner(&self) -> Result<&Arc<dyn FabricScanner>> {
        self.scanner
            .as_ref()
            .ok_or_else(|| AgentError::Configuration("no fabric scanner configured".to_string()))
    }
}

/// Builder for [`InfoCache`].
pub struct InfoCacheBuilder {
    fetcher: Option<Arc<dyn ConnectionInfoFetcher>>,
    scanner: Option<Arc<dyn FabricScanner>>,
    static_fabric: Option<NumaFabric>,
    providers: Vec<String>,
    refresh_interval: Duration,
    disable_attach_info_cache: bool,
    disable_fabric_cache: bool,
}

impl InfoCacheBuilder {
    pub fn new() -> Self {
        Self {
            fetcher: None,
            scanner: None,
            static_fabric: None,
            providers: Vec::new(),
            refresh_interval: Duration::ZERO,
            disable_attach_info_cache: false,
            disable_fabric_cache: false,
        }
    }

    /// Source of connection info (required).
    pub fn fetcher(mut self, fetcher: Arc<dyn ConnectionInfoFetcher>) -> Self {
        self.fetcher = Some(fetcher);
        self
    }

    /// Hardware probe used when no static fabric is configured.
    pub fn scanner(mut self, scanner: Arc<dyn FabricScanner>) -> Self {
        self.scanner = Some(scanner);
        self
    }

    /// Use an operator-declared topology instead of scanning.
    pub fn static_fabric(mut self, fabric: NumaFabric) -> Self {
        self.static_fabric = Some(fabric);
        self
    }

    pub fn providers<I, S>(mut self, providers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.providers = providers.into_iter().map(Into::into).collect();
        self
    }

    /// Attach-info refresh interval; zero keeps the first response forever.
    pub fn refresh_interval(mut self, interval: Duration) -> Self {
        self.refresh_interval = interval;
        self
    }

    pub fn disable_attach_info_cache(mut self) -> Self {
        self.disable_attach_info_cache = true;
        self
    }

    pub fn disable_fabric_cache(mut self) -> Self {
        self.disable_fabric_cache = true;
        self
    }

    /// Apply caching, provider and static-fabric settings from `config`.
    pub fn config(mut self, config: &AgentConfig) -> Self {
        self.refresh_interval = config.refresh_interval();
        self.providers = config.providers.clone();
        if config.disable_caching {
            self.disable_attach_info_cache = true;
            self.disable_fabric_cache = true;
        }
        if let Some(fabric) = config.static_fabric() {
            self.static_fabric = Some(fabric);
        }
        self
    }

    pub fn build(self) -> Result<InfoCache> {
        let fetcher = self.fetcher.ok_or_else(|| {
            AgentError::Configuration("a connection info fetcher is required".to_string())
        })?;
        if self.scanner.is_none() && self.static_fabric.is_none() {
            return Err(AgentError::Configuration(
                "either a fabric scanner or a static fabric is required".to_string(),
            ));
        }
        if self.static_fabric.is_none() && self.providers.is_empty() {
            return Err(AgentError::Configuration(
                "at least one fabric provider is required".to_string(),
            ));
        }

        let cache = KeyedCache::new();
        let static_fabric = self.static_fabric.map(Arc::new);
        if let Some(fabric) = &static_fabric {
            cache.set(Arc::new(FabricInfoCache::preloaded(Arc::clone(fabric))))?;
        }

        Ok(InfoCache {
            cache,
            fetcher,
            scanner: self.scanner,
            static_fabric,
            providers: self.providers,
            refresh_interval: self.refresh_interval,
            attach_info_enabled: AtomicBool::new(!self.disable_attach_info_cache),
            fabric_enabled: AtomicBool::new(!self.disable_fabric_cache),
        })
    }
}

impl Default for InfoCacheBuilder {
    fn default() -> Self {
        Self::new()
    }
}
