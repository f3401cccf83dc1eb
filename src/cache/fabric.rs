//! Cache entry memoizing the fabric topology.

use std::any::Any;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use tokio::time::Instant;
use tracing::{debug, info};

use super::keyed::{CacheItem, Refreshable};
use crate::fabric::{FabricScanner, NumaFabric};
use crate::telemetry;
use crate::{AgentError, Result};

/// Cache key of the fabric topology entry.
pub const FABRIC_KEY: &str = "fabric_info";

struct Cached {
    fabric: Arc<NumaFabric>,
    at: Instant,
}

/// Memoized fabric topology.
///
/// A scanned topology is fetched once and then treated as fixed for the
/// life of the agent; only an explicit [`Refreshable::refresh`] rescans. A
/// topology supplied by configuration ([`FabricInfoCache::preloaded`]) is
/// never rescanned.
pub struct FabricInfoCache {
    scanner: Option<Arc<dyn FabricScanner>>,
    providers: Vec<String>,
    cached: RwLock<Option<Cached>>,
}

impl FabricInfoCache {
    /// An empty entry that scans with `scanner` on first use.
    pub fn new(scanner: Arc<dyn FabricScanner>, providers: Vec<String>) -> Self {
        Self {
            scanner: Some(scanner),
            providers,
            cached: RwLock::new(None),
        }
    }

    /// An entry holding a statically configured topology.
    pub fn preloaded(fabric: Arc<NumaFabric>) -> Self {
        Self {
            scanner: None,
            providers: Vec::new(),
            cached: RwLock::new(Some(Cached {
                fabric,
                at: Instant::now(),
            })),
        }
    }

    pub fn is_static(&self) -> bool {
        self.scanner.is_none()
    }

    pub fn fabric(&self) -> Option<Arc<NumaFabric>> {
        self.cached
            .read()
            .ok()
            .and_then(|cached| cached.as_ref().map(|c| Arc::clone(&c.fabric)))
    }

    pub fn last_cached(&self) -> Option<Instant> {
        self.cached
            .read()
            .ok()
            .and_then(|cached| cached.as_ref().map(|c| c.at))
    }

    pub fn needs_refresh(&self) -> bool {
        self.last_cached().is_none()
    }
}

impl CacheItem for FabricInfoCache {
    fn key(&self) -> &str {
        FABRIC_KEY
    }

    fn as_refreshable(&self) -> Option<&dyn Refreshable> {
        Some(self)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[async_trait]
impl Refreshable for FabricInfoCache {
    async fn refresh(&self) -> Result<()> {
        let Some(scanner) = &self.scanner else {
            debug!("fabric topology is statically configured, not rescanning");
            return Ok(());
        };

        let fabric = scanner.scan(&self.providers).await?;
        info!(
            numa_nodes = fabric.num_numa_nodes(),
            providers = ?self.providers,
            "fabric scan complete"
        );
        metrics::counter!(telemetry::CACHE_REFRESHES_TOTAL, "kind" => "fabric").increment(1);

        let mut cached = self.cached.write().map_err(|e| {
            AgentError::Configuration(format!("Failed to acquire cache entry lock: {e}"))
        })?;
        *cached = Some(Cached {
            fabric: Arc::new(fabric),
            at: Instant::now(),
        });
        Ok(())
    }

    async fn refresh_if_needed(&self) -> Result<bool> {
        if !self.needs_refresh() {
            return Ok(false);
        }
        self.refresh().await?;
        Ok(true)
    }
}
