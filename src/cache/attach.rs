//! Cache entry memoizing a system's connection ("attach") info.

use std::any::Any;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;
use tracing::debug;

use super::keyed::{CacheItem, Refreshable};
use crate::mgmt::{AttachInfo, ConnectionInfoFetcher};
use crate::telemetry;
use crate::{AgentError, Result};

/// Cache key for a system's attach info.
pub fn attach_info_key(system: &str) -> String {
    format!("attach_info:{system}")
}

struct Cached {
    info: Arc<AttachInfo>,
    at: Instant,
}

/// Memoized response of a "get connection info" call for one system.
///
/// Needs a refresh when it has never been populated, or once
/// `refresh_interval` has elapsed since the last successful fetch. A zero
/// interval makes the entry sticky: fetched once, then kept until an
/// explicit refresh.
pub struct AttachInfoCache {
    key: String,
    system: String,
    refresh_interval: Duration,
    fetcher: Arc<dyn ConnectionInfoFetcher>,
    cached: RwLock<Option<Cached>>,
}

impl AttachInfoCache {
    pub fn new(
        system: impl Into<String>,
        refresh_interval: Duration,
        fetcher: Arc<dyn ConnectionInfoFetcher>,
    ) -> Self {
        let system = system.into();
        Self {
            key: attach_info_key(&system),
            system,
            refresh_interval,
            fetcher,
            cached: RwLock::new(None),
        }
    }

    pub fn system(&self) -> &str {
        &self.system
    }

    /// The last successfully fetched response.
    pub fn attach_info(&self) -> Option<Arc<AttachInfo>> {
        self.cached
            .read()
            .ok()
            .and_then(|cached| cached.as_ref().map(|c| Arc::clone(&c.info)))
    }

    /// When the last successful fetch completed.
    pub fn last_cached(&self) -> Option<Instant> {
        self.cached
            .read()
            .ok()
            .and_then(|cached| cached.as_ref().map(|c| c.at))
    }

    pub fn needs_refresh(&self) -> bool {
        match self.last_cached() {
            None => true,
            Some(_) if self.refresh_interval.is_zero() => false,
            Some(at) => Instant::now() >= at + self.refresh_interval,
        }
    }
}

impl CacheItem for AttachInfoCache {
    fn key(&self) -> &str {
        &self.key
    }

    fn as_refreshable(&self) -> Option<&dyn Refreshable> {
        Some(self)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[async_trait]
impl Refreshable for AttachInfoCache {
    async fn refresh(&self) -> Result<()> {
        let info = self.fetcher.fetch_connection_info(&self.system).await?;
        debug!(system = %self.system, ranks = info.rank_uris.len(), "attach info fetched");
        metrics::counter!(telemetry::CACHE_REFRESHES_TOTAL, "kind" => "attach_info").increment(1);

        let mut cached = self.cached.write().map_err(|e| {
            AgentError::Configuration(format!("Failed to acquire cache entry lock: {e}"))
        })?;
        *cached = Some(Cached {
            info: Arc::new(info),
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
