//! Fabric hardware scanning.
//!
//! The agent never scans on the request path more than once: the result of
//! a [`FabricScanner`] is memoized by [`FabricInfoCache`](crate::cache::FabricInfoCache).

use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use super::netif::{InterfaceResolver, SystemResolver, active_interface_names};
use super::{FabricInterface, NetDevClass, NumaFabric};
use crate::{AgentError, Result};

/// Hardware probe producing a NUMA-aware fabric topology.
#[async_trait]
pub trait FabricScanner: Send + Sync {
    /// Discover interfaces usable with any of `providers`.
    async fn scan(&self, providers: &[String]) -> Result<NumaFabric>;
}

/// Include/exclude filter applied to scanned interface names.
///
/// At most one of the two sets may be non-empty.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InterfaceFilter {
    include: BTreeSet<String>,
    exclude: BTreeSet<String>,
}

impl InterfaceFilter {
    /// Keep only the named interfaces.
    pub fn include<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            include: names.into_iter().map(Into::into).collect(),
            exclude: BTreeSet::new(),
        }
    }

    /// Drop the named interfaces.
    pub fn exclude<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            include: BTreeSet::new(),
            exclude: names.into_iter().map(Into::into).collect(),
        }
    }

    /// Build from configuration lists, rejecting a filter that sets both.
    pub fn from_lists(include: &[String], exclude: &[String]) -> Result<Self> {
        if !include.is_empty() && !exclude.is_empty() {
            return Err(AgentError::Configuration(
                "include and exclude fabric interface lists are mutually exclusive".to_string(),
            ));
        }
        Ok(Self {
            include: include.iter().cloned().collect(),
            exclude: exclude.iter().cloned().collect(),
        })
    }

    pub fn allows(&self, name: &str) -> bool {
        if !self.include.is_empty() {
            return self.include.contains(name);
        }
        !self.exclude.contains(name)
    }
}

/// [`FabricScanner`] that reads the kernel's view of the network devices.
///
/// Every up, non-loopback interface is reported with its `ARPHRD` type from
/// `/sys/class/net/<if>/type` and its NUMA node from
/// `/sys/class/net/<if>/device/numa_node` (node 0 when the kernel reports
/// none). Provider support is not probed; each interface is tagged with the
/// requested providers.
pub struct SystemScanner {
    sysfs_root: PathBuf,
    filter: InterfaceFilter,
    resolver: Arc<dyn InterfaceResolver>,
}

impl SystemScanner {
    pub fn new(filter: InterfaceFilter) -> Self {
        Self {
            sysfs_root: PathBuf::from("/sys/class/net"),
            filter,
            resolver: Arc::new(SystemResolver),
        }
    }

    /// Read device attributes from a different root (tests).
    pub fn sysfs_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.sysfs_root = root.into();
        self
    }

    /// Liveness resolver handed to the topologies this scanner builds.
    pub fn resolver(mut self, resolver: Arc<dyn InterfaceResolver>) -> Self {
        self.resolver = resolver;
        self
    }

    /// Build a topology for an explicit set of interface names.
    pub fn scan_names<I>(&self, names: I, providers: &[String]) -> Result<NumaFabric>
    where
        I: IntoIterator<Item = String>,
    {
        let mut interfaces = Vec::new();
        for name in names {
            if !self.filter.allows(&name) {
                debug!(interface = %name, "fabric interface filtered out");
                continue;
            }
            let dev_dir = self.sysfs_root.join(&name);
            let class = read_u32(&dev_dir.join("type"))?
                .map(NetDevClass)
                .unwrap_or(NetDevClass::ETHER);
            if class == NetDevClass::LOOPBACK {
                continue;
            }
            // The kernel reports -1 for devices without NUMA affinity.
            let numa_node = read_u32(&dev_dir.join("device").join("numa_node"))
                .ok()
                .flatten()
                .unwrap_or(0);
            interfaces.push(
                FabricInterface::new(name, class)
                    .with_numa_node(numa_node)
                    .with_providers(providers.iter().cloned()),
            );
        }
        Ok(NumaFabric::from_interfaces(
            interfaces,
            Arc::clone(&self.resolver),
        ))
    }
}

#[async_trait]
impl FabricScanner for SystemScanner {
    async fn scan(&self, providers: &[String]) -> Result<NumaFabric> {
        if providers.is_empty() {
            return Err(AgentError::InvalidInput(
                "at least one provider is required for a fabric scan".to_string(),
            ));
        }
        self.scan_names(active_interface_names()?, providers)
    }
}

/// Parse a small integer attribute; `None` if absent or negative.
fn read_u32(path: &Path) -> Result<Option<u32>> {
    match fs::read_to_string(path) {
        Ok(raw) => Ok(raw.trim().parse::<u32>().ok()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}
