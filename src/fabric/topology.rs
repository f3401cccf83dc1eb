//! NUMA node → fabric interface map with round-robin device selection.

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use tracing::debug;

use super::netif::{InterfaceResolver, SystemResolver, validate_interface};
use super::{FabricInterface, NetDevClass};
use crate::telemetry;
use crate::{AgentError, Result};

#[derive(Debug, Default)]
struct NumaNode {
    devices: Vec<FabricInterface>,
    /// Index of the next device to consider.
    cursor: usize,
}

#[derive(Debug, Default)]
struct FabricState {
    nodes: BTreeMap<u32, NumaNode>,
    /// Position in `nodes` (in key order) of the next node to try on fallback.
    node_cursor: usize,
}

/// Fabric interfaces grouped by NUMA node.
///
/// Device selection is round robin per node: every call to
/// [`get_device`](Self::get_device) advances that node's cursor, so repeated
/// requests spread clients across all matching devices. When the requested
/// node has nothing suitable, the remaining nodes are tried in round-robin
/// order using a separate shared cursor.
///
/// Devices are always returned by value; the shared records are never
/// exposed.
pub struct NumaFabric {
    state: RwLock<FabricState>,
    resolver: Arc<dyn InterfaceResolver>,
}

impl NumaFabric {
    /// An empty topology that validates interfaces against the live system.
    pub fn new() -> Self {
        Self::with_resolver(Arc::new(SystemResolver))
    }

    /// An empty topology using a custom liveness resolver.
    pub fn with_resolver(resolver: Arc<dyn InterfaceResolver>) -> Self {
        Self {
            state: RwLock::new(FabricState::default()),
            resolver,
        }
    }

    /// Build a topology from a list of interfaces, each placed on its own
    /// `numa_node`. Insertion order within a node is preserved.
    pub fn from_interfaces<I>(interfaces: I, resolver: Arc<dyn InterfaceResolver>) -> Self
    where
        I: IntoIterator<Item = FabricInterface>,
    {
        let mut state = FabricState::default();
        for fi in interfaces {
            state.nodes.entry(fi.numa_node).or_default().devices.push(fi);
        }
        Self {
            state: RwLock::new(state),
            resolver,
        }
    }

    /// Add an interface to the node named by its `numa_node`.
    pub fn add(&self, fi: FabricInterface) -> Result<()> {
        let mut state = self.write()?;
        state.nodes.entry(fi.numa_node).or_default().devices.push(fi);
        Ok(())
    }

    /// Number of interfaces on `numa_node` (0 for unknown nodes).
    pub fn num_devices(&self, numa_node: u32) -> usize {
        self.state
            .read()
            .map(|state| state.nodes.get(&numa_node).map_or(0, |n| n.devices.len()))
            .unwrap_or(0)
    }

    /// Number of NUMA nodes with at least one registered interface.
    pub fn num_numa_nodes(&self) -> usize {
        self.state
            .read()
            .map(|state| state.nodes.len())
            .unwrap_or(0)
    }

    /// Copy of every interface, grouped by NUMA node.
    pub fn snapshot(&self) -> BTreeMap<u32, Vec<FabricInterface>> {
        self.state
            .read()
            .map(|state| {
                state
                    .nodes
                    .iter()
                    .map(|(id, node)| (*id, node.devices.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Select a device for a client on `numa_node`.
    ///
    /// Tries the local node first, then every other node. Operator-declared
    /// devices match any class and provider and skip the liveness check;
    /// scanned devices without a routable address are skipped.
    pub fn get_device(
        &self,
        numa_node: u32,
        class: NetDevClass,
        provider: &str,
    ) -> Result<FabricInterface> {
        if provider.is_empty() {
            return Err(AgentError::InvalidInput("provider is required".to_string()));
        }

        let mut state = self.write()?;
        let resolver = self.resolver.as_ref();

        if let Some(fi) = state.device_on_node(numa_node, class, provider, resolver) {
            return Ok(fi);
        }

        debug!(numa_node, %class, provider, "no local fabric interface, trying other NUMA nodes");
        match state.device_on_other_node(numa_node, class, provider, resolver) {
            Some(fi) => {
                metrics::counter!(telemetry::FABRIC_FALLBACKS_TOTAL).increment(1);
                Ok(fi)
            }
            None => Err(AgentError::NoSuitableInterface { class }),
        }
    }

    /// Look up a device by interface name, ignoring the selection cursors.
    pub fn find(&self, name: &str) -> Result<FabricInterface> {
        let state = self.read()?;
        state
            .nodes
            .values()
            .flat_map(|node| node.devices.iter())
            .find(|fi| fi.name == name)
            .cloned()
            .ok_or_else(|| AgentError::DeviceNotFound(name.to_string()))
    }

    /// Look up a pinned device and check that it can serve the request.
    ///
    /// When `domain` is given it must match the device's domain as well.
    pub fn find_device(
        &self,
        name: &str,
        domain: Option<&str>,
        provider: &str,
    ) -> Result<FabricInterface> {
        if name.is_empty() {
            return Err(AgentError::InvalidInput("interface name is required".to_string()));
        }
        let fi = self.find(name)?;
        if let Some(domain) = domain {
            if fi.domain.as_deref() != Some(domain) {
                return Err(AgentError::DeviceNotFound(format!("{name} (domain: {domain})")));
            }
        }
        if !provider.is_empty() && !fi.has_provider(provider) {
            return Err(AgentError::ProviderMismatch {
                name: name.to_string(),
                provider: provider.to_string(),
            });
        }
        Ok(fi)
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, FabricState>> {
        self.state.read().map_err(|e| {
            AgentError::Configuration(format!("Failed to acquire fabric read lock: {e}"))
        })
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, FabricState>> {
        self.state.write().map_err(|e| {
            AgentError::Configuration(format!("Failed to acquire fabric write lock: {e}"))
        })
    }
}

impl Default for NumaFabric {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for NumaFabric {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NumaFabric")
            .field("nodes", &self.snapshot())
            .finish_non_exhaustive()
    }
}

impl FabricState {
    /// One full pass over `numa_node`'s devices starting at its cursor.
    fn device_on_node(
        &mut self,
        numa_node: u32,
        class: NetDevClass,
        provider: &str,
        resolver: &dyn InterfaceResolver,
    ) -> Option<FabricInterface> {
        let node = self.nodes.get_mut(&numa_node)?;
        let count = node.devices.len();
        for _ in 0..count {
            let idx = node.cursor % count;
            node.cursor = (idx + 1) % count;

            let candidate = &node.devices[idx];
            if !candidate.matches(class, provider) {
                continue;
            }
            if !candidate.is_manual() {
                if let Err(e) = validate_interface(resolver, &candidate.name) {
                    debug!(interface = %candidate.name, error = %e, "skipping unusable fabric interface");
                    continue;
                }
            }
            return Some(candidate.clone());
        }
        None
    }

    fn device_on_other_node(
        &mut self,
        exclude: u32,
        class: NetDevClass,
        provider: &str,
        resolver: &dyn InterfaceResolver,
    ) -> Option<FabricInterface> {
        let node_ids: Vec<u32> = self.nodes.keys().copied().collect();
        let count = node_ids.len();
        for _ in 0..count {
            let idx = self.node_cursor % count;
            self.node_cursor = (idx + 1) % count;

            let numa_node = node_ids[idx];
            if numa_node == exclude {
                continue;
            }
            if let Some(fi) = self.device_on_node(numa_node, class, provider, resolver) {
                return Some(fi);
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};

    struct AllUp;

    impl InterfaceResolver for AllUp {
        fn addresses(&self, _name: &str) -> Result<Vec<IpAddr>> {
            Ok(vec![IpAddr::V4(Ipv4Addr::new(192, 168, 1, 10))])
        }
    }

    fn eth(name: &str, numa: u32) -> FabricInterface {
        FabricInterface::new(name, NetDevClass::ETHER)
            .with_numa_node(numa)
            .with_providers(["ofi+tcp"])
    }

    #[test]
    fn counts() {
        let fabric = NumaFabric::from_interfaces(
            [eth("eth0", 0), eth("eth1", 0), eth("eth2", 1)],
            Arc::new(AllUp),
        );
        assert_eq!(fabric.num_numa_nodes(), 2);
        assert_eq!(fabric.num_devices(0), 2);
        assert_eq!(fabric.num_devices(1), 1);
        assert_eq!(fabric.num_devices(7), 0);
    }

    #[test]
    fn empty_provider_rejected() {
        let fabric = NumaFabric::from_interfaces([eth("eth0", 0)], Arc::new(AllUp));
        let err = fabric.get_device(0, NetDevClass::ETHER, "").unwrap_err();
        assert!(matches!(err, AgentError::InvalidInput(_)));
    }

    #[test]
    fn empty_topology_has_no_device() {
        let fabric = NumaFabric::with_resolver(Arc::new(AllUp));
        let err = fabric.get_device(0, NetDevClass::ETHER, "ofi+tcp").unwrap_err();
        assert!(matches!(err, AgentError::NoSuitableInterface { .. }));
    }

    #[test]
    fn add_appends_to_node() {
        let fabric = NumaFabric::with_resolver(Arc::new(AllUp));
        fabric.add(eth("eth0", 3)).unwrap();
        fabric.add(eth("eth1", 3)).unwrap();
        assert_eq!(fabric.num_devices(3), 2);
        let names: Vec<String> = fabric.snapshot()[&3].iter().map(|f| f.name.clone()).collect();
        assert_eq!(names, vec!["eth0", "eth1"]);
    }

    #[test]
    fn find_device_checks_domain_and_provider() {
        let fabric = NumaFabric::from_interfaces(
            [eth("eth0", 0).with_domain("mlx5_0")],
            Arc::new(AllUp),
        );
        assert!(fabric.find_device("eth0", Some("mlx5_0"), "ofi+tcp").is_ok());
        assert!(fabric.find_device("eth0", Some("mlx5_1"), "ofi+tcp").unwrap_err().is_not_found());
        assert!(matches!(
            fabric.find_device("eth0", None, "ofi+verbs"),
            Err(AgentError::ProviderMismatch { .. })
        ));
    }
}
