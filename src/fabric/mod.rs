//! Fabric interface model and NUMA-aware device selection.
//!
//! - [`FabricInterface`] — one network device usable for high-performance
//!   transport, tagged with a [`NetDevClass`] and the providers it supports.
//! - [`NumaFabric`] — NUMA node → interfaces, with per-node round robin and
//!   cross-node fallback. See [`NumaFabric::get_device`].
//! - [`InterfaceResolver`] — liveness check used before a scanned interface
//!   is handed out.
//! - [`FabricScanner`] — the hardware probe whose result the agent caches.

pub mod netif;
pub mod scan;
pub mod topology;

pub use netif::{InterfaceResolver, SystemResolver};
pub use scan::{FabricScanner, InterfaceFilter, SystemScanner};
pub use topology::NumaFabric;

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Hardware type of a network device, as reported by the kernel (`ARPHRD_*`).
///
/// [`NetDevClass::ANY`] is a sentinel that never comes from the kernel: it
/// marks operator-declared interfaces and, when requested, matches every
/// class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NetDevClass(pub u32);

impl NetDevClass {
    pub const NETROM: Self = Self(0);
    pub const ETHER: Self = Self(1);
    pub const EETHER: Self = Self(2);
    pub const AX25: Self = Self(3);
    pub const PRONET: Self = Self(4);
    pub const CHAOS: Self = Self(5);
    pub const IEEE802: Self = Self(6);
    pub const ARCNET: Self = Self(7);
    pub const APPLETLK: Self = Self(8);
    pub const DLCI: Self = Self(15);
    pub const ATM: Self = Self(19);
    pub const METRICOM: Self = Self(23);
    pub const IEEE1394: Self = Self(24);
    pub const EUI64: Self = Self(27);
    pub const INFINIBAND: Self = Self(32);
    pub const LOOPBACK: Self = Self(772);
    pub const ANY: Self = Self(0xFFFF_FFFF);

    fn name(self) -> Option<&'static str> {
        let name = match self {
            Self::NETROM => "NETROM",
            Self::ETHER => "ETHER",
            Self::EETHER => "EETHER",
            Self::AX25 => "AX25",
            Self::PRONET => "PRONET",
            Self::CHAOS => "CHAOS",
            Self::IEEE802 => "IEEE802",
            Self::ARCNET => "ARCNET",
            Self::APPLETLK => "APPLETLK",
            Self::DLCI => "DLCI",
            Self::ATM => "ATM",
            Self::METRICOM => "METRICOM",
            Self::IEEE1394 => "IEEE1394",
            Self::EUI64 => "EUI64",
            Self::INFINIBAND => "INFINIBAND",
            Self::LOOPBACK => "LOOPBACK",
            Self::ANY => "ANY",
            _ => return None,
        };
        Some(name)
    }
}

impl fmt::Display for NetDevClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.name() {
            Some(name) => f.write_str(name),
            None => write!(f, "UNKNOWN ({:#x})", self.0),
        }
    }
}

impl std::str::FromStr for NetDevClass {
    type Err = crate::AgentError;

    /// Parses a class name (case-insensitive) or a raw numeric value.
    fn from_str(s: &str) -> crate::Result<Self> {
        if let Ok(raw) = s.parse::<u32>() {
            return Ok(Self(raw));
        }
        let upper = s.to_ascii_uppercase();
        [
            Self::NETROM,
            Self::ETHER,
            Self::EETHER,
            Self::AX25,
            Self::PRONET,
            Self::CHAOS,
            Self::IEEE802,
            Self::ARCNET,
            Self::APPLETLK,
            Self::DLCI,
            Self::ATM,
            Self::METRICOM,
            Self::IEEE1394,
            Self::EUI64,
            Self::INFINIBAND,
            Self::LOOPBACK,
            Self::ANY,
        ]
        .into_iter()
        .find(|class| class.name() == Some(upper.as_str()))
        .ok_or_else(|| crate::AgentError::InvalidInput(format!("unknown device class {s:?}")))
    }
}

/// A network device usable for fabric traffic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FabricInterface {
    /// OS-visible interface name (e.g. `eth0`, `ib0`).
    pub name: String,
    /// Optional hardware domain qualifier (e.g. `mlx5_0`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub domain: Option<String>,
    /// NUMA node the device is attached to.
    pub numa_node: u32,
    /// Hardware type; [`NetDevClass::ANY`] for operator-declared devices.
    pub class: NetDevClass,
    /// Transport providers known to work over this device.
    #[serde(default)]
    pub providers: BTreeSet<String>,
}

impl FabricInterface {
    /// A scanned interface on NUMA node 0 with no providers.
    pub fn new(name: impl Into<String>, class: NetDevClass) -> Self {
        Self {
            name: name.into(),
            domain: None,
            numa_node: 0,
            class,
            providers: BTreeSet::new(),
        }
    }

    /// An operator-declared interface. Matches any class and provider and is
    /// never liveness-checked.
    pub fn manual(name: impl Into<String>, numa_node: u32) -> Self {
        Self {
            numa_node,
            ..Self::new(name, NetDevClass::ANY)
        }
    }

    pub fn with_domain(mut self, domain: impl Into<String>) -> Self {
        self.domain = Some(domain.into());
        self
    }

    pub fn with_numa_node(mut self, numa_node: u32) -> Self {
        self.numa_node = numa_node;
        self
    }

    pub fn with_providers<I, S>(mut self, providers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.providers.extend(providers.into_iter().map(Into::into));
        self
    }

    /// Whether this entry came from configuration rather than a scan.
    pub fn is_manual(&self) -> bool {
        self.class == NetDevClass::ANY
    }

    /// Whether the device can carry `provider` traffic.
    pub fn has_provider(&self, provider: &str) -> bool {
        self.is_manual() || self.providers.contains(provider)
    }

    /// Whether the device satisfies a class/provider request.
    pub(crate) fn matches(&self, class: NetDevClass, provider: &str) -> bool {
        let class_ok = class == NetDevClass::ANY || self.is_manual() || self.class == class;
        class_ok && self.has_provider(provider)
    }
}

impl fmt::Display for FabricInterface {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.name.is_empty() {
            f.write_str("<no name>")?;
        } else {
            f.write_str(&self.name)?;
        }
        if let Some(domain) = &self.domain {
            write!(f, " (domain: {domain})")?;
        }
        if self.providers.is_empty() {
            f.write_str(" (providers: none)")
        } else {
            let providers: Vec<&str> = self.providers.iter().map(String::as_str).collect();
            write!(f, " (providers: {})", providers.join(", "))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn class_names() {
        assert_eq!(NetDevClass::ETHER.to_string(), "ETHER");
        assert_eq!(NetDevClass::INFINIBAND.to_string(), "INFINIBAND");
        assert_eq!(NetDevClass::LOOPBACK.to_string(), "LOOPBACK");
        assert_eq!(NetDevClass::ANY.to_string(), "ANY");
        assert_eq!(NetDevClass(0xFFFF_FFFE).to_string(), "UNKNOWN (0xfffffffe)");
    }

    #[test]
    fn class_parse() {
        assert_eq!("infiniband".parse::<NetDevClass>().unwrap(), NetDevClass::INFINIBAND);
        assert_eq!("32".parse::<NetDevClass>().unwrap(), NetDevClass::INFINIBAND);
        assert!("token-ring".parse::<NetDevClass>().is_err());
    }

    #[test]
    fn display_empty() {
        let fi = FabricInterface::new("", NetDevClass::ETHER);
        assert_eq!(fi.to_string(), "<no name> (providers: none)");
    }

    #[test]
    fn display_with_domain_and_providers() {
        let fi = FabricInterface::new("test0", NetDevClass::INFINIBAND)
            .with_domain("mlx5_0")
            .with_providers(["p2", "p1"]);
        assert_eq!(fi.to_string(), "test0 (domain: mlx5_0) (providers: p1, p2)");
    }

    #[test]
    fn manual_matches_anything() {
        let fi = FabricInterface::manual("eth7", 1);
        assert!(fi.is_manual());
        assert!(fi.matches(NetDevClass::INFINIBAND, "ofi+verbs"));
        assert!(fi.matches(NetDevClass::ETHER, "ofi+tcp"));
    }

    #[test]
    fn scanned_requires_class_and_provider() {
        let fi = FabricInterface::new("ib0", NetDevClass::INFINIBAND).with_providers(["ofi+verbs"]);
        assert!(fi.matches(NetDevClass::INFINIBAND, "ofi+verbs"));
        assert!(fi.matches(NetDevClass::ANY, "ofi+verbs"));
        assert!(!fi.matches(NetDevClass::ETHER, "ofi+verbs"));
        assert!(!fi.matches(NetDevClass::INFINIBAND, "ofi+tcp"));
    }
}
