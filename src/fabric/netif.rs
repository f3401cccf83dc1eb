//! Network interface liveness checks.

use std::collections::BTreeSet;
use std::net::{IpAddr, SocketAddrV4, SocketAddrV6};

use nix::ifaddrs::getifaddrs;
use nix::net::if_::InterfaceFlags;

use crate::{AgentError, Result};

/// Resolves the IP addresses currently bound to a network interface.
///
/// [`NumaFabric`](super::NumaFabric) calls this for every scanned candidate
/// before handing it out; an interface with no usable address is skipped.
pub trait InterfaceResolver: Send + Sync {
    /// Addresses bound to `name`. Errors if the interface does not exist.
    fn addresses(&self, name: &str) -> Result<Vec<IpAddr>>;
}

/// [`InterfaceResolver`] backed by `getifaddrs(3)`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemResolver;

impl InterfaceResolver for SystemResolver {
    fn addresses(&self, name: &str) -> Result<Vec<IpAddr>> {
        let mut seen = false;
        let mut addrs = Vec::new();
        for ifa in getifaddrs()? {
            if ifa.interface_name != name {
                continue;
            }
            seen = true;
            let Some(storage) = ifa.address else {
                continue;
            };
            if let Some(sin) = storage.as_sockaddr_in() {
                addrs.push(IpAddr::V4(*SocketAddrV4::from(*sin).ip()));
            } else if let Some(sin6) = storage.as_sockaddr_in6() {
                addrs.push(IpAddr::V6(*SocketAddrV6::from(*sin6).ip()));
            }
        }
        if !seen {
            return Err(AgentError::DeviceNotFound(name.to_string()));
        }
        Ok(addrs)
    }
}

/// Names of all non-loopback interfaces that are up.
pub(crate) fn active_interface_names() -> Result<BTreeSet<String>> {
    Ok(getifaddrs()?
        .filter(|ifa| {
            ifa.flags.contains(InterfaceFlags::IFF_UP)
                && !ifa.flags.contains(InterfaceFlags::IFF_LOOPBACK)
        })
        .map(|ifa| ifa.interface_name)
        .collect())
}

/// Checks that `name` has at least one routable address.
pub(crate) fn validate_interface(resolver: &dyn InterfaceResolver, name: &str) -> Result<()> {
    let addrs = resolver.addresses(name)?;
    if addrs.iter().any(|addr| !addr.is_unspecified()) {
        Ok(())
    } else {
        Err(AgentError::InvalidInput(format!(
            "interface {name:?} has no usable address"
        )))
    }
}
