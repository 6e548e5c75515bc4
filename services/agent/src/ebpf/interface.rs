//! Network interface discovery

use nix::sys::socket::SockaddrLike;
use sipsieve_common::error::{Error, Result};
use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use tracing::debug;

/// Network interface information
#[derive(Debug, Clone)]
pub struct NetworkInterface {
    pub name: String,
    pub index: u32,
    pub ipv4_addresses: Vec<Ipv4Addr>,
    pub is_up: bool,
    pub is_loopback: bool,
}

impl NetworkInterface {
    /// Check if this interface is suitable for XDP
    pub fn supports_xdp(&self) -> bool {
        // Loopback doesn't support XDP well
        if self.is_loopback {
            return false;
        }

        if !self.is_up {
            return false;
        }

        // Skip virtual interfaces (usually)
        let virtual_prefixes = ["veth", "docker", "br-", "virbr", "cni", "flannel"];
        !virtual_prefixes
            .iter()
            .any(|prefix| self.name.starts_with(prefix))
    }
}

/// Discover all network interfaces on the system
pub fn discover_interfaces() -> Result<Vec<NetworkInterface>> {
    let addrs = nix::ifaddrs::getifaddrs()
        .map_err(|e| Error::Internal(format!("Failed to get interfaces: {}", e)))?;

    // getifaddrs yields one entry per address; fold them per interface.
    let mut interfaces: BTreeMap<String, NetworkInterface> = BTreeMap::new();

    for ifaddr in addrs {
        let name = ifaddr.interface_name.clone();

        if !interfaces.contains_key(&name) {
            let index = nix::net::if_::if_nametoindex(name.as_str())
                .map_err(|e| Error::Internal(format!("Failed to get interface index: {}", e)))?;

            let flags = ifaddr.flags;
            interfaces.insert(
                name.clone(),
                NetworkInterface {
                    name: name.clone(),
                    index,
                    ipv4_addresses: Vec::new(),
                    is_up: flags.contains(nix::net::if_::InterfaceFlags::IFF_UP),
                    is_loopback: flags.contains(nix::net::if_::InterfaceFlags::IFF_LOOPBACK),
                },
            );
        }

        let ipv4 = ifaddr.address.and_then(|addr| match addr.family() {
            Some(nix::sys::socket::AddressFamily::Inet) => addr.as_sockaddr_in().map(|sin| sin.ip()),
            _ => None,
        });

        if let (Some(ip), Some(iface)) = (ipv4, interfaces.get_mut(&name)) {
            iface.ipv4_addresses.push(ip);
        }
    }

    for iface in interfaces.values() {
        debug!("Discovered interface: {:?}", iface);
    }

    Ok(interfaces.into_values().collect())
}

/// Get a specific interface by name
pub fn get_interface(name: &str) -> Result<NetworkInterface> {
    let interfaces = discover_interfaces()?;
    interfaces
        .into_iter()
        .find(|i| i.name == name)
        .ok_or_else(|| Error::not_found("Interface", name))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn iface(name: &str) -> NetworkInterface {
        NetworkInterface {
            name: name.to_string(),
            index: 2,
            ipv4_addresses: vec![Ipv4Addr::new(192, 0, 2, 10)],
            is_up: true,
            is_loopback: false,
        }
    }

    #[test]
    fn test_discover_interfaces() {
        let interfaces = discover_interfaces().unwrap();
        // Should at least have loopback
        assert!(!interfaces.is_empty());
    }

    #[test]
    fn test_missing_interface() {
        let err = get_interface("sipsieve-does-not-exist0").unwrap_err();
        assert!(matches!(err, Error::NotFound { .. }));
    }

    #[test]
    fn test_supports_xdp() {
        assert!(iface("eth0").supports_xdp());
        assert!(!iface("veth12ab").supports_xdp());
        assert!(!iface("docker0").supports_xdp());

        let mut down = iface("eth1");
        down.is_up = false;
        assert!(!down.supports_xdp());

        let mut lo = iface("lo");
        lo.is_loopback = true;
        assert!(!lo.supports_xdp());
    }
}
