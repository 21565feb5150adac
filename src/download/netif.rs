use std::{
    net::{Ipv4Addr, Ipv6Addr},
    path::Path,
};

use anyhow::{Context, Error};

const SYS_CLASS_NET: &str = "/sys/class/net";

/// Reads the kernel's operational state for `interface`, e.g. "up" or "down".
pub fn operstate(interface: &str) -> Result<String, Error> {
    operstate_in(Path::new(SYS_CLASS_NET), interface)
}

fn operstate_in(sys_class_net: &Path, interface: &str) -> Result<String, Error> {
    let path = sys_class_net.join(interface).join("operstate");
    hostutils::files::read_file_trim(&path)
        .context(format!("Failed to read operstate of '{interface}'"))
}

/// Addresses assigned to one interface, per family, in enumeration order.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct InterfaceAddresses {
    pub v4: Vec<Ipv4Addr>,
    pub v6: Vec<Ipv6Addr>,
}

/// Enumerates the addresses currently assigned to `interface`.
pub fn addresses(interface: &str) -> Result<InterfaceAddresses, Error> {
    let mut result = InterfaceAddresses::default();
    let addrs = nix::ifaddrs::getifaddrs().context("Failed to enumerate interface addresses")?;
    for ifaddr in addrs {
        if ifaddr.interface_name != interface {
            continue;
        }
        let Some(address) = ifaddr.address else {
            continue;
        };
        if let Some(sin) = address.as_sockaddr_in() {
            result.v4.push(sin.ip());
        } else if let Some(sin6) = address.as_sockaddr_in6() {
            result.v6.push(sin6.ip());
        }
    }
    Ok(result)
}

/// fe80::/10, never usable as an unscoped local binding.
pub fn is_link_local(addr: &Ipv6Addr) -> bool {
    (addr.segments()[0] & 0xffc0) == 0xfe80
}
