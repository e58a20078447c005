//! System-wide VPN detection
//!
//! Best-effort UI signal: is *any* VPN-like interface present on the host,
//! ours or not. Never used for lifecycle decisions.

use sysinfo::Networks;

/// Interface name prefixes of tunnel, point-to-point and IPsec families
const VPN_INTERFACE_PREFIXES: &[&str] = &["utun", "tun", "tap", "ppp", "ipsec", "wg"];

/// Kernel devices that share a prefix above but are always present.
/// `tunl0` is the Linux IP-in-IP fallback device.
const NON_VPN_INTERFACE_PREFIXES: &[&str] = &["tunl"];

/// Check if an interface name looks like a VPN interface
pub fn is_vpn_interface(name: &str) -> bool {
    let name = name.to_ascii_lowercase();
    if NON_VPN_INTERFACE_PREFIXES.iter().any(|prefix| name.starts_with(prefix)) {
        return false;
    }
    VPN_INTERFACE_PREFIXES.iter().any(|prefix| name.starts_with(prefix))
}

/// Source of active network interface names
pub trait InterfaceProbe: Send + Sync {
    fn interface_names(&self) -> Vec<String>;

    /// Any VPN-like interface present
    fn any_vpn_active(&self) -> bool {
        self.interface_names().iter().any(|name| is_vpn_interface(name))
    }
}

/// Probe backed by the OS interface list
#[derive(Debug, Default)]
pub struct SystemInterfaceProbe;

impl InterfaceProbe for SystemInterfaceProbe {
    fn interface_names(&self) -> Vec<String> {
        let networks = Networks::new_with_refreshed_list();
        networks.list().keys().cloned().collect()
    }
}

/// Probe with a fixed interface list
#[derive(Debug, Default, Clone)]
pub struct StaticInterfaceProbe {
    names: Vec<String>,
}

impl StaticInterfaceProbe {
    pub fn new<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            names: names.into_iter().map(Into::into).collect(),
        }
    }
}

impl InterfaceProbe for StaticInterfaceProbe {
    fn interface_names(&self) -> Vec<String> {
        self.names.clone()
    }
}
