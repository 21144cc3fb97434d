//! Platform collaborators the tunnel engine is built against.
//!
//! Everything the engine needs from the host OS goes through these traits:
//! building the virtual interface, discovering the active network's DNS
//! servers, resolving application policies and keeping upstream sockets out
//! of the tunnel. [`crate::tunnel::linux`] provides the Linux backend.

use std::collections::BTreeSet;
use std::io;
use std::net::{IpAddr, UdpSocket};
use std::os::fd::OwnedFd;

use crate::config::{AppSettings, TunnelSettings};
use crate::error::TunnelError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressFamily {
    Ipv4,
    Ipv6,
}

/// Step-by-step description of a virtual interface, consumed by `establish`.
pub trait VpnBuilder {
    /// Assign a local address. Fails when the platform rejects the prefix.
    fn add_address(&mut self, address: IpAddr, prefix_len: u8) -> Result<(), TunnelError>;

    /// Route `address/prefix_len` into the interface.
    fn add_route(&mut self, address: IpAddr, prefix_len: u8) -> Result<(), TunnelError>;

    /// Announce `address` as a DNS server of the interface.
    fn add_dns_server(&mut self, address: IpAddr) -> Result<(), TunnelError>;

    /// Capture only the listed applications.
    fn add_allowed_application(&mut self, app: &str) -> Result<(), TunnelError>;

    /// Let the listed application bypass the interface.
    fn add_disallowed_application(&mut self, app: &str) -> Result<(), TunnelError>;

    fn set_blocking(&mut self, blocking: bool);

    fn allow_family(&mut self, family: AddressFamily);

    fn set_metered(&mut self, metered: bool);

    /// Bring the interface up and hand over its descriptor.
    ///
    /// [`TunnelError::EstablishRefused`] means the platform will not grant an
    /// interface at all; retrying cannot help.
    fn establish(self) -> Result<OwnedFd, TunnelError>;
}

/// Information about the currently active network.
pub trait NetworkInfo {
    /// DNS servers of the active network, in preference order.
    fn dns_servers(&self) -> io::Result<Vec<IpAddr>>;
}

/// Applications captured by the tunnel and applications bypassing it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AppSets {
    pub on_vpn: BTreeSet<String>,
    pub not_on_vpn: BTreeSet<String>,
}

/// Resolves the configured application identifiers into two disjoint sets.
pub trait AppResolver {
    fn resolve_apps(&self, settings: &AppSettings) -> AppSets {
        let not_on_vpn: BTreeSet<String> = settings.not_on_vpn.iter().cloned().collect();
        let on_vpn = settings
            .on_vpn
            .iter()
            .filter(|app| !not_on_vpn.contains(*app))
            .cloned()
            .collect();
        AppSets { on_vpn, not_on_vpn }
    }
}

/// Keeps upstream sockets from being routed back into the tunnel.
pub trait SocketProtector {
    /// Returns false when the socket could not be protected.
    fn protect(&self, socket: &UdpSocket) -> bool;
}

/// Everything the supervisor needs from the host.
pub trait Platform: NetworkInfo + AppResolver + SocketProtector + Send + Sync + 'static {
    type Builder: VpnBuilder;

    fn new_builder(&self, settings: &TunnelSettings) -> Self::Builder;
}
