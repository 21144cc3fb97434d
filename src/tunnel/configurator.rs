//! Virtual interface configuration.
//!
//! Each configuration epoch picks a local prefix, gives every upstream DNS
//! server an alias inside it and routes only those aliases into the tunnel.
//! Queries sent to alias `prefix.{index + 2}` are forwarded to the upstream
//! with that index.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::os::fd::OwnedFd;

use tracing::{debug, info, warn};

use super::platform::{AddressFamily, Platform, VpnBuilder};
use crate::config::{AppMode, Config};
use crate::error::TunnelError;

/// Candidate IPv4 prefixes, in preference order. All /24.
const IPV4_PREFIXES: [Ipv4Addr; 3] = [
    Ipv4Addr::new(192, 0, 2, 0),
    Ipv4Addr::new(198, 51, 100, 0),
    Ipv4Addr::new(203, 0, 113, 0),
];
const IPV4_PREFIX_LEN: u8 = 24;

const IPV6_PREFIX: Ipv6Addr = Ipv6Addr::new(0x2001, 0xdb8, 0, 0, 0, 0, 0, 0);
const IPV6_PREFIX_LEN: u8 = 120;

/// Host part of the interface's own address.
const LOCAL_HOST: u8 = 1;
/// Alias host part of the upstream with index 0.
const ALIAS_OFFSET: u8 = 2;
/// Highest alias host part (`.255` is the IPv4 broadcast address).
const MAX_ALIAS_HOST: u8 = 254;

/// One upstream DNS server of the current epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpstreamServer {
    pub address: IpAddr,
    pub index: usize,
}

/// Upstream servers of one epoch and the alias translation over them.
#[derive(Debug, Clone, Default)]
pub struct UpstreamTable {
    servers: Vec<UpstreamServer>,
    aliased: bool,
}

impl UpstreamTable {
    /// Table whose servers are reached through alias addresses.
    pub fn aliased(servers: Vec<UpstreamServer>) -> Self {
        Self {
            servers,
            aliased: true,
        }
    }

    /// Table whose servers are addressed directly by the clients.
    pub fn direct(servers: Vec<UpstreamServer>) -> Self {
        Self {
            servers,
            aliased: false,
        }
    }

    pub fn servers(&self) -> &[UpstreamServer] {
        &self.servers
    }

    pub fn is_aliased(&self) -> bool {
        self.aliased
    }

    /// Real destination of a packet sent to `destination`.
    ///
    /// Aliases are translated by their last byte; unknown aliases yield
    /// `None`. Without aliasing the destination is already the real one.
    pub fn translate(&self, destination: IpAddr) -> Option<IpAddr> {
        if !self.aliased {
            return Some(destination);
        }

        let host = match destination {
            IpAddr::V4(address) => address.octets()[3],
            IpAddr::V6(address) => address.octets()[15],
        };
        let index = host.checked_sub(ALIAS_OFFSET)?;
        self.servers
            .get(usize::from(index))
            .map(|server| server.address)
    }
}

/// A live virtual interface and its upstream table.
#[derive(Debug)]
pub struct TunnelConfiguration {
    pub interface: OwnedFd,
    pub upstreams: UpstreamTable,
    /// Address pinged by the watchdog: the last upstream added, as seen from
    /// inside the tunnel.
    pub watchdog_target: Option<IpAddr>,
}

/// Build the virtual interface described by `config`.
///
/// Fails with a recoverable error when the active network has no DNS
/// servers, and with [`TunnelError::EstablishRefused`] when the platform
/// will not grant an interface.
pub fn configure<P: Platform + ?Sized>(
    platform: &P,
    config: &Config,
) -> Result<TunnelConfiguration, TunnelError> {
    let discovered: Vec<IpAddr> = platform
        .dns_servers()?
        .into_iter()
        .filter(|address| {
            let reserved = is_reserved(*address);
            if reserved {
                debug!("Ignoring discovered DNS server {address} inside the tunnel prefixes");
            }
            !reserved
        })
        .collect();
    if discovered.is_empty() {
        return Err(TunnelError::NoDnsServers);
    }

    let candidates: Vec<IpAddr> = config.enabled_dns_servers().chain(discovered).collect();
    let mut builder = platform.new_builder(&config.tunnel);

    let ipv4_prefix = choose_ipv4_prefix(&mut builder)?;
    let ipv6_prefix = if config.ipv6_support && candidates.iter().any(IpAddr::is_ipv6) {
        let local = ipv6_host(IPV6_PREFIX, LOCAL_HOST);
        match builder.add_address(IpAddr::V6(local), IPV6_PREFIX_LEN) {
            Ok(()) => Some(IPV6_PREFIX),
            Err(err) if err.is_fatal() => return Err(err),
            Err(err) => {
                warn!("IPv6 prefix rejected, skipping IPv6 upstreams: {err}");
                None
            }
        }
    } else {
        None
    };

    let (upstreams, watchdog_target) = match ipv4_prefix {
        Some(prefix) => add_aliased_upstreams(&mut builder, &candidates, prefix, ipv6_prefix)?,
        None => {
            warn!("No IPv4 prefix accepted, forwarding to upstream addresses directly");
            add_direct_upstreams(&mut builder, &candidates, config.ipv6_support)?
        }
    };

    if upstreams.servers().is_empty() {
        return Err(TunnelError::NoDnsServers);
    }

    apply_app_policy(platform, &mut builder, config);

    builder.set_blocking(true);
    builder.allow_family(AddressFamily::Ipv4);
    builder.allow_family(AddressFamily::Ipv6);
    builder.set_metered(false);

    let interface = builder.establish()?;
    info!(
        "Tunnel configured with {} upstream DNS servers",
        upstreams.servers().len()
    );

    Ok(TunnelConfiguration {
        interface,
        upstreams,
        watchdog_target,
    })
}

/// First IPv4 prefix the platform accepts. Only fatal errors are returned;
/// other rejections move on to the next candidate.
fn choose_ipv4_prefix<B: VpnBuilder>(builder: &mut B) -> Result<Option<Ipv4Addr>, TunnelError> {
    for prefix in IPV4_PREFIXES {
        let local = ipv4_host(prefix, LOCAL_HOST);
        match builder.add_address(IpAddr::V4(local), IPV4_PREFIX_LEN) {
            Ok(()) => {
                debug!("Using IPv4 prefix {prefix}/{IPV4_PREFIX_LEN}");
                return Ok(Some(prefix));
            }
            Err(err) if err.is_fatal() => return Err(err),
            Err(err) => debug!("IPv4 prefix {prefix} rejected: {err}"),
        }
    }
    Ok(None)
}

fn add_aliased_upstreams<B: VpnBuilder>(
    builder: &mut B,
    candidates: &[IpAddr],
    ipv4_prefix: Ipv4Addr,
    ipv6_prefix: Option<Ipv6Addr>,
) -> Result<(UpstreamTable, Option<IpAddr>), TunnelError> {
    let mut servers = Vec::with_capacity(candidates.len());
    let mut last_alias = None;

    for &address in candidates {
        let index = servers.len();
        let Some(host) = u8::try_from(index)
            .ok()
            .and_then(|index| index.checked_add(ALIAS_OFFSET))
            .filter(|host| *host <= MAX_ALIAS_HOST)
        else {
            warn!("Too many upstream DNS servers, ignoring {address}");
            continue;
        };

        let (alias, prefix_len) = match address {
            IpAddr::V4(_) => (IpAddr::V4(ipv4_host(ipv4_prefix, host)), 32),
            IpAddr::V6(_) => match ipv6_prefix {
                Some(prefix) => (IpAddr::V6(ipv6_host(prefix, host)), 128),
                None => {
                    info!("Skipping IPv6 upstream {address}, no IPv6 prefix this time");
                    continue;
                }
            },
        };

        builder.add_dns_server(alias)?;
        builder.add_route(alias, prefix_len)?;
        debug!("Upstream {address} aliased as {alias}");

        servers.push(UpstreamServer { address, index });
        last_alias = Some(alias);
    }

    Ok((UpstreamTable::aliased(servers), last_alias))
}

fn add_direct_upstreams<B: VpnBuilder>(
    builder: &mut B,
    candidates: &[IpAddr],
    ipv6_support: bool,
) -> Result<(UpstreamTable, Option<IpAddr>), TunnelError> {
    let mut servers = Vec::with_capacity(candidates.len());

    for &address in candidates {
        if address.is_ipv6() && !ipv6_support {
            info!("Skipping IPv6 upstream {address}, IPv6 support disabled");
            continue;
        }
        let prefix_len = if address.is_ipv4() { 32 } else { 128 };
        builder.add_dns_server(address)?;
        builder.add_route(address, prefix_len)?;
        servers.push(UpstreamServer {
            address,
            index: servers.len(),
        });
    }

    let last = servers.last().map(|server| server.address);
    Ok((UpstreamTable::direct(servers), last))
}

fn apply_app_policy<P: Platform + ?Sized>(platform: &P, builder: &mut P::Builder, config: &Config) {
    let apps = platform.resolve_apps(&config.apps);

    match config.apps.default_mode {
        AppMode::NotOnVpn => {
            for app in &apps.on_vpn {
                if let Err(err) = builder.add_allowed_application(app) {
                    warn!("Cannot route {app} through the tunnel: {err}");
                }
            }
        }
        AppMode::OnVpn => {
            for app in &apps.not_on_vpn {
                if let Err(err) = builder.add_disallowed_application(app) {
                    warn!("Cannot exclude {app} from the tunnel: {err}");
                }
            }
        }
    }
}

/// Whether `address` lies inside one of the prefixes the tunnel may use.
fn is_reserved(address: IpAddr) -> bool {
    match address {
        IpAddr::V4(address) => IPV4_PREFIXES
            .iter()
            .any(|prefix| address.octets()[..3] == prefix.octets()[..3]),
        IpAddr::V6(address) => address.octets()[..15] == IPV6_PREFIX.octets()[..15],
    }
}

fn ipv4_host(prefix: Ipv4Addr, host: u8) -> Ipv4Addr {
    let [a, b, c, _] = prefix.octets();
    Ipv4Addr::new(a, b, c, host)
}

fn ipv6_host(prefix: Ipv6Addr, host: u8) -> Ipv6Addr {
    let mut octets = prefix.octets();
    octets[15] = host;
    Ipv6Addr::from(octets)
}
