//! Linux backend: a TUN device configured with iproute2.
//!
//! The device is created on first use by the builder and lives as long as
//! its descriptor; closing the descriptor removes the link along with its
//! addresses and routes. Requires `CAP_NET_ADMIN`.

use std::ffi::CStr;
use std::io;
use std::net::{IpAddr, UdpSocket};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::path::{Path, PathBuf};
use std::process::Command;

use libc::{IFF_NO_PI, IFF_TUN, O_CLOEXEC, O_RDWR, c_char, c_short, c_void};
use tracing::{debug, info, warn};

use super::platform::{AddressFamily, AppResolver, NetworkInfo, Platform, SocketProtector, VpnBuilder};
use crate::config::TunnelSettings;
use crate::error::TunnelError;

/// TUNSETIFF ioctl number.
const TUNSETIFF: libc::c_ulong = 0x400454ca;

/// Resolver files checked in order. The systemd-resolved one lists the real
/// upstream servers instead of the local stub.
const RESOLV_CONF_PATHS: [&str; 2] = ["/run/systemd/resolve/resolv.conf", "/etc/resolv.conf"];

#[repr(C)]
struct IfReq {
    ifr_name: [c_char; libc::IFNAMSIZ],
    ifr_flags: c_short,
    _pad: [u8; 22],
}

/// Nameservers listed in a `resolv.conf` file.
#[derive(Debug, Clone)]
pub struct ResolvConf {
    path: PathBuf,
}

impl ResolvConf {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Non-loopback `nameserver` entries of `content`, in file order.
    pub fn parse(content: &str) -> Vec<IpAddr> {
        content
            .lines()
            .filter_map(|line| {
                let mut fields = line.split_whitespace();
                match fields.next() {
                    Some("nameserver") => fields.next(),
                    _ => None,
                }
            })
            .filter_map(|value| value.parse::<IpAddr>().ok())
            .filter(|address| !address.is_loopback() && !address.is_unspecified())
            .collect()
    }
}

impl NetworkInfo for ResolvConf {
    fn dns_servers(&self) -> io::Result<Vec<IpAddr>> {
        let content = std::fs::read_to_string(&self.path)?;
        Ok(Self::parse(&content))
    }
}

/// Host platform backed by a TUN device and the system resolver files.
#[derive(Debug, Clone)]
pub struct LinuxPlatform {
    sources: Vec<ResolvConf>,
}

impl Default for LinuxPlatform {
    fn default() -> Self {
        Self::new()
    }
}

impl LinuxPlatform {
    pub fn new() -> Self {
        Self::with_sources(RESOLV_CONF_PATHS.into_iter().map(ResolvConf::new).collect())
    }

    /// Discover DNS servers from `sources`, first non-empty one wins.
    pub fn with_sources(sources: Vec<ResolvConf>) -> Self {
        Self { sources }
    }
}

impl NetworkInfo for LinuxPlatform {
    fn dns_servers(&self) -> io::Result<Vec<IpAddr>> {
        for source in &self.sources {
            match source.dns_servers() {
                Ok(servers) if !servers.is_empty() => {
                    debug!(
                        "Found {} DNS servers in {}",
                        servers.len(),
                        source.path().display()
                    );
                    return Ok(servers);
                }
                Ok(_) => {}
                Err(err) if err.kind() == io::ErrorKind::NotFound => {}
                Err(err) => warn!("Failed to read {}: {err}", source.path().display()),
            }
        }
        Ok(Vec::new())
    }
}

impl AppResolver for LinuxPlatform {}

impl SocketProtector for LinuxPlatform {
    /// Only alias addresses are routed into the device, so upstream sockets
    /// already leave through the regular uplink.
    fn protect(&self, _socket: &UdpSocket) -> bool {
        true
    }
}

impl Platform for LinuxPlatform {
    type Builder = LinuxBuilder;

    fn new_builder(&self, settings: &TunnelSettings) -> LinuxBuilder {
        LinuxBuilder::new(settings)
    }
}

/// Builds a TUN interface step by step.
#[derive(Debug)]
pub struct LinuxBuilder {
    requested_name: String,
    mtu: u16,
    device: Option<TunDevice>,
    dns_servers: Vec<IpAddr>,
    blocking: bool,
}

#[derive(Debug)]
struct TunDevice {
    fd: OwnedFd,
    name: String,
}

impl LinuxBuilder {
    pub fn new(settings: &TunnelSettings) -> Self {
        Self {
            requested_name: settings.name.clone(),
            mtu: settings.mtu,
            device: None,
            dns_servers: Vec::new(),
            blocking: true,
        }
    }

    fn device(&mut self) -> Result<&TunDevice, TunnelError> {
        if self.device.is_none() {
            let device = open_tun(&self.requested_name)?;
            ip(&[
                "link",
                "set",
                "dev",
                &device.name,
                "mtu",
                &self.mtu.to_string(),
                "up",
            ])
            .map_err(TunnelError::Interface)?;
            info!("Created TUN device {}", device.name);
            self.device = Some(device);
        }
        self.device
            .as_ref()
            .ok_or_else(|| TunnelError::Interface("TUN device unavailable".into()))
    }

    fn configure_dns(&self, name: &str) {
        if self.dns_servers.is_empty() {
            return;
        }

        let servers: Vec<String> = self.dns_servers.iter().map(ToString::to_string).collect();
        let mut dns_args = vec!["dns", name];
        dns_args.extend(servers.iter().map(String::as_str));

        let result = run("resolvectl", &dns_args)
            .and_then(|()| run("resolvectl", &["domain", name, "~."]));
        match result {
            Ok(()) => info!("DNS of {name} pointed at {}", servers.join(", ")),
            Err(err) => warn!("Failed to point system DNS at {name}: {err}"),
        }
    }
}

impl VpnBuilder for LinuxBuilder {
    fn add_address(&mut self, address: IpAddr, prefix_len: u8) -> Result<(), TunnelError> {
        let name = self.device()?.name.clone();
        let cidr = format!("{address}/{prefix_len}");
        let mut args = vec!["addr", "add", cidr.as_str(), "dev", name.as_str()];
        if address.is_ipv6() {
            args.push("nodad");
        }
        ip(&args).map_err(|reason| TunnelError::AddressRejected {
            address,
            prefix_len,
            reason,
        })
    }

    fn add_route(&mut self, address: IpAddr, prefix_len: u8) -> Result<(), TunnelError> {
        let name = self.device()?.name.clone();
        let cidr = format!("{address}/{prefix_len}");
        ip(&["route", "replace", &cidr, "dev", &name]).map_err(TunnelError::Interface)
    }

    fn add_dns_server(&mut self, address: IpAddr) -> Result<(), TunnelError> {
        self.dns_servers.push(address);
        Ok(())
    }

    fn add_allowed_application(&mut self, app: &str) -> Result<(), TunnelError> {
        Err(TunnelError::UnsupportedApplication(app.to_string()))
    }

    fn add_disallowed_application(&mut self, app: &str) -> Result<(), TunnelError> {
        Err(TunnelError::UnsupportedApplication(app.to_string()))
    }

    fn set_blocking(&mut self, blocking: bool) {
        self.blocking = blocking;
    }

    fn allow_family(&mut self, family: AddressFamily) {
        debug!("{family:?} traffic allowed on the TUN device");
    }

    fn set_metered(&mut self, metered: bool) {
        debug!("Metered flag {metered} has no effect on Linux");
    }

    fn establish(mut self) -> Result<OwnedFd, TunnelError> {
        self.device()?;
        let Some(device) = self.device.take() else {
            return Err(TunnelError::Interface("TUN device unavailable".into()));
        };

        set_blocking(&device.fd, self.blocking)?;
        self.configure_dns(&device.name);
        Ok(device.fd)
    }
}

fn open_tun(requested_name: &str) -> Result<TunDevice, TunnelError> {
    // SAFETY: the path is a NUL-terminated literal.
    let raw = unsafe { libc::open(c"/dev/net/tun".as_ptr(), O_RDWR | O_CLOEXEC) };
    if raw < 0 {
        return Err(establish_error(io::Error::last_os_error()));
    }
    // SAFETY: `raw` is a freshly opened descriptor owned by nobody else.
    let fd = unsafe { OwnedFd::from_raw_fd(raw) };

    let mut request = IfReq {
        ifr_name: [0; libc::IFNAMSIZ],
        ifr_flags: (IFF_TUN | IFF_NO_PI) as c_short,
        _pad: [0; 22],
    };
    for (slot, byte) in request
        .ifr_name
        .iter_mut()
        .zip(requested_name.bytes().take(libc::IFNAMSIZ - 1))
    {
        *slot = byte as c_char;
    }

    // SAFETY: `request` is a properly laid out ifreq that outlives the call.
    let result = unsafe {
        libc::ioctl(
            fd.as_raw_fd(),
            TUNSETIFF,
            &mut request as *mut IfReq as *mut c_void,
        )
    };
    if result < 0 {
        return Err(establish_error(io::Error::last_os_error()));
    }

    // SAFETY: the kernel writes back a NUL-terminated interface name.
    let name = unsafe { CStr::from_ptr(request.ifr_name.as_ptr()) }
        .to_string_lossy()
        .into_owned();

    Ok(TunDevice { fd, name })
}

/// Permission problems will not go away by retrying.
fn establish_error(err: io::Error) -> TunnelError {
    if err.kind() == io::ErrorKind::PermissionDenied {
        warn!("Not allowed to create a TUN device: {err}");
        TunnelError::EstablishRefused
    } else {
        TunnelError::Io(err)
    }
}

fn set_blocking(fd: &OwnedFd, blocking: bool) -> Result<(), TunnelError> {
    // SAFETY: `fd` is a valid open descriptor for the duration of both calls.
    unsafe {
        let flags = libc::fcntl(fd.as_raw_fd(), libc::F_GETFL);
        if flags < 0 {
            return Err(io::Error::last_os_error().into());
        }
        let flags = if blocking {
            flags & !libc::O_NONBLOCK
        } else {
            flags | libc::O_NONBLOCK
        };
        if libc::fcntl(fd.as_raw_fd(), libc::F_SETFL, flags) < 0 {
            return Err(io::Error::last_os_error().into());
        }
    }
    Ok(())
}

fn ip(args: &[&str]) -> Result<(), String> {
    run("ip", args)
}

fn run(program: &str, args: &[&str]) -> Result<(), String> {
    debug!("Running {program} {}", args.join(" "));
    let output = Command::new(program)
        .args(args)
        .output()
        .map_err(|err| format!("failed to run {program}: {err}"))?;
    if output.status.success() {
        Ok(())
    } else {
        Err(String::from_utf8_lossy(&output.stderr).trim().to_string())
    }
}
