//! Error types for the dnsveil tunnel engine.

use std::io;
use std::net::IpAddr;

use thiserror::Error;

/// Main error type for dnsveil operations.
#[derive(Debug, Error)]
pub enum Error {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("network error: {0}")]
    Network(#[from] NetworkError),

    #[error("tunnel error: {0}")]
    Tunnel(#[from] TunnelError),

    #[error("persistence error: {0}")]
    Persist(#[from] PersistError),

    #[error("DNS protocol error: {0}")]
    Protocol(#[from] hickory_proto::error::ProtoError),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("metrics error: {0}")]
    Metrics(String),
}

impl Error {
    /// Whether this error must stop the supervisor instead of feeding the retry loop.
    pub const fn is_fatal(&self) -> bool {
        match self {
            Self::Tunnel(err) => err.is_fatal(),
            _ => false,
        }
    }
}

/// Configuration-related errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    ReadFile(#[source] io::Error),

    #[error("failed to parse config: {0}")]
    Parse(#[source] toml::de::Error),

    #[error("validation failed: {0}")]
    Validation(#[from] ValidationError),
}

/// Validation errors for configuration values.
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("duplicate DNS server: {address}")]
    DuplicateDnsServer { address: IpAddr },

    #[error("DNS server {address} is not a usable unicast address")]
    UnusableDnsServer { address: IpAddr },

    #[error("blocklist pattern cannot be empty")]
    EmptyBlocklistPattern,

    #[error("invalid wildcard pattern: {pattern:?}")]
    InvalidWildcardPattern { pattern: String },

    #[error("tunnel.mtu must be at least 576, got {mtu}")]
    MtuTooSmall { mtu: u16 },

    #[error("tunnel.name must be 1 to 15 bytes long, got {name:?}")]
    InvalidInterfaceName { name: String },

    #[error("application {app:?} is listed both on and off the tunnel")]
    ConflictingApplication { app: String },
}

/// Packet-level errors.
#[derive(Debug, Error)]
pub enum NetworkError {
    #[error("failed to send packet to {destination}: {source}")]
    SendFailed {
        destination: std::net::SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("packet construction failed: {0}")]
    PacketConstruction(String),

    #[error("original request is not a UDP packet")]
    MalformedRequest,
}

/// Errors raised while building or running the virtual interface.
#[derive(Debug, Error)]
pub enum TunnelError {
    #[error("no DNS servers found on the active network")]
    NoDnsServers,

    #[error("the platform refused to establish the interface")]
    EstablishRefused,

    #[error("address {address}/{prefix_len} rejected: {reason}")]
    AddressRejected {
        address: IpAddr,
        prefix_len: u8,
        reason: String,
    },

    #[error("interface setup failed: {0}")]
    Interface(String),

    #[error("application {0:?} cannot be routed per-app on this platform")]
    UnsupportedApplication(String),

    #[error("watchdog timed out waiting for a packet")]
    WatchdogTimeout,

    #[error("interface I/O failed: {0}")]
    Io(#[from] io::Error),
}

impl TunnelError {
    /// Whether retrying cannot help.
    pub const fn is_fatal(&self) -> bool {
        matches!(self, Self::EstablishRefused)
    }
}

/// Block log persistence errors.
#[derive(Debug, Error)]
pub enum PersistError {
    #[error("failed to read block log: {0}")]
    Read(#[source] io::Error),

    #[error("failed to write block log: {0}")]
    Write(#[source] io::Error),

    #[error("failed to decode block log: {0}")]
    Decode(#[source] toml::de::Error),

    #[error("failed to encode block log: {0}")]
    Encode(#[source] toml::ser::Error),
}

/// Result type alias using our Error.
pub type Result<T> = std::result::Result<T, Error>;
