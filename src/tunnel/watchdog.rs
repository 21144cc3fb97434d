//! Liveness pinging of the tunnel.
//!
//! When the interface stays idle for a whole poll timeout, an empty
//! datagram is sent through the tunnel. Reading any packet from the
//! interface proves it is alive; if nothing comes back within the ping
//! wait ([`PING_WAIT`] by default) the tunnel is considered dead and gets
//! reconnected.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, UdpSocket};
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::error::TunnelError;

/// First idle timeout.
const INITIAL_TIMEOUT: Duration = Duration::from_secs(1);
/// Idle timeouts grow by this factor after each ping.
const TIMEOUT_GROWTH: u32 = 4;
/// Upper bound of the idle timeout (about 68 minutes).
const MAX_TIMEOUT: Duration = Duration::from_secs(4096);
/// How long a ping may stay unanswered.
pub const PING_WAIT: Duration = Duration::from_secs(7);

#[derive(Debug)]
pub struct Watchdog {
    target: Option<SocketAddr>,
    idle_timeout: Duration,
    ping_wait: Duration,
    ping_sent_at: Option<Instant>,
}

impl Watchdog {
    /// A watchdog that never pings and never times out.
    pub fn disabled() -> Self {
        Self {
            target: None,
            idle_timeout: INITIAL_TIMEOUT,
            ping_wait: PING_WAIT,
            ping_sent_at: None,
        }
    }

    /// A watchdog pinging `target` through the tunnel.
    pub fn new(target: SocketAddr) -> Self {
        Self::with_timeouts(target, INITIAL_TIMEOUT, PING_WAIT)
    }

    /// Like [`Self::new`] with a custom first idle timeout and ping wait.
    pub fn with_timeouts(target: SocketAddr, idle_timeout: Duration, ping_wait: Duration) -> Self {
        Self {
            target: Some(target),
            idle_timeout: idle_timeout.min(MAX_TIMEOUT),
            ping_wait,
            ping_sent_at: None,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.target.is_some()
    }

    /// How long the pump may wait for readiness. `None` means forever.
    pub fn poll_timeout(&self) -> Option<Duration> {
        self.target?;
        Some(if self.ping_sent_at.is_some() {
            self.ping_wait
        } else {
            self.idle_timeout
        })
    }

    /// A packet was read from the interface.
    pub fn handle_packet(&mut self) {
        if self.ping_sent_at.take().is_some() {
            debug!("Watchdog ping answered");
        }
    }

    /// The poll timeout elapsed without any packet.
    ///
    /// Returns the address to ping, or fails when the previous ping went
    /// unanswered.
    pub fn handle_timeout(&mut self, now: Instant) -> Result<Option<SocketAddr>, TunnelError> {
        let Some(target) = self.target else {
            return Ok(None);
        };

        if let Some(sent_at) = self.ping_sent_at {
            if now.saturating_duration_since(sent_at) >= self.ping_wait {
                return Err(TunnelError::WatchdogTimeout);
            }
            return Ok(None);
        }

        self.idle_timeout = (self.idle_timeout * TIMEOUT_GROWTH).min(MAX_TIMEOUT);
        self.ping_sent_at = Some(now);
        Ok(Some(target))
    }
}

/// Send the empty ping datagram to `target`.
///
/// The socket is left unprotected so the datagram enters the tunnel.
pub fn send_ping(target: SocketAddr) {
    let local: IpAddr = match target {
        SocketAddr::V4(_) => Ipv4Addr::UNSPECIFIED.into(),
        SocketAddr::V6(_) => Ipv6Addr::UNSPECIFIED.into(),
    };
    let result = UdpSocket::bind((local, 0)).and_then(|socket| socket.send_to(&[], target));
    match result {
        Ok(_) => debug!("Watchdog ping sent to {target}"),
        Err(err) => warn!("Failed to send watchdog ping to {target}: {err}"),
    }
}
