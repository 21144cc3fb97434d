//! Observable tunnel status.
//!
//! The supervisor is the only writer; any number of observers hold a
//! [`StatusReceiver`] and read the latest value without locking.

use std::fmt;
use std::sync::Arc;

use tokio::sync::watch;
use tracing::info;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum TunnelStatus {
    Starting,
    Running,
    Stopping,
    WaitingForNetwork,
    Reconnecting,
    ReconnectingNetworkError,
    #[default]
    Stopped,
}

impl TunnelStatus {
    /// Text of the foreground status indicator.
    pub const fn notification_text(self) -> &'static str {
        match self {
            Self::Starting => "Starting DNS filtering",
            Self::Running => "DNS filtering active",
            Self::Stopping => "Stopping DNS filtering",
            Self::WaitingForNetwork => "Waiting for network",
            Self::Reconnecting => "Reconnecting",
            Self::ReconnectingNetworkError => "Network error, retrying",
            Self::Stopped => "DNS filtering stopped",
        }
    }

    /// Whether a tunnel worker exists in this state.
    pub const fn is_active(self) -> bool {
        !matches!(self, Self::Stopping | Self::Stopped)
    }
}

impl fmt::Display for TunnelStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Stopping => "stopping",
            Self::WaitingForNetwork => "waiting-for-network",
            Self::Reconnecting => "reconnecting",
            Self::ReconnectingNetworkError => "reconnecting-network-error",
            Self::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

pub type StatusReceiver = watch::Receiver<TunnelStatus>;

/// Publishing side of the status value.
#[derive(Debug, Clone)]
pub struct StatusBridge {
    sender: Arc<watch::Sender<TunnelStatus>>,
}

impl Default for StatusBridge {
    fn default() -> Self {
        Self::new()
    }
}

impl StatusBridge {
    pub fn new() -> Self {
        let (sender, _) = watch::channel(TunnelStatus::Stopped);
        Self {
            sender: Arc::new(sender),
        }
    }

    pub fn publish(&self, status: TunnelStatus) {
        let previous = self.sender.send_replace(status);
        if previous != status {
            info!("Tunnel {previous} -> {status}: {}", status.notification_text());
        }
    }

    /// Publish `to` only while the current value is `from`.
    pub fn transition(&self, from: TunnelStatus, to: TunnelStatus) -> bool {
        let changed = self.sender.send_if_modified(|status| {
            if *status != from || from == to {
                return false;
            }
            *status = to;
            true
        });
        if changed {
            info!("Tunnel {from} -> {to}: {}", to.notification_text());
        }
        changed
    }

    pub fn current(&self) -> TunnelStatus {
        *self.sender.borrow()
    }

    pub fn subscribe(&self) -> StatusReceiver {
        self.sender.subscribe()
    }
}
