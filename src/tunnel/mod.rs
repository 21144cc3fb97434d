//! Virtual interface management and the packet pump.

pub mod configurator;
pub mod interrupt;
#[cfg(target_os = "linux")]
pub mod linux;
pub mod pending;
pub mod platform;
pub mod pump;
pub mod watchdog;

pub use configurator::{TunnelConfiguration, UpstreamServer, UpstreamTable, configure};
pub use interrupt::{Interrupt, Interrupter, Signal, Wake};
pub use pending::{PendingRequest, PendingRequestTable};
pub use platform::{
    AddressFamily, AppResolver, AppSets, NetworkInfo, Platform, SocketProtector, VpnBuilder,
};
pub use pump::{Pump, PumpExit};
pub use watchdog::Watchdog;
