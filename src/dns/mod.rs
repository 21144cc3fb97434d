//! DNS-related modules.

pub mod blocker;
pub mod proxy;

pub use blocker::{Blocker, RuleMatcher};
pub use proxy::{DnsPacketProxy, DropReason, EventLoop, NEGATIVE_CACHE_TTL, RequestOutcome};
