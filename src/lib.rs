//! dnsveil - on-device DNS filtering through a virtual network interface.
//!
//! The host routes DNS traffic into a virtual interface owned by this
//! process. Queries for blocked names are answered locally with an empty
//! response; everything else is forwarded to the real upstream servers and
//! the answers are written back into the interface.
//!
//! # Architecture
//!
//! The crate is organized into several modules:
//!
//! - [`config`]: Configuration loading and validation
//! - [`dns`]: Blocking decisions and the per-packet proxy
//! - [`network`]: Raw IP/UDP parsing and construction
//! - [`tunnel`]: Interface setup, upstream aliasing and the packet pump
//! - [`supervisor`]: Worker thread lifetime and reconnect backoff
//! - [`status`]: Observable tunnel status
//! - [`blocklog`]: Persistent log of allowed and blocked names
//! - [`error`]: Error types
//!
//! # Testing
//!
//! Host integration sits behind the traits of [`tunnel::platform`], so the
//! whole engine runs against in-memory fakes:
//!
//! ```rust
//! use dnsveil::dns::{Blocker, RuleMatcher};
//!
//! let blocker = Blocker::new(["*.ads.com"]);
//! assert!(blocker.is_blocked("tracking.ads.com"));
//! assert!(!blocker.is_blocked("example.com"));
//! ```

pub mod blocklog;
pub mod config;
pub mod dns;
pub mod error;
pub mod metrics;
pub mod network;
pub mod status;
pub mod supervisor;
pub mod tunnel;

pub use blocklog::BlockLogger;
pub use config::Config;
pub use error::{Error, Result};
pub use status::TunnelStatus;
pub use supervisor::Supervisor;
