//! Packet parsing and construction for the virtual interface.

mod packet;

pub use packet::{PacketInfo, build_ipv4_udp, build_ipv6_udp, build_reply, parse_udp};
