//! Raw IP/UDP handling for the virtual interface.
//!
//! The interface hands us bare IP packets (no link-layer header). Requests
//! are parsed into a [`PacketInfo`] plus the UDP payload; replies are built
//! with source and destination swapped and fresh checksums.

// DNS packets over the tunnel are bounded by the interface MTU, so these
// casts from usize to u16 never truncate.
#![allow(clippy::cast_possible_truncation)]

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use pnet::packet::ip::IpNextHeaderProtocols;
use pnet::packet::ipv4::{Ipv4Packet, MutableIpv4Packet};
use pnet::packet::ipv6::{Ipv6Packet, MutableIpv6Packet};
use pnet::packet::udp::{MutableUdpPacket, UdpPacket};

use crate::error::{NetworkError, Result};

/// IPv4 header size in bytes (without options).
const IPV4_HEADER_SIZE: usize = 20;
/// IPv6 header size in bytes.
const IPV6_HEADER_SIZE: usize = 40;
/// UDP header size in bytes.
const UDP_HEADER_SIZE: usize = 8;
/// Hop limit used for synthesized replies.
const REPLY_TTL: u8 = 64;

/// Addressing of a UDP datagram read from the interface.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PacketInfo {
    pub source_ip: IpAddr,
    pub dest_ip: IpAddr,
    pub source_port: u16,
    pub dest_port: u16,
}

/// Extract addressing and UDP payload from a raw IP packet.
///
/// Returns None if:
/// - The packet is neither IPv4 nor IPv6
/// - The packet does not carry UDP
/// - Any header is truncated
pub fn parse_udp(packet: &[u8]) -> Option<(PacketInfo, Vec<u8>)> {
    let version = packet.first()? >> 4;

    let (source_ip, dest_ip, udp_bytes) = match version {
        4 => {
            let ipv4 = Ipv4Packet::new(packet)?;
            if ipv4.get_next_level_protocol() != IpNextHeaderProtocols::Udp {
                return None;
            }
            let header_len = usize::from(ipv4.get_header_length()) * 4;
            let total_len = usize::from(ipv4.get_total_length()).min(packet.len());
            if header_len < IPV4_HEADER_SIZE || total_len < header_len {
                return None;
            }
            (
                IpAddr::V4(ipv4.get_source()),
                IpAddr::V4(ipv4.get_destination()),
                &packet[header_len..total_len],
            )
        }
        6 => {
            let ipv6 = Ipv6Packet::new(packet)?;
            if ipv6.get_next_header() != IpNextHeaderProtocols::Udp {
                return None;
            }
            let end = (IPV6_HEADER_SIZE + usize::from(ipv6.get_payload_length())).min(packet.len());
            (
                IpAddr::V6(ipv6.get_source()),
                IpAddr::V6(ipv6.get_destination()),
                &packet[IPV6_HEADER_SIZE..end],
            )
        }
        _ => return None,
    };

    let udp = UdpPacket::new(udp_bytes)?;
    let udp_len = usize::from(udp.get_length()).clamp(UDP_HEADER_SIZE, udp_bytes.len());
    let payload = udp_bytes[UDP_HEADER_SIZE..udp_len].to_vec();

    let info = PacketInfo {
        source_ip,
        dest_ip,
        source_port: udp.get_source(),
        dest_port: udp.get_destination(),
    };

    Some((info, payload))
}

/// Build the IP packet answering `request` with `payload`.
///
/// The reply goes from the request's destination back to its source.
pub fn build_reply(request: &PacketInfo, payload: &[u8]) -> Result<Vec<u8>> {
    match (request.source_ip, request.dest_ip) {
        (IpAddr::V4(client), IpAddr::V4(server)) => {
            build_ipv4_udp(server, client, request.dest_port, request.source_port, payload)
        }
        (IpAddr::V6(client), IpAddr::V6(server)) => {
            build_ipv6_udp(server, client, request.dest_port, request.source_port, payload)
        }
        _ => Err(NetworkError::PacketConstruction("mixed IPv4/IPv6 addresses".into()).into()),
    }
}

/// Build an IPv4 packet carrying one UDP datagram.
pub fn build_ipv4_udp(
    source: Ipv4Addr,
    destination: Ipv4Addr,
    source_port: u16,
    dest_port: u16,
    payload: &[u8],
) -> Result<Vec<u8>> {
    let udp_len = UDP_HEADER_SIZE + payload.len();
    let total_len = IPV4_HEADER_SIZE + udp_len;
    if total_len > usize::from(u16::MAX) {
        return Err(NetworkError::PacketConstruction("payload too large".into()).into());
    }

    let mut buffer = vec![0u8; total_len];

    {
        let mut udp = MutableUdpPacket::new(&mut buffer[IPV4_HEADER_SIZE..]).ok_or_else(|| {
            NetworkError::PacketConstruction("UDP packet creation failed".into())
        })?;
        udp.set_source(source_port);
        udp.set_destination(dest_port);
        udp.set_length(udp_len as u16);
        udp.set_payload(payload);
        let checksum = pnet::packet::udp::ipv4_checksum(&udp.to_immutable(), &source, &destination);
        udp.set_checksum(checksum);
    }

    {
        let mut ipv4 = MutableIpv4Packet::new(&mut buffer).ok_or_else(|| {
            NetworkError::PacketConstruction("IPv4 packet creation failed".into())
        })?;
        ipv4.set_version(4);
        ipv4.set_header_length(5);
        ipv4.set_total_length(total_len as u16);
        ipv4.set_ttl(REPLY_TTL);
        ipv4.set_next_level_protocol(IpNextHeaderProtocols::Udp);
        ipv4.set_source(source);
        ipv4.set_destination(destination);
        ipv4.set_checksum(pnet::packet::ipv4::checksum(&ipv4.to_immutable()));
    }

    Ok(buffer)
}

/// Build an IPv6 packet carrying one UDP datagram.
pub fn build_ipv6_udp(
    source: Ipv6Addr,
    destination: Ipv6Addr,
    source_port: u16,
    dest_port: u16,
    payload: &[u8],
) -> Result<Vec<u8>> {
    let udp_len = UDP_HEADER_SIZE + payload.len();
    if udp_len > usize::from(u16::MAX) {
        return Err(NetworkError::PacketConstruction("payload too large".into()).into());
    }

    let mut buffer = vec![0u8; IPV6_HEADER_SIZE + udp_len];

    {
        let mut udp = MutableUdpPacket::new(&mut buffer[IPV6_HEADER_SIZE..]).ok_or_else(|| {
            NetworkError::PacketConstruction("UDP packet creation failed".into())
        })?;
        udp.set_source(source_port);
        udp.set_destination(dest_port);
        udp.set_length(udp_len as u16);
        udp.set_payload(payload);
        let checksum = pnet::packet::udp::ipv6_checksum(&udp.to_immutable(), &source, &destination);
        udp.set_checksum(checksum);
    }

    {
        let mut ipv6 = MutableIpv6Packet::new(&mut buffer).ok_or_else(|| {
            NetworkError::PacketConstruction("IPv6 packet creation failed".into())
        })?;
        ipv6.set_version(6);
        ipv6.set_payload_length(udp_len as u16);
        ipv6.set_next_header(IpNextHeaderProtocols::Udp);
        ipv6.set_hop_limit(REPLY_TTL);
        ipv6.set_source(source);
        ipv6.set_destination(destination);
    }

    Ok(buffer)
}
