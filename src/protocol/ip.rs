//! Minimal IPv4/IPv6 header inspection for routing and ACL checks

use crate::error::{GatewayError, Result};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

pub const PROTO_ICMP: u8 = 1;
pub const PROTO_TCP: u8 = 6;
pub const PROTO_UDP: u8 = 17;
pub const PROTO_ICMPV6: u8 = 58;

/// Header fields the data plane cares about
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketInfo {
    pub src: IpAddr,
    pub dst: IpAddr,
    pub protocol: u8,
    /// Destination port for unfragmented TCP and UDP
    pub dst_port: Option<u16>,
}

/// Parse the IP header of a raw packet
pub fn inspect(packet: &[u8]) -> Result<PacketInfo> {
    match packet.first().map(|b| b >> 4) {
        Some(4) => inspect_v4(packet),
        Some(6) => inspect_v6(packet),
        Some(v) => Err(GatewayError::Protocol(format!("Not an IP packet (version {v})"))),
        None => Err(GatewayError::Protocol("Empty packet".into())),
    }
}

/// Destination address only, for the device-read hot path
pub fn destination(packet: &[u8]) -> Option<IpAddr> {
    match packet.first()? >> 4 {
        4 if packet.len() >= 20 => {
            let octets: [u8; 4] = packet[16..20].try_into().ok()?;
            Some(IpAddr::V4(Ipv4Addr::from(octets)))
        }
        6 if packet.len() >= 40 => {
            let octets: [u8; 16] = packet[24..40].try_into().ok()?;
            Some(IpAddr::V6(Ipv6Addr::from(octets)))
        }
        _ => None,
    }
}

fn inspect_v4(packet: &[u8]) -> Result<PacketInfo> {
    if packet.len() < 20 {
        return Err(GatewayError::Protocol("Truncated IPv4 header".into()));
    }
    let ihl = usize::from(packet[0] & 0x0f) * 4;
    if ihl < 20 || packet.len() < ihl {
        return Err(GatewayError::Protocol("Invalid IPv4 header length".into()));
    }
    let protocol = packet[9];
    let fragment_offset = u16::from_be_bytes([packet[6], packet[7]]) & 0x1fff;
    let src = Ipv4Addr::new(packet[12], packet[13], packet[14], packet[15]);
    let dst = Ipv4Addr::new(packet[16], packet[17], packet[18], packet[19]);
    let dst_port = if fragment_offset == 0 {
        transport_port(protocol, &packet[ihl..])
    } else {
        None
    };
    Ok(PacketInfo {
        src: IpAddr::V4(src),
        dst: IpAddr::V4(dst),
        protocol,
        dst_port,
    })
}

fn inspect_v6(packet: &[u8]) -> Result<PacketInfo> {
    if packet.len() < 40 {
        return Err(GatewayError::Protocol("Truncated IPv6 header".into()));
    }
    let protocol = packet[6];
    let mut src = [0u8; 16];
    src.copy_from_slice(&packet[8..24]);
    let mut dst = [0u8; 16];
    dst.copy_from_slice(&packet[24..40]);
    Ok(PacketInfo {
        src: IpAddr::V6(Ipv6Addr::from(src)),
        dst: IpAddr::V6(Ipv6Addr::from(dst)),
        protocol,
        dst_port: transport_port(protocol, &packet[40..]),
    })
}

fn transport_port(protocol: u8, segment: &[u8]) -> Option<u16> {
    match protocol {
        PROTO_TCP | PROTO_UDP if segment.len() >= 4 => {
            Some(u16::from_be_bytes([segment[2], segment[3]]))
        }
        _ => None,
    }
}

/// Build a minimal IPv4 packet, used by tests and benches
pub fn build_ipv4(
    src: Ipv4Addr,
    dst: Ipv4Addr,
    protocol: u8,
    dst_port: u16,
    body: &[u8],
) -> Vec<u8> {
    let transport_len = if matches!(protocol, PROTO_TCP | PROTO_UDP) { 8 } else { 0 };
    let total = 20 + transport_len + body.len();
    let mut packet = vec![0u8; total];
    packet[0] = 0x45;
    packet[2..4].copy_from_slice(&(total as u16).to_be_bytes());
    packet[8] = 64;
    packet[9] = protocol;
    packet[12..16].copy_from_slice(&src.octets());
    packet[16..20].copy_from_slice(&dst.octets());
    if transport_len > 0 {
        packet[20..22].copy_from_slice(&40000u16.to_be_bytes());
        packet[22..24].copy_from_slice(&dst_port.to_be_bytes());
    }
    packet[20 + transport_len..].copy_from_slice(body);
    packet
}
