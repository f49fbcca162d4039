//! Parsed TCP packets as handed to the dispatcher, and decoding from raw IP datagrams

use crate::connection::ConnectionId;
use crate::{ReplayError, Result};
use bitflags::bitflags;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

const IPPROTO_TCP: u8 = 6;
const IPV6_HEADER_LEN: usize = 40;
const TCP_MIN_HEADER_LEN: usize = 20;

bitflags! {
    /// TCP control bits, as laid out in byte 13 of the header.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct TcpFlags: u8 {
        const FIN = 0x01;
        const SYN = 0x02;
        const RST = 0x04;
        const PSH = 0x08;
        const ACK = 0x10;
        const URG = 0x20;
    }
}

/// Direction of a packet relative to the captured service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Client to service.
    Inbound,
    /// Service to client.
    Outbound,
}

#[derive(Debug, Clone)]
pub struct ParsedPacket {
    pub source: SocketAddr,
    pub destination: SocketAddr,
    pub seq: u32,
    pub ack: u32,
    pub flags: TcpFlags,
    pub payload: Bytes,
    pub direction: Direction,
    pub timestamp: DateTime<Utc>,
}

impl ParsedPacket {
    /// Identity of the flow exactly as the packet travelled.
    pub fn connection_id(&self) -> ConnectionId {
        ConnectionId::new(self.source, self.destination)
    }

    /// Identity normalized to the client -> service direction, so both halves
    /// of a connection share one registry key.
    pub fn normalized_id(&self) -> ConnectionId {
        match self.direction {
            Direction::Inbound => self.connection_id(),
            Direction::Outbound => self.connection_id().reverse(),
        }
    }

    pub fn has_payload(&self) -> bool {
        !self.payload.is_empty()
    }

    pub fn is_inbound(&self) -> bool {
        self.direction == Direction::Inbound
    }

    /// Decode a raw IPv4 or IPv6 datagram carrying TCP.
    ///
    /// `service_port` decides direction: traffic to it is inbound, traffic
    /// from it is outbound, anything else is rejected.
    pub fn from_ip_packet(data: &[u8], service_port: u16) -> Result<Self> {
        let (tcp_data, src_ip, dst_ip) = match data.first().map(|&b| b >> 4) {
            Some(4) => parse_ipv4_header(data)?,
            Some(6) => parse_ipv6_header(data)?,
            Some(v) => return Err(ReplayError::Parse(format!("unsupported IP version {}", v))),
            None => return Err(ReplayError::Parse("empty packet".to_string())),
        };
        let header = parse_tcp_header(tcp_data)?;

        let direction = if header.dst_port == service_port {
            Direction::Inbound
        } else if header.src_port == service_port {
            Direction::Outbound
        } else {
            return Err(ReplayError::Parse(format!(
                "ports {} -> {} do not involve service port {}",
                header.src_port, header.dst_port, service_port
            )));
        };

        Ok(Self {
            source: SocketAddr::new(src_ip, header.src_port),
            destination: SocketAddr::new(dst_ip, header.dst_port),
            seq: header.seq,
            ack: header.ack,
            flags: header.flags,
            payload: Bytes::copy_from_slice(header.payload),
            direction,
            timestamp: Utc::now(),
        })
    }
}

struct TcpHeader<'a> {
    src_port: u16,
    dst_port: u16,
    seq: u32,
    ack: u32,
    flags: TcpFlags,
    payload: &'a [u8],
}

// Returns the TCP segment plus source and destination addresses
fn parse_ipv4_header(ip_data: &[u8]) -> Result<(&[u8], IpAddr, IpAddr)> {
    if ip_data.len() < 20 {
        return Err(ReplayError::Parse("IPv4 packet too short".to_string()));
    }

    let header_len = ((ip_data[0] & 0x0F) as usize) * 4;
    if header_len < 20 || ip_data.len() < header_len + TCP_MIN_HEADER_LEN {
        return Err(ReplayError::Parse("IPv4 packet has no TCP header".to_string()));
    }

    if ip_data[9] != IPPROTO_TCP {
        return Err(ReplayError::Parse(format!("IP protocol {} is not TCP", ip_data[9])));
    }

    // total length trims link-layer padding
    let total_len = u16::from_be_bytes([ip_data[2], ip_data[3]]) as usize;
    let end = if total_len >= header_len && total_len <= ip_data.len() {
        total_len
    } else {
        ip_data.len()
    };

    let src = Ipv4Addr::new(ip_data[12], ip_data[13], ip_data[14], ip_data[15]);
    let dst = Ipv4Addr::new(ip_data[16], ip_data[17], ip_data[18], ip_data[19]);
    Ok((&ip_data[header_len..end], IpAddr::V4(src), IpAddr::V4(dst)))
}

fn parse_ipv6_header(ip_data: &[u8]) -> Result<(&[u8], IpAddr, IpAddr)> {
    if ip_data.len() < IPV6_HEADER_LEN + TCP_MIN_HEADER_LEN {
        return Err(ReplayError::Parse("IPv6 packet too short".to_string()));
    }

    // extension headers are not chased
    if ip_data[6] != IPPROTO_TCP {
        return Err(ReplayError::Parse(format!("IPv6 next header {} is not TCP", ip_data[6])));
    }

    let payload_len = u16::from_be_bytes([ip_data[4], ip_data[5]]) as usize;
    let end = (IPV6_HEADER_LEN + payload_len).min(ip_data.len());

    let mut src = [0u8; 16];
    let mut dst = [0u8; 16];
    src.copy_from_slice(&ip_data[8..24]);
    dst.copy_from_slice(&ip_data[24..40]);
    Ok((
        &ip_data[IPV6_HEADER_LEN..end],
        IpAddr::V6(Ipv6Addr::from(src)),
        IpAddr::V6(Ipv6Addr::from(dst)),
    ))
}

fn parse_tcp_header(tcp_data: &[u8]) -> Result<TcpHeader<'_>> {
    if tcp_data.len() < TCP_MIN_HEADER_LEN {
        return Err(ReplayError::Parse("TCP segment too short".to_string()));
    }

    let header_len = ((tcp_data[12] >> 4) as usize) * 4;
    if header_len < TCP_MIN_HEADER_LEN || tcp_data.len() < header_len {
        return Err(ReplayError::Parse(format!("invalid TCP data offset {}", header_len)));
    }

    Ok(TcpHeader {
        src_port: u16::from_be_bytes([tcp_data[0], tcp_data[1]]),
        dst_port: u16::from_be_bytes([tcp_data[2], tcp_data[3]]),
        seq: u32::from_be_bytes([tcp_data[4], tcp_data[5], tcp_data[6], tcp_data[7]]),
        ack: u32::from_be_bytes([tcp_data[8], tcp_data[9], tcp_data[10], tcp_data[11]]),
        flags: TcpFlags::from_bits_truncate(tcp_data[13]),
        payload: &tcp_data[header_len..],
    })
}
