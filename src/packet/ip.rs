//! Owned IP datagram with header and checksum upkeep.
//!
//! ## IPv4 header layout (fields used here)
//! ```text
//! Offset  Field
//! 0       Version (4 bits) + IHL (4 bits)
//! 2-3     Total Length (16 bits)
//! 8       TTL
//! 9       Protocol
//! 10-11   Header Checksum
//! 12-15   Source Address
//! 16-19   Destination Address
//! ```
//!
//! IPv6 carries a fixed 40-byte header: Payload Length at 4-5, Next Header
//! at 6, source at 8-23, destination at 24-39. Extension headers are not
//! interpreted; the Next Header byte is reported as the protocol.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use crate::error::{Error, Result};

/// Minimal IPv4 header length.
pub const IPV4_HEADER_MIN: usize = 20;

/// Fixed IPv6 header length.
pub const IPV6_HEADER_LEN: usize = 40;

/// Transport protocol carried by an IP packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IpProtocol {
    Icmp,
    Tcp,
    Udp,
    IcmpV6,
    Other(u8),
}

impl From<u8> for IpProtocol {
    fn from(value: u8) -> Self {
        match value {
            1 => Self::Icmp,
            6 => Self::Tcp,
            17 => Self::Udp,
            58 => Self::IcmpV6,
            other => Self::Other(other),
        }
    }
}

impl From<IpProtocol> for u8 {
    fn from(value: IpProtocol) -> u8 {
        match value {
            IpProtocol::Icmp => 1,
            IpProtocol::Tcp => 6,
            IpProtocol::Udp => 17,
            IpProtocol::IcmpV6 => 58,
            IpProtocol::Other(other) => other,
        }
    }
}

impl fmt::Display for IpProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Icmp => write!(f, "ICMP"),
            Self::Tcp => write!(f, "TCP"),
            Self::Udp => write!(f, "UDP"),
            Self::IcmpV6 => write!(f, "ICMPv6"),
            Self::Other(p) => write!(f, "proto-{p}"),
        }
    }
}

/// A parsed IP datagram owning its wire bytes.
///
/// The buffer always holds exactly one packet: total length equals the
/// byte count of the serialized form. Mutators that change addresses or
/// payload re-run checksum and length upkeep before returning.
#[derive(Clone, PartialEq, Eq)]
pub struct IpPacket {
    buf: Vec<u8>,
}

impl IpPacket {
    /// Parse an owned buffer holding exactly one IP packet.
    pub fn from_bytes(buf: Vec<u8>) -> Result<Self> {
        let declared = Self::peek_total_length(&buf)?;
        if declared != buf.len() {
            return Err(Error::malformed(format!(
                "packet declares {declared} bytes but buffer holds {}",
                buf.len()
            )));
        }
        Ok(Self { buf })
    }

    /// Read the declared total length of the packet starting at `buf[0]`.
    ///
    /// Validates only as much header as the length fields require.
    pub(crate) fn peek_total_length(buf: &[u8]) -> Result<usize> {
        if buf.is_empty() {
            return Err(Error::malformed("empty buffer"));
        }
        match buf[0] >> 4 {
            4 => {
                if buf.len() < IPV4_HEADER_MIN {
                    return Err(Error::malformed("truncated IPv4 header"));
                }
                let ihl = ((buf[0] & 0x0F) as usize) * 4;
                let total = u16::from_be_bytes([buf[2], buf[3]]) as usize;
                if ihl < IPV4_HEADER_MIN || total < ihl {
                    return Err(Error::malformed("illegal IPv4 length fields"));
                }
                Ok(total)
            }
            6 => {
                if buf.len() < IPV6_HEADER_LEN {
                    return Err(Error::malformed("truncated IPv6 header"));
                }
                let payload_len = u16::from_be_bytes([buf[4], buf[5]]) as usize;
                Ok(IPV6_HEADER_LEN + payload_len)
            }
            v => Err(Error::malformed(format!("unsupported IP version {v}"))),
        }
    }

    /// Build an IPv4 packet with a default TTL of 64.
    pub fn build_v4(
        protocol: IpProtocol,
        source: Ipv4Addr,
        destination: Ipv4Addr,
        payload: &[u8],
    ) -> Result<Self> {
        let total = IPV4_HEADER_MIN + payload.len();
        if total > u16::MAX as usize {
            return Err(Error::malformed("IPv4 payload too large"));
        }
        let mut buf = vec![0u8; total];
        buf[0] = 0x45;
        buf[2..4].copy_from_slice(&(total as u16).to_be_bytes());
        buf[8] = 64;
        buf[9] = protocol.into();
        buf[12..16].copy_from_slice(&source.octets());
        buf[16..20].copy_from_slice(&destination.octets());
        buf[IPV4_HEADER_MIN..].copy_from_slice(payload);

        let mut packet = Self { buf };
        packet.update_checksums();
        Ok(packet)
    }

    /// Build an IPv6 packet with a default hop limit of 64.
    pub fn build_v6(
        protocol: IpProtocol,
        source: Ipv6Addr,
        destination: Ipv6Addr,
        payload: &[u8],
    ) -> Result<Self> {
        if payload.len() > u16::MAX as usize {
            return Err(Error::malformed("IPv6 payload too large"));
        }
        let mut buf = vec![0u8; IPV6_HEADER_LEN + payload.len()];
        buf[0] = 0x60;
        buf[4..6].copy_from_slice(&(payload.len() as u16).to_be_bytes());
        buf[6] = protocol.into();
        buf[7] = 64;
        buf[8..24].copy_from_slice(&source.octets());
        buf[24..40].copy_from_slice(&destination.octets());
        buf[IPV6_HEADER_LEN..].copy_from_slice(payload);

        let mut packet = Self { buf };
        packet.update_checksums();
        Ok(packet)
    }

    /// IP version, 4 or 6.
    pub fn version(&self) -> u8 {
        self.buf[0] >> 4
    }

    fn is_v4(&self) -> bool {
        self.version() == 4
    }

    /// Transport protocol (IPv6: the Next Header byte).
    pub fn protocol(&self) -> IpProtocol {
        if self.is_v4() {
            IpProtocol::from(self.buf[9])
        } else {
            IpProtocol::from(self.buf[6])
        }
    }

    /// Source address.
    pub fn source(&self) -> IpAddr {
        if self.is_v4() {
            IpAddr::V4(Ipv4Addr::new(
                self.buf[12],
                self.buf[13],
                self.buf[14],
                self.buf[15],
            ))
        } else {
            let mut octets = [0u8; 16];
            octets.copy_from_slice(&self.buf[8..24]);
            IpAddr::V6(Ipv6Addr::from(octets))
        }
    }

    /// Destination address.
    pub fn destination(&self) -> IpAddr {
        if self.is_v4() {
            IpAddr::V4(Ipv4Addr::new(
                self.buf[16],
                self.buf[17],
                self.buf[18],
                self.buf[19],
            ))
        } else {
            let mut octets = [0u8; 16];
            octets.copy_from_slice(&self.buf[24..40]);
            IpAddr::V6(Ipv6Addr::from(octets))
        }
    }

    /// Total packet length in bytes, equal to `as_bytes().len()`.
    pub fn total_length(&self) -> usize {
        self.buf.len()
    }

    /// IP header length in bytes (IPv4: IHL * 4; IPv6: 40).
    pub fn header_len(&self) -> usize {
        if self.is_v4() {
            ((self.buf[0] & 0x0F) as usize) * 4
        } else {
            IPV6_HEADER_LEN
        }
    }

    /// Transport payload bytes.
    pub fn payload(&self) -> &[u8] {
        &self.buf[self.header_len()..]
    }

    /// Serialized wire bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    /// Consume the packet, yielding its wire bytes.
    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }

    /// Replace the source address. The family must match the packet version.
    pub fn set_source(&mut self, source: IpAddr) -> Result<()> {
        match (self.is_v4(), source) {
            (true, IpAddr::V4(ip)) => self.buf[12..16].copy_from_slice(&ip.octets()),
            (false, IpAddr::V6(ip)) => self.buf[8..24].copy_from_slice(&ip.octets()),
            _ => return Err(Error::invalid_state("address family mismatch")),
        }
        self.update_checksums();
        Ok(())
    }

    /// Replace the destination address. The family must match the version.
    pub fn set_destination(&mut self, destination: IpAddr) -> Result<()> {
        match (self.is_v4(), destination) {
            (true, IpAddr::V4(ip)) => self.buf[16..20].copy_from_slice(&ip.octets()),
            (false, IpAddr::V6(ip)) => self.buf[24..40].copy_from_slice(&ip.octets()),
            _ => return Err(Error::invalid_state("address family mismatch")),
        }
        self.update_checksums();
        Ok(())
    }

    /// Replace the transport payload, fixing length fields and checksums.
    pub fn set_payload(&mut self, payload: &[u8]) -> Result<()> {
        let header_len = self.header_len();
        if self.is_v4() {
            let total = header_len + payload.len();
            if total > u16::MAX as usize {
                return Err(Error::malformed("IPv4 payload too large"));
            }
            self.buf.truncate(header_len);
            self.buf.extend_from_slice(payload);
            self.buf[2..4].copy_from_slice(&(total as u16).to_be_bytes());
        } else {
            if payload.len() > u16::MAX as usize {
                return Err(Error::malformed("IPv6 payload too large"));
            }
            self.buf.truncate(IPV6_HEADER_LEN);
            self.buf.extend_from_slice(payload);
            self.buf[4..6].copy_from_slice(&(payload.len() as u16).to_be_bytes());
        }
        self.update_checksums();
        Ok(())
    }

    /// Recompute the IPv4 header checksum and any known transport checksum.
    ///
    /// Unknown transport protocols keep their payload bytes untouched.
    pub fn update_checksums(&mut self) {
        let header_len = self.header_len();
        let protocol = self.protocol();

        if self.is_v4() {
            self.buf[10] = 0;
            self.buf[11] = 0;
            let sum = finish_checksum(sum_be_words(&self.buf[..header_len]));
            self.buf[10..12].copy_from_slice(&sum.to_be_bytes());
        }

        let checksum_offset = match protocol {
            IpProtocol::Icmp | IpProtocol::IcmpV6 => 2,
            IpProtocol::Udp => 6,
            IpProtocol::Tcp => 16,
            IpProtocol::Other(_) => return,
        };
        if self.buf.len() < header_len + checksum_offset + 2 {
            return;
        }

        self.buf[header_len + checksum_offset] = 0;
        self.buf[header_len + checksum_offset + 1] = 0;

        let mut sum = sum_be_words(&self.buf[header_len..]);
        // ICMPv4 is the one transport summed without a pseudo-header.
        if protocol != IpProtocol::Icmp {
            sum += self.pseudo_header_sum(protocol);
        }
        let mut checksum = finish_checksum(sum);
        // An all-zero UDP checksum means "absent"; RFC 768 substitutes 0xFFFF.
        if protocol == IpProtocol::Udp && checksum == 0 {
            checksum = 0xFFFF;
        }
        self.buf[header_len + checksum_offset..header_len + checksum_offset + 2]
            .copy_from_slice(&checksum.to_be_bytes());
    }

    fn pseudo_header_sum(&self, protocol: IpProtocol) -> u32 {
        let transport_len = (self.buf.len() - self.header_len()) as u32;
        let proto_byte: u8 = protocol.into();
        if self.is_v4() {
            sum_be_words(&self.buf[12..20]) + proto_byte as u32 + transport_len
        } else {
            sum_be_words(&self.buf[8..40]) + proto_byte as u32 + transport_len
        }
    }
}

impl fmt::Display for IpPacket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "IPv{} {} {} -> {} ({} bytes)",
            self.version(),
            self.protocol(),
            self.source(),
            self.destination(),
            self.total_length()
        )
    }
}

impl fmt::Debug for IpPacket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

/// Sum big-endian 16-bit words, padding an odd trailing byte with zero.
pub(crate) fn sum_be_words(data: &[u8]) -> u32 {
    let mut sum: u32 = 0;
    let mut chunks = data.chunks_exact(2);
    for pair in &mut chunks {
        sum += u16::from_be_bytes([pair[0], pair[1]]) as u32;
    }
    if let [last] = chunks.remainder() {
        sum += u16::from_be_bytes([*last, 0]) as u32;
    }
    sum
}

/// Fold a 32-bit sum to 16 bits and return the one's complement.
pub(crate) fn finish_checksum(mut sum: u32) -> u16 {
    while sum >> 16 != 0 {
        sum = (sum & 0xFFFF) + (sum >> 16);
    }
    !(sum as u16)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_v4_round_trip() {
        let packet = IpPacket::build_v4(
            IpProtocol::Udp,
            Ipv4Addr::new(10, 0, 0, 1),
            Ipv4Addr::new(10, 0, 0, 2),
            &[0, 53, 0, 53, 0, 12, 0, 0, 1, 2, 3, 4],
        )
        .unwrap();

        assert_eq!(packet.version(), 4);
        assert_eq!(packet.protocol(), IpProtocol::Udp);
        assert_eq!(packet.total_length(), 32);
        assert_eq!(packet.source(), IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)));

        let reparsed = IpPacket::from_bytes(packet.as_bytes().to_vec()).unwrap();
        assert_eq!(reparsed, packet);
    }

    #[test]
    fn ipv4_header_checksum_verifies() {
        let packet = IpPacket::build_v4(
            IpProtocol::Icmp,
            Ipv4Addr::new(192, 168, 1, 100),
            Ipv4Addr::new(8, 8, 8, 8),
            &[8, 0, 0, 0, 0, 1, 0, 1, b'h', b'i'],
        )
        .unwrap();

        // Summing the header including the stored checksum must yield
        // 0xFFFF before complement.
        let sum = sum_be_words(&packet.as_bytes()[..packet.header_len()]);
        assert_eq!(finish_checksum(sum), 0);
    }

    #[test]
    fn mutation_keeps_length_invariant() {
        let mut packet = IpPacket::build_v4(
            IpProtocol::Udp,
            Ipv4Addr::new(10, 0, 0, 1),
            Ipv4Addr::new(10, 0, 0, 2),
            &[0u8; 16],
        )
        .unwrap();
        let before = packet.as_bytes().to_vec();

        packet.set_payload(&[1u8; 64]).unwrap();
        assert_eq!(packet.total_length(), packet.as_bytes().len());
        assert_eq!(packet.payload().len(), 64);
        assert_ne!(packet.as_bytes(), &before[..]);

        packet
            .set_destination(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 3)))
            .unwrap();
        assert_eq!(
            packet.destination(),
            IpAddr::V4(Ipv4Addr::new(10, 0, 0, 3))
        );
    }

    #[test]
    fn family_mismatch_rejected() {
        let mut packet = IpPacket::build_v4(
            IpProtocol::Udp,
            Ipv4Addr::new(10, 0, 0, 1),
            Ipv4Addr::new(10, 0, 0, 2),
            &[],
        )
        .unwrap();
        assert!(packet
            .set_source(IpAddr::V6(Ipv6Addr::LOCALHOST))
            .is_err());
    }

    #[test]
    fn build_v6() {
        let packet = IpPacket::build_v6(
            IpProtocol::IcmpV6,
            Ipv6Addr::LOCALHOST,
            Ipv6Addr::new(0x2001, 0xdb8, 0, 0, 0, 0, 0, 1),
            &[128, 0, 0, 0, 0, 7, 0, 3],
        )
        .unwrap();
        assert_eq!(packet.version(), 6);
        assert_eq!(packet.total_length(), 48);
        assert_eq!(packet.protocol(), IpProtocol::IcmpV6);
    }

    #[test]
    fn truncated_headers_rejected() {
        assert!(IpPacket::from_bytes(vec![0x45, 0, 0]).is_err());
        assert!(IpPacket::from_bytes(vec![0x60; 8]).is_err());
        assert!(IpPacket::from_bytes(vec![0x35; 20]).is_err());
    }
}
