//! ICMP echo parsing and construction for the ping proxy.
//!
//! Echo message layout (both families):
//! ```text
//! 0       Type
//! 1       Code
//! 2-3     Checksum
//! 4-5     Identifier
//! 6-7     Sequence Number
//! 8+      Payload
//! ```

use std::net::IpAddr;

use crate::error::{Error, Result};
use crate::packet::ip::{finish_checksum, sum_be_words};
use crate::packet::{IpPacket, IpProtocol};

pub const ICMPV4_ECHO_REQUEST: u8 = 8;
pub const ICMPV4_ECHO_REPLY: u8 = 0;
pub const ICMPV6_ECHO_REQUEST: u8 = 128;
pub const ICMPV6_ECHO_REPLY: u8 = 129;

/// Echo message header length.
const ECHO_HEADER_LEN: usize = 8;

/// A parsed ICMP echo request or reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EchoMessage {
    pub icmp_type: u8,
    pub identifier: u16,
    pub sequence: u16,
    pub payload: Vec<u8>,
}

impl EchoMessage {
    pub fn is_request(&self) -> bool {
        self.icmp_type == ICMPV4_ECHO_REQUEST || self.icmp_type == ICMPV6_ECHO_REQUEST
    }
}

/// Parse an ICMP echo request or reply out of an IP packet.
pub fn parse_echo(packet: &IpPacket) -> Result<EchoMessage> {
    let expected_types: [u8; 2] = match packet.protocol() {
        IpProtocol::Icmp => [ICMPV4_ECHO_REQUEST, ICMPV4_ECHO_REPLY],
        IpProtocol::IcmpV6 => [ICMPV6_ECHO_REQUEST, ICMPV6_ECHO_REPLY],
        other => {
            return Err(Error::malformed(format!(
                "not an ICMP packet (protocol {other})"
            )))
        }
    };

    let message = packet.payload();
    if message.len() < ECHO_HEADER_LEN {
        return Err(Error::malformed("truncated ICMP echo header"));
    }
    let icmp_type = message[0];
    if !expected_types.contains(&icmp_type) {
        return Err(Error::malformed(format!(
            "ICMP type {icmp_type} is not an echo message"
        )));
    }

    Ok(EchoMessage {
        icmp_type,
        identifier: u16::from_be_bytes([message[4], message[5]]),
        sequence: u16::from_be_bytes([message[6], message[7]]),
        payload: message[ECHO_HEADER_LEN..].to_vec(),
    })
}

/// Serialize a raw echo message for a native ICMP socket.
///
/// The IPv4 checksum is filled in here; for ICMPv6 the field stays zero
/// because the kernel computes it over the pseudo-header on send.
pub fn build_echo_message(
    icmp_type: u8,
    identifier: u16,
    sequence: u16,
    payload: &[u8],
) -> Vec<u8> {
    let mut message = vec![0u8; ECHO_HEADER_LEN + payload.len()];
    message[0] = icmp_type;
    message[4..6].copy_from_slice(&identifier.to_be_bytes());
    message[6..8].copy_from_slice(&sequence.to_be_bytes());
    message[ECHO_HEADER_LEN..].copy_from_slice(payload);

    if icmp_type == ICMPV4_ECHO_REQUEST {
        let checksum = finish_checksum(sum_be_words(&message));
        message[2..4].copy_from_slice(&checksum.to_be_bytes());
    }
    message
}

/// Build the echo reply for a request, carrying the echoed payload.
///
/// Source and destination are swapped, the type flips to EchoReply,
/// identifier and sequence are preserved, and all checksums are
/// recomputed.
pub fn build_echo_reply(request: &IpPacket, payload: &[u8]) -> Result<IpPacket> {
    let echo = parse_echo(request)?;
    if !echo.is_request() {
        return Err(Error::malformed("cannot reply to an echo reply"));
    }

    let mut message = vec![0u8; ECHO_HEADER_LEN + payload.len()];
    message[0] = if request.protocol() == IpProtocol::Icmp {
        ICMPV4_ECHO_REPLY
    } else {
        ICMPV6_ECHO_REPLY
    };
    message[4..6].copy_from_slice(&echo.identifier.to_be_bytes());
    message[6..8].copy_from_slice(&echo.sequence.to_be_bytes());
    message[ECHO_HEADER_LEN..].copy_from_slice(payload);

    match (request.source(), request.destination()) {
        (IpAddr::V4(src), IpAddr::V4(dst)) => {
            IpPacket::build_v4(IpProtocol::Icmp, dst, src, &message)
        }
        (IpAddr::V6(src), IpAddr::V6(dst)) => {
            IpPacket::build_v6(IpProtocol::IcmpV6, dst, src, &message)
        }
        _ => Err(Error::malformed("mixed address families")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn request(id: u16, seq: u16, payload: &[u8]) -> IpPacket {
        let message = build_echo_message(ICMPV4_ECHO_REQUEST, id, seq, payload);
        IpPacket::build_v4(
            IpProtocol::Icmp,
            Ipv4Addr::new(192, 168, 0, 10),
            Ipv4Addr::new(1, 1, 1, 1),
            &message,
        )
        .unwrap()
    }

    #[test]
    fn parse_round_trip() {
        let packet = request(0x1234, 7, b"ping-payload");
        let echo = parse_echo(&packet).unwrap();
        assert!(echo.is_request());
        assert_eq!(echo.identifier, 0x1234);
        assert_eq!(echo.sequence, 7);
        assert_eq!(echo.payload, b"ping-payload");
    }

    #[test]
    fn echo_message_checksum_verifies() {
        let message = build_echo_message(ICMPV4_ECHO_REQUEST, 9, 1, b"abc");
        assert_eq!(finish_checksum(sum_be_words(&message)), 0);
    }

    #[test]
    fn reply_swaps_and_preserves() {
        let packet = request(42, 3, b"data");
        let reply = build_echo_reply(&packet, b"data").unwrap();

        assert_eq!(reply.source(), packet.destination());
        assert_eq!(reply.destination(), packet.source());

        let echo = parse_echo(&reply).unwrap();
        assert!(!echo.is_request());
        assert_eq!(echo.identifier, 42);
        assert_eq!(echo.sequence, 3);
        assert_eq!(echo.payload, b"data");
    }

    #[test]
    fn reply_to_reply_rejected() {
        let packet = request(1, 1, b"x");
        let reply = build_echo_reply(&packet, b"x").unwrap();
        assert!(build_echo_reply(&reply, b"x").is_err());
    }

    #[test]
    fn non_icmp_rejected() {
        let udp = IpPacket::build_v4(
            IpProtocol::Udp,
            Ipv4Addr::new(10, 0, 0, 1),
            Ipv4Addr::new(10, 0, 0, 2),
            &[0u8; 12],
        )
        .unwrap();
        assert!(parse_echo(&udp).is_err());
    }
}
