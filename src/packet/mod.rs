//! IP packet handling for the tunneling core.
//!
//! This module contains:
//! - IpPacket: an owned, parsed IPv4/IPv6 datagram with checksum upkeep
//! - PacketCodec: batch parsing and serialization for channel payloads
//! - ICMP echo helpers used by the ping proxy

mod codec;
mod icmp;
mod ip;

pub use codec::PacketCodec;
pub use icmp::{
    build_echo_message, build_echo_reply, parse_echo, EchoMessage, ICMPV4_ECHO_REPLY,
    ICMPV4_ECHO_REQUEST, ICMPV6_ECHO_REPLY, ICMPV6_ECHO_REQUEST,
};
pub use ip::{IpPacket, IpProtocol, IPV4_HEADER_MIN, IPV6_HEADER_LEN};
