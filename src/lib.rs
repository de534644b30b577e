//! Tunneling core of a VPN data plane.
//!
//! This crate multiplexes IP packets over encrypted transport channels
//! between a client and a server:
//!
//! - [`channel::UdpChannel`] — encrypted UDP framing for packet batches
//!   over a single socket, one session per channel
//! - [`channel::UdpChannelTransmitter`] — one shared UDP socket carrying
//!   many sessions with per-datagram header obfuscation
//! - [`stream::ChunkStream`] — length-delimited framing over a reliable
//!   byte stream, terminable in-band so the transport can be reused
//! - [`ping::PingProxyPool`] — bounded pool of host ICMP echo workers
//!   answering tunneled ping traffic
//! - [`tunnel::Tunnel`] — channel aggregation with round-robin egress and
//!   a single ingress event
//!
//! Session establishment, key negotiation, authentication, TUN/TAP and
//! any CLI live in the layers around this crate.

pub mod channel;
pub mod crypto;
pub mod error;
pub mod packet;
pub mod ping;
pub mod stream;
pub mod tunnel;

pub use channel::{
    ChannelState, DatagramChannel, PacketBatch, PacketReceiver, PacketSender, Traffic, UdpChannel,
    UdpChannelOptions, UdpChannelTransmitter,
};
pub use crypto::BufferCryptor;
pub use error::{Error, Result};
pub use packet::{IpPacket, IpProtocol, PacketCodec};
pub use ping::{PacketProxyReceiver, PingProxy, PingProxyPool, PingProxyPoolOptions};
pub use stream::ChunkStream;
pub use tunnel::Tunnel;
