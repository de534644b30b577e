//! Legacy encrypted UDP datagram channel.
//!
//! One channel owns one connected UDP socket and carries one session,
//! identified by the 32-bit low half of the session id. Batches of IP
//! packets travel in single datagrams, XORed against the session-key
//! keystream at a position carried in the datagram header.
//!
//! ## Wire Format
//!
//! ```text
//! client -> server:  sessionId(4) | cryptoPos(8) | Enc( sessionId(4) | packet* )
//! server -> client:                 cryptoPos(8) | Enc( sessionId(4) | packet* )
//! ```
//!
//! All integers little-endian. `Enc` is the keystream XOR at `cryptoPos`.
//! The post-cipher session id is an integrity witness: a decryption with
//! the wrong key or position garbles it, and the datagram is dropped.
//!
//! Keystream positions are the per-direction running total of encrypted
//! bytes, offset by 2^62 on the server side so the two directions never
//! share a keystream range.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::channel::{
    ActivityClock, ChannelState, DatagramChannel, PacketBatch, PacketSender, StateCell, Traffic,
    TrafficCounters,
};
use crate::crypto::{random_id, BufferCryptor, KEY_SIZE, SERVER_POSITION_BASE};
use crate::error::{Error, Result};
use crate::packet::{IpPacket, PacketCodec};

/// Datagram header length on the client->server direction.
const CLIENT_HEADER_LEN: usize = 12;

/// Datagram header length on the server->client direction.
const SERVER_HEADER_LEN: usize = 8;

/// Length of the enciphered session-id witness.
const WITNESS_LEN: usize = 4;

fn default_mtu() -> usize {
    1400
}

/// Configuration for a legacy UDP channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UdpChannelOptions {
    /// Session identity; the legacy framing carries the 32-bit low half.
    pub session_id: u32,
    /// AES-128 session key shared by both ends.
    pub key: [u8; KEY_SIZE],
    /// Server endpoints cipher from the 2^62 keystream midpoint.
    pub is_server: bool,
    /// Fragmentation-allowed MTU for outgoing datagrams.
    #[serde(default = "default_mtu")]
    pub mtu: usize,
}

/// The legacy encrypted UDP packet channel.
///
/// Cheap to clone; clones share the underlying channel.
#[derive(Clone)]
pub struct UdpChannel {
    inner: Arc<Inner>,
}

struct Inner {
    channel_id: String,
    socket: UdpSocket,
    session_id: u32,
    is_server: bool,
    mtu: usize,
    cryptor: BufferCryptor,
    position_base: i64,
    state: StateCell,
    connected: AtomicBool,
    traffic: TrafficCounters,
    activity: ActivityClock,
    send_state: tokio::sync::Mutex<SendState>,
    recv_task: std::sync::Mutex<Option<JoinHandle<()>>>,
}

/// Send-side state guarded by one mutex: the keystream position derives
/// from `sent_bytes`, so composition and position assignment must not
/// interleave.
struct SendState {
    sent_bytes: u64,
    buf: Vec<u8>,
}

impl UdpChannel {
    /// Create a channel over a bound and connected UDP socket.
    pub fn new(socket: UdpSocket, options: UdpChannelOptions) -> Self {
        let position_base = if options.is_server {
            SERVER_POSITION_BASE
        } else {
            0
        };
        Self {
            inner: Arc::new(Inner {
                channel_id: random_id("udp"),
                socket,
                session_id: options.session_id,
                is_server: options.is_server,
                mtu: options.mtu,
                cryptor: BufferCryptor::new(options.key),
                position_base,
                state: StateCell::new(),
                connected: AtomicBool::new(false),
                traffic: TrafficCounters::default(),
                activity: ActivityClock::new(),
                send_state: tokio::sync::Mutex::new(SendState {
                    sent_bytes: 0,
                    buf: Vec::with_capacity(2048),
                }),
                recv_task: std::sync::Mutex::new(None),
            }),
        }
    }

    pub fn session_id(&self) -> u32 {
        self.inner.session_id
    }

    /// Local address of the owned socket.
    pub fn local_addr(&self) -> Result<std::net::SocketAddr> {
        Ok(self.inner.socket.local_addr()?)
    }

    fn send_header_len(&self) -> usize {
        if self.inner.is_server {
            SERVER_HEADER_LEN
        } else {
            CLIENT_HEADER_LEN
        }
    }
}

#[async_trait]
impl DatagramChannel for UdpChannel {
    fn channel_id(&self) -> &str {
        &self.inner.channel_id
    }

    fn state(&self) -> ChannelState {
        self.inner.state.get()
    }

    fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::Acquire)
    }

    fn traffic(&self) -> Traffic {
        self.inner.traffic.snapshot()
    }

    fn last_activity(&self) -> Instant {
        self.inner.activity.last_activity()
    }

    fn mtu(&self) -> usize {
        self.inner.mtu - self.send_header_len()
    }

    fn start(&self, events: PacketSender) {
        if !self.inner.state.try_start() {
            return;
        }
        self.inner.connected.store(true, Ordering::Release);
        self.inner.activity.touch();

        let inner = self.inner.clone();
        let task = tokio::spawn(async move {
            run_receive_loop(&inner, events).await;
        });
        *self.inner.recv_task.lock().unwrap() = Some(task);
        debug!(channel_id = %self.inner.channel_id, "UDP channel started");
    }

    async fn send_packets(&self, packets: &[IpPacket]) -> Result<()> {
        let inner = &*self.inner;
        match inner.state.get() {
            ChannelState::Started => {}
            ChannelState::New => return Err(Error::invalid_state("channel not started")),
            ChannelState::Disposed => return Err(Error::StreamClosed),
        }

        let batch_len = PacketCodec::batch_len(packets);
        let header_len = self.send_header_len();
        let budget = inner.mtu - header_len;
        if batch_len > budget {
            return Err(Error::Oversized {
                size: batch_len,
                budget,
            });
        }
        let enciphered_len = (WITNESS_LEN + batch_len) as u64;

        let mut state = inner.send_state.lock().await;
        let crypto_pos = inner.position_base + state.sent_bytes as i64;

        let SendState { buf, .. } = &mut *state;
        buf.clear();
        if !inner.is_server {
            buf.extend_from_slice(&inner.session_id.to_le_bytes());
        }
        buf.extend_from_slice(&crypto_pos.to_le_bytes());
        buf.extend_from_slice(&inner.session_id.to_le_bytes());
        PacketCodec::serialize_into(packets, buf);

        let end = buf.len();
        inner.cryptor.cipher_range(buf, header_len, end, crypto_pos);

        let written = match inner.socket.send(buf).await {
            Ok(n) => n,
            Err(e) => {
                let err = Error::from(e);
                if err.is_fatal() {
                    inner.mark_disposed();
                }
                return Err(err);
            }
        };
        if written != end {
            return Err(Error::ShortWrite {
                written,
                requested: end,
            });
        }

        state.sent_bytes += enciphered_len;
        inner.traffic.add_sent(enciphered_len);
        inner.activity.touch();
        trace!(channel_id = %inner.channel_id, packets = packets.len(), bytes = written, "sent batch");
        Ok(())
    }

    fn dispose(&self) {
        if !self.inner.state.dispose() {
            return;
        }
        self.inner.connected.store(false, Ordering::Release);
        if let Some(task) = self.inner.recv_task.lock().unwrap().take() {
            task.abort();
        }
        debug!(channel_id = %self.inner.channel_id, "UDP channel disposed");
    }
}

impl Inner {
    /// In-task disposal: marks the channel dead without aborting the
    /// receive task (the loop breaks on its own).
    fn mark_disposed(&self) {
        if self.state.dispose() {
            self.connected.store(false, Ordering::Release);
            debug!(channel_id = %self.channel_id, "UDP channel disposed after fatal socket error");
        }
    }

    /// Parse, decrypt and verify one datagram, appending its packets to
    /// the pending batch.
    fn handle_datagram(&self, datagram: &mut [u8], pending: &mut PacketBatch) -> Result<()> {
        // We receive the peer's format: the server parses client framing
        // and vice versa.
        let header_len = if self.is_server {
            CLIENT_HEADER_LEN
        } else {
            SERVER_HEADER_LEN
        };
        if datagram.len() < header_len + WITNESS_LEN {
            return Err(Error::malformed(format!(
                "datagram of {} bytes is shorter than the {}-byte header",
                datagram.len(),
                header_len + WITNESS_LEN
            )));
        }

        let mut offset = 0;
        if self.is_server {
            let outer = u32::from_le_bytes(datagram[..4].try_into().unwrap());
            offset = 4;
            if outer != self.session_id {
                return Err(Error::unauthorized(format!(
                    "outer session id {outer} does not match {}",
                    self.session_id
                )));
            }
        }

        let crypto_pos = i64::from_le_bytes(datagram[offset..offset + 8].try_into().unwrap());
        if crypto_pos < 0 {
            return Err(Error::malformed("negative keystream position"));
        }

        let end = datagram.len();
        self.cryptor
            .cipher_range(datagram, header_len, end, crypto_pos);

        let witness =
            u32::from_le_bytes(datagram[header_len..header_len + WITNESS_LEN].try_into().unwrap());
        if witness != self.session_id {
            return Err(Error::unauthorized(format!(
                "post-cipher session id {witness} does not match {}",
                self.session_id
            )));
        }

        let mut idx = header_len + WITNESS_LEN;
        let packets = PacketCodec::read_all(datagram, &mut idx)?;

        self.traffic.add_received((end - header_len) as u64);
        self.activity.touch();
        pending.extend(packets);
        Ok(())
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        if let Some(task) = self.recv_task.lock().unwrap().take() {
            task.abort();
        }
    }
}

/// Receive loop: reads datagrams and emits the pending batch whenever the
/// socket's readable queue drains. This batches across bursts without
/// adding latency when traffic is idle.
async fn run_receive_loop(inner: &Arc<Inner>, events: PacketSender) {
    let mut buf = vec![0u8; u16::MAX as usize];
    let mut pending: PacketBatch = Vec::new();

    'outer: while inner.state.get() == ChannelState::Started {
        let n = match inner.socket.recv(&mut buf).await {
            Ok(n) => n,
            Err(e) => {
                if handle_socket_error(inner, &e) {
                    break;
                }
                continue;
            }
        };
        process_datagram(inner, &mut buf[..n], &mut pending);

        // Drain whatever the kernel already queued, then emit.
        loop {
            match inner.socket.try_recv(&mut buf) {
                Ok(n) => process_datagram(inner, &mut buf[..n], &mut pending),
                Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    if handle_socket_error(inner, &e) {
                        break 'outer;
                    }
                    break;
                }
            }
        }

        if !pending.is_empty() && events.send(std::mem::take(&mut pending)).is_err() {
            debug!(channel_id = %inner.channel_id, "packet event receiver dropped, stopping");
            inner.mark_disposed();
            break;
        }
    }
}

fn process_datagram(inner: &Inner, datagram: &mut [u8], pending: &mut PacketBatch) {
    if let Err(e) = inner.handle_datagram(datagram, pending) {
        warn!(channel_id = %inner.channel_id, error = %e, "dropping datagram");
    }
}

/// Returns true when the error is fatal and the loop must stop.
fn handle_socket_error(inner: &Inner, e: &std::io::Error) -> bool {
    let err = Error::Io(std::io::Error::new(e.kind(), e.to_string()));
    if err.is_fatal() {
        warn!(channel_id = %inner.channel_id, error = %e, "fatal socket error");
        inner.mark_disposed();
        true
    } else {
        warn!(channel_id = %inner.channel_id, error = %e, "transient socket error");
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;
    use crate::packet::IpProtocol;

    fn options(is_server: bool) -> UdpChannelOptions {
        UdpChannelOptions {
            session_id: 200,
            key: *b"0123456789abcdef",
            is_server,
            mtu: 1400,
        }
    }

    async fn loopback_socket() -> UdpSocket {
        UdpSocket::bind("127.0.0.1:0").await.unwrap()
    }

    #[tokio::test]
    async fn send_requires_started() {
        let socket = loopback_socket().await;
        socket.connect(socket.local_addr().unwrap()).await.unwrap();
        let channel = UdpChannel::new(socket, options(false));

        let packet = IpPacket::build_v4(
            IpProtocol::Udp,
            Ipv4Addr::LOCALHOST,
            Ipv4Addr::LOCALHOST,
            &[0u8; 8],
        )
        .unwrap();
        let err = channel.send_packets(&[packet]).await.unwrap_err();
        assert!(matches!(err, Error::InvalidState(_)));
    }

    #[tokio::test]
    async fn send_after_dispose_fails() {
        let socket = loopback_socket().await;
        socket.connect(socket.local_addr().unwrap()).await.unwrap();
        let channel = UdpChannel::new(socket, options(false));
        let (tx, _rx) = tokio::sync::mpsc::unbounded_channel();
        channel.start(tx);
        channel.dispose();
        channel.dispose(); // idempotent

        let packet = IpPacket::build_v4(
            IpProtocol::Udp,
            Ipv4Addr::LOCALHOST,
            Ipv4Addr::LOCALHOST,
            &[],
        )
        .unwrap();
        let err = channel.send_packets(&[packet]).await.unwrap_err();
        assert!(matches!(err, Error::StreamClosed));
        assert_eq!(channel.state(), ChannelState::Disposed);
        assert!(!channel.is_connected());
    }

    #[tokio::test]
    async fn oversized_batch_rejected() {
        let socket = loopback_socket().await;
        socket.connect(socket.local_addr().unwrap()).await.unwrap();
        let channel = UdpChannel::new(socket, options(false));
        let (tx, _rx) = tokio::sync::mpsc::unbounded_channel();
        channel.start(tx);

        let packet = IpPacket::build_v4(
            IpProtocol::Udp,
            Ipv4Addr::LOCALHOST,
            Ipv4Addr::LOCALHOST,
            &[0u8; 1500],
        )
        .unwrap();
        let err = channel.send_packets(&[packet]).await.unwrap_err();
        assert!(matches!(err, Error::Oversized { .. }));
    }

    #[test]
    fn options_deserialize_with_default_mtu() {
        let opts: UdpChannelOptions = serde_json::from_str(
            r#"{"session_id":200,"key":[0,1,2,3,4,5,6,7,8,9,10,11,12,13,14,15],"is_server":true}"#,
        )
        .unwrap();
        assert_eq!(opts.mtu, 1400);
        assert!(opts.is_server);
    }

    #[test]
    fn budget_arithmetic() {
        // Clients spend 12 header bytes per datagram, servers 8.
        let opts = options(false);
        assert_eq!(opts.mtu - CLIENT_HEADER_LEN, 1388);
        assert_eq!(opts.mtu - SERVER_HEADER_LEN, 1392);
    }
}
