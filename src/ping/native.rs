//! Native ICMP echo client over a host raw socket.
//!
//! One nonblocking raw socket per client, bound to the proxied source
//! address and driven through tokio's AsyncFd. The socket sees every
//! ICMP message the host delivers, so replies are matched by identifier
//! and sequence; the owning proxy keeps at most one echo in flight.
//!
//! Raw ICMP sockets require elevated privileges on most systems; pools
//! built for tests inject a mock client instead.

use std::net::{IpAddr, SocketAddr};
use std::os::fd::AsRawFd;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use socket2::{Domain, Protocol, Type};
use tokio::io::unix::AsyncFd;
use tracing::trace;

use crate::error::{Error, Result};
use crate::packet::{
    build_echo_message, ICMPV4_ECHO_REPLY, ICMPV4_ECHO_REQUEST, ICMPV6_ECHO_REPLY,
    ICMPV6_ECHO_REQUEST,
};
use crate::ping::{EchoClient, EchoClientFactory};

/// Wrapper so `socket2::Socket` registers with tokio's AsyncFd.
struct RawIcmpSocket(socket2::Socket);

impl AsRawFd for RawIcmpSocket {
    fn as_raw_fd(&self) -> std::os::fd::RawFd {
        self.0.as_raw_fd()
    }
}

/// Host echo client bound to one IPv4 or IPv6 source address.
pub struct NativeEchoClient {
    fd: AsyncFd<RawIcmpSocket>,
    source: IpAddr,
    identifier: u16,
    next_sequence: AtomicU16,
}

impl NativeEchoClient {
    /// Open a raw ICMP socket bound to `source`.
    pub fn new(source: IpAddr) -> Result<Self> {
        let (domain, protocol) = match source {
            IpAddr::V4(_) => (Domain::IPV4, Protocol::ICMPV4),
            IpAddr::V6(_) => (Domain::IPV6, Protocol::ICMPV6),
        };
        let socket = socket2::Socket::new(domain, Type::RAW, Some(protocol))?;
        socket.set_nonblocking(true)?;
        socket.bind(&SocketAddr::new(source, 0).into())?;

        Ok(Self {
            fd: AsyncFd::new(RawIcmpSocket(socket))?,
            source,
            identifier: rand::random(),
            next_sequence: AtomicU16::new(1),
        })
    }

    async fn send_message(&self, destination: IpAddr, message: &[u8]) -> Result<()> {
        let dest: socket2::SockAddr = SocketAddr::new(destination, 0).into();
        loop {
            let mut guard = self.fd.writable().await?;
            match guard.try_io(|inner| inner.get_ref().0.send_to(message, &dest)) {
                Ok(sent) => {
                    let n = sent?;
                    if n != message.len() {
                        return Err(Error::ShortWrite {
                            written: n,
                            requested: message.len(),
                        });
                    }
                    return Ok(());
                }
                Err(_would_block) => continue,
            }
        }
    }

    async fn recv_matching(&self, identifier: u16, sequence: u16) -> Result<Vec<u8>> {
        let is_v6 = self.source.is_ipv6();
        let mut buf = vec![0u8; u16::MAX as usize];
        loop {
            let mut guard = self.fd.readable().await?;
            let received = guard.try_io(|inner| {
                // SAFETY: reading into a valid owned buffer from a raw
                // socket fd.
                let n = unsafe {
                    libc::recv(
                        inner.get_ref().as_raw_fd(),
                        buf.as_mut_ptr().cast(),
                        buf.len(),
                        0,
                    )
                };
                if n < 0 {
                    Err(std::io::Error::last_os_error())
                } else {
                    Ok(n as usize)
                }
            });
            match received {
                Ok(Ok(n)) => {
                    if let Some(payload) = match_echo_reply(&buf[..n], is_v6, identifier, sequence)
                    {
                        return Ok(payload);
                    }
                    // Unrelated ICMP traffic on the raw socket; keep waiting.
                }
                Ok(Err(e)) => return Err(e.into()),
                Err(_would_block) => continue,
            }
        }
    }
}

#[async_trait]
impl EchoClient for NativeEchoClient {
    async fn echo(
        &self,
        destination: IpAddr,
        payload: &[u8],
        timeout: Duration,
    ) -> Result<Vec<u8>> {
        if destination.is_ipv6() != self.source.is_ipv6() {
            return Err(Error::invalid_state("address family mismatch"));
        }

        let sequence = self.next_sequence.fetch_add(1, Ordering::Relaxed);
        let request_type = if destination.is_ipv6() {
            ICMPV6_ECHO_REQUEST
        } else {
            ICMPV4_ECHO_REQUEST
        };
        let message = build_echo_message(request_type, self.identifier, sequence, payload);

        self.send_message(destination, &message).await?;
        trace!(source = %self.source, %destination, sequence, "echo sent");

        tokio::time::timeout(timeout, self.recv_matching(self.identifier, sequence))
            .await
            .map_err(|_| {
                Error::Io(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    format!("no echo reply from {destination}"),
                ))
            })?
    }
}

/// Extract the reply payload if `buf` holds the echo reply we wait for.
///
/// IPv4 raw sockets deliver the IP header in front of the ICMP message;
/// IPv6 sockets deliver the ICMP message alone.
fn match_echo_reply(buf: &[u8], is_v6: bool, identifier: u16, sequence: u16) -> Option<Vec<u8>> {
    let (message, reply_type) = if is_v6 {
        (buf, ICMPV6_ECHO_REPLY)
    } else {
        if buf.len() < 20 {
            return None;
        }
        let ihl = ((buf[0] & 0x0F) as usize) * 4;
        (buf.get(ihl..)?, ICMPV4_ECHO_REPLY)
    };

    if message.len() < 8 || message[0] != reply_type {
        return None;
    }
    if u16::from_be_bytes([message[4], message[5]]) != identifier
        || u16::from_be_bytes([message[6], message[7]]) != sequence
    {
        return None;
    }
    Some(message[8..].to_vec())
}

/// Default factory creating native clients per source address.
pub struct NativeEchoClientFactory;

impl EchoClientFactory for NativeEchoClientFactory {
    fn create(&self, source: IpAddr) -> Result<Arc<dyn EchoClient>> {
        Ok(Arc::new(NativeEchoClient::new(source)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn v4_reply(identifier: u16, sequence: u16, payload: &[u8]) -> Vec<u8> {
        let mut buf = vec![0u8; 20];
        buf[0] = 0x45;
        let mut message = vec![ICMPV4_ECHO_REPLY, 0, 0, 0];
        message.extend_from_slice(&identifier.to_be_bytes());
        message.extend_from_slice(&sequence.to_be_bytes());
        message.extend_from_slice(payload);
        buf.extend_from_slice(&message);
        buf
    }

    #[test]
    fn matches_v4_reply_behind_ip_header() {
        let buf = v4_reply(42, 7, b"data");
        assert_eq!(
            match_echo_reply(&buf, false, 42, 7),
            Some(b"data".to_vec())
        );
    }

    #[test]
    fn ignores_wrong_identifier_or_sequence() {
        let buf = v4_reply(42, 7, b"data");
        assert_eq!(match_echo_reply(&buf, false, 42, 8), None);
        assert_eq!(match_echo_reply(&buf, false, 43, 7), None);
    }

    #[test]
    fn ignores_non_reply_types() {
        let mut buf = v4_reply(42, 7, b"data");
        buf[20] = ICMPV4_ECHO_REQUEST;
        assert_eq!(match_echo_reply(&buf, false, 42, 7), None);
    }

    #[test]
    fn matches_v6_reply_without_ip_header() {
        let mut message = vec![ICMPV6_ECHO_REPLY, 0, 0, 0];
        message.extend_from_slice(&9u16.to_be_bytes());
        message.extend_from_slice(&3u16.to_be_bytes());
        message.extend_from_slice(b"p6");
        assert_eq!(match_echo_reply(&message, true, 9, 3), Some(b"p6".to_vec()));
    }

    #[test]
    fn truncated_buffers_ignored() {
        assert_eq!(match_echo_reply(&[0u8; 6], false, 1, 1), None);
        assert_eq!(match_echo_reply(&[0u8; 6], true, 1, 1), None);
    }
}
