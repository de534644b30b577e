//! A single ping emulation worker scoped to one source address.

use std::collections::HashSet;
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::trace;

use crate::error::{Error, Result};
use crate::packet::{build_echo_reply, parse_echo, IpPacket};
use crate::ping::{EchoClient, PacketProxyReceiver};

/// Emulates ICMP echo for one tunneled source address.
///
/// The proxy serializes its own in-flight echoes; concurrent callers on
/// the same source queue behind one another while distinct sources run in
/// parallel.
pub struct PingProxy {
    source: IpAddr,
    client: Arc<dyn EchoClient>,
    receiver: Arc<dyn PacketProxyReceiver>,
    timeout: Duration,
    last_used: std::sync::Mutex<Instant>,
    in_flight: tokio::sync::Mutex<()>,
    seen_remotes: std::sync::Mutex<HashSet<IpAddr>>,
    used_once: AtomicBool,
}

impl PingProxy {
    pub(crate) fn new(
        source: IpAddr,
        client: Arc<dyn EchoClient>,
        receiver: Arc<dyn PacketProxyReceiver>,
        timeout: Duration,
    ) -> Self {
        Self {
            source,
            client,
            receiver,
            timeout,
            last_used: std::sync::Mutex::new(Instant::now()),
            in_flight: tokio::sync::Mutex::new(()),
            seen_remotes: std::sync::Mutex::new(HashSet::new()),
            used_once: AtomicBool::new(false),
        }
    }

    /// The tunneled source address this proxy answers for.
    pub fn source(&self) -> IpAddr {
        self.source
    }

    pub(crate) fn touch(&self) {
        *self.last_used.lock().unwrap() = Instant::now();
    }

    pub(crate) fn last_used(&self) -> Instant {
        *self.last_used.lock().unwrap()
    }

    /// Emulate one echo request and deliver the reply to the receiver.
    pub async fn send_packet(&self, packet: IpPacket) -> Result<()> {
        let echo = parse_echo(&packet)?;
        if !echo.is_request() {
            return Err(Error::malformed("not an echo request"));
        }
        let remote = packet.destination();
        self.notify_endpoints(&packet, remote);

        let reply_payload = {
            let _guard = self.in_flight.lock().await;
            self.client.echo(remote, &echo.payload, self.timeout).await?
        };

        let reply = build_echo_reply(&packet, &reply_payload)?;
        trace!(source = %self.source, %remote, sequence = echo.sequence, "echo reply emulated");
        self.receiver.on_packet_received(reply).await;
        Ok(())
    }

    fn notify_endpoints(&self, packet: &IpPacket, remote: IpAddr) {
        let is_new_local = !self.used_once.swap(true, Ordering::AcqRel);
        let is_new_remote = self.seen_remotes.lock().unwrap().insert(remote);

        if is_new_remote {
            self.receiver
                .on_new_remote_endpoint(packet.protocol(), remote);
        }
        if is_new_local || is_new_remote {
            self.receiver.on_new_endpoint(
                packet.protocol(),
                self.source,
                remote,
                is_new_local,
                is_new_remote,
            );
        }
    }
}
