//! Channel aggregation: one packet pipe over many channels.
//!
//! The tunnel owns an ordered set of attached channels, spreads egress
//! batches across them and funnels every channel's ingress into a single
//! packet-received event. Selection prefers connected channels with the
//! oldest activity, which degenerates to round-robin under steady load
//! because each send refreshes the sender's activity clock.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::debug;

use crate::channel::{ChannelState, DatagramChannel, PacketReceiver, PacketSender, Traffic};
use crate::error::{Error, Result};
use crate::packet::IpPacket;

/// Aggregates channels into a single packet pipe.
///
/// Cheap to clone; clones share the channel set. The tunnel owns its
/// channels: disposing the tunnel disposes all of them.
#[derive(Clone)]
pub struct Tunnel {
    inner: Arc<Inner>,
}

struct Inner {
    channels: std::sync::Mutex<Vec<Arc<dyn DatagramChannel>>>,
    event_tx: PacketSender,
    disposed: AtomicBool,
}

impl Tunnel {
    /// Create a tunnel and the receiver for its packet-received event.
    ///
    /// Ingress batches from every attached channel arrive on the
    /// returned receiver verbatim, in channel delivery order.
    pub fn new() -> (Self, PacketReceiver) {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        (
            Self {
                inner: Arc::new(Inner {
                    channels: std::sync::Mutex::new(Vec::new()),
                    event_tx,
                    disposed: AtomicBool::new(false),
                }),
            },
            event_rx,
        )
    }

    /// Attach a channel, starting it if it has not been started yet.
    ///
    /// The tunnel takes ownership for the rest of the channel's life.
    pub fn add_channel(&self, channel: Arc<dyn DatagramChannel>) -> Result<()> {
        if self.inner.disposed.load(Ordering::Acquire) {
            return Err(Error::StreamClosed);
        }
        match channel.state() {
            ChannelState::New => channel.start(self.inner.event_tx.clone()),
            ChannelState::Started => {}
            ChannelState::Disposed => {
                return Err(Error::invalid_state("cannot attach a disposed channel"))
            }
        }
        debug!(channel_id = %channel.channel_id(), "channel attached to tunnel");
        self.inner.channels.lock().unwrap().push(channel);
        Ok(())
    }

    /// Number of attached, not yet disposed channels.
    pub fn channel_count(&self) -> usize {
        let mut channels = self.inner.channels.lock().unwrap();
        channels.retain(|c| c.state() != ChannelState::Disposed);
        channels.len()
    }

    /// Aggregate traffic over all attached channels.
    pub fn traffic(&self) -> Traffic {
        self.inner
            .channels
            .lock()
            .unwrap()
            .iter()
            .map(|c| c.traffic())
            .fold(Traffic::default(), |acc, t| acc + t)
    }

    /// Send a batch, partitioning it into sub-batches no larger than the
    /// selected channel's MTU and spreading them across usable channels.
    ///
    /// A packet bigger than every channel's MTU propagates the channel's
    /// oversize failure; there is no fragmentation here.
    pub async fn send_packets(&self, packets: &[IpPacket]) -> Result<()> {
        if self.inner.disposed.load(Ordering::Acquire) {
            return Err(Error::StreamClosed);
        }

        let mut remaining = packets;
        while !remaining.is_empty() {
            let channel = self.select_channel()?;
            let budget = channel.mtu();

            let mut size = 0;
            let mut count = 0;
            for packet in remaining {
                let next = size + packet.total_length();
                if count > 0 && next > budget {
                    break;
                }
                size = next;
                count += 1;
            }

            let (batch, rest) = remaining.split_at(count);
            channel.send_packets(batch).await?;
            remaining = rest;
        }
        Ok(())
    }

    /// Pick the connected channel with the oldest activity, pruning
    /// disposed channels on the way.
    fn select_channel(&self) -> Result<Arc<dyn DatagramChannel>> {
        let mut channels = self.inner.channels.lock().unwrap();
        channels.retain(|c| c.state() != ChannelState::Disposed);
        channels
            .iter()
            .filter(|c| c.is_connected())
            .min_by_key(|c| c.last_activity())
            .cloned()
            .ok_or(Error::NoChannel)
    }

    /// Dispose the tunnel and every owned channel. Idempotent.
    pub fn dispose(&self) {
        if self.inner.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        let channels: Vec<_> = self.inner.channels.lock().unwrap().drain(..).collect();
        for channel in &channels {
            channel.dispose();
        }
        debug!(channels = channels.len(), "tunnel disposed");
    }
}
