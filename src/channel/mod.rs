//! Packet channels: encrypted transports for batches of IP packets.
//!
//! This module contains:
//! - The DatagramChannel trait implemented by every channel kind
//! - Lifecycle, traffic and activity bookkeeping shared by channels
//! - UdpChannel: the legacy single-session encrypted UDP framing
//! - UdpChannelTransmitter: the shared-socket multi-session framing

mod udp_channel;
mod udp_transmitter;

pub use udp_channel::{UdpChannel, UdpChannelOptions};
pub use udp_transmitter::{SessionReceiver, UdpChannelTransmitter, TRANSMITTER_HEADER_LEN};

use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::time::Instant;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::error::Result;
use crate::packet::IpPacket;

/// A batch of packets delivered by one channel ingress event.
pub type PacketBatch = Vec<IpPacket>;

/// Sender half of the packet-received event.
///
/// Unbounded on purpose: emission happens on the receive task and must
/// never suspend it.
pub type PacketSender = mpsc::UnboundedSender<PacketBatch>;

/// Receiver half of the packet-received event.
pub type PacketReceiver = mpsc::UnboundedReceiver<PacketBatch>;

/// Channel lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    New,
    Started,
    Disposed,
}

/// Traffic counter snapshot in bytes of channel payload.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Traffic {
    pub sent: u64,
    pub received: u64,
}

impl Traffic {
    pub fn total(&self) -> u64 {
        self.sent + self.received
    }
}

impl std::ops::Add for Traffic {
    type Output = Traffic;

    fn add(self, rhs: Traffic) -> Traffic {
        Traffic {
            sent: self.sent + rhs.sent,
            received: self.received + rhs.received,
        }
    }
}

/// An encrypted bidirectional transport for batches of IP packets.
///
/// A channel owns itself until attached to a tunnel; the tunnel then owns
/// it for the rest of its lifetime. Sends require external serialization
/// per channel (the tunnel never overlaps sends to one channel); receive
/// events are emitted from the channel's own background task.
#[async_trait]
pub trait DatagramChannel: Send + Sync {
    /// Unique channel identity.
    fn channel_id(&self) -> &str;

    fn state(&self) -> ChannelState;

    fn is_connected(&self) -> bool;

    fn traffic(&self) -> Traffic;

    /// Instant of the last send or receive on this channel.
    fn last_activity(&self) -> Instant;

    /// Largest packet batch in bytes accepted by `send_packets`.
    fn mtu(&self) -> usize;

    /// Start the receive loop, delivering ingress batches to `events`.
    ///
    /// Starting an already started or disposed channel is a no-op.
    fn start(&self, events: PacketSender);

    /// Send one batch of packets as a single datagram.
    async fn send_packets(&self, packets: &[IpPacket]) -> Result<()>;

    /// Tear the channel down: cancel the receive loop and close the
    /// socket. Idempotent.
    fn dispose(&self);
}

/// Atomic lifecycle cell shared by channel implementations.
#[derive(Debug)]
pub(crate) struct StateCell(AtomicU8);

impl StateCell {
    const NEW: u8 = 0;
    const STARTED: u8 = 1;
    const DISPOSED: u8 = 2;

    pub fn new() -> Self {
        Self(AtomicU8::new(Self::NEW))
    }

    pub fn get(&self) -> ChannelState {
        match self.0.load(Ordering::Acquire) {
            Self::NEW => ChannelState::New,
            Self::STARTED => ChannelState::Started,
            _ => ChannelState::Disposed,
        }
    }

    /// `New -> Started`; false if the channel already left `New`.
    pub fn try_start(&self) -> bool {
        self.0
            .compare_exchange(
                Self::NEW,
                Self::STARTED,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    /// `* -> Disposed`; false if already disposed.
    pub fn dispose(&self) -> bool {
        self.0.swap(Self::DISPOSED, Ordering::AcqRel) != Self::DISPOSED
    }
}

/// Atomic traffic counters; snapshots are taken lock-free.
#[derive(Debug, Default)]
pub(crate) struct TrafficCounters {
    sent: AtomicU64,
    received: AtomicU64,
}

impl TrafficCounters {
    pub fn add_sent(&self, bytes: u64) {
        self.sent.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn add_received(&self, bytes: u64) {
        self.received.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn sent(&self) -> u64 {
        self.sent.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> Traffic {
        Traffic {
            sent: self.sent.load(Ordering::Relaxed),
            received: self.received.load(Ordering::Relaxed),
        }
    }
}

/// Millisecond-resolution last-activity clock.
///
/// Stores an offset from a per-channel epoch so readers stay lock-free.
#[derive(Debug)]
pub(crate) struct ActivityClock {
    epoch: Instant,
    last_ms: AtomicU64,
}

impl ActivityClock {
    pub fn new() -> Self {
        Self {
            epoch: Instant::now(),
            last_ms: AtomicU64::new(0),
        }
    }

    pub fn touch(&self) {
        let ms = self.epoch.elapsed().as_millis() as u64;
        self.last_ms.fetch_max(ms, Ordering::Relaxed);
    }

    pub fn last_activity(&self) -> Instant {
        self.epoch + std::time::Duration::from_millis(self.last_ms.load(Ordering::Relaxed))
    }
}
