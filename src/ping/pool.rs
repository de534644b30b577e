//! Bounded pool of ping emulation workers keyed by source address.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::packet::{parse_echo, IpPacket};
use crate::ping::{EchoClientFactory, NativeEchoClientFactory, PacketProxyReceiver, PingProxy};

fn default_max_client_count() -> usize {
    128
}

fn default_icmp_timeout() -> Duration {
    Duration::from_secs(30)
}

/// Configuration for a ping proxy pool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PingProxyPoolOptions {
    /// Hard cap on concurrently held host ICMP clients.
    #[serde(default = "default_max_client_count")]
    pub max_client_count: usize,
    /// Per-echo timeout.
    #[serde(default = "default_icmp_timeout")]
    pub icmp_timeout: Duration,
}

impl Default for PingProxyPoolOptions {
    fn default() -> Self {
        Self {
            max_client_count: default_max_client_count(),
            icmp_timeout: default_icmp_timeout(),
        }
    }
}

/// Maps tunneled source addresses to ping proxies, evicting the least
/// recently used entry once the cap is reached.
///
/// The map mutex is held only across map mutations, never across echo
/// I/O; echoes run on spawned tasks and replies may arrive out of order
/// relative to requests.
pub struct PingProxyPool {
    receiver: Arc<dyn PacketProxyReceiver>,
    client_factory: Arc<dyn EchoClientFactory>,
    proxies: std::sync::Mutex<HashMap<IpAddr, Arc<PingProxy>>>,
    max_client_count: usize,
    icmp_timeout: Duration,
}

impl PingProxyPool {
    /// Create a pool backed by native host ICMP sockets.
    pub fn new(receiver: Arc<dyn PacketProxyReceiver>, options: PingProxyPoolOptions) -> Self {
        Self::with_client_factory(receiver, options, Arc::new(NativeEchoClientFactory))
    }

    /// Create a pool with a custom echo client factory.
    pub fn with_client_factory(
        receiver: Arc<dyn PacketProxyReceiver>,
        options: PingProxyPoolOptions,
        client_factory: Arc<dyn EchoClientFactory>,
    ) -> Self {
        assert!(options.max_client_count > 0, "pool cap must be positive");
        Self {
            receiver,
            client_factory,
            proxies: std::sync::Mutex::new(HashMap::new()),
            max_client_count: options.max_client_count,
            icmp_timeout: options.icmp_timeout,
        }
    }

    /// Number of live proxies; never exceeds `max_client_count`.
    pub fn len(&self) -> usize {
        self.proxies.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.proxies.lock().unwrap().is_empty()
    }

    /// Dispatch one tunneled echo request to the proxy owning its source
    /// address, creating or recycling a proxy as needed.
    ///
    /// The echo itself runs on its own task; failures there are logged
    /// and the packet is dropped, like any other tunnel loss.
    pub fn send_packet(&self, packet: IpPacket) -> Result<()> {
        let echo = parse_echo(&packet)?;
        if !echo.is_request() {
            return Err(Error::malformed("not an echo request"));
        }

        let proxy = self.obtain(packet.source())?;
        proxy.touch();
        tokio::spawn(async move {
            if let Err(e) = proxy.send_packet(packet).await {
                warn!(error = %e, "ping emulation failed");
            }
        });
        Ok(())
    }

    /// Look up or create the proxy for `source`.
    ///
    /// The echo client is created outside the map lock; a concurrent
    /// creator for the same source wins by insertion order and the loser
    /// is discarded.
    fn obtain(&self, source: IpAddr) -> Result<Arc<PingProxy>> {
        if let Some(proxy) = self.proxies.lock().unwrap().get(&source) {
            return Ok(proxy.clone());
        }

        let client = self.client_factory.create(source)?;
        let proxy = Arc::new(PingProxy::new(
            source,
            client,
            self.receiver.clone(),
            self.icmp_timeout,
        ));

        let mut map = self.proxies.lock().unwrap();
        if let Some(existing) = map.get(&source) {
            return Ok(existing.clone());
        }
        if map.len() >= self.max_client_count {
            if let Some(lru) = map
                .iter()
                .min_by_key(|(_, p)| p.last_used())
                .map(|(ip, _)| *ip)
            {
                map.remove(&lru);
                debug!(evicted = %lru, "ping proxy pool full, evicted least recently used");
            }
        }
        map.insert(source, proxy.clone());
        Ok(proxy)
    }
}
