//! ICMP echo emulation for tunneled ping traffic.
//!
//! Echo requests whose destination lies outside the tunnel are re-issued
//! from the host network stack and the replies are fed back into the
//! tunnel's ingress path. One PingProxy serves one source address; the
//! pool bounds how many host ICMP clients exist at once.

mod native;
mod pool;
mod proxy;

pub use native::{NativeEchoClient, NativeEchoClientFactory};
pub use pool::{PingProxyPool, PingProxyPoolOptions};
pub use proxy::PingProxy;

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::Result;
use crate::packet::{IpPacket, IpProtocol};

/// A host-side ICMP echo issuer bound to one source address.
///
/// The native implementation drives a raw ICMP socket; tests substitute
/// their own.
#[async_trait]
pub trait EchoClient: Send + Sync {
    /// Issue one echo to `destination` and return the reply payload.
    async fn echo(
        &self,
        destination: IpAddr,
        payload: &[u8],
        timeout: Duration,
    ) -> Result<Vec<u8>>;
}

/// Creates echo clients for the pool as new source addresses appear.
pub trait EchoClientFactory: Send + Sync {
    fn create(&self, source: IpAddr) -> Result<Arc<dyn EchoClient>>;
}

/// Consumer of emulated replies and endpoint notifications.
///
/// `on_packet_received` fires for every reply; the endpoint callbacks are
/// informational and fire at most once per newly observed endpoint.
#[async_trait]
pub trait PacketProxyReceiver: Send + Sync {
    async fn on_packet_received(&self, packet: IpPacket);

    fn on_new_remote_endpoint(&self, protocol: IpProtocol, remote_ep: IpAddr) {
        let _ = (protocol, remote_ep);
    }

    fn on_new_endpoint(
        &self,
        protocol: IpProtocol,
        local_ep: IpAddr,
        remote_ep: IpAddr,
        is_new_local: bool,
        is_new_remote: bool,
    ) {
        let _ = (protocol, local_ep, remote_ep, is_new_local, is_new_remote);
    }
}
