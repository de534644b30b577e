//! Shared-socket transmitter carrying many sessions over one UDP socket.
//!
//! ## Wire Format (fixed 32-byte header)
//!
//! ```text
//! offset  field             size  encryption
//! 0       IV                8     plaintext
//! 8       signature "OK"    2     obfuscated
//! 10      reserved          6     obfuscated
//! 16      sessionId         8     obfuscated
//! 24      sessionCryptoPos  8     obfuscated
//! 32..    payload           var   encrypted by the session key
//! ```
//!
//! The obfuscated region is XORed with the server-key keystream at
//! position IV, a fresh random value per datagram. Obfuscation hides the
//! constant signature and session metadata from traffic inspection; it is
//! not the confidentiality layer. Payload bytes are enciphered by the
//! session layer with the session key, which the transmitter never sees.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::crypto::{random_iv, BufferCryptor, KEY_SIZE};
use crate::error::{Error, Result};

/// Fixed datagram header length.
pub const TRANSMITTER_HEADER_LEN: usize = 32;

/// Anti-corruption signature, checked after header deobfuscation.
const SIGNATURE: [u8; 2] = *b"OK";

/// Extent of the obfuscated header region.
const OBFUSCATED_START: usize = 8;

/// Session layer consuming validated datagrams.
///
/// Called from the transmitter's receive task on every datagram that
/// passed the signature check; implementations must not block. The
/// payload at `buffer[payload_offset..]` is still encrypted with the
/// session key.
pub trait SessionReceiver: Send + Sync {
    fn on_receive_data(
        &self,
        session_id: u64,
        remote_ep: SocketAddr,
        session_crypto_pos: i64,
        buffer: &[u8],
        payload_offset: usize,
    );
}

/// Multi-session UDP transmitter with header obfuscation.
///
/// Cheap to clone; clones share the socket and receive loop.
#[derive(Clone)]
pub struct UdpChannelTransmitter {
    inner: Arc<Inner>,
}

struct Inner {
    socket: UdpSocket,
    server_cryptor: BufferCryptor,
    disposed: AtomicBool,
    /// Guards send-buffer composition together with IV generation so
    /// concurrent senders cannot interleave partial headers.
    send_state: tokio::sync::Mutex<Vec<u8>>,
    recv_task: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl UdpChannelTransmitter {
    /// Create a transmitter over a bound UDP socket and start its receive
    /// loop. `server_key` drives header obfuscation on both directions.
    pub fn new(
        socket: UdpSocket,
        server_key: [u8; KEY_SIZE],
        receiver: Arc<dyn SessionReceiver>,
    ) -> Self {
        let inner = Arc::new(Inner {
            socket,
            server_cryptor: BufferCryptor::new(server_key),
            disposed: AtomicBool::new(false),
            send_state: tokio::sync::Mutex::new(Vec::with_capacity(2048)),
            recv_task: std::sync::Mutex::new(None),
        });

        let loop_inner = inner.clone();
        let task = tokio::spawn(async move {
            run_receive_loop(&loop_inner, receiver).await;
        });
        *inner.recv_task.lock().unwrap() = Some(task);

        Self { inner }
    }

    /// Local address of the shared socket.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.inner.socket.local_addr()?)
    }

    /// Send one session datagram on the connected socket.
    ///
    /// `payload` must already be enciphered with the session key at
    /// `session_crypto_pos`.
    pub async fn send(
        &self,
        session_id: u64,
        session_crypto_pos: i64,
        payload: &[u8],
    ) -> Result<usize> {
        self.send_internal(None, session_id, session_crypto_pos, payload)
            .await
    }

    /// Send one session datagram to an explicit remote endpoint
    /// (server side; the shared socket is unconnected there).
    pub async fn send_to(
        &self,
        remote_ep: SocketAddr,
        session_id: u64,
        session_crypto_pos: i64,
        payload: &[u8],
    ) -> Result<usize> {
        self.send_internal(Some(remote_ep), session_id, session_crypto_pos, payload)
            .await
    }

    async fn send_internal(
        &self,
        remote_ep: Option<SocketAddr>,
        session_id: u64,
        session_crypto_pos: i64,
        payload: &[u8],
    ) -> Result<usize> {
        let inner = &*self.inner;
        if inner.disposed.load(Ordering::Acquire) {
            return Err(Error::StreamClosed);
        }

        let mut buf = inner.send_state.lock().await;
        buf.clear();
        buf.resize(TRANSMITTER_HEADER_LEN, 0);

        let iv = random_iv();
        buf[0..8].copy_from_slice(&iv.to_le_bytes());
        buf[8..10].copy_from_slice(&SIGNATURE);
        // reserved bytes 10..16 stay zero before obfuscation
        buf[16..24].copy_from_slice(&session_id.to_le_bytes());
        buf[24..32].copy_from_slice(&session_crypto_pos.to_le_bytes());
        inner
            .server_cryptor
            .cipher_range(&mut buf, OBFUSCATED_START, TRANSMITTER_HEADER_LEN, iv);
        buf.extend_from_slice(payload);

        let written = match remote_ep {
            Some(ep) => inner.socket.send_to(&buf, ep).await?,
            None => inner.socket.send(&buf).await?,
        };
        if written != buf.len() {
            return Err(Error::ShortWrite {
                written,
                requested: buf.len(),
            });
        }
        trace!(session_id, bytes = written, "transmitter sent datagram");
        Ok(written)
    }

    /// Stop the receive loop. Idempotent.
    pub fn dispose(&self) {
        if self.inner.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(task) = self.inner.recv_task.lock().unwrap().take() {
            task.abort();
        }
        debug!("UDP transmitter disposed");
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        if let Some(task) = self.recv_task.lock().unwrap().take() {
            task.abort();
        }
    }
}

async fn run_receive_loop(inner: &Arc<Inner>, receiver: Arc<dyn SessionReceiver>) {
    let mut buf = vec![0u8; u16::MAX as usize];

    while !inner.disposed.load(Ordering::Acquire) {
        let (n, remote_ep) = match inner.socket.recv_from(&mut buf).await {
            Ok(received) => received,
            Err(e) => {
                if Error::from(e).is_fatal() {
                    warn!("fatal socket error, stopping transmitter");
                    inner.disposed.store(true, Ordering::Release);
                    break;
                }
                continue;
            }
        };

        match deobfuscate_header(inner, &mut buf[..n]) {
            Ok((session_id, session_crypto_pos)) => {
                receiver.on_receive_data(
                    session_id,
                    remote_ep,
                    session_crypto_pos,
                    &buf[..n],
                    TRANSMITTER_HEADER_LEN,
                );
            }
            Err(e) => {
                warn!(%remote_ep, error = %e, "dropping datagram");
            }
        }
    }
}

/// Deobfuscate and validate the 32-byte header in place, returning the
/// session id and session keystream position.
fn deobfuscate_header(inner: &Inner, datagram: &mut [u8]) -> Result<(u64, i64)> {
    if datagram.len() < TRANSMITTER_HEADER_LEN {
        return Err(Error::malformed(format!(
            "datagram of {} bytes is shorter than the {TRANSMITTER_HEADER_LEN}-byte header",
            datagram.len()
        )));
    }

    // A foreign sender could set the IV's top bit; mask so the parsed
    // value is a valid keystream position (our senders never set it).
    let iv = (u64::from_le_bytes(datagram[0..8].try_into().unwrap()) & i64::MAX as u64) as i64;
    inner
        .server_cryptor
        .cipher_range(datagram, OBFUSCATED_START, TRANSMITTER_HEADER_LEN, iv);

    if datagram[8..10] != SIGNATURE {
        return Err(Error::unauthorized("header signature mismatch"));
    }
    // reserved bytes 10..16 are ignored on receive

    let session_id = u64::from_le_bytes(datagram[16..24].try_into().unwrap());
    let session_crypto_pos = i64::from_le_bytes(datagram[24..32].try_into().unwrap());
    if session_crypto_pos < 0 {
        return Err(Error::malformed("negative session keystream position"));
    }
    Ok((session_id, session_crypto_pos))
}
