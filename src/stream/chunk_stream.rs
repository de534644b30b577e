//! Length-delimited chunk framing with in-band termination and transport
//! reuse.
//!
//! ## Wire Format
//!
//! ```text
//! chunk      := len(4, little-endian signed) | bytes(len)
//! stream     := chunk+ | terminator
//! terminator := chunk with len == 0, followed by a 16-byte nonce
//! ```
//!
//! A zero-length chunk ends the logical stream without closing the
//! underlying transport. The nonce that follows seeds the next logical
//! stream, letting both peers swap to a fresh ChunkStream over the same
//! connection instead of reconnecting.
//!
//! The reader must not consume past the terminator before the new
//! instance is constructed, or the next stream starts mid-handshake.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, trace};

use crate::crypto::{random_bytes, random_id};
use crate::error::{Error, Result};

/// Largest accepted chunk; bigger lengths indicate a corrupt stream.
pub const MAX_CHUNK_SIZE: usize = 16 * 1024 * 1024;

/// Length of the reuse-handshake nonce.
pub const REUSE_SECRET_LEN: usize = 16;

/// A logical byte stream framed into chunks over a reliable transport.
///
/// The transport is owned for the lifetime of the logical stream and
/// handed over wholesale on reuse; the consumed instance can never touch
/// it again.
pub struct ChunkStream<S> {
    transport: Option<S>,
    stream_id: String,
    secret: [u8; REUSE_SECRET_LEN],
    wrote_chunk_count: u64,
    remaining_in_chunk: usize,
    finished: bool,
    wrote_terminator: bool,
    can_reuse: bool,
}

impl<S> ChunkStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    /// Bind a fresh logical stream to a reliable transport.
    pub fn new(transport: S) -> Self {
        Self::with_secret(transport, random_bytes())
    }

    fn with_secret(transport: S, secret: [u8; REUSE_SECRET_LEN]) -> Self {
        Self {
            transport: Some(transport),
            stream_id: random_id("chunk"),
            secret,
            wrote_chunk_count: 0,
            remaining_in_chunk: 0,
            finished: false,
            wrote_terminator: false,
            can_reuse: true,
        }
    }

    pub fn stream_id(&self) -> &str {
        &self.stream_id
    }

    /// The 16-byte reuse secret this logical stream was seeded with.
    pub fn secret(&self) -> &[u8; REUSE_SECRET_LEN] {
        &self.secret
    }

    /// Chunks written so far, terminator included.
    pub fn wrote_chunk_count(&self) -> u64 {
        self.wrote_chunk_count
    }

    /// True once the read side observed the terminator.
    pub fn finished(&self) -> bool {
        self.finished
    }

    pub fn can_reuse(&self) -> bool {
        self.can_reuse
    }

    fn transport_mut(&mut self) -> Result<&mut S> {
        self.transport.as_mut().ok_or(Error::StreamClosed)
    }

    /// Read logical-stream bytes into `buf`, honoring any caller buffer
    /// size; a return of 0 means the terminator was observed.
    ///
    /// Reads never cross a chunk boundary, so a caller may consume one
    /// chunk in several partial reads.
    pub async fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        if self.transport.is_none() {
            return Err(Error::StreamClosed);
        }
        if self.finished || buf.is_empty() {
            return Ok(0);
        }

        if self.remaining_in_chunk == 0 {
            let mut len_buf = [0u8; 4];
            self.transport_mut()?
                .read_exact(&mut len_buf)
                .await
                .map_err(map_eof)?;
            let len = i32::from_le_bytes(len_buf);
            if len < 0 {
                return Err(Error::frame(format!("negative chunk length {len}")));
            }
            if len == 0 {
                trace!(stream_id = %self.stream_id, "terminator observed");
                self.finished = true;
                return Ok(0);
            }
            if len as usize > MAX_CHUNK_SIZE {
                return Err(Error::frame(format!(
                    "chunk of {len} bytes exceeds the {MAX_CHUNK_SIZE}-byte limit"
                )));
            }
            self.remaining_in_chunk = len as usize;
        }

        let want = buf.len().min(self.remaining_in_chunk);
        let got = self.transport_mut()?.read(&mut buf[..want]).await?;
        if got == 0 {
            return Err(Error::frame("transport ended inside a chunk"));
        }
        self.remaining_in_chunk -= got;
        Ok(got)
    }

    /// Read exactly `buf.len()` logical-stream bytes.
    pub async fn read_exact(&mut self, buf: &mut [u8]) -> Result<()> {
        let mut filled = 0;
        while filled < buf.len() {
            let got = self.read(&mut buf[filled..]).await?;
            if got == 0 {
                return Err(Error::frame("logical stream ended mid-read"));
            }
            filled += got;
        }
        Ok(())
    }

    /// Write `buf` as one chunk. Empty buffers are a no-op: the
    /// zero-length chunk is reserved for the terminator.
    pub async fn write(&mut self, buf: &[u8]) -> Result<()> {
        if self.transport.is_none() || self.wrote_terminator {
            return Err(Error::StreamClosed);
        }
        if buf.is_empty() {
            return Ok(());
        }
        if buf.len() > MAX_CHUNK_SIZE {
            return Err(Error::frame(format!(
                "chunk of {} bytes exceeds the {MAX_CHUNK_SIZE}-byte limit",
                buf.len()
            )));
        }

        let transport = self.transport_mut()?;
        transport
            .write_all(&(buf.len() as i32).to_le_bytes())
            .await?;
        transport.write_all(buf).await?;
        self.wrote_chunk_count += 1;
        Ok(())
    }

    /// Flush the underlying transport.
    pub async fn flush(&mut self) -> Result<()> {
        self.transport_mut()?.flush().await?;
        Ok(())
    }

    /// Terminate the logical stream: a zero-length chunk followed by a
    /// fresh random nonce for the peer's next stream. Idempotent.
    pub async fn write_terminator(&mut self) -> Result<()> {
        if self.transport.is_none() {
            return Err(Error::StreamClosed);
        }
        if self.wrote_terminator {
            return Ok(());
        }

        let nonce: [u8; REUSE_SECRET_LEN] = random_bytes();
        let transport = self.transport_mut()?;
        transport.write_all(&0i32.to_le_bytes()).await?;
        transport.write_all(&nonce).await?;
        transport.flush().await?;
        self.wrote_chunk_count += 1;
        self.wrote_terminator = true;
        trace!(stream_id = %self.stream_id, "terminator written");
        Ok(())
    }

    /// Swap to a fresh logical stream over the same transport.
    ///
    /// Writes the terminator if the caller has not yet, drains any
    /// unconsumed bytes up to the peer's terminator, reads the peer's
    /// 16-byte nonce, and moves the transport into a new instance seeded
    /// with it. Consuming `self` makes any further use of the old stream
    /// impossible.
    pub async fn create_reuse(mut self) -> Result<ChunkStream<S>> {
        if self.transport.is_none() || !self.can_reuse {
            return Err(Error::StreamClosed);
        }

        self.write_terminator().await?;

        // Drain the logical stream to its terminator; anything the caller
        // left unread is discarded.
        let mut scratch = [0u8; 4096];
        while self.read(&mut scratch).await? != 0 {}

        let mut nonce = [0u8; REUSE_SECRET_LEN];
        let transport = self.transport_mut()?;
        transport.read_exact(&mut nonce).await.map_err(map_eof)?;

        self.can_reuse = false;
        let transport = self.transport.take().expect("transport checked above");
        let next = ChunkStream::with_secret(transport, nonce);
        debug!(
            old = %self.stream_id,
            new = %next.stream_id,
            "chunk stream reused"
        );
        Ok(next)
    }

    /// Close the logical stream and release the transport.
    ///
    /// Graceful disposal terminates the logical stream in-band first so
    /// the peer sees a clean end; abrupt disposal just drops the
    /// transport.
    pub async fn dispose(mut self, graceful: bool) -> Result<()> {
        let Some(mut transport) = self.transport.take() else {
            return Ok(());
        };

        if graceful && !self.wrote_terminator {
            let nonce: [u8; REUSE_SECRET_LEN] = random_bytes();
            transport.write_all(&0i32.to_le_bytes()).await?;
            transport.write_all(&nonce).await?;
            transport.flush().await?;
        }
        let _ = transport.shutdown().await;
        debug!(stream_id = %self.stream_id, graceful, "chunk stream disposed");
        Ok(())
    }
}

/// A clean EOF where framing promised more bytes is a framing violation,
/// not a transient I/O condition.
fn map_eof(e: std::io::Error) -> Error {
    if e.kind() == std::io::ErrorKind::UnexpectedEof {
        Error::frame("transport ended inside the framing")
    } else {
        Error::Io(e)
    }
}
