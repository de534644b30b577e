//! Error types for the tunneling core.

use thiserror::Error;

/// Result type alias using our Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the tunneling core.
#[derive(Error, Debug)]
pub enum Error {
    /// Truncated or illegal IP/ICMP header.
    #[error("Malformed packet: {0}")]
    MalformedPacket(String),

    /// Bad chunk length or corrupt stream framing.
    #[error("Malformed frame: {0}")]
    MalformedFrame(String),

    /// Session id or signature mismatch on a received datagram.
    #[error("Unauthorized datagram: {0}")]
    Unauthorized(String),

    /// Outgoing batch exceeds the datagram budget.
    #[error("Batch of {size} bytes exceeds the {budget}-byte datagram budget")]
    Oversized { size: usize, budget: usize },

    /// The socket accepted fewer bytes than requested.
    #[error("Short write: {written} of {requested} bytes")]
    ShortWrite { written: usize, requested: usize },

    /// The socket failed in a way that tears down the owning component.
    #[error("Socket failed fatally: {0}")]
    SocketFatal(String),

    /// Operation raced with cancellation or disposal.
    #[error("Operation cancelled")]
    Cancelled,

    /// Operation on a disposed channel or stream.
    #[error("Stream is closed")]
    StreamClosed,

    /// Tunnel send with no usable channel attached.
    #[error("No usable channel")]
    NoChannel,

    /// Operation issued in the wrong lifecycle state.
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// I/O errors (transient unless classified fatal).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Create a new malformed-packet error.
    pub fn malformed<S: Into<String>>(msg: S) -> Self {
        Self::MalformedPacket(msg.into())
    }

    /// Create a new malformed-frame error.
    pub fn frame<S: Into<String>>(msg: S) -> Self {
        Self::MalformedFrame(msg.into())
    }

    /// Create a new unauthorized error.
    pub fn unauthorized<S: Into<String>>(msg: S) -> Self {
        Self::Unauthorized(msg.into())
    }

    /// Create a new invalid-state error.
    pub fn invalid_state<S: Into<String>>(msg: S) -> Self {
        Self::InvalidState(msg.into())
    }

    /// Check whether this error must tear down the owning component.
    ///
    /// Receive loops skip everything else: malformed and unauthorized
    /// datagrams are dropped, transient socket errors are retried.
    pub fn is_fatal(&self) -> bool {
        match self {
            Self::SocketFatal(_) => true,
            Self::Io(e) => is_fatal_io_kind(e.kind()),
            _ => false,
        }
    }
}

/// I/O error kinds that indicate the socket itself is unusable, as opposed
/// to a transient per-datagram failure (e.g. ICMP port unreachable).
fn is_fatal_io_kind(kind: std::io::ErrorKind) -> bool {
    matches!(
        kind,
        std::io::ErrorKind::InvalidInput
            | std::io::ErrorKind::NotConnected
            | std::io::ErrorKind::BrokenPipe
    )
}

/// Convert from anyhow::Error for convenience.
impl From<anyhow::Error> for Error {
    fn from(err: anyhow::Error) -> Self {
        Self::InvalidState(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fatal_classification() {
        assert!(Error::SocketFatal("gone".into()).is_fatal());
        assert!(Error::Io(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            "bad fd"
        ))
        .is_fatal());
        assert!(!Error::Io(std::io::Error::new(
            std::io::ErrorKind::ConnectionRefused,
            "icmp unreachable"
        ))
        .is_fatal());
        assert!(!Error::malformed("truncated").is_fatal());
        assert!(!Error::unauthorized("bad session").is_fatal());
    }
}
