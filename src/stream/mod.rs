//! Reliable-stream framing for the tunneling core.

mod chunk_stream;

pub use chunk_stream::{ChunkStream, MAX_CHUNK_SIZE, REUSE_SECRET_LEN};
