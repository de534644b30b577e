//! Chunk stream round trips over real TCP loopback with transport reuse.

use std::net::SocketAddr;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;

use tunnelcore::stream::ChunkStream;

/// Byte echo server for one connection.
///
/// Reading and echoing are decoupled through an unbounded queue so the
/// read side always drains; large transfers cannot deadlock on socket
/// buffers.
async fn spawn_echo_server() -> (SocketAddr, JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let handle = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let (mut reader, mut writer) = stream.into_split();
        let (tx, mut rx) = mpsc::unbounded_channel::<Vec<u8>>();

        let echo = tokio::spawn(async move {
            while let Some(data) = rx.recv().await {
                if writer.write_all(&data).await.is_err() {
                    break;
                }
            }
        });

        let mut buf = vec![0u8; 64 * 1024];
        loop {
            match reader.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if tx.send(buf[..n].to_vec()).is_err() {
                        break;
                    }
                }
            }
        }
        drop(tx);
        let _ = echo.await;
    });
    (addr, handle)
}

const TEXT_CHUNKS: [&str; 4] = [
    "HelloHelloHelloHello\r\n",
    "Apple1234,Apple1234,\r\n",
    "Book009,Book009,Book009\n",
    "550Clock\n\r,550Clock\n\r,",
];

/// One text round: length-prefix chunk, four text chunks, echo back,
/// reassemble and compare.
async fn run_text_round(stream: &mut ChunkStream<TcpStream>) {
    let expected: String = TEXT_CHUNKS.concat();
    let total = expected.len() as u32;

    stream.write(&total.to_le_bytes()).await.unwrap();
    for chunk in TEXT_CHUNKS {
        stream.write(chunk.as_bytes()).await.unwrap();
    }
    stream.flush().await.unwrap();
    assert_eq!(stream.wrote_chunk_count(), 5);

    let mut len_buf = [0u8; 4];
    stream.read_exact(&mut len_buf).await.unwrap();
    assert_eq!(u32::from_le_bytes(len_buf), total);

    let mut body = vec![0u8; total as usize];
    stream.read_exact(&mut body).await.unwrap();
    assert_eq!(String::from_utf8(body).unwrap(), expected);
}

#[tokio::test]
async fn text_round_trip_with_reuse() {
    let (addr, server) = spawn_echo_server().await;
    let tcp = TcpStream::connect(addr).await.unwrap();

    let mut stream = ChunkStream::new(tcp);
    run_text_round(&mut stream).await;

    // Swap to a fresh logical stream on the same connection and repeat.
    let mut stream = stream.create_reuse().await.unwrap();
    run_text_round(&mut stream).await;

    stream.dispose(true).await.unwrap();
    timeout(Duration::from_secs(2), server)
        .await
        .expect("echo server did not stop after disposal")
        .unwrap();
}

#[tokio::test]
async fn large_binary_round_trip() {
    let (addr, _server) = spawn_echo_server().await;
    let tcp = TcpStream::connect(addr).await.unwrap();
    let mut stream = ChunkStream::new(tcp);

    let mut payload = vec![0u8; 10 * 1024 * 1024 + 2000];
    tunnelcore::crypto::fill_random(&mut payload);

    stream
        .write(&(payload.len() as u32).to_le_bytes())
        .await
        .unwrap();
    stream.write(&payload).await.unwrap();
    stream.flush().await.unwrap();

    let mut len_buf = [0u8; 4];
    stream.read_exact(&mut len_buf).await.unwrap();
    assert_eq!(u32::from_le_bytes(len_buf) as usize, payload.len());

    let mut echoed = vec![0u8; payload.len()];
    stream.read_exact(&mut echoed).await.unwrap();
    assert_eq!(echoed, payload);

    // Terminate; the echoed terminator ends the logical stream.
    stream.write_terminator().await.unwrap();
    let mut buf = [0u8; 16];
    assert_eq!(stream.read(&mut buf).await.unwrap(), 0);
    assert!(stream.finished());
}

#[tokio::test]
async fn chunk_counts_include_terminator() {
    let (addr, _server) = spawn_echo_server().await;
    let tcp = TcpStream::connect(addr).await.unwrap();
    let mut stream = ChunkStream::new(tcp);

    stream.write(b"one").await.unwrap();
    stream.write(b"two").await.unwrap();
    stream.write_terminator().await.unwrap();
    assert_eq!(stream.wrote_chunk_count(), 3);
}
