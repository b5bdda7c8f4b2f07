//! TCP transport between the two rank processes.
//!
//! Rank 0 listens, rank 1 connects with a bounded retry loop. Frames are
//! self-delimiting: the fixed header carries the body length, so a reader
//! takes `HEADER_LEN` bytes, validates the header, then reads exactly the
//! body before verifying its hash.

use std::io::ErrorKind;
use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use cosim_core::wire::{decode_header, verify_body, Frame, HEADER_LEN};

use super::{ChannelError, Transport};

pub struct TcpTransport {
    stream: TcpStream,
}

impl TcpTransport {
    pub async fn listen(addr: &str) -> Result<TcpListener, ChannelError> {
        let listener = TcpListener::bind(addr).await?;
        tracing::info!(addr = %listener.local_addr()?, "waiting for peer");
        Ok(listener)
    }

    /// Accept exactly one peer.
    pub async fn accept(listener: &TcpListener) -> Result<Self, ChannelError> {
        let (stream, peer) = listener.accept().await?;
        stream.set_nodelay(true)?;
        tracing::info!(%peer, "peer connected");
        Ok(Self { stream })
    }

    pub async fn connect(
        addr: &str,
        attempts: u32,
        backoff: Duration,
    ) -> Result<Self, ChannelError> {
        for attempt in 1..=attempts.max(1) {
            match TcpStream::connect(addr).await {
                Ok(stream) => {
                    stream.set_nodelay(true)?;
                    tracing::info!(addr, attempt, "connected to peer");
                    return Ok(Self { stream });
                }
                Err(e) => {
                    tracing::debug!(addr, attempt, error = %e, "peer not reachable yet");
                    tokio::time::sleep(backoff).await;
                }
            }
        }
        Err(ChannelError::Connect {
            addr: addr.to_string(),
            attempts,
        })
    }
}

fn disconnect_on_eof(e: std::io::Error) -> ChannelError {
    match e.kind() {
        ErrorKind::UnexpectedEof | ErrorKind::ConnectionReset | ErrorKind::BrokenPipe => {
            ChannelError::Disconnected
        }
        _ => ChannelError::Io(e),
    }
}

impl Transport for TcpTransport {
    async fn send(&mut self, frame: Bytes) -> Result<(), ChannelError> {
        self.stream.write_all(&frame).await.map_err(disconnect_on_eof)?;
        self.stream.flush().await.map_err(disconnect_on_eof)
    }

    async fn recv(&mut self) -> Result<Frame, ChannelError> {
        let mut header_bytes = [0u8; HEADER_LEN];
        self.stream
            .read_exact(&mut header_bytes)
            .await
            .map_err(disconnect_on_eof)?;
        let header = decode_header(&header_bytes)?;

        let mut body = vec![0u8; header.length as usize];
        self.stream.read_exact(&mut body).await.map_err(disconnect_on_eof)?;
        Ok(verify_body(&header, Bytes::from(body))?)
    }
}
