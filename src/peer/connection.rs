//! Duplex stream wrapper: length-prefixed framing plus the optional
//! compression layer, over a `TcpStream`.
//!
//! A thin wrapper owning the socket, exposing `send_bytes`/`recv_bytes`,
//! with `io-util` framing.

use std::net::SocketAddr;

use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::Mutex;

use crate::config::PEER_MAX_PACKET_SIZE;
use crate::peer::compression::{Compression, CompressionError};

#[derive(Error, Debug)]
pub enum ConnectionError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("frame of {0} bytes exceeds max packet size {1}")]
    FrameTooLarge(usize, usize),
    #[error(transparent)]
    Compression(#[from] CompressionError),
}

pub type ConnectionResult<T> = Result<T, ConnectionError>;

/// One peer's duplex stream. `outgoing` records whether we dialed or were
/// dialed, which callers use to report peer direction.
pub struct Connection {
    stream: Mutex<TcpStream>,
    address: SocketAddr,
    outgoing: bool,
    compression: Compression,
}

impl Connection {
    pub fn new(stream: TcpStream, address: SocketAddr, outgoing: bool) -> Self {
        Self {
            stream: Mutex::new(stream),
            address,
            outgoing,
            compression: Compression::new(),
        }
    }

    pub fn get_address(&self) -> &SocketAddr {
        &self.address
    }

    pub fn is_out(&self) -> bool {
        self.outgoing
    }

    pub fn enable_compression(&mut self) -> Result<(), CompressionError> {
        self.compression.enable()
    }

    /// Writes one length-prefixed frame. `bytes` is compressed first if
    /// compression is enabled on this connection.
    pub async fn send_bytes(&self, bytes: &[u8]) -> ConnectionResult<()> {
        let mut framed = bytes.to_vec();
        self.compression.compress(&mut framed).await?;

        if framed.len() > PEER_MAX_PACKET_SIZE {
            return Err(ConnectionError::FrameTooLarge(framed.len(), PEER_MAX_PACKET_SIZE));
        }

        let mut stream = self.stream.lock().await;
        stream.write_u32(framed.len() as u32).await?;
        stream.write_all(&framed).await?;
        stream.flush().await?;
        Ok(())
    }

    /// Reads one length-prefixed frame, decompressing it if compression
    /// is enabled.
    pub async fn recv_bytes(&self) -> ConnectionResult<Vec<u8>> {
        let mut stream = self.stream.lock().await;
        let len = stream.read_u32().await? as usize;
        if len > PEER_MAX_PACKET_SIZE {
            return Err(ConnectionError::FrameTooLarge(len, PEER_MAX_PACKET_SIZE));
        }
        let mut buf = vec![0u8; len];
        stream.read_exact(&mut buf).await?;
        drop(stream);

        self.compression.decompress(&mut buf).await?;
        Ok(buf)
    }

    pub async fn shutdown(&self) -> ConnectionResult<()> {
        let mut stream = self.stream.lock().await;
        stream.shutdown().await?;
        Ok(())
    }
}
