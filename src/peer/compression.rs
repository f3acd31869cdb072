//! Optional per-session Snappy frame compression, threshold-gated, with a
//! 1-byte trailer flag.
//!
//! Operates on a plain `Vec<u8>` rather than an AEAD buffer type, since
//! cryptographic primitives are an external collaborator's concern here.
//! Sits as an additive layer between serialization and the wire, wire
//! encoding itself being otherwise unpinned.

use human_bytes::human_bytes;
use snap::raw::{Decoder, Encoder};
use std::time::Instant;
use thiserror::Error;
use tokio::sync::Mutex;

use crate::config::PEER_MAX_PACKET_SIZE;

pub const COMPRESSION_THRESHOLD: usize = 1024;

#[derive(Debug, Error)]
pub enum CompressionError {
    #[error("compression error")]
    Compression,
    #[error("decompression error")]
    Decompression,
    #[error("buffer too large")]
    Buffer,
    #[error("already initialized")]
    Initialized,
}

pub struct Compression {
    encoder: Option<Mutex<(Encoder, Vec<u8>)>>,
    decoder: Option<Mutex<(Decoder, Vec<u8>)>>,
}

impl Compression {
    pub fn new() -> Self {
        Self {
            encoder: None,
            decoder: None,
        }
    }

    #[inline]
    pub fn is_enabled(&self) -> bool {
        self.encoder.is_some()
    }

    pub fn enable(&mut self) -> Result<(), CompressionError> {
        if self.encoder.is_some() || self.decoder.is_some() {
            return Err(CompressionError::Initialized);
        }

        let buffer = vec![0; snap::raw::max_compress_len(PEER_MAX_PACKET_SIZE)];
        self.encoder = Some(Mutex::new((Encoder::new(), buffer)));

        let buffer = vec![0; PEER_MAX_PACKET_SIZE];
        self.decoder = Some(Mutex::new((Decoder::new(), buffer)));

        Ok(())
    }

    /// Compresses `input` in place if larger than [`COMPRESSION_THRESHOLD`]
    /// and compression is enabled; always appends a 1-byte trailer flag.
    /// No-op (aside from the flag byte) if compression is disabled.
    pub async fn compress(&self, input: &mut Vec<u8>) -> Result<(), CompressionError> {
        if let Some(mutex) = self.encoder.as_ref() {
            let mut should_compress = input.len() > COMPRESSION_THRESHOLD;
            if should_compress {
                let start = Instant::now();
                let mut lock = mutex.lock().await;
                let (encoder, buffer) = &mut *lock;

                let len = input.len();
                let n = encoder
                    .compress(input, buffer)
                    .map_err(|_| CompressionError::Compression)?;

                let use_compressed = n < len && n + 1 <= PEER_MAX_PACKET_SIZE;
                if use_compressed {
                    input.clear();
                    input.extend_from_slice(&buffer[..n]);

                    let elapsed = start.elapsed();
                    if log::log_enabled!(log::Level::Trace) {
                        log::trace!(
                            "packet compressed from {} to {} in {:?}",
                            human_bytes(len as f64),
                            human_bytes(n as f64),
                            elapsed
                        );
                    }
                    metrics::histogram!("tos_p2p_compress").record(elapsed.as_millis() as f64);
                } else {
                    should_compress = false;
                }
            }

            if input.len() + 1 > PEER_MAX_PACKET_SIZE {
                return Err(CompressionError::Buffer);
            }

            input.push(should_compress as u8);
        }

        Ok(())
    }

    /// Decompresses `buf` in place if its trailer flag indicates it was
    /// compressed. No-op if compression is disabled.
    pub async fn decompress(&self, buf: &mut Vec<u8>) -> Result<(), CompressionError> {
        if let Some(mutex) = self.decoder.as_ref() {
            if buf.is_empty() {
                return Err(CompressionError::Buffer);
            }

            let compressed = buf[buf.len() - 1] == 1;
            buf.truncate(buf.len() - 1);

            if compressed {
                let start = Instant::now();
                let mut lock = mutex.lock().await;
                let (decoder, buffer) = &mut *lock;

                let n = decoder
                    .decompress(buf, buffer)
                    .map_err(|_| CompressionError::Decompression)?;

                let len = buf.len();
                buf.clear();
                buf.extend_from_slice(&buffer[..n]);
                let _ = len;

                let elapsed = start.elapsed();
                metrics::histogram!("tos_p2p_decompress").record(elapsed.as_millis() as f64);
            }
        }

        Ok(())
    }
}

impl Default for Compression {
    fn default() -> Self {
        Self::new()
    }
}
