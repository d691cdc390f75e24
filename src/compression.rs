//! Compression policy and raw DEFLATE helpers
//!
//! Compressed objects are stored as raw DEFLATE streams (no zlib or gzip
//! framing), which is the format already present in existing containers.

use crate::config::schema::CacheConfig;
use flate2::read::DeflateDecoder;
use flate2::write::DeflateEncoder;
use flate2::Compression;
use std::io::{self, Read, Write};
use tokio::io::{AsyncWrite, AsyncWriteExt};

/// Decides whether an object is stored compressed
pub trait CompressionPolicy: Send + Sync {
    fn should_compress(&self, name: &str) -> bool;
}

/// Compress objects whose file extension is in a fixed list
#[derive(Debug, Clone)]
pub struct ExtensionPolicy {
    enabled: bool,
    extensions: Vec<String>,
}

impl ExtensionPolicy {
    pub fn new(enabled: bool, extensions: Vec<String>) -> Self {
        Self {
            enabled,
            extensions,
        }
    }

    pub fn from_config(config: &CacheConfig) -> Self {
        Self::new(config.compress_blobs, config.compressed_extensions.clone())
    }

    /// A policy that never compresses
    pub fn disabled() -> Self {
        Self::new(false, Vec::new())
    }
}

impl CompressionPolicy for ExtensionPolicy {
    fn should_compress(&self, name: &str) -> bool {
        if !self.enabled {
            return false;
        }
        match name.rfind('.') {
            Some(dot) => {
                let ext = &name[dot..];
                self.extensions.iter().any(|e| e.eq_ignore_ascii_case(ext))
            }
            None => false,
        }
    }
}

/// Compress `data` into a raw DEFLATE stream
pub fn deflate(data: &[u8]) -> io::Result<Vec<u8>> {
    let mut encoder = DeflateEncoder::new(Vec::with_capacity(data.len() / 2), Compression::default());
    encoder.write_all(data)?;
    encoder.finish()
}

/// Inflate a raw DEFLATE buffer into `sink` in `chunk_size` pieces
///
/// Reads until the decoder returns zero bytes; a short read in the middle of
/// the stream is not treated as the end.
pub async fn inflate_into<W>(compressed: &[u8], sink: &mut W, chunk_size: usize) -> io::Result<u64>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let mut decoder = DeflateDecoder::new(compressed);
    let mut chunk = vec![0u8; chunk_size.max(1)];
    let mut total = 0u64;

    loop {
        let read = decoder.read(&mut chunk)?;
        if read == 0 {
            break;
        }
        sink.write_all(&chunk[..read]).await?;
        total += read as u64;
    }

    sink.flush().await?;
    Ok(total)
}
