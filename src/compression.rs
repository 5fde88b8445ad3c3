//! Chunk compression for image streams
//!
//! Every chunk is compressed on its own so a random read only inflates the
//! chunk it touches.
//!
//! **Design**:
//! - Stored chunks are copied verbatim
//! - Deflate chunks are zlib-wrapped (header + adler32 trailer)
//! - LZ4 chunks carry their decompressed size as a prefix
//! - Decompression is always bounded by the caller's expected chunk length

use crate::error::{Aff4Error, Result};
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use serde::{Deserialize, Serialize};
use std::io::{Read, Write};

/// Compression scheme for image chunks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum Compression {
    /// No compression
    Stored = 0,
    /// zlib deflate
    #[default]
    Deflate = 1,
    /// LZ4 (fast, moderate ratio)
    Lz4 = 2,
    /// Zstd (slower, better ratio)
    Zstd = 3,
}

impl Compression {
    /// Convert from u8
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Compression::Stored),
            1 => Some(Compression::Deflate),
            2 => Some(Compression::Lz4),
            3 => Some(Compression::Zstd),
            _ => None,
        }
    }

    /// Name recorded in the `aff4:compression` attribute
    pub fn name(self) -> &'static str {
        match self {
            Compression::Stored => "stored",
            Compression::Deflate => "deflate",
            Compression::Lz4 => "lz4",
            Compression::Zstd => "zstd",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "stored" => Some(Compression::Stored),
            "deflate" => Some(Compression::Deflate),
            "lz4" => Some(Compression::Lz4),
            "zstd" => Some(Compression::Zstd),
            _ => None,
        }
    }

    /// Compress one chunk
    pub fn compress(self, data: &[u8]) -> Result<Vec<u8>> {
        match self {
            Compression::Stored => Ok(data.to_vec()),
            Compression::Deflate => {
                let mut encoder = ZlibEncoder::new(
                    Vec::with_capacity(data.len() / 2),
                    flate2::Compression::default(),
                );
                encoder.write_all(data)?;
                Ok(encoder.finish()?)
            }
            Compression::Lz4 => Ok(lz4_flex::compress_prepend_size(data)),
            Compression::Zstd => zstd::bulk::compress(data, 3)
                .map_err(|e| Aff4Error::Compression(format!("Zstd compression failed: {}", e))),
        }
    }

    /// Decompress one chunk that must expand to exactly `expected` bytes
    pub fn decompress(self, data: &[u8], expected: usize) -> Result<Vec<u8>> {
        let decompressed = match self {
            Compression::Stored => data.to_vec(),
            Compression::Deflate => {
                let mut out = Vec::with_capacity(expected);
                ZlibDecoder::new(data)
                    .take(expected as u64 + 1)
                    .read_to_end(&mut out)
                    .map_err(|e| {
                        Aff4Error::Compression(format!("Deflate decompression failed: {}", e))
                    })?;
                out
            }
            Compression::Lz4 => lz4_flex::decompress_size_prepended(data).map_err(|e| {
                Aff4Error::Compression(format!("LZ4 decompression failed: {}", e))
            })?,
            Compression::Zstd => zstd::bulk::decompress(data, expected).map_err(|e| {
                Aff4Error::Compression(format!("Zstd decompression failed: {}", e))
            })?,
        };

        if decompressed.len() != expected {
            return Err(Aff4Error::Compression(format!(
                "{} chunk expanded to {} bytes, expected {}",
                self.name(),
                decompressed.len(),
                expected
            )));
        }
        Ok(decompressed)
    }
}
