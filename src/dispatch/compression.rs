//! Payload compression for the RPC transport
//!
//! Stateless and reentrant. Small payloads and payloads LZ4 cannot shrink
//! meaningfully are sent as-is, tagged so the receiver knows not to
//! decompress.

use crate::{Error, Result};
use bytes::Bytes;
use lz4::block::CompressionMode;
use std::fmt;
use std::str::FromStr;

/// Largest uncompressed size accepted from the wire.
pub const MAX_UNCOMPRESSED_LEN: u32 = 64 * 1024 * 1024;

/// Compression tag carried on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum CompressionType {
    None = 0,
    /// Compression was requested but did not pay off
    Incompressible = 1,
    Lz4 = 6,
}

impl CompressionType {
    pub fn code(self) -> u8 {
        self as u8
    }

    pub fn from_code(code: u8) -> Result<Self> {
        match code {
            0 => Ok(Self::None),
            1 => Ok(Self::Incompressible),
            6 => Ok(Self::Lz4),
            other => Err(Error::Protocol(format!("unknown compression type code {other}"))),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Incompressible => "incompressible",
            Self::Lz4 => "lz4",
        }
    }
}

impl fmt::Display for CompressionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CompressionType {
    type Err = Error;

    fn from_str(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "none" => Ok(Self::None),
            "lz4" => Ok(Self::Lz4),
            other => Err(Error::Encode(format!(
                "unknown compression type '{other}', expected one of none, lz4"
            ))),
        }
    }
}

/// A payload ready to be put on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Compressed {
    pub compression: CompressionType,
    pub data: Bytes,
    pub uncompressed_len: u32,
}

/// LZ4 block compressor with an incompressibility cutoff.
#[derive(Debug, Clone)]
pub struct Compressor {
    level: i32,
    /// Compressed output larger than this fraction of the input is discarded
    threshold: f64,
    /// Payloads shorter than this are never compressed
    min_size: usize,
}

impl Default for Compressor {
    fn default() -> Self {
        Self::new(5, 0.95, 32)
    }
}

impl Compressor {
    pub fn new(level: i32, threshold: f64, min_size: usize) -> Self {
        Self {
            level,
            threshold,
            min_size,
        }
    }

    pub fn compress(&self, requested: CompressionType, payload: &[u8]) -> Result<Compressed> {
        let uncompressed_len = u32::try_from(payload.len()).map_err(|_| {
            Error::Encode(format!("payload of {} bytes is too large", payload.len()))
        })?;

        if requested != CompressionType::Lz4 || payload.len() < self.min_size {
            return Ok(Compressed {
                compression: CompressionType::None,
                data: Bytes::copy_from_slice(payload),
                uncompressed_len,
            });
        }

        let compressed = lz4::block::compress(
            payload,
            Some(CompressionMode::HIGHCOMPRESSION(self.level)),
            false,
        )
        .map_err(|e| Error::Encode(format!("lz4 compression failed: {e}")))?;

        if compressed.len() as f64 > payload.len() as f64 * self.threshold {
            return Ok(Compressed {
                compression: CompressionType::Incompressible,
                data: Bytes::copy_from_slice(payload),
                uncompressed_len,
            });
        }

        Ok(Compressed {
            compression: CompressionType::Lz4,
            data: Bytes::from(compressed),
            uncompressed_len,
        })
    }

    /// Undo [`Compressor::compress`] given the tag found on the wire.
    pub fn decompress(
        &self,
        compression: CompressionType,
        data: &[u8],
        uncompressed_len: u32,
    ) -> Result<Bytes> {
        let out = match compression {
            CompressionType::None | CompressionType::Incompressible => data.to_vec(),
            CompressionType::Lz4 => {
                if uncompressed_len > MAX_UNCOMPRESSED_LEN {
                    return Err(Error::Protocol(format!(
                        "uncompressed length {uncompressed_len} exceeds {MAX_UNCOMPRESSED_LEN}"
                    )));
                }
                let size = i32::try_from(uncompressed_len).map_err(|_| {
                    Error::Protocol(format!("uncompressed length {uncompressed_len} out of range"))
                })?;
                lz4::block::decompress(data, Some(size))
                    .map_err(|e| Error::Protocol(format!("lz4 decompression failed: {e}")))?
            }
        };
        if out.len() != uncompressed_len as usize {
            return Err(Error::Protocol(format!(
                "expected {} bytes after decompression, got {}",
                uncompressed_len,
                out.len()
            )));
        }
        Ok(Bytes::from(out))
    }
}
