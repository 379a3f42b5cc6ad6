//! Compress/decompress chunk payloads under one of the engine's supported
//! algorithms, and translate Anvil's per-chunk compression byte.

use std::io::{Read, Write};

use serde::{Deserialize, Serialize};

use crate::error::CodecError;

/// Compression algorithms understood by the engine.
///
/// `None`/`Zlib`/`Lz4`/`Zstd` map directly onto the LRF header's compression
/// field (spec §3); the numeric values below are that on-disk encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[repr(u32)]
pub enum Algorithm {
    None = 0,
    Zlib = 1,
    Lz4 = 2,
    Zstd = 3,
}

impl Algorithm {
    pub fn from_u32(value: u32) -> Option<Self> {
        match value {
            0 => Some(Self::None),
            1 => Some(Self::Zlib),
            2 => Some(Self::Lz4),
            3 => Some(Self::Zstd),
            _ => None,
        }
    }

    pub fn as_u32(self) -> u32 {
        self as u32
    }
}

/// Anvil's per-chunk compression byte, distinct from [`Algorithm`] because
/// MCA additionally supports gzip and may carry an unsupported marker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum McaCompression {
    Gzip,
    Zlib,
    Uncompressed,
    Lz4,
}

/// Translate an Anvil compression byte (spec §3) to [`McaCompression`].
/// Returns `None` for unrecognized bytes; callers treat that as a
/// non-fatal per-chunk error (scan continues).
pub fn detect_mca_compression(byte: u8) -> Option<McaCompression> {
    match byte {
        1 => Some(McaCompression::Gzip),
        2 => Some(McaCompression::Zlib),
        3 => Some(McaCompression::Uncompressed),
        4 => Some(McaCompression::Lz4),
        _ => None,
    }
}

/// Outcome of a [`Codec::compress`] call: whether the requested algorithm
/// was actually used, or whether the implementation fell back to `None`.
#[derive(Debug, Clone)]
pub struct CompressOutcome {
    pub bytes: Vec<u8>,
    pub fell_back: bool,
}

/// Stateless compression service. A region commits to one [`Algorithm`] in
/// its LRF header (kept stateless on read); Anvil chunks each carry their
/// own [`McaCompression`] byte.
pub struct Codec {
    pub zlib_level: u32,
    pub zstd_level: i32,
}

impl Default for Codec {
    fn default() -> Self {
        Self {
            zlib_level: flate2::Compression::default().level(),
            zstd_level: 0,
        }
    }
}

impl Codec {
    pub fn new(zlib_level: u32, zstd_level: i32) -> Self {
        Self {
            zlib_level,
            zstd_level,
        }
    }

    /// Compress `data` under `algo`. Never fails for `None`/`Zlib`/`Lz4`/`Zstd`
    /// since all four are always compiled in; kept fallible to match the
    /// contract described in spec §4.1 for implementations that make some
    /// algorithms optional features.
    pub fn compress(&self, data: &[u8], algo: Algorithm) -> Result<CompressOutcome, CodecError> {
        let bytes = match algo {
            Algorithm::None => data.to_vec(),
            Algorithm::Zlib => {
                let mut enc = flate2::write::ZlibEncoder::new(
                    Vec::new(),
                    flate2::Compression::new(self.zlib_level),
                );
                enc.write_all(data)
                    .map_err(|e| CodecError::Malformed(e.to_string()))?;
                enc.finish()
                    .map_err(|e| CodecError::Malformed(e.to_string()))?
            }
            Algorithm::Lz4 => lz4_flex::compress_prepend_size(data),
            Algorithm::Zstd => zstd::stream::encode_all(data, self.zstd_level)
                .map_err(|e| CodecError::Malformed(e.to_string()))?,
        };
        Ok(CompressOutcome {
            bytes,
            fell_back: false,
        })
    }

    /// Decompress `data`, previously compressed by [`Codec::compress`] with
    /// the same `algo`.
    pub fn decompress(&self, data: &[u8], algo: Algorithm) -> Result<Vec<u8>, CodecError> {
        match algo {
            Algorithm::None => Ok(data.to_vec()),
            Algorithm::Zlib => {
                let mut dec = flate2::read::ZlibDecoder::new(data);
                let mut out = Vec::new();
                dec.read_to_end(&mut out)
                    .map_err(|e| CodecError::Malformed(e.to_string()))?;
                Ok(out)
            }
            Algorithm::Lz4 => lz4_flex::decompress_size_prepended(data)
                .map_err(|e| CodecError::Malformed(e.to_string())),
            Algorithm::Zstd => zstd::stream::decode_all(data)
                .map_err(|e| CodecError::Malformed(e.to_string())),
        }
    }

    /// Decompress a chunk read from an Anvil region, per its own
    /// [`McaCompression`] byte. LZ4 is not supported on the read path per
    /// spec §3/§9 and yields `Unsupported` rather than panicking.
    pub fn decompress_mca(&self, data: &[u8], compression: McaCompression) -> Result<Vec<u8>, CodecError> {
        match compression {
            McaCompression::Uncompressed => Ok(data.to_vec()),
            McaCompression::Zlib => {
                let mut dec = flate2::read::ZlibDecoder::new(data);
                let mut out = Vec::new();
                dec.read_to_end(&mut out)
                    .map_err(|e| CodecError::Malformed(e.to_string()))?;
                Ok(out)
            }
            McaCompression::Gzip => {
                let mut dec = flate2::read::GzDecoder::new(data);
                let mut out = Vec::new();
                dec.read_to_end(&mut out)
                    .map_err(|e| CodecError::Malformed(e.to_string()))?;
                Ok(out)
            }
            McaCompression::Lz4 => Err(CodecError::Unsupported(Algorithm::Lz4)),
        }
    }

    /// Compress a chunk for the Anvil writer, which always uses zlib
    /// (spec §4.3), returning the compression byte alongside the bytes.
    pub fn compress_mca(&self, data: &[u8]) -> Result<(u8, Vec<u8>), CodecError> {
        let out = self.compress(data, Algorithm::Zlib)?;
        Ok((2, out.bytes))
    }
}
