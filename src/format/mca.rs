//! Anvil (MCA) reader/writer, kept only for interoperability and migration.
//! 4 KiB sectors, 8 KiB header (1024 location entries + 1024 timestamps),
//! chunk payload prefixed by `(length: u32 BE, compression: u8)`.

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use tracing::warn;

use crate::chunk::{ChunkEntry, CompressedChunk, MAX_CHUNK_BYTES};
use crate::codec::Codec;
use crate::coord::{chunk_index, CHUNKS_PER_REGION};
use crate::error::{Result, StorageError};

pub const SECTOR_SIZE: usize = 4096;
pub const HEADER_SECTORS: usize = 2;
pub const HEADER_SIZE: usize = SECTOR_SIZE * HEADER_SECTORS;

#[derive(Debug, Clone, Copy, Default)]
struct Location {
    sector_offset: u32,
    sector_count: u8,
}

impl Location {
    fn is_absent(self) -> bool {
        self.sector_offset == 0 || self.sector_count == 0
    }
}

/// Read-only handle over an MCA file. Corrupt or unsupported-compression
/// chunks are skipped (return `None`), never abort the scan.
pub struct McaReader {
    data: Vec<u8>,
    path: PathBuf,
}

impl McaReader {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let data = fs::read(&path)?;
        if data.len() < HEADER_SIZE {
            return Err(StorageError::InvalidFormat(format!(
                "MCA file shorter than header ({} < {HEADER_SIZE})",
                data.len()
            )));
        }
        if data.len() % SECTOR_SIZE != 0 {
            return Err(StorageError::InvalidFormat(
                "MCA file length not sector-aligned".into(),
            ));
        }
        Ok(Self { data, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read and decompress the chunk at `(cx, cz)`. Returns `None` both when
    /// the chunk is absent and when it is present but unreadable (corrupt
    /// header, oversized length, or unsupported compression) — each such
    /// case is logged, never fatal to the scan.
    pub fn read_chunk(&self, codec: &Codec, cx: i32, cz: i32) -> Option<Vec<u8>> {
        read_chunk_in(&self.data, codec, cx, cz)
    }

    pub fn read_chunk_entry(&self, codec: &Codec, cx: i32, cz: i32) -> Option<ChunkEntry> {
        read_chunk_entry_in(&self.data, codec, cx, cz)
    }

    /// All live local `(cx, cz)` coordinates (0..32 each), independent of
    /// whether they're readable (use [`McaReader::read_chunk`] to find out).
    pub fn live_chunks(&self) -> Vec<(i32, i32)> {
        live_chunks_in(&self.data)
    }
}

fn location_in(data: &[u8], index: usize) -> Location {
    let base = index * 4;
    let raw = u32::from_be_bytes(data[base..base + 4].try_into().unwrap());
    Location {
        sector_offset: raw >> 8,
        sector_count: (raw & 0xFF) as u8,
    }
}

fn timestamp_in(data: &[u8], index: usize) -> u32 {
    let base = SECTOR_SIZE + index * 4;
    u32::from_be_bytes(data[base..base + 4].try_into().unwrap())
}

fn read_chunk_in(data: &[u8], codec: &Codec, cx: i32, cz: i32) -> Option<Vec<u8>> {
    let idx = chunk_index(cx, cz);
    let location = location_in(data, idx);
    if location.is_absent() {
        return None;
    }

    let byte_offset = location.sector_offset as usize * SECTOR_SIZE;
    let sector_bytes = location.sector_count as usize * SECTOR_SIZE;

    if byte_offset + 5 > data.len() {
        warn!(cx, cz, "MCA chunk offset out of bounds");
        return None;
    }
    let length = u32::from_be_bytes(data[byte_offset..byte_offset + 4].try_into().unwrap()) as usize;
    if length < 1 || length > sector_bytes {
        warn!(cx, cz, length, "MCA chunk length exceeds allocated sectors");
        return None;
    }
    let compression_byte = data[byte_offset + 4];
    let payload_start = byte_offset + 5;
    let payload_len = length - 1;
    if payload_start + payload_len > data.len() {
        warn!(cx, cz, "MCA chunk payload truncated by file length");
        return None;
    }
    let raw = &data[payload_start..payload_start + payload_len];

    let compression = match crate::codec::detect_mca_compression(compression_byte) {
        Some(c) => c,
        None => {
            warn!(cx, cz, compression_byte, "unrecognized MCA compression byte");
            return None;
        }
    };

    match codec.decompress_mca(raw, compression) {
        Ok(bytes) => Some(bytes),
        Err(e) => {
            warn!(cx, cz, error = %e, "MCA chunk decompression failed");
            None
        }
    }
}

fn read_chunk_entry_in(data: &[u8], codec: &Codec, cx: i32, cz: i32) -> Option<ChunkEntry> {
    let bytes = read_chunk_in(data, codec, cx, cz)?;
    let timestamp_ms = timestamp_in(data, chunk_index(cx, cz)) as u64 * 1000;
    Some(ChunkEntry::new(cx, cz, bytes, timestamp_ms))
}

fn live_chunks_in(data: &[u8]) -> Vec<(i32, i32)> {
    (0..CHUNKS_PER_REGION)
        .filter(|&idx| !location_in(data, idx).is_absent())
        .map(|idx| ((idx % 32) as i32, (idx / 32) as i32))
        .collect()
}

/// Read a chunk directly out of an already-mapped region file, e.g. an
/// [`memmap2::Mmap`] handed out by [`crate::mmap_cache::MmapReadAhead`].
/// Equivalent to [`McaReader::read_chunk_entry`] but without needing an
/// owned, file-backed `McaReader`.
pub fn read_chunk_entry_from_slice(data: &[u8], codec: &Codec, cx: i32, cz: i32) -> Option<ChunkEntry> {
    read_chunk_entry_in(data, codec, cx, cz)
}

/// Write-only: always compresses with zlib (spec §4.3).
pub struct McaWriter;

impl McaWriter {
    pub fn flush(path: impl AsRef<Path>, codec: &Codec, chunks: &[ChunkEntry]) -> Result<()> {
        let compressed = Self::compress(codec, chunks)?;
        Self::flush_compressed(path, &compressed)
    }

    /// Compress every entry sequentially, always with zlib (spec §4.3).
    /// Split out so the batch saver can instead compress a batch in
    /// parallel and call [`McaWriter::flush_compressed`] directly.
    pub fn compress(codec: &Codec, chunks: &[ChunkEntry]) -> Result<Vec<CompressedChunk>> {
        chunks
            .iter()
            .map(|entry| {
                if entry.payload.len() > MAX_CHUNK_BYTES {
                    return Err(StorageError::InvalidArgument(format!(
                        "chunk ({}, {}) payload exceeds {MAX_CHUNK_BYTES} bytes",
                        entry.cx, entry.cz
                    )));
                }
                let (compression_byte, compressed) = codec.compress_mca(&entry.payload)?;
                Ok(CompressedChunk {
                    cx: entry.cx,
                    cz: entry.cz,
                    compressed,
                    timestamp_ms: entry.timestamp_ms,
                    mca_compression_byte: compression_byte,
                })
            })
            .collect()
    }

    pub fn flush_compressed(path: impl AsRef<Path>, chunks: &[CompressedChunk]) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let mut locations = [Location::default(); CHUNKS_PER_REGION];
        let mut timestamps = [0u32; CHUNKS_PER_REGION];
        let mut payload = Vec::new();
        let mut next_sector = HEADER_SECTORS as u32;

        for entry in chunks {
            let length = entry.compressed.len() as u32 + 1;
            let mut chunk_bytes = Vec::with_capacity(4 + 1 + entry.compressed.len());
            chunk_bytes.extend_from_slice(&length.to_be_bytes());
            chunk_bytes.push(entry.mca_compression_byte);
            chunk_bytes.extend_from_slice(&entry.compressed);

            let sector_count = chunk_bytes.len().div_ceil(SECTOR_SIZE);
            let padded_len = sector_count * SECTOR_SIZE;
            chunk_bytes.resize(padded_len, 0);

            if sector_count > u8::MAX as usize {
                return Err(StorageError::InvalidArgument(format!(
                    "chunk ({}, {}) needs more than 255 sectors",
                    entry.cx, entry.cz
                )));
            }

            let idx = chunk_index(entry.cx, entry.cz);
            locations[idx] = Location {
                sector_offset: next_sector,
                sector_count: sector_count as u8,
            };
            timestamps[idx] = (entry.timestamp_ms / 1000) as u32;

            payload.extend_from_slice(&chunk_bytes);
            next_sector += sector_count as u32;
        }

        let mut file = File::create(path)?;
        for location in &locations {
            let raw = (location.sector_offset << 8) | location.sector_count as u32;
            file.write_all(&raw.to_be_bytes())?;
        }
        for timestamp in &timestamps {
            file.write_all(&timestamp.to_be_bytes())?;
        }
        file.write_all(&payload)?;
        file.flush()?;
        Ok(())
    }
}
