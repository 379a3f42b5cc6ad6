//! Linear Region Format (LRF): fixed 256-byte prelude, 8 KiB offsets/sizes
//! table, then a sequentially packed, singly-compressed payload area.
//!
//! Chosen canonical layout (spec §3/§9 open question, resolved in
//! SPEC_FULL.md §6.1): the 256-byte prelude carries only the fixed fields
//! (magic, version, count, compression) with the remaining bytes reserved;
//! the full 1024-entry offsets/sizes table follows immediately after, at a
//! fixed, version-independent location.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crate::chunk::{ChunkEntry, CompressedChunk, MAX_CHUNK_BYTES};
use crate::codec::{Algorithm, Codec};
use crate::coord::{chunk_index, CHUNKS_PER_REGION};
use crate::error::{Result, StorageError};

pub const MAGIC: &[u8; 9] = b"TURBO_LRF";
pub const FORMAT_VERSION: u32 = 1;
pub const PRELUDE_SIZE: u64 = 256;
pub const TABLE_ENTRY_SIZE: u64 = 8;
pub const TABLE_SIZE: u64 = TABLE_ENTRY_SIZE * CHUNKS_PER_REGION as u64;
/// Byte offset where the chunk payload area begins; every live chunk's
/// `offset` must be `>= HEADER_END`.
pub const HEADER_END: u64 = PRELUDE_SIZE + TABLE_SIZE;

#[derive(Debug, Clone, Copy, Default)]
struct TableEntry {
    offset: u32,
    size: u32,
}

impl TableEntry {
    fn is_absent(self) -> bool {
        self.size == 0
    }
}

/// Parsed header shared by the reader and writer.
#[derive(Debug, Clone)]
struct Header {
    chunk_count: u32,
    compression: Algorithm,
    table: Vec<TableEntry>,
}

fn read_header<R: Read>(mut r: R) -> Result<Header> {
    let mut prelude = [0u8; PRELUDE_SIZE as usize];
    r.read_exact(&mut prelude)?;

    if &prelude[0..9] != MAGIC {
        return Err(StorageError::InvalidFormat("LRF magic mismatch".into()));
    }
    let version = u32::from_le_bytes(prelude[9..13].try_into().unwrap());
    if version != FORMAT_VERSION {
        return Err(StorageError::InvalidFormat(format!(
            "unsupported LRF version {version}"
        )));
    }
    let chunk_count = u32::from_le_bytes(prelude[13..17].try_into().unwrap());
    let compression_raw = u32::from_le_bytes(prelude[17..21].try_into().unwrap());
    let compression = Algorithm::from_u32(compression_raw).ok_or_else(|| {
        StorageError::InvalidFormat(format!("unknown LRF compression id {compression_raw}"))
    })?;

    let mut table_bytes = vec![0u8; TABLE_SIZE as usize];
    r.read_exact(&mut table_bytes)?;
    let mut table = Vec::with_capacity(CHUNKS_PER_REGION);
    for chunk in table_bytes.chunks_exact(TABLE_ENTRY_SIZE as usize) {
        let offset = u32::from_le_bytes(chunk[0..4].try_into().unwrap());
        let size = u32::from_le_bytes(chunk[4..8].try_into().unwrap());
        table.push(TableEntry { offset, size });
    }

    Ok(Header {
        chunk_count,
        compression,
        table,
    })
}

fn write_header<W: Write>(mut w: W, header: &Header) -> Result<()> {
    let mut prelude = [0u8; PRELUDE_SIZE as usize];
    prelude[0..9].copy_from_slice(MAGIC);
    prelude[9..13].copy_from_slice(&FORMAT_VERSION.to_le_bytes());
    prelude[13..17].copy_from_slice(&header.chunk_count.to_le_bytes());
    prelude[17..21].copy_from_slice(&header.compression.as_u32().to_le_bytes());
    w.write_all(&prelude)?;

    for entry in &header.table {
        w.write_all(&entry.offset.to_le_bytes())?;
        w.write_all(&entry.size.to_le_bytes())?;
    }
    Ok(())
}

/// Read-only handle over an LRF file.
pub struct LrfReader {
    file: File,
    path: PathBuf,
    header: Header,
    file_len: u64,
}

impl LrfReader {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut file = File::open(&path)?;
        let header = read_header(&mut file)?;
        let file_len = file.seek(SeekFrom::End(0))?;
        Ok(Self {
            file,
            path,
            header,
            file_len,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn compression(&self) -> Algorithm {
        self.header.compression
    }

    pub fn chunk_count(&self) -> u32 {
        self.header.chunk_count
    }

    /// Refresh header + file length, e.g. after an external writer flush.
    pub fn refresh(&mut self) -> Result<()> {
        self.file.seek(SeekFrom::Start(0))?;
        self.header = read_header(&mut self.file)?;
        self.file_len = self.file.seek(SeekFrom::End(0))?;
        Ok(())
    }

    /// Read a chunk's raw decompressed bytes (payload + trailing 8-byte
    /// timestamp, per the on-disk invariant). Returns `None` if absent.
    pub fn read_chunk(&mut self, codec: &Codec, cx: i32, cz: i32) -> Result<Option<Vec<u8>>> {
        let entry = self.header.table[chunk_index(cx, cz)];
        if entry.is_absent() {
            return Ok(None);
        }
        if entry.size as usize > MAX_CHUNK_BYTES * 2 {
            // compressed size should never exceed a couple times the raw cap
            return Err(StorageError::InvalidFormat("chunk size too large".into()));
        }
        let start = entry.offset as u64;
        let end = start + entry.size as u64;
        if start < HEADER_END || end > self.file_len {
            return Err(StorageError::InvalidFormat(
                "chunk offset/size outside file bounds".into(),
            ));
        }

        self.file.seek(SeekFrom::Start(start))?;
        let mut compressed = vec![0u8; entry.size as usize];
        self.file.read_exact(&mut compressed)?;

        let decompressed = codec.decompress(&compressed, self.header.compression)?;
        Ok(Some(decompressed))
    }

    pub fn read_chunk_entry(
        &mut self,
        codec: &Codec,
        cx: i32,
        cz: i32,
    ) -> Result<Option<ChunkEntry>> {
        let Some(stored) = self.read_chunk(codec, cx, cz)? else {
            return Ok(None);
        };
        let (payload, timestamp_ms) = ChunkEntry::split_stored(stored)
            .ok_or_else(|| StorageError::InvalidFormat("chunk missing timestamp tail".into()))?;
        Ok(Some(ChunkEntry::new(cx, cz, payload, timestamp_ms)))
    }

    /// Enumerate all live chunk coordinates in this region.
    pub fn live_chunks(&self) -> Vec<(i32, i32, u32)> {
        // We only know the region's own (rx, rz) from the caller; coordinates
        // returned here are local (cx_local, cz_local) in 0..32.
        let mut out = Vec::new();
        for idx in 0..CHUNKS_PER_REGION {
            if !self.header.table[idx].is_absent() {
                let cx_local = (idx % 32) as i32;
                let cz_local = (idx / 32) as i32;
                out.push((cx_local, cz_local, self.header.table[idx].size));
            }
        }
        out
    }
}

/// Read a chunk directly out of an already-mapped region file, e.g. an
/// [`memmap2::Mmap`] handed out by [`crate::mmap_cache::MmapReadAhead`].
/// No file handle or seeking involved; header and payload both come out
/// of the same byte slice.
pub fn read_chunk_entry_from_slice(
    bytes: &[u8],
    codec: &Codec,
    cx: i32,
    cz: i32,
) -> Result<Option<ChunkEntry>> {
    let header = read_header(bytes)?;
    let entry = header.table[chunk_index(cx, cz)];
    if entry.is_absent() {
        return Ok(None);
    }
    if entry.size as usize > MAX_CHUNK_BYTES * 2 {
        return Err(StorageError::InvalidFormat("chunk size too large".into()));
    }
    let start = entry.offset as u64;
    let end = start + entry.size as u64;
    if start < HEADER_END || end > bytes.len() as u64 {
        return Err(StorageError::InvalidFormat(
            "chunk offset/size outside file bounds".into(),
        ));
    }

    let compressed = &bytes[start as usize..end as usize];
    let decompressed = codec.decompress(compressed, header.compression)?;
    let (payload, timestamp_ms) = ChunkEntry::split_stored(decompressed)
        .ok_or_else(|| StorageError::InvalidFormat("chunk missing timestamp tail".into()))?;
    Ok(Some(ChunkEntry::new(cx, cz, payload, timestamp_ms)))
}

/// Write-only handle: one `flush` call serializes a full set of chunks.
pub struct LrfWriter;

impl LrfWriter {
    /// Write `chunks` to `path` under `algo`, atomically from the caller's
    /// perspective: header, offsets table, then payload area, then
    /// truncate to the exact total length.
    ///
    /// Idempotent modulo timestamps: the same `(path, algo, chunks)` input
    /// (timestamps aside) produces the same file bytes.
    pub fn flush(
        path: impl AsRef<Path>,
        codec: &Codec,
        algo: Algorithm,
        chunks: &[ChunkEntry],
    ) -> Result<()> {
        let compressed = Self::compress(codec, algo, chunks)?;
        Self::flush_compressed(path, algo, &compressed)
    }

    /// Compress every entry sequentially. Kept separate from
    /// [`LrfWriter::flush_compressed`] so callers (e.g. the batch saver)
    /// can instead compress a batch in parallel and call
    /// `flush_compressed` directly.
    pub fn compress(
        codec: &Codec,
        algo: Algorithm,
        chunks: &[ChunkEntry],
    ) -> Result<Vec<CompressedChunk>> {
        chunks
            .iter()
            .map(|entry| {
                if entry.payload.len() > MAX_CHUNK_BYTES {
                    return Err(StorageError::InvalidArgument(format!(
                        "chunk ({}, {}) payload exceeds {MAX_CHUNK_BYTES} bytes",
                        entry.cx, entry.cz
                    )));
                }
                let stored = entry.bytes_with_timestamp();
                let compressed = codec.compress(&stored, algo)?.bytes;
                Ok(CompressedChunk {
                    cx: entry.cx,
                    cz: entry.cz,
                    compressed,
                    timestamp_ms: entry.timestamp_ms,
                    mca_compression_byte: 0,
                })
            })
            .collect()
    }

    /// Serialize already-compressed chunks: header, offsets table, then
    /// payload area, then truncate to the exact total length.
    pub fn flush_compressed(
        path: impl AsRef<Path>,
        algo: Algorithm,
        chunks: &[CompressedChunk],
    ) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let mut table = vec![TableEntry::default(); CHUNKS_PER_REGION];
        let mut payload = Vec::new();
        let mut offset = HEADER_END;
        let mut live = 0u32;

        for entry in chunks {
            let idx = chunk_index(entry.cx, entry.cz);
            table[idx] = TableEntry {
                offset: offset as u32,
                size: entry.compressed.len() as u32,
            };
            offset += entry.compressed.len() as u64;
            payload.extend_from_slice(&entry.compressed);
            live += 1;
        }

        let header = Header {
            chunk_count: live,
            compression: algo,
            table,
        };

        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(path)?;
        write_header(&mut file, &header)?;
        file.write_all(&payload)?;
        file.set_len(HEADER_END + payload.len() as u64)?;
        file.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn entry(cx: i32, cz: i32, byte: u8, len: usize) -> ChunkEntry {
        ChunkEntry::new(cx, cz, vec![byte; len], 1_700_000_000_000)
    }

    #[test]
    fn write_then_read_one_chunk() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("r.0.0.lrf");
        let codec = Codec::default();
        let chunks = vec![entry(5, 3, 0xAB, 4096)];
        LrfWriter::flush(&path, &codec, Algorithm::Zlib, &chunks).unwrap();

        let mut reader = LrfReader::open(&path).unwrap();
        let read = reader.read_chunk_entry(&codec, 5, 3).unwrap().unwrap();
        assert_eq!(read.payload, vec![0xAB; 4096]);

        let meta = std::fs::metadata(&path).unwrap();
        assert!(meta.len() >= HEADER_END);
    }

    #[test]
    fn absent_chunk_is_none() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("r.0.0.lrf");
        let codec = Codec::default();
        LrfWriter::flush(&path, &codec, Algorithm::None, &[]).unwrap();
        let mut reader = LrfReader::open(&path).unwrap();
        assert!(reader.read_chunk(&codec, 0, 0).unwrap().is_none());
    }

    #[test]
    fn round_trip_full_region() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("r.0.0.lrf");
        let codec = Codec::default();
        let chunks: Vec<ChunkEntry> = (0..CHUNKS_PER_REGION)
            .map(|i| entry((i % 32) as i32, (i / 32) as i32, (i % 251) as u8, 1024))
            .collect();
        LrfWriter::flush(&path, &codec, Algorithm::Lz4, &chunks).unwrap();

        let mut reader = LrfReader::open(&path).unwrap();
        for (i, original) in chunks.iter().enumerate() {
            let cx = (i % 32) as i32;
            let cz = (i / 32) as i32;
            let read = reader.read_chunk_entry(&codec, cx, cz).unwrap().unwrap();
            assert_eq!(read.payload, original.payload);
        }
    }

    #[test]
    fn oversized_payload_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("r.0.0.lrf");
        let codec = Codec::default();
        let chunks = vec![entry(0, 0, 0, MAX_CHUNK_BYTES + 1)];
        let err = LrfWriter::flush(&path, &codec, Algorithm::None, &chunks).unwrap_err();
        assert!(matches!(err, StorageError::InvalidArgument(_)));
    }

    #[test]
    fn no_overlap_between_live_chunks() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("r.0.0.lrf");
        let codec = Codec::default();
        let chunks: Vec<ChunkEntry> = (0..16)
            .map(|i| entry(i, 0, i as u8, 777))
            .collect();
        LrfWriter::flush(&path, &codec, Algorithm::Zstd, &chunks).unwrap();

        let reader = LrfReader::open(&path).unwrap();
        let mut ranges: Vec<(u64, u64)> = reader
            .header
            .table
            .iter()
            .filter(|e| !e.is_absent())
            .map(|e| (e.offset as u64, e.offset as u64 + e.size as u64))
            .collect();
        ranges.sort();
        for w in ranges.windows(2) {
            assert!(w[0].1 <= w[1].0);
        }
    }

    #[test]
    fn read_from_slice_matches_reader() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("r.0.0.lrf");
        let codec = Codec::default();
        let chunks = vec![entry(7, 9, 0x42, 2048)];
        LrfWriter::flush(&path, &codec, Algorithm::Zstd, &chunks).unwrap();

        let bytes = std::fs::read(&path).unwrap();
        let from_slice = read_chunk_entry_from_slice(&bytes, &codec, 7, 9)
            .unwrap()
            .unwrap();
        assert_eq!(from_slice.payload, vec![0x42; 2048]);

        let mut reader = LrfReader::open(&path).unwrap();
        let from_reader = reader.read_chunk_entry(&codec, 7, 9).unwrap().unwrap();
        assert_eq!(from_slice.payload, from_reader.payload);
    }

    #[test]
    fn invalid_magic_is_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("bad.lrf");
        std::fs::write(&path, vec![0u8; HEADER_END as usize]).unwrap();
        let err = LrfReader::open(&path).unwrap_err();
        assert!(matches!(err, StorageError::InvalidFormat(_)));
    }
}
