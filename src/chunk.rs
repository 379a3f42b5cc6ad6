//! Chunk payload types shared by the LRF and MCA readers/writers.

/// Maximum payload size accepted by [`crate::manager::StorageManager::save_chunk`]
/// and the format writers (spec §3/§8).
pub const MAX_CHUNK_BYTES: usize = 1024 * 1024;

/// A fully-resolved chunk: its coordinates, opaque payload, and the
/// millisecond timestamp that trails the payload on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkEntry {
    pub cx: i32,
    pub cz: i32,
    pub payload: Vec<u8>,
    pub timestamp_ms: u64,
}

impl ChunkEntry {
    pub fn new(cx: i32, cz: i32, payload: Vec<u8>, timestamp_ms: u64) -> Self {
        Self {
            cx,
            cz,
            payload,
            timestamp_ms,
        }
    }

    /// Append the big-endian timestamp to the payload, the form that is
    /// actually compressed and stored on disk.
    pub fn bytes_with_timestamp(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.payload.len() + 8);
        out.extend_from_slice(&self.payload);
        out.extend_from_slice(&self.timestamp_ms.to_be_bytes());
        out
    }

    /// Split stored bytes (payload + trailing 8-byte BE timestamp) back
    /// into payload and timestamp. Fails if shorter than 8 bytes.
    pub fn split_stored(mut stored: Vec<u8>) -> Option<(Vec<u8>, u64)> {
        if stored.len() < 8 {
            return None;
        }
        let ts_bytes = stored.split_off(stored.len() - 8);
        let timestamp_ms = u64::from_be_bytes(ts_bytes.try_into().ok()?);
        Some((stored, timestamp_ms))
    }
}

/// A chunk whose payload has already been compressed, so a writer's flush
/// only has to place bytes rather than also run the codec. Lets the batch
/// saver compress every pending entry in parallel before the single
/// sequential write (spec §4/§9: "parallel compress then single-writer
/// flush").
#[derive(Debug, Clone)]
pub struct CompressedChunk {
    pub cx: i32,
    pub cz: i32,
    pub compressed: Vec<u8>,
    pub timestamp_ms: u64,
    /// Anvil's per-chunk compression byte; unused by the LRF writer, which
    /// stores one compression algorithm for the whole region instead.
    pub mca_compression_byte: u8,
}
