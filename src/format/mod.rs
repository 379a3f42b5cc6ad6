//! On-disk region file formats.

pub mod lrf;
pub mod mca;

use std::path::{Path, PathBuf};

use parking_lot::Mutex;

use crate::chunk::ChunkEntry;
use crate::codec::Codec;
use crate::error::{Result, StorageError};

/// `RegionBackend` collapses the two on-disk formats into one sum type,
/// dispatched at the per-region layer (spec §9 design notes). `LrfReader`
/// seeks on every read so it needs interior mutability to be shared across
/// the batch loader's worker threads; `McaReader` holds its whole file in
/// memory and reads are already `&self`.
pub enum RegionBackend {
    Lrf(Mutex<lrf::LrfReader>),
    Mca(mca::McaReader),
}

impl RegionBackend {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        match path.extension().and_then(|e| e.to_str()) {
            Some("lrf") => Ok(Self::Lrf(Mutex::new(lrf::LrfReader::open(path)?))),
            Some("mca") => Ok(Self::Mca(mca::McaReader::open(path)?)),
            other => Err(StorageError::InvalidFormat(format!(
                "unrecognized region file extension: {other:?}"
            ))),
        }
    }

    pub fn path(&self) -> PathBuf {
        match self {
            Self::Lrf(r) => r.lock().path().to_path_buf(),
            Self::Mca(r) => r.path().to_path_buf(),
        }
    }

    pub fn read_chunk_entry(&self, codec: &Codec, cx: i32, cz: i32) -> Result<Option<ChunkEntry>> {
        match self {
            Self::Lrf(r) => r.lock().read_chunk_entry(codec, cx, cz),
            Self::Mca(r) => Ok(r.read_chunk_entry(codec, cx, cz)),
        }
    }

    /// Read a chunk directly out of `mmap` instead of going through the
    /// reader's own file handle, for callers that already hold a mapping
    /// from [`crate::mmap_cache::MmapReadAhead`]. `mmap` must be a mapping
    /// of this backend's own file.
    pub fn read_chunk_entry_mmap(
        &self,
        codec: &Codec,
        mmap: &[u8],
        cx: i32,
        cz: i32,
    ) -> Result<Option<ChunkEntry>> {
        match self {
            Self::Lrf(_) => lrf::read_chunk_entry_from_slice(mmap, codec, cx, cz),
            Self::Mca(_) => Ok(mca::read_chunk_entry_from_slice(mmap, codec, cx, cz)),
        }
    }

    /// Local `(cx, cz)` coordinates (0..32 each) of every live chunk.
    pub fn live_chunks(&self) -> Vec<(i32, i32)> {
        match self {
            Self::Lrf(r) => r
                .lock()
                .live_chunks()
                .into_iter()
                .map(|(cx, cz, _)| (cx, cz))
                .collect(),
            Self::Mca(r) => r.live_chunks(),
        }
    }

    pub fn refresh(&self) -> Result<()> {
        match self {
            Self::Lrf(r) => r.lock().refresh(),
            Self::Mca(_) => Ok(()),
        }
    }
}
