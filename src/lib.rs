//! Chunked spatial storage engine.
//!
//! Persists 32x32-chunk regions in either of two on-disk formats: a custom
//! Linear Region Format ([`format::lrf`]) that packs a whole region's
//! chunks behind one region-wide compression algorithm, and the legacy
//! Anvil/MCA format ([`format::mca`]) kept for interoperability and
//! migration. [`manager::StorageManager`] is the process-wide entry point:
//! it dispatches loads/saves to per-region [`batch::BatchLoader`]/
//! [`batch::BatchSaver`] pairs, serves reads from a memory-mapped
//! read-ahead cache ([`mmap_cache::MmapReadAhead`]), and checks every
//! loaded chunk against a CRC32C/SHA-256 pair ([`integrity`]).
//!
//! [`convert::RegionConverter`] migrates directories between formats in
//! place, and [`scheduler::BackgroundScheduler`] can drive that migration
//! automatically whenever the host reports idle time.

pub mod batch;
pub mod checksum;
pub mod chunk;
pub mod codec;
pub mod config;
pub mod convert;
pub mod coord;
pub mod error;
pub mod format;
pub mod integrity;
pub mod intent;
pub mod lod_index;
pub mod manager;
pub mod mmap_cache;
pub mod pending;
pub mod scheduler;
pub mod stats;

pub use chunk::ChunkEntry;
pub use codec::{Algorithm, Codec, McaCompression};
pub use config::{ConversionMode, FormatPreference, StorageConfig};
pub use coord::RegionCoord;
pub use error::{CodecError, Result, StorageError};
pub use integrity::{IntegrityValidator, ValidationReport};
pub use lod_index::{LodDescriptor, TurboIndex};
pub use manager::{PreferredFormat, StorageManager};
pub use stats::{StorageStats, StorageStatsSnapshot};
