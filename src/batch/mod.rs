//! Concurrent, batched chunk I/O layered on top of the region file formats.

pub mod loader;
pub mod saver;

pub use loader::{BatchLoader, BatchLoaderConfig};
pub use saver::{BatchSaver, BatchSaverConfig, SaveFormat};
