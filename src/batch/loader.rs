//! Concurrent batched chunk loading: a small I/O thread pool feeds a
//! decompression thread pool, in-flight requests for the same chunk are
//! deduplicated onto one job, and the loader applies backpressure once too
//! many loads are outstanding rather than growing an unbounded queue
//! (grounded on the `TPool` bounded-queue pattern in the lz4 port's
//! `threadpool.rs`, adapted here to two pools instead of one).

use std::collections::HashMap;
use std::sync::Arc;

use memmap2::Mmap;
use parking_lot::Mutex;
use rayon::{ThreadPool, ThreadPoolBuilder};
use tracing::debug;

use crate::chunk::ChunkEntry;
use crate::codec::Codec;
use crate::coord::chunk_index;
use crate::error::{Result, StorageError};
use crate::format::RegionBackend;
use crate::pending::{pending, PendingCompleter, PendingResult};

#[derive(Debug, Clone, Copy)]
pub struct BatchLoaderConfig {
    pub io_threads: usize,
    pub decompress_threads: usize,
    /// Maximum number of distinct chunks with a load outstanding at once.
    pub max_in_flight: usize,
}

impl Default for BatchLoaderConfig {
    fn default() -> Self {
        Self {
            io_threads: 2,
            decompress_threads: 4,
            max_in_flight: 256,
        }
    }
}

type LoadResult = Result<Option<ChunkEntry>>;

struct Inner {
    in_flight: Mutex<HashMap<usize, Vec<PendingCompleter<LoadResult>>>>,
    max_in_flight: usize,
}

/// Per-region handle driving reads against a shared [`RegionBackend`].
pub struct BatchLoader {
    io_pool: Arc<ThreadPool>,
    decompress_pool: Arc<ThreadPool>,
    inner: Arc<Inner>,
}

impl BatchLoader {
    pub fn new(config: BatchLoaderConfig) -> Result<Self> {
        let io_pool = ThreadPoolBuilder::new()
            .num_threads(config.io_threads)
            .thread_name(|i| format!("turbo-region-io-{i}"))
            .build()
            .map_err(|e| StorageError::InvalidArgument(e.to_string()))?;
        let decompress_pool = ThreadPoolBuilder::new()
            .num_threads(config.decompress_threads)
            .thread_name(|i| format!("turbo-region-decompress-{i}"))
            .build()
            .map_err(|e| StorageError::InvalidArgument(e.to_string()))?;

        Ok(Self {
            io_pool: Arc::new(io_pool),
            decompress_pool: Arc::new(decompress_pool),
            inner: Arc::new(Inner {
                in_flight: Mutex::new(HashMap::new()),
                max_in_flight: config.max_in_flight,
            }),
        })
    }

    /// Request a chunk load. `None` means the in-flight budget is
    /// exhausted and this is a brand new (non-duplicate) request; the
    /// caller should treat this as backpressure and retry later.
    ///
    /// `mmap`, when given, must be a mapping of `backend`'s own file; the
    /// read then comes straight out of it instead of going through the
    /// reader's own seeks, letting read-ahead warm the mapping before the
    /// request ever lands here.
    pub fn request(
        &self,
        backend: Arc<RegionBackend>,
        codec: Arc<Codec>,
        mmap: Option<Arc<Mmap>>,
        cx: i32,
        cz: i32,
    ) -> Option<PendingResult<LoadResult>> {
        let idx = chunk_index(cx, cz);
        let (completer, result) = pending();

        {
            let mut guard = self.inner.in_flight.lock();
            if let Some(waiters) = guard.get_mut(&idx) {
                debug!(cx, cz, "load request deduplicated onto in-flight job");
                waiters.push(completer);
                return Some(result);
            }
            if guard.len() >= self.inner.max_in_flight {
                return None;
            }
            guard.insert(idx, vec![completer]);
        }

        let inner = Arc::clone(&self.inner);
        let decompress_pool = Arc::clone(&self.decompress_pool);

        self.io_pool.spawn(move || {
            decompress_pool.spawn(move || {
                let outcome = match &mmap {
                    Some(mmap) => backend.read_chunk_entry_mmap(&codec, mmap, cx, cz),
                    None => backend.read_chunk_entry(&codec, cx, cz),
                };
                let waiters = inner.in_flight.lock().remove(&idx);
                if let Some(waiters) = waiters {
                    let mut waiters = waiters.into_iter();
                    if let Some(first) = waiters.next() {
                        // Every waiter gets its own clone of the outcome;
                        // only the last one gets the original to avoid a
                        // redundant final clone.
                        let mut remaining: Vec<_> = waiters.collect();
                        if let Some(last) = remaining.pop() {
                            first.complete(clone_result(&outcome));
                            for waiter in remaining {
                                waiter.complete(clone_result(&outcome));
                            }
                            last.complete(outcome);
                        } else {
                            first.complete(outcome);
                        }
                    }
                }
            });
        });

        Some(result)
    }

    /// Number of distinct chunks with a load currently outstanding.
    pub fn in_flight_count(&self) -> usize {
        self.inner.in_flight.lock().len()
    }
}

fn clone_result(result: &LoadResult) -> LoadResult {
    match result {
        Ok(entry) => Ok(entry.clone()),
        Err(e) => Err(StorageError::InvalidFormat(e.to_string())),
    }
}
