//! Bounded, lock-free pools of fixed-size chunks.
//!
//! A [BufferPool] caches up to `max_pool_size` chunks of a single size for one
//! allocation domain (for example, one CPU-affinity partition of a
//! [crate::MemoryManager]).
//!
//! # Thread Safety
//!
//! [BufferPool] is `Send + Sync` and can be shared freely. [BufferPool::acquire] and
//! [BufferPool::release] never block: the freelist is a bounded
//! [crossbeam_queue::ArrayQueue] and all accounting uses atomic counters.
//!
//! # Slots
//!
//! The freelist stores `Option<Chunk>` where:
//! - `Some(chunk)` = a reusable chunk
//! - `None` = a free slot for which a chunk has not been materialized yet
//!
//! When `prefill` is set, every slot is materialized on construction. Either way the
//! number of entries in the freelist plus the number of chunks held by buffers never
//! exceeds `max_pool_size`.
//!
//! # Pool Lifecycle
//!
//! Buffers hold a weak reference to the pool. If a buffer is disposed after its pool
//! was dropped, its chunk is deallocated instead of returned.

use crate::{
    buffer::PoolBuffer,
    metrics::{Metrics, PoolLabel},
    probe::Probes,
    Chunk, Error,
};
use crossbeam_queue::ArrayQueue;
use prometheus_client::registry::Registry;
use std::{
    alloc::Layout,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
};
use tracing::{debug, trace};

/// Error returned when a pooled allocation cannot be satisfied.
///
/// Neither variant is fatal: [crate::MemoryManager] answers both by falling back to
/// memory that is not tracked by any pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolError {
    /// The requested size exceeds the chunk size.
    Oversized,
    /// The pool has no free chunk.
    Exhausted,
}

impl std::fmt::Display for PoolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Oversized => write!(f, "requested size exceeds chunk size"),
            Self::Exhausted => write!(f, "pool exhausted"),
        }
    }
}

impl std::error::Error for PoolError {}

/// Configuration for a single [BufferPool].
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Capacity of every chunk in the pool.
    pub chunk_size: usize,
    /// Chunk alignment. Must be a power of two.
    pub alignment: usize,
    /// Maximum number of chunks the pool retains.
    pub max_pool_size: usize,
    /// Whether to allocate every chunk on pool creation.
    pub prefill: bool,
}

impl PoolConfig {
    /// Validates the configuration, returning the chunk layout.
    ///
    /// # Errors
    ///
    /// Returns [Error::InvalidArgument] if `chunk_size` or `max_pool_size` is zero,
    /// or if `alignment` is not a power of two.
    pub fn validate(&self) -> Result<Layout, Error> {
        if self.chunk_size == 0 {
            return Err(Error::InvalidArgument("chunk size must be positive"));
        }
        if self.max_pool_size == 0 {
            return Err(Error::InvalidArgument("pool size must be positive"));
        }
        if !self.alignment.is_power_of_two() {
            return Err(Error::InvalidArgument("alignment must be a power of two"));
        }
        Layout::from_size_align(self.chunk_size, self.alignment)
            .map_err(|_| Error::InvalidArgument("chunk layout is invalid"))
    }
}

/// Internal state of a buffer pool.
pub(crate) struct PoolInner {
    /// Index of the pool within its manager (used as the metrics label).
    index: usize,
    /// Layout shared by every chunk.
    layout: Layout,
    /// Maximum number of chunks retained.
    max_pool_size: usize,
    /// Free list storing either reusable chunks or empty slots.
    freelist: ArrayQueue<Option<Chunk>>,
    /// Number of chunks currently held by buffers (out of pool).
    allocated: AtomicUsize,
    metrics: Arc<Metrics>,
    probes: Arc<Probes>,
}

impl PoolInner {
    /// Try to take a chunk from the freelist, materializing an empty slot if needed.
    fn acquire(&self) -> Option<Chunk> {
        let label = PoolLabel::new(self.index);
        let chunk = match self.freelist.pop() {
            // Reuse existing chunk
            Some(Some(chunk)) => chunk,
            // Create new chunk (we have a slot)
            Some(None) => Chunk::with_layout(self.layout),
            None => {
                self.metrics.exhausted_total.get_or_create(&label).inc();
                trace!(pool = self.index, "pool exhausted");
                return None;
            }
        };

        self.allocated.fetch_add(1, Ordering::Relaxed);
        self.metrics.acquired_total.get_or_create(&label).inc();
        self.metrics.allocated.get_or_create(&label).inc();
        self.metrics.available.get_or_create(&label).dec();
        self.probes.allocate_from_pool(chunk.capacity());
        Some(chunk)
    }

    /// Offer a chunk back to the freelist.
    ///
    /// Returns `false` (and drops the chunk) if the freelist is full or the chunk
    /// does not match the pool's layout.
    pub(crate) fn release(&self, chunk: Chunk) -> bool {
        let label = PoolLabel::new(self.index);
        if chunk.capacity() != self.layout.size() || chunk.alignment() < self.layout.align() {
            self.metrics.rejected_total.get_or_create(&label).inc();
            debug!(
                pool = self.index,
                capacity = chunk.capacity(),
                "rejected foreign chunk"
            );
            return false;
        }

        let capacity = chunk.capacity();
        match self.freelist.push(Some(chunk)) {
            Ok(()) => {
                let _ = self
                    .allocated
                    .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |prev| {
                        Some(prev.saturating_sub(1))
                    });
                self.metrics.allocated.get_or_create(&label).dec();
                self.metrics.available.get_or_create(&label).inc();
                self.metrics.released_total.get_or_create(&label).inc();
                self.probes.release_to_pool(capacity);
                true
            }
            Err(_chunk) => {
                // Freelist full, chunk is dropped and deallocated
                self.metrics.rejected_total.get_or_create(&label).inc();
                debug!(pool = self.index, "pool full, abandoning chunk");
                false
            }
        }
    }
}

/// A bounded pool of reusable chunks of one size.
///
/// Cloning a [BufferPool] yields another handle to the same freelist.
#[derive(Clone)]
pub struct BufferPool {
    inner: Arc<PoolInner>,
}

impl std::fmt::Debug for BufferPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferPool")
            .field("index", &self.inner.index)
            .field("chunk_size", &self.chunk_size())
            .field("max_pool_size", &self.inner.max_pool_size)
            .field("size", &self.size())
            .finish()
    }
}

impl BufferPool {
    /// Creates a standalone pool, registering its metrics with `registry`.
    ///
    /// # Errors
    ///
    /// Returns [Error::InvalidArgument] if the configuration is invalid.
    pub fn new(config: PoolConfig, registry: &mut Registry) -> Result<Self, Error> {
        let metrics = Arc::new(Metrics::new(registry));
        Self::with_shared(0, config, metrics, Arc::default())
    }

    /// Creates a pool that reports to metrics and probes shared with other pools.
    pub(crate) fn with_shared(
        index: usize,
        config: PoolConfig,
        metrics: Arc<Metrics>,
        probes: Arc<Probes>,
    ) -> Result<Self, Error> {
        let layout = config.validate()?;

        let freelist = ArrayQueue::new(config.max_pool_size);
        for _ in 0..config.max_pool_size {
            let entry = config.prefill.then(|| Chunk::with_layout(layout));
            let _ = freelist.push(entry);
        }
        metrics
            .available
            .get_or_create(&PoolLabel::new(index))
            .set(freelist.len() as i64);
        debug!(
            pool = index,
            chunk_size = config.chunk_size,
            max_pool_size = config.max_pool_size,
            prefill = config.prefill,
            "created pool"
        );

        Ok(Self {
            inner: Arc::new(PoolInner {
                index,
                layout,
                max_pool_size: config.max_pool_size,
                freelist,
                allocated: AtomicUsize::new(0),
                metrics,
                probes,
            }),
        })
    }

    /// Takes a free chunk, or returns `None` if the pool is empty.
    ///
    /// Never blocks. A chunk taken with this method counts as held until it is
    /// passed back to [Self::release].
    pub fn acquire(&self) -> Option<Chunk> {
        self.inner.acquire()
    }

    /// Offers a chunk back to the pool.
    ///
    /// Returns `false` if the pool is already full or the chunk was not shaped by
    /// this pool; the chunk is then deallocated.
    pub fn release(&self, chunk: Chunk) -> bool {
        self.inner.release(chunk)
    }

    /// Allocates a single-chunk buffer with `position == 0` and `limit == size`.
    ///
    /// # Errors
    ///
    /// - [PoolError::Oversized]: `size` exceeds the chunk size
    /// - [PoolError::Exhausted]: the pool has no free chunk
    pub fn try_alloc(&self, size: usize) -> Result<PoolBuffer, PoolError> {
        if size > self.chunk_size() {
            return Err(PoolError::Oversized);
        }
        let chunk = self.acquire().ok_or(PoolError::Exhausted)?;
        Ok(PoolBuffer::new(chunk, Arc::downgrade(&self.inner), size))
    }

    /// Returns the approximate number of free entries in the pool.
    ///
    /// Best-effort under concurrency; intended for monitoring and tests.
    pub fn size(&self) -> usize {
        self.inner.freelist.len()
    }

    /// Returns the number of chunks currently held outside of the pool.
    pub fn allocated(&self) -> usize {
        self.inner.allocated.load(Ordering::Relaxed)
    }

    /// Returns the maximum number of chunks the pool retains.
    pub fn max_pool_size(&self) -> usize {
        self.inner.max_pool_size
    }

    /// Returns the capacity of every chunk in the pool.
    pub fn chunk_size(&self) -> usize {
        self.inner.layout.size()
    }

    /// Returns the alignment of every chunk in the pool.
    pub fn alignment(&self) -> usize {
        self.inner.layout.align()
    }

    /// Returns the index of the pool within its manager.
    pub fn index(&self) -> usize {
        self.inner.index
    }
}
