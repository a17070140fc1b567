//! The allocation façade.
//!
//! A [MemoryManager] owns one [BufferPool] per partition and decides how each
//! request is served:
//! - `size <= chunk_size`: a single [PoolBuffer].
//! - `size > chunk_size`: a [CompositeBuffer] of `ceil(size / chunk_size)` chunks,
//!   the last one limited to the remainder.
//!
//! Each thread is pinned (round-robin, on first use) to a preferred pool. When that
//! pool is empty the next ones are tried in order; when every pool is empty the
//! chunk is allocated outside of any pool and deallocated once released.
//!
//! The manager is a factory, not an owner: buffers return their chunks to the pools
//! directly, and a manager can be cloned and shared freely.

use crate::{
    buffer::{Buffer, CompositeBuffer, Cursor, PoolBuffer},
    chunk::{cache_line_size, physical_memory},
    metrics::Metrics,
    pool::{BufferPool, PoolConfig},
    probe::{MemoryProbe, Probes},
    Chunk, Error,
};
use prometheus_client::registry::Registry;
use std::{
    alloc::Layout,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Weak,
    },
    thread,
};
use tracing::{debug, trace, warn};

/// Source of thread affinities.
static NEXT_AFFINITY: AtomicUsize = AtomicUsize::new(0);

thread_local! {
    static AFFINITY: usize = NEXT_AFFINITY.fetch_add(1, Ordering::Relaxed);
}

/// Configuration for a [MemoryManager].
#[derive(Debug, Clone)]
pub struct Config {
    /// Capacity of every chunk.
    pub chunk_size: usize,
    /// Number of pools (partitions).
    pub pool_count: usize,
    /// Fraction of available memory devoted to pooled chunks, in `(0, 1)`.
    pub heap_usage: f64,
    /// Memory the budget is computed from. Defaults to the host's physical memory.
    pub available_memory: Option<usize>,
    /// Whether to allocate every pooled chunk on construction.
    pub prefill: bool,
    /// Chunk alignment. Must be a power of two.
    pub alignment: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            chunk_size: 4096,
            pool_count: thread::available_parallelism().map_or(1, |n| n.get()),
            heap_usage: 0.03,
            available_memory: None,
            prefill: false,
            alignment: cache_line_size(),
        }
    }
}

impl Config {
    /// Validates the configuration.
    ///
    /// # Errors
    ///
    /// Returns [Error::InvalidArgument] if `chunk_size` or `pool_count` is zero, if
    /// `heap_usage` is not strictly between 0 and 1, or if `alignment` is not a
    /// power of two.
    pub fn validate(&self) -> Result<(), Error> {
        if self.chunk_size == 0 {
            return Err(Error::InvalidArgument("chunk size must be positive"));
        }
        if self.pool_count == 0 {
            return Err(Error::InvalidArgument("pool count must be positive"));
        }
        if !(self.heap_usage > 0.0 && self.heap_usage < 1.0) {
            return Err(Error::InvalidArgument("heap usage must be in (0, 1)"));
        }
        if !self.alignment.is_power_of_two() {
            return Err(Error::InvalidArgument("alignment must be a power of two"));
        }
        Ok(())
    }

    /// Number of chunks the memory budget affords each pool, before clamping.
    fn budgeted_chunks(&self) -> usize {
        let available = self.available_memory.unwrap_or_else(physical_memory);
        let budget = (available as f64 * self.heap_usage) as usize;
        budget
            .checked_div(self.chunk_size)
            .and_then(|chunks| chunks.checked_div(self.pool_count))
            .unwrap_or(0)
    }

    /// Returns the number of chunks each pool retains (at least one).
    pub fn chunks_per_pool(&self) -> usize {
        self.budgeted_chunks().max(1)
    }
}

/// Hands out pooled buffers.
#[derive(Clone)]
pub struct MemoryManager {
    config: Config,
    layout: Layout,
    pools: Vec<BufferPool>,
    metrics: Arc<Metrics>,
    probes: Arc<Probes>,
}

impl std::fmt::Debug for MemoryManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryManager")
            .field("config", &self.config)
            .field("pools", &self.pools)
            .finish()
    }
}

impl MemoryManager {
    /// Creates the pools described by `config`, registering metrics with `registry`.
    ///
    /// # Errors
    ///
    /// Returns [Error::InvalidArgument] if the configuration is invalid.
    pub fn new(config: Config, registry: &mut Registry) -> Result<Self, Error> {
        config.validate()?;
        if config.budgeted_chunks() == 0 {
            warn!(
                chunk_size = config.chunk_size,
                pool_count = config.pool_count,
                heap_usage = config.heap_usage,
                "memory budget is below one chunk per pool, retaining one"
            );
        }
        let chunks_per_pool = config.chunks_per_pool();
        let pool_config = PoolConfig {
            chunk_size: config.chunk_size,
            alignment: config.alignment,
            max_pool_size: chunks_per_pool,
            prefill: config.prefill,
        };
        let layout = pool_config.validate()?;

        let metrics = Arc::new(Metrics::new(registry));
        let probes = Arc::new(Probes::default());
        let pools = (0..config.pool_count)
            .map(|index| {
                BufferPool::with_shared(
                    index,
                    pool_config.clone(),
                    metrics.clone(),
                    probes.clone(),
                )
            })
            .collect::<Result<Vec<_>, _>>()?;
        debug!(
            pool_count = config.pool_count,
            chunk_size = config.chunk_size,
            chunks_per_pool,
            "created memory manager"
        );

        Ok(Self {
            config,
            layout,
            pools,
            metrics,
            probes,
        })
    }

    /// Returns the index of the calling thread's preferred pool.
    fn affinity(&self) -> usize {
        AFFINITY.with(|affinity| *affinity) % self.pools.len()
    }

    /// Draws one chunk with `limit` visible bytes, falling back to an unpooled
    /// chunk if every pool is empty.
    fn draw(&self, limit: usize) -> PoolBuffer {
        let start = self.affinity();
        let count = self.pools.len();
        for i in 0..count {
            if let Ok(buffer) = self.pools[(start + i) % count].try_alloc(limit) {
                return buffer;
            }
        }

        let chunk = Chunk::with_layout(self.layout);
        let capacity = chunk.capacity();
        self.metrics.fallback_total.inc();
        self.metrics.fallback_bytes_total.inc_by(capacity as u64);
        self.probes.allocate(capacity);
        trace!(capacity, limit, "pools exhausted, allocating unpooled chunk");
        PoolBuffer::new(chunk, Weak::new(), limit)
    }

    /// Draws `count` chunks, the last one limited to `last`.
    fn draw_composite(&self, count: usize, last: usize) -> CompositeBuffer {
        let chunk_size = self.chunk_size();
        let segments = (0..count)
            .map(|i| self.draw(if i + 1 == count { last } else { chunk_size }))
            .collect();
        CompositeBuffer::from_allocation(segments)
    }

    /// Allocates a buffer with `position == 0` and `limit == capacity == size`
    /// (for a single chunk, `capacity` is the chunk size).
    pub fn allocate(&self, size: usize) -> Buffer {
        let chunk_size = self.chunk_size();
        if size <= chunk_size {
            return Buffer::Pool(self.draw(size));
        }
        let count = size.div_ceil(chunk_size);
        let last = size - (count - 1) * chunk_size;
        Buffer::Composite(self.draw_composite(count, last))
    }

    /// Allocates a buffer of whole chunks with at least `size` bytes, with
    /// `limit == capacity`.
    pub fn allocate_at_least(&self, size: usize) -> Buffer {
        let chunk_size = self.chunk_size();
        if size <= chunk_size {
            return Buffer::Pool(self.draw(chunk_size));
        }
        Buffer::Composite(self.draw_composite(size.div_ceil(chunk_size), chunk_size))
    }

    /// Resizes `buffer` to `new_size` bytes.
    ///
    /// If the buffer's backing chunks can hold `new_size` without changing their
    /// number, the limit is adjusted in place and `buffer` itself is returned.
    /// Otherwise a new buffer is allocated, `[0, min(limit, new_size))` is copied
    /// into it, the cursor and byte order are carried over, and `buffer` is disposed.
    ///
    /// Growing in place widens the window over the rest of the chunk, which is only
    /// done while `buffer` is the chunk's sole holder. A view whose chunk is shared
    /// (by a split half, slice or duplicate still alive) and whose window is too
    /// small for `new_size` is therefore copied, even when the chunk count would not
    /// change. Shrinking, or growing within the current window, is always in place.
    ///
    /// # Errors
    ///
    /// Returns [Error::UseAfterDispose] if `buffer` was disposed.
    pub fn reallocate(&self, mut buffer: Buffer, new_size: usize) -> Result<Buffer, Error> {
        if buffer.is_disposed() {
            return Err(Error::UseAfterDispose);
        }

        let chunk_size = self.chunk_size();
        let in_place = match &mut buffer {
            Buffer::Pool(single) => {
                new_size <= chunk_size
                    && (new_size <= single.capacity() || single.expand(new_size))
            }
            Buffer::Composite(composite) => {
                new_size > chunk_size
                    && new_size.div_ceil(chunk_size) == composite.segment_count()
                    && (new_size <= composite.capacity() || composite.expand(new_size))
            }
        };
        if in_place {
            buffer.set_limit(new_size)?;
            return Ok(buffer);
        }

        let mut replacement = self.allocate(new_size);
        let len = buffer.limit().min(new_size);
        let mut scratch = vec![0u8; len.min(chunk_size)];
        let mut copied = 0;
        while copied < len {
            let n = (len - copied).min(scratch.len());
            buffer.read_at(copied, &mut scratch[..n])?;
            replacement.write_at(copied, &scratch[..n])?;
            copied += n;
        }
        replacement.set_order(buffer.order());
        replacement.set_position(buffer.position().min(new_size))?;
        trace!(
            from = buffer.capacity(),
            to = new_size,
            "reallocated buffer by copy"
        );

        buffer.dispose();
        Ok(replacement)
    }

    /// Registers a probe with the manager and all of its pools.
    pub fn add_probe(&self, probe: Arc<dyn MemoryProbe>) {
        self.probes.add(probe);
    }

    /// Returns the pool at `index`.
    pub fn pool(&self, index: usize) -> Option<&BufferPool> {
        self.pools.get(index)
    }

    /// Returns every pool, indexed by partition.
    pub fn pools(&self) -> &[BufferPool] {
        &self.pools
    }

    /// Returns the configuration the manager was built from.
    pub const fn config(&self) -> &Config {
        &self.config
    }

    /// Returns the capacity of every chunk.
    pub const fn chunk_size(&self) -> usize {
        self.layout.size()
    }

    /// Returns the approximate number of free entries across all pools.
    pub fn free_chunks(&self) -> usize {
        self.pools.iter().map(BufferPool::size).sum()
    }

    /// Returns the number of pooled chunks held by buffers across all pools.
    pub fn allocated_chunks(&self) -> usize {
        self.pools.iter().map(BufferPool::allocated).sum()
    }

    /// Returns the metrics shared by the manager and its pools.
    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::probe::CountingProbe;
    use prometheus_client::encoding::text::encode;
    use rand::{rngs::StdRng, Rng, SeedableRng};
    use std::collections::HashSet;
    use test_case::test_case;

    const CHUNK: usize = 4096;

    fn test_config(pool_count: usize, chunks_per_pool: usize) -> Config {
        Config {
            chunk_size: CHUNK,
            pool_count,
            heap_usage: 0.5,
            available_memory: Some(2 * CHUNK * pool_count * chunks_per_pool),
            prefill: false,
            alignment: 64,
        }
    }

    fn test_manager(pool_count: usize, chunks_per_pool: usize) -> MemoryManager {
        let mut registry = Registry::default();
        MemoryManager::new(test_config(pool_count, chunks_per_pool), &mut registry).unwrap()
    }

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.chunk_size, 4096);
        assert!(config.pool_count >= 1);
        assert!(config.validate().is_ok());
        assert!(config.chunks_per_pool() >= 1);
    }

    #[test_case(Config { chunk_size: 0, ..test_config(1, 1) }; "zero chunk size")]
    #[test_case(Config { pool_count: 0, ..test_config(1, 1) }; "zero pool count")]
    #[test_case(Config { heap_usage: 0.0, ..test_config(1, 1) }; "zero heap usage")]
    #[test_case(Config { heap_usage: 1.0, ..test_config(1, 1) }; "full heap usage")]
    #[test_case(Config { heap_usage: f64::NAN, ..test_config(1, 1) }; "nan heap usage")]
    #[test_case(Config { alignment: 48, ..test_config(1, 1) }; "alignment not power of two")]
    fn test_invalid_config(config: Config) {
        assert!(matches!(config.validate(), Err(Error::InvalidArgument(_))));
        let mut registry = Registry::default();
        assert!(matches!(
            MemoryManager::new(config, &mut registry),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_chunks_per_pool() {
        let config = Config {
            available_memory: Some(1 << 20),
            pool_count: 4,
            ..test_config(1, 1)
        };
        assert_eq!(config.chunks_per_pool(), 32);

        // Budgets below one chunk per pool are clamped
        let config = Config {
            available_memory: Some(1000),
            ..test_config(1, 1)
        };
        assert_eq!(config.chunks_per_pool(), 1);
        let manager = MemoryManager::new(config, &mut Registry::default()).unwrap();
        assert_eq!(manager.pool(0).unwrap().max_pool_size(), 1);
    }

    #[test]
    fn test_allocate_single() {
        let manager = test_manager(1, 4);
        let buffer = manager.allocate(100);
        assert!(!buffer.is_composite());
        assert_eq!(buffer.position(), 0);
        assert_eq!(buffer.limit(), 100);
        assert_eq!(buffer.capacity(), CHUNK);
        assert!(buffer.is_pooled());

        let empty = manager.allocate(0);
        assert_eq!(empty.limit(), 0);
        let full = manager.allocate(CHUNK);
        assert!(!full.is_composite());
        assert_eq!(full.limit(), CHUNK);
        assert_eq!(manager.free_chunks(), 1);
    }

    #[test]
    fn test_allocate_composite_scenario() {
        let manager = test_manager(1, 8);
        let pool = manager.pool(0).unwrap();
        assert_eq!(pool.size(), 8);

        let mut buffer = manager.allocate(6000);
        assert!(buffer.is_composite());
        assert_eq!(buffer.segment_count(), 2);
        assert_eq!(buffer.capacity(), 6000);
        assert_eq!(buffer.limit(), 6000);
        assert_eq!(pool.size(), 6);

        buffer.dispose();
        assert_eq!(pool.size(), 8);

        let first = pool.acquire().unwrap();
        let second = pool.acquire().unwrap();
        assert_eq!(first.capacity(), CHUNK);
        assert_eq!(second.capacity(), CHUNK);
    }

    #[test_case(1, 1, CHUNK; "tiny")]
    #[test_case(4096, 1, CHUNK; "one chunk")]
    #[test_case(4097, 2, 2 * CHUNK; "just over")]
    #[test_case(3 * 4096, 3, 3 * CHUNK; "exact multiple")]
    fn test_allocate_at_least(size: usize, segments: usize, capacity: usize) {
        let manager = test_manager(1, 4);
        let buffer = manager.allocate_at_least(size);
        assert_eq!(buffer.segment_count(), segments);
        assert_eq!(buffer.capacity(), capacity);
        assert_eq!(buffer.limit(), capacity);
        assert!(buffer.capacity() >= size);
    }

    #[test]
    fn test_pools_spill_over_then_fall_back() {
        let manager = test_manager(2, 1);
        let probe = Arc::new(CountingProbe::default());
        manager.add_probe(probe.clone());

        let mut first = manager.allocate(10);
        let mut second = manager.allocate(10);
        assert!(first.is_pooled());
        assert!(second.is_pooled());
        assert_eq!(manager.free_chunks(), 0);

        // Every pool is empty
        let mut third = manager.allocate(10);
        assert!(!third.is_pooled());
        assert_eq!(third.capacity(), CHUNK);
        third.put_u32(1).unwrap();
        assert_eq!(manager.metrics().fallbacks(), 1);
        assert_eq!(probe.allocated(), 1);
        assert_eq!(probe.from_pool(), 2);

        // Events report chunk capacity, not the requested size
        assert_eq!(probe.allocated_bytes(), CHUNK);
        assert_eq!(probe.from_pool_bytes(), 2 * CHUNK);

        // Unpooled memory never enters a pool
        assert!(!third.try_dispose());
        assert_eq!(manager.free_chunks(), 0);
        assert!(first.try_dispose());
        assert!(second.try_dispose());
        assert_eq!(manager.free_chunks(), 2);
        assert_eq!(probe.released(), 2);
        assert_eq!(probe.outstanding(), 0);
    }

    #[test]
    fn test_composite_mixes_pooled_and_fallback_segments() {
        let manager = test_manager(1, 2);
        let counter = Arc::new(CountingProbe::default());
        manager.add_probe(counter.clone());

        // The pool runs dry after two of the three chunks
        let mut buffer = manager.allocate(3 * CHUNK);
        assert_eq!(buffer.segment_count(), 3);
        assert_eq!(buffer.pooled_chunks().len(), 2);
        assert_eq!(manager.free_chunks(), 0);
        assert_eq!(manager.metrics().fallbacks(), 1);
        assert_eq!(counter.allocated() as u64, manager.metrics().fallbacks());
        assert_eq!(counter.from_pool(), 2);

        // Bytes cross from pooled into unpooled memory seamlessly
        let data: Vec<u8> = (0..3 * CHUNK).map(|i| (i % 251) as u8).collect();
        buffer.put_slice(&data).unwrap();
        let mut copied = vec![0u8; data.len()];
        buffer.read_at(0, &mut copied).unwrap();
        assert_eq!(copied, data);
        let mut raw = [0u8; 8];
        raw.copy_from_slice(&data[2 * CHUNK - 4..2 * CHUNK + 4]);
        assert_eq!(
            buffer.get_u64_at(2 * CHUNK - 4).unwrap(),
            u64::from_be_bytes(raw)
        );

        // Only the pooled segments are credited back
        assert!(buffer.try_dispose());
        assert_eq!(manager.free_chunks(), 2);
        assert_eq!(manager.allocated_chunks(), 0);
        assert_eq!(counter.released(), 2);
        assert_eq!(counter.outstanding(), 0);
        assert_eq!(manager.metrics().fallbacks(), 1);
        assert_eq!(manager.pool(0).unwrap().size(), 2);
    }

    #[test]
    fn test_reallocate_in_place() {
        let manager = test_manager(1, 4);
        let buffer = manager.allocate(100);
        let chunk = buffer.as_pool().unwrap().chunk_addr();

        let buffer = manager.reallocate(buffer, 4000).unwrap();
        assert_eq!(buffer.as_pool().unwrap().chunk_addr(), chunk);
        assert_eq!(buffer.limit(), 4000);

        let buffer = manager.reallocate(buffer, 10).unwrap();
        assert_eq!(buffer.as_pool().unwrap().chunk_addr(), chunk);
        assert_eq!(buffer.limit(), 10);
        assert_eq!(manager.free_chunks(), 3);
    }

    #[test]
    fn test_reallocate_trimmed_single_expands() {
        let manager = test_manager(1, 4);
        let mut buffer = manager.allocate(100);
        buffer.trim().unwrap();
        assert_eq!(buffer.capacity(), 100);
        let chunk = buffer.as_pool().unwrap().chunk_addr();

        let buffer = manager.reallocate(buffer, CHUNK).unwrap();
        assert_eq!(buffer.as_pool().unwrap().chunk_addr(), chunk);
        assert_eq!(buffer.capacity(), CHUNK);
        assert_eq!(buffer.limit(), CHUNK);
    }

    #[test]
    fn test_reallocate_grow_copies() {
        let manager = test_manager(1, 8);
        let mut buffer = manager.allocate(100);
        let data: Vec<u8> = (0..100).collect();
        buffer.put_slice(&data).unwrap();
        buffer.set_position(50).unwrap();
        buffer.set_order(crate::ByteOrder::LittleEndian);

        let buffer = manager.reallocate(buffer, 6000).unwrap();
        assert!(buffer.is_composite());
        assert_eq!(buffer.limit(), 6000);
        assert_eq!(buffer.position(), 50);
        assert_eq!(buffer.order(), crate::ByteOrder::LittleEndian);
        let mut copied = [0u8; 100];
        buffer.read_at(0, &mut copied).unwrap();
        assert_eq!(copied.as_slice(), data.as_slice());

        // The old chunk went back to the pool
        assert_eq!(manager.free_chunks(), 6);
    }

    #[test]
    fn test_reallocate_composite() {
        let manager = test_manager(1, 8);
        let mut buffer = manager.allocate(6000);
        let data: Vec<u8> = (0..6000).map(|i| (i % 251) as u8).collect();
        buffer.put_slice(&data).unwrap();

        // Same chunk count: in place
        let buffer = manager.reallocate(buffer, 5000).unwrap();
        assert_eq!(buffer.segment_count(), 2);
        assert_eq!(buffer.limit(), 5000);
        assert_eq!(buffer.position(), 5000);
        assert_eq!(manager.free_chunks(), 6);

        // Growing within the last chunk widens it in place
        let buffer = manager.reallocate(buffer, 8000).unwrap();
        assert_eq!(buffer.segment_count(), 2);
        assert_eq!(buffer.capacity(), 8000);
        assert_eq!(manager.free_chunks(), 6);

        // Fewer chunks: copy into a single buffer
        let buffer = manager.reallocate(buffer, 3000).unwrap();
        assert!(!buffer.is_composite());
        assert_eq!(buffer.limit(), 3000);
        assert_eq!(buffer.position(), 3000);
        let mut copied = vec![0u8; 3000];
        buffer.read_at(0, &mut copied).unwrap();
        assert_eq!(copied, data[..3000]);
        assert_eq!(manager.free_chunks(), 7);
    }

    #[test]
    fn test_reallocate_shared_view_copies() {
        let manager = test_manager(1, 4);
        let mut head = manager.allocate(CHUNK);
        head.put_slice(&[1u8; 1000]).unwrap();
        head.put_slice(&[2u8; 1000]).unwrap();
        head.rewind().unwrap();
        let tail = head.split(1000).unwrap();
        let chunk = head.as_pool().unwrap().chunk_addr();

        // Shrinking stays in place even though the chunk is shared
        let head = manager.reallocate(head, 500).unwrap();
        assert_eq!(head.as_pool().unwrap().chunk_addr(), chunk);
        assert_eq!(head.limit(), 500);

        // Growing past the window would overwrite the tail, so it copies
        let head = manager.reallocate(head, 2000).unwrap();
        assert_ne!(head.as_pool().unwrap().chunk_addr(), chunk);
        assert_eq!(head.limit(), 2000);
        assert_eq!(head.get_u8_at(499).unwrap(), 1);
        assert_eq!(tail.get_u8_at(0).unwrap(), 2);
        assert_eq!(tail.get_u8_at(999).unwrap(), 2);
        assert_eq!(tail.ref_count(), 1);
    }

    #[test]
    fn test_reallocate_disposed() {
        let manager = test_manager(1, 1);
        let mut buffer = manager.allocate(10);
        buffer.dispose();
        assert!(matches!(
            manager.reallocate(buffer, 20),
            Err(Error::UseAfterDispose)
        ));
    }

    #[test]
    fn test_refcount_and_split_accounting() {
        let manager = test_manager(1, 2);
        let pool = manager.pool(0).unwrap();

        let mut buffer = manager.allocate(CHUNK);
        let mut views = vec![
            buffer.duplicate().unwrap(),
            buffer.slice().unwrap(),
            buffer.as_read_only().unwrap(),
        ];
        buffer.dispose();
        views[0].dispose();
        views[1].dispose();
        assert_eq!(pool.size(), 1);
        views[2].dispose();
        assert_eq!(pool.size(), 2);

        let mut head = manager.allocate(CHUNK);
        let mut tail = head.split(1000).unwrap();
        head.dispose();
        assert_eq!(pool.size(), 1);
        tail.dispose();
        assert_eq!(pool.size(), 2);
    }

    #[test]
    fn test_conservation() {
        const POOLS: usize = 2;
        const CHUNKS: usize = 16;

        let manager = test_manager(POOLS, CHUNKS);
        let total = POOLS * CHUNKS;
        let mut rng = StdRng::seed_from_u64(7);
        let mut live: Vec<Buffer> = Vec::new();

        for _ in 0..2_000 {
            match rng.gen_range(0..6) {
                0 | 1 => live.push(manager.allocate(rng.gen_range(0..3 * CHUNK))),
                2 if !live.is_empty() => {
                    let i = rng.gen_range(0..live.len());
                    let view = match rng.gen_range(0..3) {
                        0 => live[i].duplicate(),
                        1 => live[i].slice(),
                        _ => live[i].as_read_only(),
                    };
                    live.push(view.unwrap());
                }
                3 if !live.is_empty() => {
                    let i = rng.gen_range(0..live.len());
                    let (position, limit) = (live[i].position(), live[i].limit());
                    if position < limit {
                        let at = rng.gen_range(position..limit);
                        let tail = live[i].split(at).unwrap();
                        live.push(tail);
                    }
                }
                4 if !live.is_empty() => {
                    let i = rng.gen_range(0..live.len());
                    let buffer = &mut live[i];
                    let position = rng.gen_range(0..=buffer.limit());
                    buffer.set_position(position).unwrap();
                    if rng.gen_bool(0.5) {
                        buffer.trim().unwrap();
                    } else {
                        buffer.shrink().unwrap();
                    }
                }
                _ if !live.is_empty() => {
                    let i = rng.gen_range(0..live.len());
                    let mut buffer = live.swap_remove(i);
                    buffer.dispose();
                }
                _ => {}
            }

            let held: HashSet<usize> = live.iter().flat_map(Buffer::pooled_chunks).collect();
            assert_eq!(manager.free_chunks() + held.len(), total);
            assert_eq!(manager.allocated_chunks(), held.len());
        }

        for mut buffer in live {
            buffer.dispose();
        }
        assert_eq!(manager.free_chunks(), total);
        assert_eq!(manager.allocated_chunks(), 0);
    }

    #[test_case(64; "ample pools")]
    #[test_case(2; "exhausted pools")]
    fn test_concurrent_stress(chunks_per_pool: usize) {
        const THREADS: usize = 4;
        const ROUNDS: usize = 100_000;

        let manager = test_manager(THREADS, chunks_per_pool);
        let initial: Vec<usize> = manager.pools().iter().map(BufferPool::size).collect();
        let probe = Arc::new(CountingProbe::default());
        manager.add_probe(probe.clone());

        let handles: Vec<_> = (0..THREADS)
            .map(|seed| {
                let manager = manager.clone();
                thread::spawn(move || {
                    let mut rng = StdRng::seed_from_u64(seed as u64);
                    for _ in 0..ROUNDS {
                        let size = rng.gen_range(0..19_000);
                        let mut buffer = manager.allocate(size);
                        assert_eq!(buffer.limit(), size);
                        if size >= 8 {
                            buffer.put_u64_at(size - 8, size as u64).unwrap();
                            assert_eq!(buffer.get_u64_at(size - 8).unwrap(), size as u64);
                        }
                        buffer.dispose();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let sizes: Vec<usize> = manager.pools().iter().map(BufferPool::size).collect();
        assert_eq!(sizes, initial);
        assert_eq!(manager.allocated_chunks(), 0);
        assert_eq!(probe.outstanding(), 0);
        assert_eq!(probe.allocated() as u64, manager.metrics().fallbacks());
        assert_eq!(probe.allocated_bytes(), probe.allocated() * CHUNK);
    }

    #[test]
    fn test_concurrent_writer_and_reader_across_segments() {
        const ROUNDS: usize = 100_000;

        let manager = test_manager(1, 2);
        let mut writer = manager.allocate(2 * CHUNK);
        let reader = writer.duplicate().unwrap();

        // The value straddles the two chunks
        let index = CHUNK - 4;
        let handle = thread::spawn(move || {
            for _ in 0..ROUNDS {
                let value = reader.get_u64_at(index).unwrap();
                for byte in value.to_be_bytes() {
                    assert!(byte == 0x00 || byte == 0xFF, "unexpected byte {byte:#x}");
                }
            }
            reader
        });

        let mut value = u64::MAX;
        for _ in 0..ROUNDS {
            writer.put_u64_at(index, value).unwrap();
            value = !value;
        }
        let mut reader = handle.join().unwrap();
        assert_eq!(reader.get_u64_at(index).unwrap(), !value);

        reader.dispose();
        writer.dispose();
        assert_eq!(manager.free_chunks(), 2);
    }

    #[test]
    fn test_cross_thread_views() {
        let manager = test_manager(2, 8);
        let mut buffer = manager.allocate(10_000);
        let tail = buffer.split(5000).unwrap();
        let duplicate = buffer.duplicate().unwrap();

        let handles: Vec<_> = [tail, duplicate]
            .into_iter()
            .map(|mut view| thread::spawn(move || view.dispose()))
            .collect();
        buffer.dispose();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(manager.free_chunks(), 16);
    }

    #[test]
    fn test_metrics_registered() {
        let mut registry = Registry::default();
        let manager = MemoryManager::new(test_config(2, 4), &mut registry).unwrap();
        let _buffer = manager.allocate(6000);

        let mut encoded = String::new();
        encode(&mut encoded, &registry).unwrap();
        assert!(encoded.contains("memory_pool_acquired_total"));
        assert!(encoded.contains("memory_fallback_total 0"));
        assert_eq!(
            manager.metrics().allocated(0) + manager.metrics().allocated(1),
            2
        );
    }
}
