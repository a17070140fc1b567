//! Recycle fixed-size memory chunks across a multi-threaded network stack.
//!
//! A [MemoryManager] hands out [Buffer]s backed by chunks drawn from bounded,
//! per-partition [BufferPool]s. Requests up to one chunk are served by a
//! [PoolBuffer]; larger ones by a [CompositeBuffer] spanning several chunks.
//!
//! Buffers can be duplicated, sliced, made read-only or split, and the derived views
//! may travel to other threads. Each chunk returns to its pool exactly once, when the
//! last view referencing it is disposed (or dropped). When every pool is empty,
//! allocation falls back to memory outside of any pool, which is deallocated instead
//! of recycled.
//!
//! # Example
//!
//! ```rust
//! use chunkwise_memory::{Config, Cursor, MemoryManager};
//! use prometheus_client::registry::Registry;
//!
//! let config = Config {
//!     pool_count: 2,
//!     available_memory: Some(1 << 20),
//!     ..Config::default()
//! };
//! let manager = MemoryManager::new(config, &mut Registry::default()).unwrap();
//!
//! let mut buffer = manager.allocate(6000);
//! assert_eq!(buffer.segment_count(), 2);
//! buffer.put_u32(0xCAFE).unwrap();
//! buffer.flip().unwrap();
//! assert_eq!(buffer.get_u32().unwrap(), 0xCAFE);
//! buffer.dispose();
//! ```
//!
//! # Status
//!
//! `chunkwise-memory` is **ALPHA** software and is not yet recommended for production use. Developers should
//! expect breaking changes and occasional instability.

use thiserror::Error;

mod buffer;
pub use buffer::{Buffer, ByteOrder, CompositeBuffer, Cursor, PoolBuffer};
mod chunk;
pub use chunk::{cache_line_size, Chunk};
mod manager;
pub use manager::{Config, MemoryManager};
mod metrics;
pub use metrics::Metrics;
mod pool;
pub use pool::{BufferPool, PoolConfig, PoolError};
mod probe;
pub use probe::{CountingProbe, MemoryProbe, Probes};

/// Errors that can occur when interacting with buffers or their allocator.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),
    #[error("buffer used after dispose")]
    UseAfterDispose,
    #[error("write to read-only buffer")]
    ReadOnlyViolation,
    #[error("buffer underflow")]
    Underflow,
    #[error("buffer overflow")]
    Overflow,
    #[error("index out of bounds: {index}+{len} exceeds limit {limit}")]
    OutOfBounds {
        index: usize,
        len: usize,
        limit: usize,
    },
}
