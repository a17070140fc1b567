//! Prometheus metrics for pools and the manager.

use prometheus_client::{
    encoding::EncodeLabelSet,
    metrics::{counter::Counter, family::Family, gauge::Gauge},
    registry::Registry,
};

/// Label identifying the pool (partition) a metric belongs to.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub(crate) struct PoolLabel {
    pub(crate) pool: u64,
}

impl PoolLabel {
    pub(crate) const fn new(pool: usize) -> Self {
        Self { pool: pool as u64 }
    }
}

/// Metrics shared by a manager and all of its pools.
#[derive(Debug, Default)]
pub struct Metrics {
    /// Number of chunks currently held by views (out of pool).
    pub(crate) allocated: Family<PoolLabel, Gauge>,
    /// Number of free entries in the pool.
    pub(crate) available: Family<PoolLabel, Gauge>,
    /// Total number of chunks drawn from the pool.
    pub(crate) acquired_total: Family<PoolLabel, Counter>,
    /// Total number of acquire attempts that found the pool empty.
    pub(crate) exhausted_total: Family<PoolLabel, Counter>,
    /// Total number of chunks accepted back by the pool.
    pub(crate) released_total: Family<PoolLabel, Counter>,
    /// Total number of chunks the pool refused (full or foreign size).
    pub(crate) rejected_total: Family<PoolLabel, Counter>,
    /// Total number of chunks allocated outside of any pool.
    pub(crate) fallback_total: Counter,
    /// Total bytes allocated outside of any pool.
    pub(crate) fallback_bytes_total: Counter,
}

impl Metrics {
    /// Creates the metrics and registers them with `registry`.
    pub fn new(registry: &mut Registry) -> Self {
        let metrics = Self::default();

        registry.register(
            "memory_pool_allocated",
            "Number of chunks currently held by buffers",
            metrics.allocated.clone(),
        );
        registry.register(
            "memory_pool_available",
            "Number of free entries in the pool",
            metrics.available.clone(),
        );
        registry.register(
            "memory_pool_acquired",
            "Total number of chunks drawn from the pool",
            metrics.acquired_total.clone(),
        );
        registry.register(
            "memory_pool_exhausted",
            "Total number of acquire attempts that found the pool empty",
            metrics.exhausted_total.clone(),
        );
        registry.register(
            "memory_pool_released",
            "Total number of chunks returned to the pool",
            metrics.released_total.clone(),
        );
        registry.register(
            "memory_pool_rejected",
            "Total number of chunks the pool refused to take back",
            metrics.rejected_total.clone(),
        );
        registry.register(
            "memory_fallback",
            "Total number of chunks allocated outside of any pool",
            metrics.fallback_total.clone(),
        );
        registry.register(
            "memory_fallback_bytes",
            "Total bytes allocated outside of any pool",
            metrics.fallback_bytes_total.clone(),
        );

        metrics
    }

    /// Returns the number of chunks held by views for `pool`.
    pub fn allocated(&self, pool: usize) -> i64 {
        self.allocated.get_or_create(&PoolLabel::new(pool)).get()
    }

    /// Returns the number of free entries in `pool`.
    pub fn available(&self, pool: usize) -> i64 {
        self.available.get_or_create(&PoolLabel::new(pool)).get()
    }

    /// Returns the number of chunks allocated outside of any pool.
    pub fn fallbacks(&self) -> u64 {
        self.fallback_total.get()
    }
}
