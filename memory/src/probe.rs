//! Hooks for observing allocator activity.
//!
//! Operators and tests register a [MemoryProbe] with a [crate::MemoryManager] to
//! verify chunk conservation and detect leaks.
//!
//! Every event concerns one whole chunk and reports its capacity in bytes, not the
//! size the caller requested: a 10-byte allocation served by a 4096-byte chunk is
//! reported as 4096. Requested sizes are not tracked, because a chunk's limit
//! changes over its lifetime while its capacity does not.

use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc, RwLock,
};

/// Receives allocator events.
///
/// Callbacks run synchronously on the allocating (or disposing) thread and must
/// not block.
pub trait MemoryProbe: Send + Sync {
    /// A chunk of `capacity` bytes was created outside of any pool (pools
    /// exhausted).
    fn on_allocate(&self, _capacity: usize) {}

    /// A chunk of `capacity` bytes was drawn from a pool.
    fn on_allocate_from_pool(&self, _capacity: usize) {}

    /// A chunk of `capacity` bytes was accepted back by its pool.
    fn on_release_to_pool(&self, _capacity: usize) {}
}

/// The set of probes shared by a manager and its pools.
#[derive(Default)]
pub struct Probes {
    probes: RwLock<Vec<Arc<dyn MemoryProbe>>>,
}

impl Probes {
    /// Registers a probe.
    pub fn add(&self, probe: Arc<dyn MemoryProbe>) {
        self.probes
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(probe);
    }

    /// Returns the number of registered probes.
    pub fn len(&self) -> usize {
        self.read().len()
    }

    /// Returns `true` if no probe is registered.
    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    pub(crate) fn allocate(&self, capacity: usize) {
        self.each(|probe| probe.on_allocate(capacity));
    }

    pub(crate) fn allocate_from_pool(&self, capacity: usize) {
        self.each(|probe| probe.on_allocate_from_pool(capacity));
    }

    pub(crate) fn release_to_pool(&self, capacity: usize) {
        self.each(|probe| probe.on_release_to_pool(capacity));
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, Vec<Arc<dyn MemoryProbe>>> {
        self.probes
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn each(&self, f: impl Fn(&dyn MemoryProbe)) {
        for probe in self.read().iter() {
            f(probe.as_ref());
        }
    }
}

impl std::fmt::Debug for Probes {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Probes").field("len", &self.len()).finish()
    }
}

/// A [MemoryProbe] that counts events.
///
/// At any quiescent point, `from_pool() - released()` equals the number of
/// pooled chunks held by live views.
#[derive(Debug, Default)]
pub struct CountingProbe {
    allocated: AtomicUsize,
    allocated_bytes: AtomicUsize,
    from_pool: AtomicUsize,
    from_pool_bytes: AtomicUsize,
    released: AtomicUsize,
    released_bytes: AtomicUsize,
}

impl CountingProbe {
    /// Number of non-pooled chunk allocations.
    pub fn allocated(&self) -> usize {
        self.allocated.load(Ordering::Acquire)
    }

    /// Chunk capacity, in bytes, allocated outside of any pool.
    pub fn allocated_bytes(&self) -> usize {
        self.allocated_bytes.load(Ordering::Acquire)
    }

    /// Number of chunks drawn from pools.
    pub fn from_pool(&self) -> usize {
        self.from_pool.load(Ordering::Acquire)
    }

    /// Chunk capacity, in bytes, drawn from pools.
    pub fn from_pool_bytes(&self) -> usize {
        self.from_pool_bytes.load(Ordering::Acquire)
    }

    /// Number of chunks returned to pools.
    pub fn released(&self) -> usize {
        self.released.load(Ordering::Acquire)
    }

    /// Chunk capacity, in bytes, returned to pools.
    pub fn released_bytes(&self) -> usize {
        self.released_bytes.load(Ordering::Acquire)
    }

    /// Pooled chunks currently held by views.
    pub fn outstanding(&self) -> usize {
        self.from_pool().saturating_sub(self.released())
    }
}

impl MemoryProbe for CountingProbe {
    fn on_allocate(&self, capacity: usize) {
        self.allocated.fetch_add(1, Ordering::AcqRel);
        self.allocated_bytes.fetch_add(capacity, Ordering::AcqRel);
    }

    fn on_allocate_from_pool(&self, capacity: usize) {
        self.from_pool.fetch_add(1, Ordering::AcqRel);
        self.from_pool_bytes.fetch_add(capacity, Ordering::AcqRel);
    }

    fn on_release_to_pool(&self, capacity: usize) {
        self.released.fetch_add(1, Ordering::AcqRel);
        self.released_bytes.fetch_add(capacity, Ordering::AcqRel);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_probes_dispatch() {
        let probes = Probes::default();
        assert!(probes.is_empty());

        let first = Arc::new(CountingProbe::default());
        let second = Arc::new(CountingProbe::default());
        probes.add(first.clone());
        probes.add(second.clone());
        assert_eq!(probes.len(), 2);

        probes.allocate_from_pool(4096);
        probes.allocate_from_pool(4096);
        probes.release_to_pool(4096);
        probes.allocate(100);

        for probe in [&first, &second] {
            assert_eq!(probe.from_pool(), 2);
            assert_eq!(probe.from_pool_bytes(), 8192);
            assert_eq!(probe.released(), 1);
            assert_eq!(probe.outstanding(), 1);
            assert_eq!(probe.allocated(), 1);
            assert_eq!(probe.allocated_bytes(), 100);
        }
    }

    #[test]
    fn test_default_callbacks_are_noops() {
        struct Silent;
        impl MemoryProbe for Silent {}

        let probes = Probes::default();
        probes.add(Arc::new(Silent));
        probes.allocate(1);
        probes.allocate_from_pool(1);
        probes.release_to_pool(1);
    }
}
