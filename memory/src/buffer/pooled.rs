use super::{Bounds, ByteOrder, Cursor};
use crate::{
    pool::{BufferPool, PoolError, PoolInner},
    Chunk, Error,
};
use std::{
    mem::ManuallyDrop,
    sync::{Arc, Weak},
};

/// Ownership of one chunk while it is out of its pool.
///
/// The strong count of the `Arc<Lease>` is the chunk's reference count. When the
/// last reference is dropped the chunk is offered back to its pool, or
/// deallocated if it has no (live) pool.
struct Lease {
    chunk: ManuallyDrop<Chunk>,
    pool: Weak<PoolInner>,
}

impl Lease {
    fn new(chunk: Chunk, pool: Weak<PoolInner>) -> Arc<Self> {
        Arc::new(Self {
            chunk: ManuallyDrop::new(chunk),
            pool,
        })
    }

    /// Returns `true` if the chunk will be offered back to a pool.
    fn is_tracked(&self) -> bool {
        self.pool.strong_count() > 0
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        // SAFETY: Drop is only called once and the chunk is not used afterwards.
        let chunk = unsafe { ManuallyDrop::take(&mut self.chunk) };
        if let Some(pool) = self.pool.upgrade() {
            pool.release(chunk);
        }
        // else: chunk is dropped here, which deallocates it
    }
}

/// One logical reference to a [Lease].
///
/// `duplicate`, `as_read_only` and `slice` mint a new [Reference]. `split` hands the
/// same `Arc<Reference>` to both halves, so the logical reference (and with it the
/// lease count) is released only once the second half is gone.
struct Reference {
    lease: Arc<Lease>,
}

impl Reference {
    fn new(lease: Arc<Lease>) -> Arc<Self> {
        Arc::new(Self { lease })
    }
}

/// A cursor-bearing view over a window of a single [Chunk].
///
/// The window is `[offset, offset + capacity)` of the chunk; cursor indices are
/// relative to the start of the window.
///
/// # Concurrency
///
/// A [PoolBuffer] is owned by one thread at a time, but derived views can be sent
/// to other threads and used or disposed there. Views that share a chunk share its
/// bytes. Each byte is read and written atomically, so concurrent access through
/// different views is free of data races. Multi-byte values are not atomic: a
/// reader racing a writer may observe a value mixing old and new bytes. Callers
/// that need whole values must order their accesses (for example over a channel).
pub struct PoolBuffer {
    /// `None` once disposed.
    reference: Option<Arc<Reference>>,
    /// Start of the window within the chunk.
    offset: usize,
    bounds: Bounds,
    order: ByteOrder,
    read_only: bool,
    dispose_allowed: bool,
}

impl std::fmt::Debug for PoolBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolBuffer")
            .field("offset", &self.offset)
            .field("position", &self.bounds.position)
            .field("limit", &self.bounds.limit)
            .field("capacity", &self.bounds.capacity)
            .field("read_only", &self.read_only)
            .field("disposed", &self.is_disposed())
            .finish()
    }
}

impl PoolBuffer {
    fn from_reference(reference: Arc<Reference>, offset: usize, bounds: Bounds) -> Self {
        Self {
            reference: Some(reference),
            offset,
            bounds,
            order: ByteOrder::default(),
            read_only: false,
            dispose_allowed: true,
        }
    }

    /// Wraps a chunk drawn from `pool`, returning it there once fully released.
    ///
    /// With a dangling `pool` ([Weak::new]) the chunk is deallocated instead.
    pub(crate) fn new(chunk: Chunk, pool: Weak<PoolInner>, limit: usize) -> Self {
        let capacity = chunk.capacity();
        debug_assert!(limit <= capacity);
        let reference = Reference::new(Lease::new(chunk, pool));
        Self::from_reference(reference, 0, Bounds::new(capacity, limit))
    }

    /// Wraps a chunk that belongs to no pool. Its memory is deallocated once fully
    /// released.
    pub fn unpooled(chunk: Chunk) -> Self {
        let limit = chunk.capacity();
        Self::new(chunk, Weak::new(), limit)
    }

    /// Draws one chunk from `pool`, with `position == 0` and `limit == size`.
    ///
    /// # Errors
    ///
    /// See [BufferPool::try_alloc].
    pub fn allocate(pool: &BufferPool, size: usize) -> Result<Self, PoolError> {
        pool.try_alloc(size)
    }

    fn reference(&self) -> Result<&Arc<Reference>, Error> {
        self.reference.as_ref().ok_or(Error::UseAfterDispose)
    }

    /// Derives a view with a fresh logical reference over `[start, end)` of this
    /// view's window.
    pub(crate) fn region(&self, start: usize, end: usize) -> Result<Self, Error> {
        let reference = self.reference()?;
        if start > end || end > self.bounds.capacity {
            return Err(Error::InvalidArgument("region exceeds capacity"));
        }
        let mut view = Self::from_reference(
            Reference::new(reference.lease.clone()),
            self.offset + start,
            Bounds::new(end - start, end - start),
        );
        view.order = self.order;
        view.read_only = self.read_only;
        Ok(view)
    }

    /// Narrows this view's window to `[start, end)` in place, resetting the cursor
    /// to cover the whole new window.
    pub(crate) fn narrow(&mut self, start: usize, end: usize) -> Result<(), Error> {
        self.reference()?;
        if start > end || end > self.bounds.capacity {
            return Err(Error::InvalidArgument("region exceeds capacity"));
        }
        self.offset += start;
        self.bounds = Bounds::new(end - start, end - start);
        Ok(())
    }

    /// Copies from the window without consulting the limit (the caller owns the
    /// addressing, as [super::CompositeBuffer] does for its segments).
    pub(crate) fn load(&self, index: usize, dst: &mut [u8]) -> Result<(), Error> {
        let reference = self.reference()?;
        assert!(index + dst.len() <= self.bounds.capacity);
        reference.lease.chunk.load(self.offset + index, dst);
        Ok(())
    }

    /// Copies into the window without consulting the limit or the read-only flag.
    pub(crate) fn store(&mut self, index: usize, src: &[u8]) -> Result<(), Error> {
        let reference = self.reference()?;
        assert!(index + src.len() <= self.bounds.capacity);
        reference.lease.chunk.store(self.offset + index, src);
        Ok(())
    }

    /// Shrinks the window to `capacity` bytes, clamping the cursor.
    pub(crate) fn truncate(&mut self, capacity: usize) {
        self.bounds.truncate(capacity.min(self.bounds.capacity));
    }

    /// Returns a view with its own cursor over the same window.
    ///
    /// Takes a new reference to the chunk. The duplicate of a read-only view is
    /// read-only.
    pub fn duplicate(&self) -> Result<Self, Error> {
        let reference = self.reference()?;
        let mut view = Self::from_reference(
            Reference::new(reference.lease.clone()),
            self.offset,
            self.bounds,
        );
        view.order = self.order;
        view.read_only = self.read_only;
        Ok(view)
    }

    /// Returns a duplicate that rejects writes with [Error::ReadOnlyViolation].
    pub fn as_read_only(&self) -> Result<Self, Error> {
        let mut view = self.duplicate()?;
        view.read_only = true;
        Ok(view)
    }

    /// Returns a view over `[position, limit)` with its own cursor.
    ///
    /// Takes a new reference to the chunk.
    pub fn slice(&self) -> Result<Self, Error> {
        self.region(self.bounds.position, self.bounds.limit)
    }

    /// Splits this view at `at`.
    ///
    /// Returns a view over `[at, capacity)` with `position == 0` and
    /// `limit == limit - at`; this view is truncated to `[0, at)` (its visible data
    /// becomes `[position, at)`).
    ///
    /// No new reference is taken: both halves share the one this view held, and the
    /// chunk is released once, after both are disposed.
    ///
    /// # Errors
    ///
    /// Returns [Error::InvalidArgument] unless `position <= at < limit`.
    pub fn split(&mut self, at: usize) -> Result<Self, Error> {
        self.reference()?;
        if at < self.bounds.position || at >= self.bounds.limit {
            return Err(Error::InvalidArgument("split index outside [position, limit)"));
        }
        self.divide(at)
    }

    /// Splits the window at `at <= capacity` regardless of the cursor, sharing this
    /// view's reference with the returned tail.
    pub(crate) fn divide(&mut self, at: usize) -> Result<Self, Error> {
        let reference = self.reference()?.clone();
        debug_assert!(at <= self.bounds.capacity);

        let mut tail = Self::from_reference(
            reference,
            self.offset + at,
            Bounds::new(
                self.bounds.capacity - at,
                self.bounds.limit.saturating_sub(at),
            ),
        );
        tail.order = self.order;
        tail.read_only = self.read_only;
        tail.dispose_allowed = self.dispose_allowed;

        self.bounds.truncate(at);
        Ok(tail)
    }

    /// Restricts the window to `[position, limit)`.
    ///
    /// A single chunk cannot be partially returned, so this only adjusts the
    /// view: afterwards `position == 0` and `limit == capacity == remaining`.
    pub fn trim(&mut self) -> Result<(), Error> {
        let (start, end) = (self.bounds.position, self.bounds.limit);
        self.narrow(start, end)
    }

    /// Same as [Self::trim] for a single chunk.
    pub fn shrink(&mut self) -> Result<(), Error> {
        self.trim()
    }

    /// Widens the window to `capacity` bytes if this view is the chunk's only
    /// holder and the chunk has room. Returns `true` on success.
    pub(crate) fn expand(&mut self, capacity: usize) -> bool {
        let Some(reference) = self.reference.as_mut() else {
            return false;
        };
        if Arc::get_mut(reference).is_none() {
            return false;
        }
        if Arc::strong_count(&reference.lease) != 1 {
            return false;
        }
        if self.offset + capacity > reference.lease.chunk.capacity() {
            return false;
        }
        if capacity > self.bounds.capacity {
            self.bounds.capacity = capacity;
        }
        true
    }

    /// Releases this view's reference.
    pub fn dispose(&mut self) {
        self.try_dispose();
    }

    /// Releases this view's reference.
    ///
    /// Returns `true` if a reference to a pooled chunk was released. Returns
    /// `false` if the view was already disposed, if disposal is forbidden with
    /// [Self::allow_buffer_dispose], or if the chunk belongs to no pool (its
    /// reference is still released).
    pub fn try_dispose(&mut self) -> bool {
        if !self.dispose_allowed {
            return false;
        }
        let Some(reference) = self.reference.take() else {
            return false;
        };
        let pooled = reference.lease.is_tracked();
        self.bounds = Bounds::default();
        drop(reference);
        pooled
    }

    /// Allows or forbids [Self::dispose] on this view.
    ///
    /// A view that may not be disposed still releases its reference when dropped.
    pub fn allow_buffer_dispose(&mut self, allow: bool) {
        self.dispose_allowed = allow;
    }

    pub(crate) const fn is_dispose_allowed(&self) -> bool {
        self.dispose_allowed
    }

    /// Returns `true` if the chunk will be returned to a pool.
    pub fn is_pooled(&self) -> bool {
        self.reference
            .as_ref()
            .is_some_and(|reference| reference.lease.is_tracked())
    }

    /// Returns the number of logical references to the chunk (0 once disposed).
    ///
    /// Halves produced by [Self::split] share a single reference.
    pub fn ref_count(&self) -> usize {
        self.reference
            .as_ref()
            .map_or(0, |reference| Arc::strong_count(&reference.lease))
    }

    /// Returns the capacity of the backing chunk (0 once disposed).
    pub fn chunk_capacity(&self) -> usize {
        self.reference
            .as_ref()
            .map_or(0, |reference| reference.lease.chunk.capacity())
    }

    #[cfg(test)]
    pub(crate) fn chunk_addr(&self) -> Option<usize> {
        self.reference
            .as_ref()
            .map(|reference| reference.lease.chunk.as_ptr() as usize)
    }

    #[cfg(test)]
    pub(crate) fn pooled_chunk(&self) -> Option<usize> {
        if self.is_pooled() {
            self.chunk_addr()
        } else {
            None
        }
    }
}

impl Cursor for PoolBuffer {
    fn position(&self) -> usize {
        self.bounds.position
    }

    fn limit(&self) -> usize {
        self.bounds.limit
    }

    fn capacity(&self) -> usize {
        self.bounds.capacity
    }

    fn order(&self) -> ByteOrder {
        self.order
    }

    fn set_order(&mut self, order: ByteOrder) {
        self.order = order;
    }

    fn is_disposed(&self) -> bool {
        self.reference.is_none()
    }

    fn is_read_only(&self) -> bool {
        self.read_only
    }

    fn set_position(&mut self, position: usize) -> Result<(), Error> {
        self.reference()?;
        self.bounds.set_position(position)
    }

    fn set_limit(&mut self, limit: usize) -> Result<(), Error> {
        self.reference()?;
        self.bounds.set_limit(limit)
    }

    fn mark(&mut self) -> Result<(), Error> {
        self.reference()?;
        self.bounds.mark = Some(self.bounds.position);
        Ok(())
    }

    fn reset(&mut self) -> Result<(), Error> {
        self.reference()?;
        self.bounds.reset()
    }

    fn read_at(&self, index: usize, dst: &mut [u8]) -> Result<(), Error> {
        self.reference()?;
        self.bounds.check_range(index, dst.len())?;
        self.load(index, dst)
    }

    fn write_at(&mut self, index: usize, src: &[u8]) -> Result<(), Error> {
        self.reference()?;
        if self.read_only {
            return Err(Error::ReadOnlyViolation);
        }
        self.bounds.check_range(index, src.len())?;
        self.store(index, src)
    }
}
