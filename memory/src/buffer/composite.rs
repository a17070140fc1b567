use super::{Bounds, ByteOrder, Cursor, PoolBuffer};
use crate::Error;
use std::mem;

/// A logical buffer spanning an ordered, gapless sequence of [PoolBuffer] segments.
///
/// Segment `i` occupies `[ends[i - 1], ends[i])` of the composite's address space.
/// Reads and writes (including multi-byte primitives) cross segment boundaries
/// transparently.
///
/// # Releasing segments
///
/// [Self::trim] and [Self::shrink] release segments that lie entirely outside
/// `[position, limit)`. A released segment is disposed when both the composite
/// allows internal disposal ([Self::allow_internal_buffers_dispose]) and the segment
/// allows its own ([PoolBuffer::allow_buffer_dispose]). Otherwise it is detached and
/// can be reclaimed by the caller with [Self::take_detached].
pub struct CompositeBuffer {
    segments: Vec<PoolBuffer>,
    /// Cumulative end offset of each segment.
    ends: Vec<usize>,
    bounds: Bounds,
    order: ByteOrder,
    read_only: bool,
    disposed: bool,
    dispose_allowed: bool,
    internal_dispose_allowed: bool,
    detached: Vec<PoolBuffer>,
}

impl std::fmt::Debug for CompositeBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompositeBuffer")
            .field("segments", &self.segments.len())
            .field("position", &self.bounds.position)
            .field("limit", &self.bounds.limit)
            .field("capacity", &self.bounds.capacity)
            .field("read_only", &self.read_only)
            .field("disposed", &self.disposed)
            .finish()
    }
}

impl Default for CompositeBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl CompositeBuffer {
    /// Creates an empty composite.
    pub const fn new() -> Self {
        Self {
            segments: Vec::new(),
            ends: Vec::new(),
            bounds: Bounds::new(0, 0),
            order: ByteOrder::BigEndian,
            read_only: false,
            disposed: false,
            dispose_allowed: true,
            internal_dispose_allowed: true,
            detached: Vec::new(),
        }
    }

    /// Creates a composite from `segments`, appended in order.
    pub fn from_segments(
        segments: impl IntoIterator<Item = PoolBuffer>,
    ) -> Result<Self, Error> {
        let mut composite = Self::new();
        for segment in segments {
            composite.append(segment)?;
        }
        Ok(composite)
    }

    /// Assembles freshly drawn segments, each contributing `[0, limit)`.
    pub(crate) fn from_allocation(mut segments: Vec<PoolBuffer>) -> Self {
        for segment in &mut segments {
            let limit = segment.limit();
            segment.truncate(limit);
        }
        let mut composite = Self::new();
        composite.segments = segments;
        composite.reindex();
        let capacity = composite.ends.last().copied().unwrap_or(0);
        composite.bounds = Bounds::new(capacity, capacity);
        composite
    }

    /// Derives a composite that shares this one's settings but holds `segments`.
    fn derive(&self, segments: Vec<PoolBuffer>, bounds: Bounds) -> Self {
        let mut composite = Self {
            segments,
            ends: Vec::new(),
            bounds,
            order: self.order,
            read_only: self.read_only,
            disposed: false,
            dispose_allowed: true,
            internal_dispose_allowed: true,
            detached: Vec::new(),
        };
        composite.reindex();
        composite
    }

    fn live(&self) -> Result<(), Error> {
        if self.disposed {
            return Err(Error::UseAfterDispose);
        }
        Ok(())
    }

    fn reindex(&mut self) {
        self.ends.clear();
        let mut end = 0;
        for segment in &self.segments {
            end += segment.capacity();
            self.ends.push(end);
        }
    }

    /// Returns the start offset of segment `i` (or the total length for `i == len`).
    fn start(&self, i: usize) -> usize {
        match i {
            0 => 0,
            i => self.ends[i - 1],
        }
    }

    /// Returns the segment containing `index` and the offset of `index` within it.
    fn locate(&self, index: usize) -> (usize, usize) {
        let segment = self.ends.partition_point(|&end| end <= index);
        (segment, index - self.start(segment))
    }

    /// Derives new references over `[start, end)` of the address space.
    fn regions(&self, start: usize, end: usize) -> Result<Vec<PoolBuffer>, Error> {
        let mut regions = Vec::new();
        let first = self.ends.partition_point(|&e| e <= start);
        for (i, segment) in self.segments.iter().enumerate().skip(first) {
            let segment_start = self.start(i);
            if segment_start >= end {
                break;
            }
            let from = start.max(segment_start) - segment_start;
            let to = end.min(self.ends[i]) - segment_start;
            regions.push(segment.region(from, to)?);
        }
        Ok(regions)
    }

    /// Disposes or detaches a segment that left the composite.
    ///
    /// Returns `true` if a reference to pooled memory was released.
    fn release(&mut self, mut segment: PoolBuffer) -> bool {
        if self.internal_dispose_allowed && segment.is_dispose_allowed() {
            segment.try_dispose()
        } else {
            self.detached.push(segment);
            false
        }
    }

    /// Appends `buffer`'s `[position, limit)` at the logical tail and extends the
    /// limit to the new capacity.
    ///
    /// Appending a read-only view makes the composite read-only.
    ///
    /// # Errors
    ///
    /// Returns [Error::UseAfterDispose] if either buffer was disposed.
    pub fn append(&mut self, mut buffer: PoolBuffer) -> Result<(), Error> {
        self.live()?;
        buffer.trim()?;
        if buffer.capacity() == 0 {
            return Ok(());
        }

        self.read_only |= buffer.is_read_only();
        let end = self.bounds.capacity + buffer.capacity();
        self.segments.push(buffer);
        self.ends.push(end);
        self.bounds.capacity = end;
        self.bounds.limit = end;
        Ok(())
    }

    /// Returns a composite with its own cursor over new references to every segment.
    pub fn duplicate(&self) -> Result<Self, Error> {
        self.live()?;
        let segments = self
            .segments
            .iter()
            .map(PoolBuffer::duplicate)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(self.derive(segments, self.bounds))
    }

    /// Returns a duplicate that rejects writes with [Error::ReadOnlyViolation].
    pub fn as_read_only(&self) -> Result<Self, Error> {
        let mut composite = self.duplicate()?;
        composite.read_only = true;
        Ok(composite)
    }

    /// Returns a composite over `[position, limit)`, referencing only the segments
    /// that overlap it.
    pub fn slice(&self) -> Result<Self, Error> {
        self.live()?;
        let (start, end) = (self.bounds.position, self.bounds.limit);
        let segments = self.regions(start, end)?;
        Ok(self.derive(segments, Bounds::new(end - start, end - start)))
    }

    /// Splits the composite at `at`.
    ///
    /// Returns a composite over `[at, capacity)` with `position == 0` and
    /// `limit == limit - at`; this composite is truncated to `[0, at)`. Whole
    /// segments move to the returned composite; a segment straddling `at` is split
    /// with [PoolBuffer::split] semantics, so no reference is added.
    ///
    /// # Errors
    ///
    /// Returns [Error::InvalidArgument] unless `position <= at < limit`.
    pub fn split(&mut self, at: usize) -> Result<Self, Error> {
        self.live()?;
        if at < self.bounds.position || at >= self.bounds.limit {
            return Err(Error::InvalidArgument("split index outside [position, limit)"));
        }

        let (segment, offset) = self.locate(at);
        let tail_segments = if offset == 0 {
            self.segments.split_off(segment)
        } else {
            let straddling = self.segments[segment].divide(offset)?;
            let mut tail = vec![straddling];
            tail.extend(self.segments.drain(segment + 1..));
            tail
        };

        let tail_bounds = Bounds::new(
            self.bounds.capacity - at,
            self.bounds.limit - at,
        );
        let mut tail = self.derive(tail_segments, tail_bounds);
        tail.dispose_allowed = self.dispose_allowed;
        tail.internal_dispose_allowed = self.internal_dispose_allowed;

        self.reindex();
        self.bounds.truncate(at);
        Ok(tail)
    }

    /// Releases every segment that lies entirely before `position` or at or after
    /// `limit`. Segments partially inside the window are kept whole.
    ///
    /// The cursor keeps pointing at the same bytes; indices shift by the length of
    /// the released leading segments.
    pub fn trim(&mut self) -> Result<(), Error> {
        self.live()?;
        let (position, limit) = (self.bounds.position, self.bounds.limit);
        let leading = self.ends.partition_point(|&end| end <= position);
        let trailing = (leading..self.segments.len())
            .find(|&i| self.start(i) >= limit)
            .unwrap_or(self.segments.len());
        let shift = self.start(leading);

        let mut released: Vec<PoolBuffer> = self.segments.drain(trailing..).collect();
        released.extend(self.segments.drain(..leading));
        for segment in released {
            self.release(segment);
        }

        self.reindex();
        self.bounds.rebase(shift);
        self.bounds.capacity = self.ends.last().copied().unwrap_or(0);
        Ok(())
    }

    /// Like [Self::trim], then narrows the boundary segments to exactly
    /// `[position, limit)`.
    ///
    /// Afterwards `position == 0` and `limit == capacity`.
    pub fn shrink(&mut self) -> Result<(), Error> {
        self.trim()?;
        let (position, limit) = (self.bounds.position, self.bounds.limit);
        let len = limit - position;

        if let Some(first) = self.segments.first_mut() {
            let capacity = first.capacity();
            first.narrow(position, capacity)?;
            self.reindex();
        }
        if let Some(last) = self.segments.len().checked_sub(1) {
            let start = self.start(last);
            self.segments[last].narrow(0, len - start)?;
        }

        let (empty, kept): (Vec<_>, Vec<_>) = mem::take(&mut self.segments)
            .into_iter()
            .partition(|segment| segment.capacity() == 0);
        self.segments = kept;
        for segment in empty {
            self.release(segment);
        }

        self.reindex();
        self.bounds = Bounds::new(len, len);
        Ok(())
    }

    /// Widens the last segment so the composite spans `capacity` bytes, if that
    /// segment is exclusively owned and its chunk has room. Returns `true` on success.
    pub(crate) fn expand(&mut self, capacity: usize) -> bool {
        if self.disposed {
            return false;
        }
        if capacity <= self.bounds.capacity {
            return true;
        }
        let grow = capacity - self.bounds.capacity;
        let Some(last) = self.segments.last_mut() else {
            return false;
        };
        let target = last.capacity() + grow;
        if !last.expand(target) {
            return false;
        }
        self.reindex();
        self.bounds.capacity = capacity;
        true
    }

    /// Releases every segment.
    pub fn dispose(&mut self) {
        self.try_dispose();
    }

    /// Releases every segment, or detaches them all if internal disposal is
    /// forbidden.
    ///
    /// Returns `true` if a reference to pooled memory was released. Returns
    /// `false` if already disposed or if disposal is forbidden with
    /// [Self::allow_buffer_dispose].
    pub fn try_dispose(&mut self) -> bool {
        if !self.dispose_allowed || self.disposed {
            return false;
        }
        self.disposed = true;
        self.bounds = Bounds::default();
        self.ends.clear();

        let mut pooled = false;
        for segment in mem::take(&mut self.segments) {
            pooled |= self.release(segment);
        }
        pooled
    }

    /// Allows or forbids [Self::dispose] on this composite.
    pub fn allow_buffer_dispose(&mut self, allow: bool) {
        self.dispose_allowed = allow;
    }

    /// Allows or forbids disposing segments released by trim, shrink or dispose.
    ///
    /// When forbidden, such segments are detached instead; ownership passes to the
    /// caller through [Self::take_detached].
    pub fn allow_internal_buffers_dispose(&mut self, allow: bool) {
        self.internal_dispose_allowed = allow;
    }

    /// Takes the segments detached so far.
    pub fn take_detached(&mut self) -> Vec<PoolBuffer> {
        mem::take(&mut self.detached)
    }

    /// Returns the number of segments.
    pub fn segment_count(&self) -> usize {
        self.segments.len()
    }

    /// Returns `true` if any segment is backed by pooled memory.
    pub fn is_pooled(&self) -> bool {
        self.segments.iter().any(PoolBuffer::is_pooled)
    }

    /// Returns the number of logical references to the first segment's chunk
    /// (0 once disposed).
    ///
    /// Segments can be shared unevenly: a slice or split of this composite only
    /// references the chunks it covers. Use [Self::segment_ref_counts] to inspect
    /// every segment.
    pub fn ref_count(&self) -> usize {
        self.segments.first().map_or(0, PoolBuffer::ref_count)
    }

    /// Returns the number of logical references to each segment's chunk, in
    /// segment order.
    pub fn segment_ref_counts(&self) -> Vec<usize> {
        self.segments.iter().map(PoolBuffer::ref_count).collect()
    }

    #[cfg(test)]
    pub(crate) fn pooled_chunks(&self) -> Vec<usize> {
        self.segments
            .iter()
            .filter_map(PoolBuffer::pooled_chunk)
            .collect()
    }
}

impl Cursor for CompositeBuffer {
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
        self.disposed
    }

    fn is_read_only(&self) -> bool {
        self.read_only
    }

    fn set_position(&mut self, position: usize) -> Result<(), Error> {
        self.live()?;
        self.bounds.set_position(position)
    }

    fn set_limit(&mut self, limit: usize) -> Result<(), Error> {
        self.live()?;
        self.bounds.set_limit(limit)
    }

    fn mark(&mut self) -> Result<(), Error> {
        self.live()?;
        self.bounds.mark = Some(self.bounds.position);
        Ok(())
    }

    fn reset(&mut self) -> Result<(), Error> {
        self.live()?;
        self.bounds.reset()
    }

    fn read_at(&self, index: usize, dst: &mut [u8]) -> Result<(), Error> {
        self.live()?;
        self.bounds.check_range(index, dst.len())?;

        let mut copied = 0;
        while copied < dst.len() {
            let (segment, offset) = self.locate(index + copied);
            let buffer = &self.segments[segment];
            let len = (buffer.capacity() - offset).min(dst.len() - copied);
            buffer.load(offset, &mut dst[copied..copied + len])?;
            copied += len;
        }
        Ok(())
    }

    fn write_at(&mut self, index: usize, src: &[u8]) -> Result<(), Error> {
        self.live()?;
        if self.read_only {
            return Err(Error::ReadOnlyViolation);
        }
        self.bounds.check_range(index, src.len())?;

        let mut copied = 0;
        while copied < src.len() {
            let (segment, offset) = self.locate(index + copied);
            let buffer = &mut self.segments[segment];
            let len = (buffer.capacity() - offset).min(src.len() - copied);
            buffer.store(offset, &src[copied..copied + len])?;
            copied += len;
        }
        Ok(())
    }
}
