//! Cursor-bearing views over pooled chunks.
//!
//! Every buffer follows the usual cursor discipline:
//!
//! ```text
//! [0.........mark.........position..........limit.........capacity]
//!                          ^                  ^              ^
//!                          |                  |              |
//!                          next read/write    end of data    end of view
//! ```
//!
//! with `mark <= position <= limit <= capacity` at all times.
//!
//! Two shapes exist:
//! - [PoolBuffer]: a view over a window of a single [crate::Chunk].
//! - [CompositeBuffer]: an ordered, gapless sequence of [PoolBuffer] segments
//!   addressed as one range.
//!
//! [Buffer] is the closed union of both and is what [crate::MemoryManager] hands out.
//!
//! # Views
//!
//! `duplicate`, `as_read_only` and `slice` take a new reference to the underlying
//! chunk(s). `split` divides the reference a view already holds between two views:
//! the chunk is returned to its pool once, after both halves are gone.
//!
//! # Disposal
//!
//! `dispose` releases a view's reference early. Any later operation on the view fails
//! with [Error::UseAfterDispose]. Dropping a view that was not disposed releases its
//! reference as well.

mod composite;
mod pooled;

pub use composite::CompositeBuffer;
pub use pooled::PoolBuffer;

use crate::Error;
use bytes::Bytes;

/// Byte order used to encode multi-byte primitives.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum ByteOrder {
    /// Most significant byte first (network order).
    #[default]
    BigEndian,
    /// Least significant byte first.
    LittleEndian,
}

/// Cursor state shared by both buffer shapes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct Bounds {
    pub(crate) position: usize,
    pub(crate) limit: usize,
    pub(crate) capacity: usize,
    pub(crate) mark: Option<usize>,
}

impl Bounds {
    pub(crate) const fn new(capacity: usize, limit: usize) -> Self {
        Self {
            position: 0,
            limit,
            capacity,
            mark: None,
        }
    }

    pub(crate) fn set_position(&mut self, position: usize) -> Result<(), Error> {
        if position > self.limit {
            return Err(Error::InvalidArgument("position exceeds limit"));
        }
        self.position = position;
        if self.mark.is_some_and(|mark| mark > position) {
            self.mark = None;
        }
        Ok(())
    }

    pub(crate) fn set_limit(&mut self, limit: usize) -> Result<(), Error> {
        if limit > self.capacity {
            return Err(Error::InvalidArgument("limit exceeds capacity"));
        }
        self.limit = limit;
        if self.position > limit {
            self.position = limit;
        }
        if self.mark.is_some_and(|mark| mark > limit) {
            self.mark = None;
        }
        Ok(())
    }

    pub(crate) fn reset(&mut self) -> Result<(), Error> {
        let mark = self.mark.ok_or(Error::InvalidArgument("mark is not set"))?;
        self.position = mark;
        Ok(())
    }

    /// Shrinks the view to `capacity`, clamping the cursor.
    pub(crate) fn truncate(&mut self, capacity: usize) {
        self.capacity = capacity;
        self.limit = self.limit.min(capacity);
        self.position = self.position.min(self.limit);
        if self.mark.is_some_and(|mark| mark > self.position) {
            self.mark = None;
        }
    }

    /// Moves the origin of the view forward by `shift` bytes.
    pub(crate) fn rebase(&mut self, shift: usize) {
        self.capacity -= shift;
        self.limit = self.limit.saturating_sub(shift);
        self.position = self.position.saturating_sub(shift);
        self.mark = self.mark.and_then(|mark| mark.checked_sub(shift));
    }

    pub(crate) fn check_range(&self, index: usize, len: usize) -> Result<(), Error> {
        match index.checked_add(len) {
            Some(end) if end <= self.limit => Ok(()),
            _ => Err(Error::OutOfBounds {
                index,
                len,
                limit: self.limit,
            }),
        }
    }
}

macro_rules! primitive {
    ($ty:ty, $get:ident, $put:ident, $get_at:ident, $put_at:ident) => {
        #[doc = concat!("Reads a `", stringify!($ty), "` at the cursor and advances it.")]
        fn $get(&mut self) -> Result<$ty, Error> {
            let mut raw = [0u8; std::mem::size_of::<$ty>()];
            self.get_slice(&mut raw)?;
            Ok(match self.order() {
                ByteOrder::BigEndian => <$ty>::from_be_bytes(raw),
                ByteOrder::LittleEndian => <$ty>::from_le_bytes(raw),
            })
        }

        #[doc = concat!("Writes a `", stringify!($ty), "` at the cursor and advances it.")]
        fn $put(&mut self, value: $ty) -> Result<(), Error> {
            let raw = match self.order() {
                ByteOrder::BigEndian => value.to_be_bytes(),
                ByteOrder::LittleEndian => value.to_le_bytes(),
            };
            self.put_slice(&raw)
        }

        #[doc = concat!("Reads a `", stringify!($ty), "` at `index` without moving the cursor.")]
        fn $get_at(&self, index: usize) -> Result<$ty, Error> {
            let mut raw = [0u8; std::mem::size_of::<$ty>()];
            self.read_at(index, &mut raw)?;
            Ok(match self.order() {
                ByteOrder::BigEndian => <$ty>::from_be_bytes(raw),
                ByteOrder::LittleEndian => <$ty>::from_le_bytes(raw),
            })
        }

        #[doc = concat!("Writes a `", stringify!($ty), "` at `index` without moving the cursor.")]
        fn $put_at(&mut self, index: usize, value: $ty) -> Result<(), Error> {
            let raw = match self.order() {
                ByteOrder::BigEndian => value.to_be_bytes(),
                ByteOrder::LittleEndian => value.to_le_bytes(),
            };
            self.write_at(index, &raw)
        }
    };
}

/// Cursor and primitive access common to every buffer.
///
/// Implementors provide the cursor bounds and indexed bulk access; everything
/// else is derived. Accessors on a disposed buffer return zero, and every
/// mutation or data access returns [Error::UseAfterDispose].
pub trait Cursor {
    /// Returns the index of the next byte to read or write.
    fn position(&self) -> usize;

    /// Returns the index of the first byte that must not be read or written.
    fn limit(&self) -> usize;

    /// Returns the number of addressable bytes.
    fn capacity(&self) -> usize;

    /// Returns the byte order used by multi-byte primitives.
    fn order(&self) -> ByteOrder;

    /// Sets the byte order used by multi-byte primitives.
    fn set_order(&mut self, order: ByteOrder);

    /// Returns `true` once the buffer has been disposed.
    fn is_disposed(&self) -> bool;

    /// Returns `true` if writes are rejected.
    fn is_read_only(&self) -> bool;

    /// Moves the cursor. Discards the mark if it lies beyond `position`.
    ///
    /// # Errors
    ///
    /// Returns [Error::InvalidArgument] if `position > limit`.
    fn set_position(&mut self, position: usize) -> Result<(), Error>;

    /// Moves the limit, clamping the cursor and mark to it.
    ///
    /// # Errors
    ///
    /// Returns [Error::InvalidArgument] if `limit > capacity`.
    fn set_limit(&mut self, limit: usize) -> Result<(), Error>;

    /// Remembers the current position.
    fn mark(&mut self) -> Result<(), Error>;

    /// Moves the cursor back to the mark.
    fn reset(&mut self) -> Result<(), Error>;

    /// Copies `dst.len()` bytes starting at `index` into `dst`.
    ///
    /// # Errors
    ///
    /// Returns [Error::OutOfBounds] if `index + dst.len() > limit`.
    fn read_at(&self, index: usize, dst: &mut [u8]) -> Result<(), Error>;

    /// Copies `src` into the buffer starting at `index`.
    ///
    /// # Errors
    ///
    /// Returns [Error::ReadOnlyViolation] on a read-only view and
    /// [Error::OutOfBounds] if `index + src.len() > limit`.
    fn write_at(&mut self, index: usize, src: &[u8]) -> Result<(), Error>;

    /// Returns the number of bytes between the cursor and the limit.
    fn remaining(&self) -> usize {
        self.limit().saturating_sub(self.position())
    }

    /// Returns `true` if at least one byte lies between the cursor and the limit.
    fn has_remaining(&self) -> bool {
        self.remaining() > 0
    }

    /// Sets the limit to the current position and rewinds the cursor.
    fn flip(&mut self) -> Result<(), Error> {
        let position = self.position();
        self.set_limit(position)?;
        self.set_position(0)
    }

    /// Rewinds the cursor, leaving the limit untouched.
    fn rewind(&mut self) -> Result<(), Error> {
        self.set_position(0)
    }

    /// Rewinds the cursor and extends the limit to the capacity.
    fn clear(&mut self) -> Result<(), Error> {
        let capacity = self.capacity();
        self.set_limit(capacity)?;
        self.set_position(0)
    }

    /// Fills `dst` from the cursor and advances it.
    ///
    /// # Errors
    ///
    /// Returns [Error::Underflow] if fewer than `dst.len()` bytes remain.
    fn get_slice(&mut self, dst: &mut [u8]) -> Result<(), Error> {
        if self.is_disposed() {
            return Err(Error::UseAfterDispose);
        }
        if self.remaining() < dst.len() {
            return Err(Error::Underflow);
        }
        let position = self.position();
        self.read_at(position, dst)?;
        self.set_position(position + dst.len())
    }

    /// Writes `src` at the cursor and advances it.
    ///
    /// # Errors
    ///
    /// Returns [Error::Overflow] if fewer than `src.len()` bytes remain.
    fn put_slice(&mut self, src: &[u8]) -> Result<(), Error> {
        if self.is_disposed() {
            return Err(Error::UseAfterDispose);
        }
        if self.is_read_only() {
            return Err(Error::ReadOnlyViolation);
        }
        if self.remaining() < src.len() {
            return Err(Error::Overflow);
        }
        let position = self.position();
        self.write_at(position, src)?;
        self.set_position(position + src.len())
    }

    /// Copies the bytes between the cursor and the limit into a [Bytes].
    fn to_bytes(&self) -> Result<Bytes, Error> {
        if self.is_disposed() {
            return Err(Error::UseAfterDispose);
        }
        let mut out = vec![0u8; self.remaining()];
        self.read_at(self.position(), &mut out)?;
        Ok(Bytes::from(out))
    }

    primitive!(u8, get_u8, put_u8, get_u8_at, put_u8_at);
    primitive!(i8, get_i8, put_i8, get_i8_at, put_i8_at);
    primitive!(u16, get_u16, put_u16, get_u16_at, put_u16_at);
    primitive!(i16, get_i16, put_i16, get_i16_at, put_i16_at);
    primitive!(u32, get_u32, put_u32, get_u32_at, put_u32_at);
    primitive!(i32, get_i32, put_i32, get_i32_at, put_i32_at);
    primitive!(u64, get_u64, put_u64, get_u64_at, put_u64_at);
    primitive!(i64, get_i64, put_i64, get_i64_at, put_i64_at);
    primitive!(f32, get_f32, put_f32, get_f32_at, put_f32_at);
    primitive!(f64, get_f64, put_f64, get_f64_at, put_f64_at);
}

/// A buffer handed out by [crate::MemoryManager].
#[derive(Debug)]
pub enum Buffer {
    /// A view over a single chunk (pooled or not).
    Pool(PoolBuffer),
    /// A view over several chunks.
    Composite(CompositeBuffer),
}

macro_rules! delegate {
    ($self:ident, $buffer:ident => $body:expr) => {
        match $self {
            Buffer::Pool($buffer) => $body,
            Buffer::Composite($buffer) => $body,
        }
    };
}

impl Buffer {
    /// Returns a view with its own cursor over the same memory.
    pub fn duplicate(&self) -> Result<Self, Error> {
        Ok(match self {
            Self::Pool(buffer) => Self::Pool(buffer.duplicate()?),
            Self::Composite(buffer) => Self::Composite(buffer.duplicate()?),
        })
    }

    /// Returns a duplicate that rejects writes.
    pub fn as_read_only(&self) -> Result<Self, Error> {
        Ok(match self {
            Self::Pool(buffer) => Self::Pool(buffer.as_read_only()?),
            Self::Composite(buffer) => Self::Composite(buffer.as_read_only()?),
        })
    }

    /// Returns a view over `[position, limit)` of this buffer.
    pub fn slice(&self) -> Result<Self, Error> {
        Ok(match self {
            Self::Pool(buffer) => Self::Pool(buffer.slice()?),
            Self::Composite(buffer) => Self::Composite(buffer.slice()?),
        })
    }

    /// Splits the buffer at `at`, returning the view over `[at, limit)`.
    pub fn split(&mut self, at: usize) -> Result<Self, Error> {
        Ok(match self {
            Self::Pool(buffer) => Self::Pool(buffer.split(at)?),
            Self::Composite(buffer) => Self::Composite(buffer.split(at)?),
        })
    }

    /// Restricts the buffer to `[position, limit)`, releasing what lies outside if possible.
    pub fn trim(&mut self) -> Result<(), Error> {
        delegate!(self, buffer => buffer.trim())
    }

    /// Releases whole segments outside `[position, limit]` and narrows the rest.
    pub fn shrink(&mut self) -> Result<(), Error> {
        delegate!(self, buffer => buffer.shrink())
    }

    /// Releases the buffer's reference(s).
    pub fn dispose(&mut self) {
        delegate!(self, buffer => buffer.dispose())
    }

    /// Releases the buffer's reference(s), returning `true` if pooled memory was released.
    pub fn try_dispose(&mut self) -> bool {
        delegate!(self, buffer => buffer.try_dispose())
    }

    /// Allows or forbids [Self::dispose] on this view.
    pub fn allow_buffer_dispose(&mut self, allow: bool) {
        delegate!(self, buffer => buffer.allow_buffer_dispose(allow))
    }

    /// Returns `true` if any backing chunk belongs to a pool.
    pub fn is_pooled(&self) -> bool {
        delegate!(self, buffer => buffer.is_pooled())
    }

    /// Returns the number of logical references to the backing chunk.
    ///
    /// For a composite this covers only the first segment; see
    /// [Self::segment_ref_counts].
    pub fn ref_count(&self) -> usize {
        delegate!(self, buffer => buffer.ref_count())
    }

    /// Returns the number of logical references to each backing chunk, in order.
    pub fn segment_ref_counts(&self) -> Vec<usize> {
        match self {
            Self::Pool(buffer) if buffer.is_disposed() => Vec::new(),
            Self::Pool(buffer) => vec![buffer.ref_count()],
            Self::Composite(buffer) => buffer.segment_ref_counts(),
        }
    }

    /// Returns the number of chunks backing the buffer.
    pub fn segment_count(&self) -> usize {
        match self {
            Self::Pool(buffer) => usize::from(!buffer.is_disposed()),
            Self::Composite(buffer) => buffer.segment_count(),
        }
    }

    /// Returns `true` if the buffer spans several chunks.
    pub const fn is_composite(&self) -> bool {
        matches!(self, Self::Composite(_))
    }

    /// Returns the single-chunk view, if that is the shape of this buffer.
    pub const fn as_pool(&self) -> Option<&PoolBuffer> {
        match self {
            Self::Pool(buffer) => Some(buffer),
            Self::Composite(_) => None,
        }
    }

    /// Returns the multi-chunk view, if that is the shape of this buffer.
    pub const fn as_composite(&self) -> Option<&CompositeBuffer> {
        match self {
            Self::Pool(_) => None,
            Self::Composite(buffer) => Some(buffer),
        }
    }

    /// Addresses of the pooled chunks referenced by this view.
    #[cfg(test)]
    pub(crate) fn pooled_chunks(&self) -> Vec<usize> {
        match self {
            Self::Pool(buffer) => buffer.pooled_chunk().into_iter().collect(),
            Self::Composite(buffer) => buffer.pooled_chunks(),
        }
    }
}

impl Cursor for Buffer {
    fn position(&self) -> usize {
        delegate!(self, buffer => buffer.position())
    }

    fn limit(&self) -> usize {
        delegate!(self, buffer => buffer.limit())
    }

    fn capacity(&self) -> usize {
        delegate!(self, buffer => buffer.capacity())
    }

    fn order(&self) -> ByteOrder {
        delegate!(self, buffer => buffer.order())
    }

    fn set_order(&mut self, order: ByteOrder) {
        delegate!(self, buffer => buffer.set_order(order))
    }

    fn is_disposed(&self) -> bool {
        delegate!(self, buffer => buffer.is_disposed())
    }

    fn is_read_only(&self) -> bool {
        delegate!(self, buffer => buffer.is_read_only())
    }

    fn set_position(&mut self, position: usize) -> Result<(), Error> {
        delegate!(self, buffer => buffer.set_position(position))
    }

    fn set_limit(&mut self, limit: usize) -> Result<(), Error> {
        delegate!(self, buffer => buffer.set_limit(limit))
    }

    fn mark(&mut self) -> Result<(), Error> {
        delegate!(self, buffer => buffer.mark())
    }

    fn reset(&mut self) -> Result<(), Error> {
        delegate!(self, buffer => buffer.reset())
    }

    fn read_at(&self, index: usize, dst: &mut [u8]) -> Result<(), Error> {
        delegate!(self, buffer => buffer.read_at(index, dst))
    }

    fn write_at(&mut self, index: usize, src: &[u8]) -> Result<(), Error> {
        delegate!(self, buffer => buffer.write_at(index, src))
    }
}

impl From<PoolBuffer> for Buffer {
    fn from(buffer: PoolBuffer) -> Self {
        Self::Pool(buffer)
    }
}

impl From<CompositeBuffer> for Buffer {
    fn from(buffer: CompositeBuffer) -> Self {
        Self::Composite(buffer)
    }
}
