//! Fixed-capacity, aligned memory regions.

use std::{
    alloc::{alloc_zeroed, dealloc, handle_alloc_error, Layout},
    ptr::NonNull,
    sync::atomic::{AtomicU8, Ordering},
};

/// Returns the cache line size for the current architecture.
///
/// Uses 128 bytes for x86_64 and aarch64 as a conservative estimate that
/// accounts for spatial prefetching. Uses 64 bytes for other architectures.
pub const fn cache_line_size() -> usize {
    cfg_if::cfg_if! {
        if #[cfg(any(target_arch = "x86_64", target_arch = "aarch64"))] {
            128
        } else {
            64
        }
    }
}

/// Returns the amount of physical memory installed on the host.
///
/// On Unix systems, queries the page count and page size via `sysconf`.
/// Elsewhere (or if `sysconf` fails), assumes 1GB.
#[cfg(unix)]
pub(crate) fn physical_memory() -> usize {
    const FALLBACK: usize = 1 << 30;

    // SAFETY: sysconf is safe to call.
    let (pages, page_size) = unsafe {
        (
            libc::sysconf(libc::_SC_PHYS_PAGES),
            libc::sysconf(libc::_SC_PAGESIZE),
        )
    };
    if pages <= 0 || page_size <= 0 {
        return FALLBACK;
    }
    (pages as usize).saturating_mul(page_size as usize)
}

#[cfg(not(unix))]
pub(crate) fn physical_memory() -> usize {
    1 << 30
}

/// A contiguous memory region of fixed capacity.
///
/// A [Chunk] is the indivisible unit handed out by a [crate::BufferPool]. It is
/// never resized and its identity is its address. Deallocates itself on drop
/// using the stored layout.
///
/// Views that share a chunk may access its bytes from several threads at once,
/// so every access made by this crate goes through [AtomicU8] with relaxed
/// ordering. Concurrent readers see each byte either before or after a write,
/// never a torn byte, but a multi-byte value may mix old and new bytes.
pub struct Chunk {
    ptr: NonNull<u8>,
    layout: Layout,
}

// SAFETY: Chunk owns its memory and can be sent between threads.
unsafe impl Send for Chunk {}
// SAFETY: shared access to the bytes only happens through `load` and `store`,
// which use atomic operations; `as_ptr` hands out a raw pointer whose use is
// unsafe.
unsafe impl Sync for Chunk {}

impl std::fmt::Debug for Chunk {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Chunk")
            .field("ptr", &self.ptr)
            .field("capacity", &self.capacity())
            .finish()
    }
}

impl Chunk {
    /// Allocates a new zeroed chunk with the given capacity and alignment.
    ///
    /// Returns `None` if `capacity` is zero or `alignment` is not a power of two.
    pub fn new(capacity: usize, alignment: usize) -> Option<Self> {
        if capacity == 0 {
            return None;
        }
        let layout = Layout::from_size_align(capacity, alignment).ok()?;
        Some(Self::with_layout(layout))
    }

    /// Allocates a new zeroed chunk for a layout that has already been validated.
    ///
    /// Chunks are zeroed once, when created, so that every byte a view can
    /// observe is initialized. Recycled chunks keep their previous contents.
    pub(crate) fn with_layout(layout: Layout) -> Self {
        debug_assert!(layout.size() > 0);

        // SAFETY: callers only pass non-zero layouts with power-of-two alignment.
        let ptr = unsafe { alloc_zeroed(layout) };
        let Some(ptr) = NonNull::new(ptr) else {
            handle_alloc_error(layout);
        };
        Self { ptr, layout }
    }

    /// Returns the capacity of the chunk.
    #[inline]
    pub const fn capacity(&self) -> usize {
        self.layout.size()
    }

    /// Returns the alignment of the chunk.
    #[inline]
    pub const fn alignment(&self) -> usize {
        self.layout.align()
    }

    /// Returns a raw pointer to the start of the chunk.
    #[inline]
    pub const fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    fn bytes(&self) -> &[AtomicU8] {
        // SAFETY: AtomicU8 has the same size and alignment as u8, the region was
        // initialized by alloc_zeroed, and it lives as long as `self`.
        unsafe {
            std::slice::from_raw_parts(self.ptr.as_ptr() as *const AtomicU8, self.capacity())
        }
    }

    /// Copies `dst.len()` bytes starting at `offset` into `dst`.
    ///
    /// # Panics
    ///
    /// Panics if the range exceeds the chunk.
    pub(crate) fn load(&self, offset: usize, dst: &mut [u8]) {
        let src = &self.bytes()[offset..offset + dst.len()];
        for (byte, cell) in dst.iter_mut().zip(src) {
            *byte = cell.load(Ordering::Relaxed);
        }
    }

    /// Copies `src` into the chunk starting at `offset`.
    ///
    /// # Panics
    ///
    /// Panics if the range exceeds the chunk.
    pub(crate) fn store(&self, offset: usize, src: &[u8]) {
        let dst = &self.bytes()[offset..offset + src.len()];
        for (cell, byte) in dst.iter().zip(src) {
            cell.store(*byte, Ordering::Relaxed);
        }
    }
}

impl Drop for Chunk {
    fn drop(&mut self) {
        // SAFETY: ptr was allocated with this layout.
        unsafe { dealloc(self.ptr.as_ptr(), self.layout) };
    }
}
