//! The capability interface shared by every memory space, and the primitive
//! allocators behind the built-in spaces.
//!
//! ## [`MemoryAllocator`](trait.MemoryAllocator.html)
//!
//! Four primitives (`malloc`, `calloc`, `realloc`, `free`) plus a fill. These
//! are raw: they do not know which pointers they handed out, so the calls
//! that take a pointer are `unsafe`, in the same way
//! [`GlobalAlloc`](https://doc.rust-lang.org/core/alloc/trait.GlobalAlloc.html)
//! is. [`MemoryResource`](../resource/struct.MemoryResource.html) wraps a
//! `MemoryAllocator` with the bookkeeping that makes it safe to call.
//!
//! ## [`HostAllocator`](struct.HostAllocator.html)
//!
//! The process heap, through libc.
//!
//! ## [`MappedAllocator`](struct.MappedAllocator.html)
//!
//! Anonymous memory mappings with a fixed capacity budget. This stands in for
//! a device heap (private mappings, one budget per device) and for unified
//! memory (shared mappings).

use core::fmt;
use core::ptr::{self, NonNull};
use core::result::Result;
use core::sync::atomic::{AtomicUsize, Ordering};

use errno::Errno;

// Round up value to the nearest multiple of increment, or None if that
// doesn't fit in a usize
pub(crate) fn round_up(value: usize, increment: usize) -> Option<usize> {
    if value == 0 {
        return Some(0);
    }
    ((value - 1) / increment + 1).checked_mul(increment)
}

/// The primitive operations a memory space must provide.
pub trait MemoryAllocator: Send + Sync {
    type Err: fmt::Debug;

    /// Allocate at least `bytes` bytes.
    fn malloc(&self, bytes: usize) -> Result<NonNull<u8>, Self::Err>;

    /// Allocate at least `bytes` bytes, all of which read as zero.
    fn calloc(&self, bytes: usize) -> Result<NonNull<u8>, Self::Err>;

    /// Resize the allocation at `ptr` from `old_bytes` to `new_bytes`,
    /// possibly moving it. On success the old pointer must no longer be used;
    /// on failure it is still valid.
    ///
    /// # Safety
    ///
    /// `ptr` must have been returned by this allocator, with size
    /// `old_bytes`, and not freed since.
    unsafe fn realloc(
        &self,
        ptr: NonNull<u8>,
        old_bytes: usize,
        new_bytes: usize,
    ) -> Result<NonNull<u8>, Self::Err>;

    /// Return memory to the allocator.
    ///
    /// # Safety
    ///
    /// `ptr` must have been returned by this allocator, with size `bytes`,
    /// and not freed since.
    unsafe fn free(&self, ptr: NonNull<u8>, bytes: usize) -> Result<(), Self::Err>;

    /// Fill `bytes` bytes at `ptr` with `value`.
    ///
    /// # Safety
    ///
    /// The whole range must lie inside one live allocation of this allocator.
    unsafe fn memset(&self, ptr: NonNull<u8>, value: u8, bytes: usize) {
        ptr::write_bytes(ptr.as_ptr(), value, bytes);
    }
}

impl<A: MemoryAllocator + ?Sized> MemoryAllocator for std::sync::Arc<A> {
    type Err = A::Err;

    fn malloc(&self, bytes: usize) -> Result<NonNull<u8>, Self::Err> {
        (**self).malloc(bytes)
    }

    fn calloc(&self, bytes: usize) -> Result<NonNull<u8>, Self::Err> {
        (**self).calloc(bytes)
    }

    unsafe fn realloc(
        &self,
        ptr: NonNull<u8>,
        old_bytes: usize,
        new_bytes: usize,
    ) -> Result<NonNull<u8>, Self::Err> {
        (**self).realloc(ptr, old_bytes, new_bytes)
    }

    unsafe fn free(&self, ptr: NonNull<u8>, bytes: usize) -> Result<(), Self::Err> {
        (**self).free(ptr, bytes)
    }

    unsafe fn memset(&self, ptr: NonNull<u8>, value: u8, bytes: usize) {
        (**self).memset(ptr, value, bytes)
    }
}

/// HostAllocator hands out memory from the C heap.
#[derive(Default, Debug, Clone, Copy)]
pub struct HostAllocator;

impl MemoryAllocator for HostAllocator {
    type Err = Errno;

    fn malloc(&self, bytes: usize) -> Result<NonNull<u8>, Errno> {
        // malloc(0) may legally return null, which we'd mistake for failure.
        let ptr = unsafe { libc::malloc(bytes.max(1)) };
        NonNull::new(ptr as *mut u8).ok_or_else(errno::errno)
    }

    fn calloc(&self, bytes: usize) -> Result<NonNull<u8>, Errno> {
        let ptr = unsafe { libc::calloc(1, bytes.max(1)) };
        NonNull::new(ptr as *mut u8).ok_or_else(errno::errno)
    }

    unsafe fn realloc(
        &self,
        ptr: NonNull<u8>,
        _old_bytes: usize,
        new_bytes: usize,
    ) -> Result<NonNull<u8>, Errno> {
        let new_ptr = libc::realloc(ptr.as_ptr() as *mut libc::c_void, new_bytes.max(1));
        NonNull::new(new_ptr as *mut u8).ok_or_else(errno::errno)
    }

    unsafe fn free(&self, ptr: NonNull<u8>, _bytes: usize) -> Result<(), Errno> {
        libc::free(ptr.as_ptr() as *mut libc::c_void);
        Ok(())
    }
}

#[derive(Debug)]
pub enum MapError {
    /// The capacity budget cannot cover the request.
    Exhausted { requested: usize, available: usize },
    Mmap(Errno),
    Munmap(Errno),
}

/// MappedAllocator uses anonymous memory mappings, page by page, up to a
/// fixed capacity.
#[derive(Debug)]
pub struct MappedAllocator {
    shared: bool,
    capacity: usize,
    page_size: usize,
    // Bytes currently mapped, in whole pages
    in_use: AtomicUsize,
    // Live mappings
    mappings: AtomicUsize,
}

impl MappedAllocator {
    /// Private mappings, standing in for one device's memory.
    pub fn device(capacity: usize) -> Self {
        MappedAllocator::new(capacity, false)
    }

    /// Shared mappings, standing in for unified memory.
    pub fn unified(capacity: usize) -> Self {
        MappedAllocator::new(capacity, true)
    }

    fn new(capacity: usize, shared: bool) -> Self {
        MappedAllocator {
            shared,
            capacity,
            page_size: sysconf::page::pagesize(),
            in_use: AtomicUsize::new(0),
            mappings: AtomicUsize::new(0),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Bytes currently mapped. Always a multiple of the page size.
    pub fn in_use(&self) -> usize {
        self.in_use.load(Ordering::SeqCst)
    }

    /// Number of live mappings.
    pub fn mappings(&self) -> usize {
        self.mappings.load(Ordering::SeqCst)
    }

    fn mapped_len(&self, bytes: usize) -> Result<usize, MapError> {
        round_up(bytes.max(1), self.page_size).ok_or_else(|| MapError::Exhausted {
            requested: bytes,
            available: self.capacity.saturating_sub(self.in_use()),
        })
    }

    fn reserve(&self, len: usize) -> Result<(), MapError> {
        let capacity = self.capacity;
        self.in_use
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |used| {
                used.checked_add(len).filter(|&total| total <= capacity)
            })
            .map(|_| ())
            .map_err(|used| MapError::Exhausted {
                requested: len,
                available: capacity.saturating_sub(used),
            })
    }

    fn unreserve(&self, len: usize) {
        self.in_use.fetch_sub(len, Ordering::SeqCst);
    }

    fn map(&self, len: usize) -> Result<NonNull<u8>, MapError> {
        self.reserve(len)?;

        let sharing = if self.shared {
            libc::MAP_SHARED
        } else {
            libc::MAP_PRIVATE
        };

        let ptr = unsafe {
            libc::mmap(
                // Address we want the memory at. We don't care, so null it is.
                ptr::null_mut(),
                len,
                libc::PROT_WRITE | libc::PROT_READ,
                // No file behind it, just pages.
                libc::MAP_ANON | sharing,
                -1,
                0,
            )
        };

        if ptr == libc::MAP_FAILED {
            let err = errno::errno();
            self.unreserve(len);
            log::warn!("mmap of {} bytes failed: {}", len, err);
            return Err(MapError::Mmap(err));
        }

        self.mappings.fetch_add(1, Ordering::SeqCst);
        // mmap never hands back address 0 on success
        NonNull::new(ptr as *mut u8).ok_or(MapError::Mmap(Errno(libc::ENOMEM)))
    }

    unsafe fn unmap(&self, ptr: NonNull<u8>, len: usize) -> Result<(), MapError> {
        if libc::munmap(ptr.as_ptr() as *mut libc::c_void, len) != 0 {
            let err = errno::errno();
            log::warn!("munmap of {} bytes at {:?} failed: {}", len, ptr, err);
            return Err(MapError::Munmap(err));
        }
        self.unreserve(len);
        self.mappings.fetch_sub(1, Ordering::SeqCst);
        Ok(())
    }
}

impl MemoryAllocator for MappedAllocator {
    type Err = MapError;

    fn malloc(&self, bytes: usize) -> Result<NonNull<u8>, MapError> {
        self.map(self.mapped_len(bytes)?)
    }

    fn calloc(&self, bytes: usize) -> Result<NonNull<u8>, MapError> {
        // Fresh anonymous pages are zero-filled by the kernel.
        self.malloc(bytes)
    }

    unsafe fn realloc(
        &self,
        ptr: NonNull<u8>,
        old_bytes: usize,
        new_bytes: usize,
    ) -> Result<NonNull<u8>, MapError> {
        let old_len = self.mapped_len(old_bytes)?;
        let new_len = self.mapped_len(new_bytes)?;
        if old_len == new_len {
            return Ok(ptr);
        }

        let new_ptr = self.map(new_len)?;
        ptr::copy_nonoverlapping(ptr.as_ptr(), new_ptr.as_ptr(), old_bytes.min(new_bytes));
        if let Err(e) = self.unmap(ptr, old_len) {
            // The old mapping is still live, so the new one has to go.
            if let Err(undo) = self.unmap(new_ptr, new_len) {
                log::warn!("leaking {} bytes at {:?}: {:?}", new_len, new_ptr, undo);
            }
            return Err(e);
        }
        Ok(new_ptr)
    }

    unsafe fn free(&self, ptr: NonNull<u8>, bytes: usize) -> Result<(), MapError> {
        self.unmap(ptr, self.mapped_len(bytes)?)
    }
}
