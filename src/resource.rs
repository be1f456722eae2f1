//! Memory spaces: a primitive [`MemoryAllocator`] plus the bookkeeping that
//! makes it a safe [`AllocationStrategy`].

use core::ptr::NonNull;
use std::collections::BTreeMap;

use log::{trace, warn};
use spin::Mutex;

use crate::alloc::MemoryAllocator;
use crate::error::{Error, Result};
use crate::platform::MemoryResourceTraits;
use crate::strategy::{AllocationStrategy, Usage};

// Live allocations, keyed by address so an interior pointer can be traced back
// to the allocation containing it.
#[derive(Default)]
struct Ledger {
    live: BTreeMap<usize, usize>,
    usage: Usage,
}

impl Ledger {
    // The allocation containing [addr, addr + len), as (start, size).
    fn containing(&self, addr: usize, len: usize) -> Option<(usize, usize)> {
        let (&start, &size) = self.live.range(..=addr).next_back()?;
        if addr.checked_add(len)? <= start + size.max(1) {
            Some((start, size))
        } else {
            None
        }
    }

    fn insert(&mut self, addr: usize, size: usize) {
        let previous = self.live.insert(addr, size);
        debug_assert!(previous.is_none(), "{:#x} handed out twice", addr);
        self.usage.record_allocate(size);
    }

    fn remove(&mut self, addr: usize) -> Option<usize> {
        let size = self.live.remove(&addr)?;
        self.usage.record_deallocate(size);
        Some(size)
    }
}

/// A memory space. Every call reaches the primitive allocator; nothing is
/// pooled.
pub struct MemoryResource<A> {
    name: String,
    id: usize,
    traits: MemoryResourceTraits,
    allocator: A,
    ledger: Mutex<Ledger>,
}

impl<A: MemoryAllocator> MemoryResource<A> {
    pub fn new<S: Into<String>>(
        name: S,
        id: usize,
        traits: MemoryResourceTraits,
        allocator: A,
    ) -> Self {
        MemoryResource {
            name: name.into(),
            id,
            traits,
            allocator,
            ledger: Mutex::new(Ledger::default()),
        }
    }

    pub fn allocator(&self) -> &A {
        &self.allocator
    }

    fn record(&self, ptr: NonNull<u8>, bytes: usize) -> NonNull<u8> {
        trace!("{}: allocated {} bytes at {:?}", self.name, bytes, ptr);
        self.ledger.lock().insert(ptr.as_ptr() as usize, bytes);
        ptr
    }

    fn failure(&self, bytes: usize, err: A::Err) -> Error {
        log::debug!("{}: allocating {} bytes failed: {:?}", self.name, bytes, err);
        Error::allocation_failure(self.name.as_str(), bytes)
    }
}

impl<A: MemoryAllocator> AllocationStrategy for MemoryResource<A> {
    fn name(&self) -> &str {
        &self.name
    }

    fn id(&self) -> usize {
        self.id
    }

    fn traits(&self) -> MemoryResourceTraits {
        self.traits
    }

    fn allocate(&self, bytes: usize) -> Result<NonNull<u8>> {
        match self.allocator.malloc(bytes) {
            Ok(ptr) => Ok(self.record(ptr, bytes)),
            Err(e) => Err(self.failure(bytes, e)),
        }
    }

    fn allocate_zeroed(&self, bytes: usize) -> Result<NonNull<u8>> {
        match self.allocator.calloc(bytes) {
            Ok(ptr) => Ok(self.record(ptr, bytes)),
            Err(e) => Err(self.failure(bytes, e)),
        }
    }

    fn reallocate(&self, ptr: NonNull<u8>, bytes: usize) -> Result<NonNull<u8>> {
        let addr = ptr.as_ptr() as usize;
        // Hold the ledger across the call, so nobody else can free `ptr`
        // while it is being moved.
        let mut ledger = self.ledger.lock();
        let old_bytes = match ledger.live.get(&addr) {
            Some(&size) => size,
            None => return Err(Error::invalid_pointer(self.name.as_str(), addr)),
        };

        let new_ptr = unsafe { self.allocator.realloc(ptr, old_bytes, bytes) }
            .map_err(|e| self.failure(bytes, e))?;
        ledger.remove(addr);
        ledger.insert(new_ptr.as_ptr() as usize, bytes);
        trace!(
            "{}: moved {} bytes at {:?} to {} bytes at {:?}",
            self.name,
            old_bytes,
            ptr,
            bytes,
            new_ptr
        );
        Ok(new_ptr)
    }

    fn deallocate(&self, ptr: NonNull<u8>) -> Result<()> {
        let addr = ptr.as_ptr() as usize;
        let bytes = self
            .ledger
            .lock()
            .remove(addr)
            .ok_or_else(|| Error::invalid_pointer(self.name.as_str(), addr))?;

        if let Err(e) = unsafe { self.allocator.free(ptr, bytes) } {
            warn!("{}: freeing {:?} failed: {:?}", self.name, ptr, e);
            // Still ours; put it back.
            self.ledger.lock().insert(addr, bytes);
            return Err(Error::invalid_pointer(self.name.as_str(), addr));
        }
        trace!("{}: freed {} bytes at {:?}", self.name, bytes, ptr);
        Ok(())
    }

    fn memset(&self, ptr: NonNull<u8>, value: u8, bytes: usize) -> Result<()> {
        let addr = ptr.as_ptr() as usize;
        let ledger = self.ledger.lock();
        if ledger.containing(addr, bytes).is_none() {
            return Err(Error::invalid_pointer(self.name.as_str(), addr));
        }
        unsafe { self.allocator.memset(ptr, value, bytes) };
        Ok(())
    }

    fn size_of(&self, ptr: NonNull<u8>) -> Option<usize> {
        self.ledger
            .lock()
            .live
            .get(&(ptr.as_ptr() as usize))
            .copied()
    }

    fn usage(&self) -> Option<Usage> {
        Some(self.ledger.lock().usage)
    }

    fn actual_size(&self) -> usize {
        self.ledger.lock().usage.current_size
    }
}

impl<A> Drop for MemoryResource<A> {
    fn drop(&mut self) {
        let live = self.ledger.lock().live.len();
        if live > 0 {
            // Somebody still holds these pointers, so we can't free them.
            warn!("{}: dropped with {} live allocations", self.name, live);
        }
    }
}
