//! The contract every allocator handle dispatches through, and the
//! build-time introspection policy for strategies that can opt out of it.

use core::ptr::NonNull;

use crate::allocator::Allocator;
use crate::error::Result;
use crate::platform::MemoryResourceTraits;

/// Allocation counters.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Usage {
    /// Bytes currently handed out.
    pub current_size: usize,
    /// Largest `current_size` ever seen.
    pub high_watermark: usize,
    /// Number of successful allocations, ever.
    pub allocation_count: usize,
}

impl Usage {
    #[inline]
    pub fn record_allocate(&mut self, bytes: usize) {
        self.current_size += bytes;
        self.allocation_count += 1;
        if self.current_size > self.high_watermark {
            self.high_watermark = self.current_size;
        }
    }

    #[inline]
    pub fn record_deallocate(&mut self, bytes: usize) {
        self.current_size -= bytes;
    }
}

/// Something that hands out memory: a memory space, or a strategy layered
/// over one.
///
/// Implementations must be safe to share between threads; each one
/// serializes its own state.
pub trait AllocationStrategy: Send + Sync {
    fn name(&self) -> &str;

    /// Unique among the strategies of one resource manager.
    fn id(&self) -> usize;

    fn traits(&self) -> MemoryResourceTraits;

    fn allocate(&self, bytes: usize) -> Result<NonNull<u8>>;

    fn allocate_zeroed(&self, bytes: usize) -> Result<NonNull<u8>> {
        let ptr = self.allocate(bytes)?;
        if let Err(e) = self.memset(ptr, 0, bytes) {
            // Can't hand back memory we failed to zero; give it back.
            let _ = self.deallocate(ptr);
            return Err(e);
        }
        Ok(ptr)
    }

    /// Resize an allocation made by this strategy. On success the old pointer
    /// is invalid.
    fn reallocate(&self, ptr: NonNull<u8>, bytes: usize) -> Result<NonNull<u8>>;

    fn deallocate(&self, ptr: NonNull<u8>) -> Result<()>;

    /// Hand unused backing memory back. Must be idempotent.
    fn release(&self) -> Result<()> {
        Ok(())
    }

    /// Fill `bytes` bytes at `ptr`, which may point anywhere inside a live
    /// allocation, with `value`.
    fn memset(&self, ptr: NonNull<u8>, value: u8, bytes: usize) -> Result<()>;

    /// Size of the live allocation starting at `ptr`, if this strategy made
    /// it.
    fn size_of(&self, ptr: NonNull<u8>) -> Option<usize>;

    /// Counters, if this strategy keeps them.
    fn usage(&self) -> Option<Usage>;

    /// Bytes this strategy holds from whatever backs it.
    fn actual_size(&self) -> usize;
}

/// A strategy that the resource manager can construct by name over a backing
/// allocator.
pub trait Strategy: AllocationStrategy + Sized + 'static {
    type Config;

    fn build(name: &str, id: usize, backing: &Allocator, config: Self::Config) -> Result<Self>;
}

/// Build-time choice of whether a strategy keeps [`Usage`] counters.
///
/// Strategies are generic over this, so the choice is made per instantiation
/// and [`Untracked`] compiles to nothing.
pub trait Introspection: Default + Send + 'static {
    fn record_allocate(&mut self, bytes: usize);
    fn record_deallocate(&mut self, bytes: usize);
    fn usage(&self) -> Option<Usage>;
}

/// Keep counters.
#[derive(Debug, Default)]
pub struct Introspected {
    usage: Usage,
}

impl Introspection for Introspected {
    #[inline]
    fn record_allocate(&mut self, bytes: usize) {
        self.usage.record_allocate(bytes);
    }

    #[inline]
    fn record_deallocate(&mut self, bytes: usize) {
        self.usage.record_deallocate(bytes);
    }

    fn usage(&self) -> Option<Usage> {
        Some(self.usage)
    }
}

/// Keep no counters at all.
#[derive(Debug, Default, Clone, Copy)]
pub struct Untracked;

impl Introspection for Untracked {
    #[inline(always)]
    fn record_allocate(&mut self, _bytes: usize) {}

    #[inline(always)]
    fn record_deallocate(&mut self, _bytes: usize) {}

    #[inline(always)]
    fn usage(&self) -> Option<Usage> {
        None
    }
}

static_assertions::const_assert_eq!(core::mem::size_of::<Untracked>(), 0);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_usage_high_watermark() {
        let mut tracked = Introspected::default();
        tracked.record_allocate(64);
        tracked.record_allocate(32);
        tracked.record_deallocate(64);
        tracked.record_allocate(16);

        let usage = tracked.usage().unwrap();
        assert_eq!(usage.current_size, 48);
        assert_eq!(usage.high_watermark, 96);
        assert_eq!(usage.allocation_count, 3);
    }

    #[test]
    fn test_untracked_keeps_nothing() {
        let mut untracked = Untracked;
        untracked.record_allocate(64);
        assert_eq!(untracked.usage(), None);
    }
}
