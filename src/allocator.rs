//! The caller-facing allocator handle.

use core::fmt;
use core::ptr::NonNull;
use std::sync::Arc;

use log::warn;

use crate::error::{Error, Result};
use crate::manager::{AllocationMap, AllocationRecord};
use crate::platform::{MemoryResourceTraits, Platform};
use crate::strategy::{AllocationStrategy, Usage};

/// A cheap, cloneable handle to one strategy: a memory space, or a strategy
/// (such as a pool) built over one.
///
/// Everything allocated through a handle is recorded in its resource
/// manager's ownership map, so it can also be freed with
/// [`ResourceManager::deallocate`](../manager/struct.ResourceManager.html#method.deallocate).
#[derive(Clone)]
pub struct Allocator {
    strategy: Arc<dyn AllocationStrategy>,
    allocations: Arc<AllocationMap>,
}

static_assertions::assert_impl_all!(Allocator: Send, Sync, Clone);

impl Allocator {
    pub(crate) fn new(strategy: Arc<dyn AllocationStrategy>, allocations: Arc<AllocationMap>) -> Self {
        Allocator {
            strategy,
            allocations,
        }
    }

    pub fn name(&self) -> &str {
        self.strategy.name()
    }

    pub fn id(&self) -> usize {
        self.strategy.id()
    }

    pub fn traits(&self) -> MemoryResourceTraits {
        self.strategy.traits()
    }

    pub fn strategy(&self) -> &Arc<dyn AllocationStrategy> {
        &self.strategy
    }

    fn register(&self, ptr: NonNull<u8>, bytes: usize) -> Result<NonNull<u8>> {
        let record = AllocationRecord {
            ptr: ptr.as_ptr() as usize,
            size: bytes,
            strategy: self.strategy.clone(),
        };
        if let Err(e) = self.allocations.insert(record) {
            if let Err(undo) = self.strategy.deallocate(ptr) {
                warn!("{}: leaking {:?} after {}: {}", self.name(), ptr, e, undo);
            }
            return Err(e);
        }
        Ok(ptr)
    }

    pub fn allocate(&self, bytes: usize) -> Result<NonNull<u8>> {
        let ptr = self.strategy.allocate(bytes)?;
        self.register(ptr, bytes)
    }

    pub fn allocate_zeroed(&self, bytes: usize) -> Result<NonNull<u8>> {
        let ptr = self.strategy.allocate_zeroed(bytes)?;
        self.register(ptr, bytes)
    }

    /// Resize an allocation made through this allocator. The contents up to
    /// the smaller of the two sizes are kept; on success `ptr` is invalid.
    pub fn reallocate(&self, ptr: NonNull<u8>, bytes: usize) -> Result<NonNull<u8>> {
        let record = self
            .allocations
            .remove_owned(ptr.as_ptr() as usize, &*self.strategy)?;
        match self.strategy.reallocate(ptr, bytes) {
            Ok(new_ptr) => self.register(new_ptr, bytes),
            Err(e) => {
                self.allocations.restore(record);
                Err(e)
            }
        }
    }

    /// Free an allocation made through this allocator.
    pub fn deallocate(&self, ptr: NonNull<u8>) -> Result<()> {
        // The record leaves the map first: once the strategy has the memory
        // back it may hand the same address to another thread.
        let record = self
            .allocations
            .remove_owned(ptr.as_ptr() as usize, &*self.strategy)?;
        if let Err(e) = self.strategy.deallocate(ptr) {
            self.allocations.restore(record);
            return Err(e);
        }
        Ok(())
    }

    /// Return unused backing memory. Calling it again changes nothing.
    pub fn release(&self) -> Result<()> {
        self.strategy.release()
    }

    /// Fill the first `bytes` bytes of an allocation made through this
    /// allocator.
    pub fn memset(&self, ptr: NonNull<u8>, value: u8, bytes: usize) -> Result<()> {
        let record = self
            .allocations
            .find_owned(ptr.as_ptr() as usize, &*self.strategy)?;
        if bytes > record.size {
            return Err(Error::OutOfBounds {
                ptr: record.ptr,
                len: bytes,
                size: record.size,
            });
        }
        self.strategy.memset(ptr, value, bytes)
    }

    /// Bytes requested for a live allocation made through this allocator.
    pub fn size_of(&self, ptr: NonNull<u8>) -> Option<usize> {
        self.allocations
            .find_owned(ptr.as_ptr() as usize, &*self.strategy)
            .ok()
            .map(|record| record.size)
    }

    pub fn usage(&self) -> Option<Usage> {
        self.strategy.usage()
    }

    pub fn current_size(&self) -> Option<usize> {
        self.usage().map(|u| u.current_size)
    }

    pub fn high_watermark(&self) -> Option<usize> {
        self.usage().map(|u| u.high_watermark)
    }

    pub fn allocation_count(&self) -> Option<usize> {
        self.usage().map(|u| u.allocation_count)
    }

    /// Bytes held from whatever backs this allocator.
    pub fn actual_size(&self) -> usize {
        self.strategy.actual_size()
    }

    /// Can code running on `platform` dereference this allocator's memory?
    pub fn is_accessible(&self, platform: Platform) -> bool {
        self.traits().is_accessible_from(platform)
    }
}

impl fmt::Debug for Allocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Allocator")
            .field("name", &self.name())
            .field("id", &self.id())
            .field("traits", &self.traits())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::manager::ResourceManager;
    use crate::pool::{Pool, PoolConfig};
    use crate::strategy::Untracked;

    use test_env_log::test;

    #[test]
    fn test_handle_round_trip() {
        let rm = ResourceManager::new();
        let host = rm.get_allocator("HOST").unwrap();

        let ptr = host.allocate(48).unwrap();
        assert_eq!(host.size_of(ptr), Some(48));
        assert_eq!(host.current_size(), Some(48));
        assert!(rm.has_allocator(ptr));

        let ptr = host.reallocate(ptr, 96).unwrap();
        assert_eq!(host.size_of(ptr), Some(96));
        host.memset(ptr, 1, 96).unwrap();
        assert!(host.memset(ptr, 1, 97).is_err());

        host.deallocate(ptr).unwrap();
        assert!(!rm.has_allocator(ptr));
        assert_eq!(host.current_size(), Some(0));
        assert_eq!(host.high_watermark(), Some(96));
        assert_eq!(host.allocation_count(), Some(2));
        assert_eq!(host.deallocate(ptr), Err(Error::DoubleFree(ptr.as_ptr() as usize)));
    }

    #[test]
    fn test_foreign_pointer() {
        let rm = ResourceManager::new();
        let host = rm.get_allocator("HOST").unwrap();
        let pool = rm
            .make_allocator::<Pool<Untracked>>("pool", &host, PoolConfig::default())
            .unwrap();

        let ptr = host.allocate(8).unwrap();
        assert_eq!(
            pool.deallocate(ptr),
            Err(Error::ForeignPointer {
                allocator: "pool".to_owned(),
                ptr: ptr.as_ptr() as usize,
            })
        );
        // Still live, and still freeable by its owner.
        assert!(rm.has_allocator(ptr));
        host.deallocate(ptr).unwrap();

        let mut local = 0u8;
        let stray = NonNull::from(&mut local);
        match host.deallocate(stray) {
            Err(Error::ForeignPointer { allocator, .. }) => assert_eq!(allocator, "HOST"),
            other => panic!("expected ForeignPointer, got {:?}", other),
        }
        assert_eq!(pool.usage(), None);
    }

    #[test]
    fn test_freed_pointer_belongs_to_its_owner() {
        let rm = ResourceManager::new();
        let host = rm.get_allocator("HOST").unwrap();
        let pool = rm
            .make_allocator::<Pool>("pool", &host, PoolConfig::default())
            .unwrap();

        let ptr = host.allocate(32).unwrap();
        host.deallocate(ptr).unwrap();

        let foreign = Err(Error::ForeignPointer {
            allocator: "pool".to_owned(),
            ptr: ptr.as_ptr() as usize,
        });
        // The pool never had it, freed or not.
        assert_eq!(pool.deallocate(ptr), foreign);
        assert_eq!(pool.memset(ptr, 0, 1), foreign);
        assert_eq!(host.deallocate(ptr), Err(Error::DoubleFree(ptr.as_ptr() as usize)));
    }

    #[test]
    fn test_failed_registration_returns_the_block() {
        let rm = ResourceManager::new();
        let host = rm.get_allocator("HOST").unwrap();
        let config = PoolConfig {
            initial_size: 4096,
            min_grow_size: 4096,
            granularity: 4096,
        };
        let pool = rm.make_allocator::<Pool>("pool", &host, config).unwrap();

        let a = pool.allocate(32).unwrap();
        // Claim the address the pool will hand out next.
        let next = unsafe { NonNull::new_unchecked(a.as_ptr().add(32)) };
        rm.register_allocation(next, 1, &host).unwrap();

        assert_eq!(
            pool.allocate(64),
            Err(Error::DuplicateAllocation(next.as_ptr() as usize))
        );
        assert_eq!(pool.current_size(), Some(32));
        assert_eq!(
            pool.reallocate(a, 128),
            Err(Error::DuplicateAllocation(next.as_ptr() as usize))
        );
        assert_eq!(pool.current_size(), Some(0));
        assert!(!rm.has_allocator(a));

        rm.deregister_allocation(next).unwrap();
        assert!(rm.allocations().is_empty());
    }

    #[test]
    fn test_zeroed_pool_memory() {
        let rm = ResourceManager::new();
        let host = rm.get_allocator("HOST").unwrap();
        let pool = rm
            .make_allocator::<Pool>("pool", &host, PoolConfig::default())
            .unwrap();

        let dirty = pool.allocate(256).unwrap();
        pool.memset(dirty, 0xee, 256).unwrap();
        pool.deallocate(dirty).unwrap();

        let clean = pool.allocate_zeroed(256).unwrap();
        assert_eq!(clean, dirty);
        let bytes = unsafe { core::slice::from_raw_parts(clean.as_ptr(), 256) };
        assert!(bytes.iter().all(|&b| b == 0));
        pool.deallocate(clean).unwrap();

        pool.release().unwrap();
        pool.release().unwrap();
        assert_eq!(pool.actual_size(), 0);
        assert_eq!(host.current_size(), Some(0));
    }

    #[test]
    fn test_accessibility() {
        let rm = ResourceManager::new();
        let host = rm.get_allocator("HOST").unwrap();
        assert!(host.is_accessible(Platform::Host));
        assert!(!host.is_accessible(Platform::Device));
        assert!(!host.is_accessible(Platform::Undefined));

        let pool = rm
            .make_allocator::<Pool>("pool", &host, PoolConfig::default())
            .unwrap();
        assert_eq!(pool.traits(), host.traits());
    }
}
