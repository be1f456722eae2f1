//! The resource manager: named allocators, and the ownership map that lets
//! memory be freed by pointer alone.
//!
//! A `ResourceManager` is an ordinary value; build one with
//! [`ResourceManager::new`](struct.ResourceManager.html#method.new) or
//! [`with_config`](struct.ResourceManager.html#method.with_config) and pass it
//! to whatever needs it. [`ResourceManager::instance`](struct.ResourceManager.html#method.instance)
//! is the process-wide default, built on first use.
//!
//! Each structure has its own lock: the name table, the ownership map, the
//! registry's factory list, and every strategy's internal state. Unrelated
//! allocators never wait on each other.

use core::fmt;
use core::ptr::NonNull;
use core::sync::atomic::{AtomicUsize, Ordering};
use std::collections::HashMap;
use std::sync::Arc;

use log::{debug, warn};
use spin::{Mutex, Once};

use crate::allocator::Allocator;
use crate::error::{Error, Result};
use crate::registry::{AllocatorRegistry, SpaceFactory};
use crate::strategy::{AllocationStrategy, Strategy};

const GIB: usize = 1 << 30;

/// Settings for a resource manager and its built-in spaces.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ManagerConfig {
    /// Number of emulated devices (`DEVICE::0` ..).
    pub device_count: usize,
    /// Bytes each device can hand out.
    pub device_capacity: usize,
    /// Bytes the unified space can hand out.
    pub unified_capacity: usize,
    /// How many freed addresses to remember for reporting double frees.
    pub tombstone_capacity: usize,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        ManagerConfig {
            device_count: 1,
            device_capacity: GIB,
            unified_capacity: GIB,
            tombstone_capacity: 1 << 16,
        }
    }
}

/// Who owns a live allocation.
#[derive(Clone)]
pub struct AllocationRecord {
    pub ptr: usize,
    /// Bytes requested by the caller.
    pub size: usize,
    pub strategy: Arc<dyn AllocationStrategy>,
}

impl fmt::Debug for AllocationRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AllocationRecord")
            .field("ptr", &format_args!("{:#x}", self.ptr))
            .field("size", &self.size)
            .field("allocator", &self.strategy.name())
            .finish()
    }
}

struct Entries {
    live: HashMap<usize, AllocationRecord>,
    // Recently freed addresses, with the id of the strategy that freed them.
    // Forgotten when reused, or all at once when there are too many.
    freed: HashMap<usize, usize>,
}

/// Address -> owning allocator, for every live allocation made through an
/// [`Allocator`](../allocator/struct.Allocator.html).
pub struct AllocationMap {
    entries: Mutex<Entries>,
    tombstone_capacity: usize,
}

impl AllocationMap {
    pub fn new(tombstone_capacity: usize) -> Self {
        AllocationMap {
            entries: Mutex::new(Entries {
                live: HashMap::new(),
                freed: HashMap::new(),
            }),
            tombstone_capacity,
        }
    }

    fn missing(entries: &Entries, ptr: usize) -> Error {
        if entries.freed.contains_key(&ptr) {
            Error::DoubleFree(ptr)
        } else {
            Error::UnknownAllocation(ptr)
        }
    }

    pub fn insert(&self, record: AllocationRecord) -> Result<()> {
        let mut entries = self.entries.lock();
        let ptr = record.ptr;
        if entries.live.contains_key(&ptr) {
            return Err(Error::DuplicateAllocation(ptr));
        }
        entries.freed.remove(&ptr);
        entries.live.insert(ptr, record);
        Ok(())
    }

    // Remove a live record, leaving a tombstone behind.
    fn take(&self, entries: &mut Entries, ptr: usize) -> Option<AllocationRecord> {
        let record = entries.live.remove(&ptr)?;
        if entries.freed.len() >= self.tombstone_capacity {
            entries.freed.clear();
        }
        if self.tombstone_capacity > 0 {
            entries.freed.insert(ptr, record.strategy.id());
        }
        Some(record)
    }

    /// Take the record for `ptr` out of the map.
    pub fn remove(&self, ptr: usize) -> Result<AllocationRecord> {
        let mut entries = self.entries.lock();
        match self.take(&mut entries, ptr) {
            Some(record) => Ok(record),
            None => Err(Self::missing(&entries, ptr)),
        }
    }

    // Is `ptr` live and made by `owner`? A pointer `owner` already freed is a
    // double free; anything else isn't `owner`'s to touch.
    fn check_owner(entries: &Entries, ptr: usize, owner: &dyn AllocationStrategy) -> Result<()> {
        let owner_id = match entries.live.get(&ptr) {
            Some(record) => record.strategy.id(),
            None => match entries.freed.get(&ptr) {
                Some(&freed_by) if freed_by == owner.id() => return Err(Error::DoubleFree(ptr)),
                _ => return Err(Error::foreign_pointer(owner.name(), ptr)),
            },
        };
        if owner_id == owner.id() {
            Ok(())
        } else {
            Err(Error::foreign_pointer(owner.name(), ptr))
        }
    }

    /// Take the record for `ptr` out of the map, but only if `owner` made it.
    pub(crate) fn remove_owned(
        &self,
        ptr: usize,
        owner: &dyn AllocationStrategy,
    ) -> Result<AllocationRecord> {
        let mut entries = self.entries.lock();
        Self::check_owner(&entries, ptr, owner)?;
        self.take(&mut entries, ptr)
            .ok_or_else(|| Error::foreign_pointer(owner.name(), ptr))
    }

    /// Put back a record whose removal is being undone. The address is not
    /// left behind as a tombstone.
    pub(crate) fn restore(&self, record: AllocationRecord) {
        let mut entries = self.entries.lock();
        entries.freed.remove(&record.ptr);
        entries.live.insert(record.ptr, record);
    }

    pub fn find(&self, ptr: usize) -> Result<AllocationRecord> {
        let entries = self.entries.lock();
        match entries.live.get(&ptr) {
            Some(record) => Ok(record.clone()),
            None => Err(Self::missing(&entries, ptr)),
        }
    }

    pub(crate) fn find_owned(
        &self,
        ptr: usize,
        owner: &dyn AllocationStrategy,
    ) -> Result<AllocationRecord> {
        let entries = self.entries.lock();
        Self::check_owner(&entries, ptr, owner)?;
        entries
            .live
            .get(&ptr)
            .cloned()
            .ok_or_else(|| Error::foreign_pointer(owner.name(), ptr))
    }

    pub fn contains(&self, ptr: usize) -> bool {
        self.entries.lock().live.contains_key(&ptr)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().live.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Default)]
struct NameTable {
    by_name: HashMap<String, Allocator>,
    // Registration order
    order: Vec<String>,
}

impl NameTable {
    fn insert(&mut self, name: &str, allocator: Allocator) {
        self.by_name.insert(name.to_owned(), allocator);
        self.order.push(name.to_owned());
    }
}

/// Named allocators, and the map from every live pointer to its allocator.
pub struct ResourceManager {
    registry: AllocatorRegistry,
    allocators: Mutex<NameTable>,
    allocations: Arc<AllocationMap>,
    next_id: AtomicUsize,
}

static INSTANCE: Once<ResourceManager> = Once::new();

impl Default for ResourceManager {
    fn default() -> Self {
        Self::new()
    }
}

impl ResourceManager {
    pub fn new() -> Self {
        ResourceManager::with_config(ManagerConfig::default())
    }

    pub fn with_config(config: ManagerConfig) -> Self {
        let registry = AllocatorRegistry::with_defaults(&config);
        ResourceManager::with_registry(registry, &config)
    }

    /// A manager over exactly the spaces `registry` knows.
    pub fn with_registry(registry: AllocatorRegistry, config: &ManagerConfig) -> Self {
        ResourceManager {
            registry,
            allocators: Mutex::new(NameTable::default()),
            allocations: Arc::new(AllocationMap::new(config.tombstone_capacity)),
            next_id: AtomicUsize::new(0),
        }
    }

    /// The process-wide manager, with the default configuration.
    pub fn instance() -> &'static ResourceManager {
        INSTANCE.call_once(ResourceManager::new)
    }

    fn next_id(&self) -> usize {
        self.next_id.fetch_add(1, Ordering::SeqCst)
    }

    pub fn allocations(&self) -> &Arc<AllocationMap> {
        &self.allocations
    }

    /// The allocator called `name`, building the memory space on first use.
    pub fn get_allocator(&self, name: &str) -> Result<Allocator> {
        // Held while building, so concurrent first requests build one space.
        let mut table = self.allocators.lock();
        if let Some(allocator) = table.by_name.get(name) {
            return Ok(allocator.clone());
        }

        let strategy = self.registry.make_resource(name, self.next_id())?;
        debug!(
            "built memory space {} ({}, id {})",
            name,
            strategy.traits().kind,
            strategy.id()
        );
        let allocator = Allocator::new(strategy, self.allocations.clone());
        table.insert(name, allocator.clone());
        Ok(allocator)
    }

    /// Build a strategy of type `S` over `backing`, and register it as
    /// `name`.
    pub fn make_allocator<S: Strategy>(
        &self,
        name: &str,
        backing: &Allocator,
        config: S::Config,
    ) -> Result<Allocator> {
        let mut table = self.allocators.lock();
        if table.by_name.contains_key(name) || self.registry.is_valid_name(name) {
            return Err(Error::NameInUse(name.to_owned()));
        }

        let strategy = S::build(name, self.next_id(), backing, config)?;
        debug!(
            "built allocator {} (id {}) over {}",
            name,
            strategy.id(),
            backing.name()
        );
        let allocator = Allocator::new(Arc::new(strategy), self.allocations.clone());
        table.insert(name, allocator.clone());
        Ok(allocator)
    }

    pub fn register_factory(&self, factory: Arc<dyn SpaceFactory>) {
        self.registry.register(factory);
    }

    /// Record that `allocator` owns the `size` bytes at `ptr`.
    pub fn register_allocation(
        &self,
        ptr: NonNull<u8>,
        size: usize,
        allocator: &Allocator,
    ) -> Result<()> {
        self.allocations.insert(AllocationRecord {
            ptr: ptr.as_ptr() as usize,
            size,
            strategy: allocator.strategy().clone(),
        })
    }

    pub fn deregister_allocation(&self, ptr: NonNull<u8>) -> Result<AllocationRecord> {
        self.allocations.remove(ptr.as_ptr() as usize)
    }

    /// Free `ptr` through whichever allocator made it.
    pub fn deallocate(&self, ptr: NonNull<u8>) -> Result<()> {
        let record = self.allocations.remove(ptr.as_ptr() as usize)?;
        if let Err(e) = record.strategy.deallocate(ptr) {
            self.allocations.restore(record);
            return Err(e);
        }
        Ok(())
    }

    /// Resize `ptr` through whichever allocator made it.
    pub fn reallocate(&self, ptr: NonNull<u8>, bytes: usize) -> Result<NonNull<u8>> {
        let record = self.allocations.remove(ptr.as_ptr() as usize)?;
        match record.strategy.reallocate(ptr, bytes) {
            Ok(new_ptr) => {
                let strategy = record.strategy.clone();
                if let Err(e) = self.allocations.insert(AllocationRecord {
                    ptr: new_ptr.as_ptr() as usize,
                    size: bytes,
                    strategy: record.strategy,
                }) {
                    // Nobody can reach the moved block through the map.
                    if let Err(undo) = strategy.deallocate(new_ptr) {
                        warn!("{}: leaking {:?} after {}: {}", strategy.name(), new_ptr, e, undo);
                    }
                    return Err(e);
                }
                Ok(new_ptr)
            }
            Err(e) => {
                self.allocations.restore(record);
                Err(e)
            }
        }
    }

    /// Fill the first `bytes` bytes of the allocation at `ptr`, using its
    /// allocator's fill.
    pub fn memset(&self, ptr: NonNull<u8>, value: u8, bytes: usize) -> Result<()> {
        let record = self.allocations.find(ptr.as_ptr() as usize)?;
        if bytes > record.size {
            return Err(Error::OutOfBounds {
                ptr: record.ptr,
                len: bytes,
                size: record.size,
            });
        }
        record.strategy.memset(ptr, value, bytes)
    }

    /// Copy `bytes` bytes between two allocations.
    pub fn copy(&self, dst: NonNull<u8>, src: NonNull<u8>, bytes: usize) -> Result<()> {
        for &ptr in [src, dst].iter() {
            let record = self.allocations.find(ptr.as_ptr() as usize)?;
            if bytes > record.size {
                return Err(Error::OutOfBounds {
                    ptr: record.ptr,
                    len: bytes,
                    size: record.size,
                });
            }
        }
        // Both ranges lie inside live allocations; they may be the same one.
        unsafe { core::ptr::copy(src.as_ptr(), dst.as_ptr(), bytes) };
        Ok(())
    }

    pub fn get_size(&self, ptr: NonNull<u8>) -> Result<usize> {
        Ok(self.allocations.find(ptr.as_ptr() as usize)?.size)
    }

    pub fn has_allocator(&self, ptr: NonNull<u8>) -> bool {
        self.allocations.contains(ptr.as_ptr() as usize)
    }

    /// A handle to the allocator that made `ptr`.
    pub fn get_allocator_for(&self, ptr: NonNull<u8>) -> Result<Allocator> {
        let record = self.allocations.find(ptr.as_ptr() as usize)?;
        Ok(Allocator::new(record.strategy, self.allocations.clone()))
    }

    /// Is `name` an allocator already, or a space that can be built?
    pub fn is_allocator(&self, name: &str) -> bool {
        self.allocators.lock().by_name.contains_key(name) || self.registry.is_valid_name(name)
    }

    /// Names of the allocators built so far, in the order they were built.
    pub fn get_allocator_names(&self) -> Vec<String> {
        self.allocators.lock().order.clone()
    }

    /// Names of every memory space the registry can build.
    pub fn get_resource_names(&self) -> Vec<String> {
        self.registry.resource_names()
    }
}
