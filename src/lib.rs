//! Portable memory allocation over named memory spaces.
//!
//! Memory lives in *spaces*: `HOST` (the process heap), `DEVICE::<n>`
//! (device memory, `DEVICE` being device 0), and `UM` (unified memory,
//! reachable from host and device alike). A [`ResourceManager`] hands out an
//! [`Allocator`] handle for each space by name, and builds strategies, such
//! as a [`Pool`], over any handle.
//!
//! Every pointer handed out through a handle is recorded with the allocator
//! that made it, so it can be freed, filled, copied or resized knowing only
//! the pointer.
//!
//! ```no_run
//! use memspace::{Pool, PoolConfig, ResourceManager};
//!
//! let rm = ResourceManager::instance();
//! let host = rm.get_allocator("HOST")?;
//! let pool = rm.make_allocator::<Pool>("small-blocks", &host, PoolConfig::default())?;
//!
//! let ptr = pool.allocate(1024)?;
//! rm.memset(ptr, 0, 1024)?;
//! rm.deallocate(ptr)?;
//! # Ok::<(), memspace::Error>(())
//! ```
//!
//! The device and unified spaces are emulated with anonymous memory mappings
//! and are only built with the `device` feature (on by default).

pub mod alloc;
pub mod allocator;
pub mod error;
pub mod manager;
pub mod platform;
pub mod pool;
pub mod registry;
pub mod resource;
pub mod strategy;

pub use crate::allocator::Allocator;
pub use crate::error::{Error, Result};
pub use crate::manager::{AllocationMap, AllocationRecord, ManagerConfig, ResourceManager};
pub use crate::platform::{MemoryResourceTraits, Platform, ResourceKind};
pub use crate::pool::{Pool, PoolConfig};
pub use crate::registry::{AllocatorRegistry, SpaceFactory};
pub use crate::strategy::{AllocationStrategy, Introspected, Strategy, Untracked, Usage};

/// The allocator called `name`, from the process-wide resource manager.
pub fn get_allocator(name: &str) -> Result<Allocator> {
    ResourceManager::instance().get_allocator(name)
}

/// Build a strategy of type `S` over `backing` in the process-wide resource
/// manager.
pub fn make_allocator<S: Strategy>(
    name: &str,
    backing: &Allocator,
    config: S::Config,
) -> Result<Allocator> {
    ResourceManager::instance().make_allocator::<S>(name, backing, config)
}

/// Can code running on `platform` use memory from `allocator`?
pub fn is_accessible(platform: Platform, allocator: &Allocator) -> bool {
    allocator.is_accessible(platform)
}

/// Every memory space the process-wide resource manager can build.
pub fn get_resource_names() -> Vec<String> {
    ResourceManager::instance().get_resource_names()
}

#[cfg(test)]
mod tests {
    use super::*;

    use test_env_log::test;

    #[test]
    fn test_process_wide_functions() {
        let host = get_allocator("HOST").unwrap();
        assert_eq!(host.id(), get_allocator("HOST").unwrap().id());
        assert!(is_accessible(Platform::Host, &host));
        assert!(get_resource_names().contains(&"HOST".to_owned()));

        let pool = make_allocator::<Pool>("lib-test-pool", &host, PoolConfig::default()).unwrap();
        let ptr = pool.allocate(10).unwrap();
        assert_eq!(
            ResourceManager::instance().get_allocator_for(ptr).unwrap().id(),
            pool.id()
        );
        ResourceManager::instance().deallocate(ptr).unwrap();
        pool.release().unwrap();
    }
}
