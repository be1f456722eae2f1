//! Space factories, and the registry that maps a resource name to the factory
//! able to build it.
//!
//! Names:
//!
//! - `HOST`: the process heap.
//! - `DEVICE`, `DEVICE::<n>`: device memory, one capacity budget per device;
//!   `DEVICE` is device 0.
//! - `UM`: unified memory.
//!
//! The device and unified spaces are only available with the `device`
//! feature.

use std::sync::Arc;

use spin::Mutex;

#[cfg(feature = "device")]
use crate::alloc::MappedAllocator;
use crate::alloc::HostAllocator;
use crate::error::{Error, Result};
use crate::manager::ManagerConfig;
use crate::platform::{MemoryResourceTraits, ResourceKind};
use crate::resource::MemoryResource;
use crate::strategy::AllocationStrategy;

/// Builds the memory space for a family of names.
pub trait SpaceFactory: Send + Sync {
    fn is_valid_name(&self, name: &str) -> bool;

    /// Every name this factory accepts, in a stable order.
    fn resource_names(&self) -> Vec<String>;

    /// Build a fresh memory space for `name`, with strategy id `id`.
    fn create(&self, name: &str, id: usize) -> Result<Arc<dyn AllocationStrategy>>;
}

#[derive(Default, Debug)]
pub struct HostSpaceFactory;

impl SpaceFactory for HostSpaceFactory {
    fn is_valid_name(&self, name: &str) -> bool {
        name == "HOST"
    }

    fn resource_names(&self) -> Vec<String> {
        vec!["HOST".to_owned()]
    }

    fn create(&self, name: &str, id: usize) -> Result<Arc<dyn AllocationStrategy>> {
        Ok(Arc::new(MemoryResource::new(
            name,
            id,
            MemoryResourceTraits::new(ResourceKind::Host, 0),
            HostAllocator,
        )))
    }
}

/// Device memory. Every name for the same device shares that device's
/// capacity.
#[cfg(feature = "device")]
#[derive(Debug)]
pub struct DeviceSpaceFactory {
    devices: Vec<Arc<MappedAllocator>>,
}

#[cfg(feature = "device")]
impl DeviceSpaceFactory {
    pub fn new(device_count: usize, capacity: usize) -> Self {
        DeviceSpaceFactory {
            devices: (0..device_count)
                .map(|_| Arc::new(MappedAllocator::device(capacity)))
                .collect(),
        }
    }

    fn device_id(&self, name: &str) -> Option<usize> {
        let id = if name == "DEVICE" {
            0
        } else {
            name.strip_prefix("DEVICE::")?.parse().ok()?
        };
        if id < self.devices.len() {
            Some(id)
        } else {
            None
        }
    }
}

#[cfg(feature = "device")]
impl SpaceFactory for DeviceSpaceFactory {
    fn is_valid_name(&self, name: &str) -> bool {
        self.device_id(name).is_some()
    }

    fn resource_names(&self) -> Vec<String> {
        if self.devices.is_empty() {
            return Vec::new();
        }
        let mut names = vec!["DEVICE".to_owned()];
        names.extend((0..self.devices.len()).map(|id| format!("DEVICE::{}", id)));
        names
    }

    fn create(&self, name: &str, id: usize) -> Result<Arc<dyn AllocationStrategy>> {
        let device = self
            .device_id(name)
            .ok_or_else(|| Error::UnknownResource(name.to_owned()))?;
        Ok(Arc::new(MemoryResource::new(
            name,
            id,
            MemoryResourceTraits::new(ResourceKind::Device, device),
            self.devices[device].clone(),
        )))
    }
}

#[cfg(feature = "device")]
#[derive(Debug)]
pub struct UnifiedMemorySpaceFactory {
    allocator: Arc<MappedAllocator>,
}

#[cfg(feature = "device")]
impl UnifiedMemorySpaceFactory {
    pub fn new(capacity: usize) -> Self {
        UnifiedMemorySpaceFactory {
            allocator: Arc::new(MappedAllocator::unified(capacity)),
        }
    }
}

#[cfg(feature = "device")]
impl SpaceFactory for UnifiedMemorySpaceFactory {
    fn is_valid_name(&self, name: &str) -> bool {
        name == "UM"
    }

    fn resource_names(&self) -> Vec<String> {
        vec!["UM".to_owned()]
    }

    fn create(&self, name: &str, id: usize) -> Result<Arc<dyn AllocationStrategy>> {
        Ok(Arc::new(MemoryResource::new(
            name,
            id,
            MemoryResourceTraits::new(ResourceKind::Unified, 0),
            self.allocator.clone(),
        )))
    }
}

/// The set of space factories, searched in registration order.
pub struct AllocatorRegistry {
    factories: Mutex<Vec<Arc<dyn SpaceFactory>>>,
}

impl Default for AllocatorRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl AllocatorRegistry {
    /// A registry with no factories at all.
    pub fn new() -> Self {
        AllocatorRegistry {
            factories: Mutex::new(Vec::new()),
        }
    }

    /// The built-in spaces.
    pub fn with_defaults(config: &ManagerConfig) -> Self {
        let registry = AllocatorRegistry::new();
        registry.register(Arc::new(HostSpaceFactory));

        #[cfg(feature = "device")]
        {
            registry.register(Arc::new(DeviceSpaceFactory::new(
                config.device_count,
                config.device_capacity,
            )));
            registry.register(Arc::new(UnifiedMemorySpaceFactory::new(
                config.unified_capacity,
            )));
        }
        #[cfg(not(feature = "device"))]
        let _ = config;

        registry
    }

    pub fn register(&self, factory: Arc<dyn SpaceFactory>) {
        self.factories.lock().push(factory);
    }

    fn find(&self, name: &str) -> Option<Arc<dyn SpaceFactory>> {
        self.factories
            .lock()
            .iter()
            .find(|f| f.is_valid_name(name))
            .cloned()
    }

    pub fn is_valid_name(&self, name: &str) -> bool {
        self.find(name).is_some()
    }

    /// Build the memory space `name` with the first factory accepting it.
    pub fn make_resource(&self, name: &str, id: usize) -> Result<Arc<dyn AllocationStrategy>> {
        match self.find(name) {
            Some(factory) => factory.create(name, id),
            None => Err(Error::UnknownResource(name.to_owned())),
        }
    }

    pub fn resource_names(&self) -> Vec<String> {
        self.factories
            .lock()
            .iter()
            .flat_map(|f| f.resource_names())
            .collect()
    }
}
