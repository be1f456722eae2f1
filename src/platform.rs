//! Execution platforms, memory-resource traits, and the static accessibility
//! matrix relating the two.

use core::fmt;

/// A place code can run.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Platform {
    /// Not a real platform; nothing is accessible from it.
    Undefined,
    Host,
    Device,
}

/// The kind of memory a resource hands out.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    Unknown,
    /// Ordinary process heap.
    Host,
    /// Memory resident on a single device.
    Device,
    /// Memory addressable from the host and every participating device.
    Unified,
}

impl ResourceKind {
    /// The platforms that may dereference memory of this kind.
    pub fn platforms(self) -> &'static [Platform] {
        match self {
            ResourceKind::Host => &[Platform::Host],
            ResourceKind::Device => &[Platform::Device],
            ResourceKind::Unified => &[Platform::Host, Platform::Device],
            ResourceKind::Unknown => &[],
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ResourceKind::Unknown => "unknown",
            ResourceKind::Host => "host",
            ResourceKind::Device => "device",
            ResourceKind::Unified => "unified",
        };
        f.write_str(name)
    }
}

/// Static description of a memory resource.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct MemoryResourceTraits {
    pub kind: ResourceKind,
    /// Device (or memory space) number; 0 for the host and unified spaces.
    pub id: usize,
}

impl MemoryResourceTraits {
    pub const fn new(kind: ResourceKind, id: usize) -> Self {
        MemoryResourceTraits { kind, id }
    }

    /// Can code running on `platform` dereference memory with these traits?
    ///
    /// This is a pure table lookup; nothing is probed at runtime.
    pub fn is_accessible_from(&self, platform: Platform) -> bool {
        self.kind.platforms().contains(&platform)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_accessibility_matrix() {
        let host = MemoryResourceTraits::new(ResourceKind::Host, 0);
        let device = MemoryResourceTraits::new(ResourceKind::Device, 1);
        let unified = MemoryResourceTraits::new(ResourceKind::Unified, 0);
        let unknown = MemoryResourceTraits::new(ResourceKind::Unknown, 0);

        assert!(host.is_accessible_from(Platform::Host));
        assert!(!host.is_accessible_from(Platform::Device));

        assert!(!device.is_accessible_from(Platform::Host));
        assert!(device.is_accessible_from(Platform::Device));

        assert!(unified.is_accessible_from(Platform::Host));
        assert!(unified.is_accessible_from(Platform::Device));

        for traits in &[host, device, unified, unknown] {
            assert!(!traits.is_accessible_from(Platform::Undefined));
        }
        assert!(!unknown.is_accessible_from(Platform::Host));
    }
}
