//! Errors reported by allocators, strategies and the resource manager.
//!
//! Pointers are carried as plain addresses so errors stay `Send + Sync` and
//! can be printed after the memory is gone.

pub type Result<T> = core::result::Result<T, Error>;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    /// No space factory accepts this name, and no allocator was registered
    /// under it.
    #[error("no memory resource or allocator named `{0}`")]
    UnknownResource(String),

    /// The backing resource could not satisfy the request.
    #[error("allocator `{allocator}` failed to allocate {size} bytes")]
    AllocationFailure { allocator: String, size: usize },

    /// The strategy was handed an address it did not produce.
    #[error("allocator `{allocator}` does not own pointer {ptr:#x}")]
    InvalidPointer { allocator: String, ptr: usize },

    /// A handle was handed a pointer that belongs to a different allocator,
    /// or to no allocator at all.
    #[error("pointer {ptr:#x} was not allocated by `{allocator}`")]
    ForeignPointer { allocator: String, ptr: usize },

    #[error("no allocation record for pointer {0:#x}")]
    UnknownAllocation(usize),

    #[error("pointer {0:#x} was already deallocated")]
    DoubleFree(usize),

    #[error("an allocator named `{0}` already exists")]
    NameInUse(String),

    #[error("{len} bytes at {ptr:#x} overrun an allocation of {size} bytes")]
    OutOfBounds { ptr: usize, len: usize, size: usize },

    /// An address was registered twice without a deallocation in between.
    #[error("pointer {0:#x} is already registered to an allocator")]
    DuplicateAllocation(usize),
}

impl Error {
    pub fn allocation_failure<S: Into<String>>(allocator: S, size: usize) -> Self {
        Error::AllocationFailure {
            allocator: allocator.into(),
            size,
        }
    }

    pub fn invalid_pointer<S: Into<String>>(allocator: S, ptr: usize) -> Self {
        Error::InvalidPointer {
            allocator: allocator.into(),
            ptr,
        }
    }

    pub fn foreign_pointer<S: Into<String>>(allocator: S, ptr: usize) -> Self {
        Error::ForeignPointer {
            allocator: allocator.into(),
            ptr,
        }
    }
}
