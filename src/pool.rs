//! A pooling strategy: large chunks from a backing allocator, carved up into
//! many small allocations.
//!
//! Each chunk keeps its free memory as runs of `(offset, length)`, sorted by
//! offset. A pool-wide index orders every free run by
//! `(length, chunk, offset)`, so the best fit for a request is the first run
//! in the index at least as long as the request: the smallest run that fits,
//! and among equally small runs, the one in the oldest chunk.
//!
//! Invariants, checked by [`Pool::validate`](struct.Pool.html#method.validate):
//!
//! - Free runs in a chunk never overlap.
//! - No two free runs in a chunk are adjacent (those are merged on free).
//! - For every chunk, free bytes plus live bytes equals the chunk size.
//! - The best-fit index holds exactly the runs of the chunks.

use core::fmt;
use core::ptr::NonNull;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use log::{debug, trace, warn};
use spin::Mutex;
use static_assertions::const_assert;

use crate::allocator::Allocator;
use crate::error::{Error, Result};
use crate::platform::MemoryResourceTraits;
use crate::strategy::{AllocationStrategy, Introspected, Introspection, Strategy, Usage};

/// Every block handed out by a pool is aligned to, and a multiple of, this
/// many bytes. Zero-byte requests still take one unit.
pub const POOL_ALIGNMENT: usize = 16;
const_assert!(POOL_ALIGNMENT.is_power_of_two());

const KIB: usize = 1 << 10;
const MIB: usize = 1 << 20;

/// How a pool grows.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PoolConfig {
    /// Minimum size of the first chunk.
    pub initial_size: usize,
    /// Minimum size of every later chunk.
    pub min_grow_size: usize,
    /// Requests too big for the minimum are rounded up to a multiple of this.
    pub granularity: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        PoolConfig {
            initial_size: 16 * MIB,
            min_grow_size: MIB,
            granularity: 4 * KIB,
        }
    }
}

impl PoolConfig {
    /// Size of a new chunk able to hold `size` bytes.
    fn chunk_size(&self, size: usize, first: bool) -> Option<usize> {
        let minimum = if first {
            self.initial_size
        } else {
            self.min_grow_size
        };
        let granularity = self.granularity.max(1);
        let needed = size.checked_add(granularity - 1)? / granularity * granularity;
        minimum
            .max(needed)
            .checked_add(POOL_ALIGNMENT - 1)
            .map(|c| c & !(POOL_ALIGNMENT - 1))
    }
}

fn aligned_size(bytes: usize) -> Option<usize> {
    bytes
        .max(1)
        .checked_add(POOL_ALIGNMENT - 1)
        .map(|b| b & !(POOL_ALIGNMENT - 1))
}

/// A contiguous block from the backing allocator.
struct Chunk {
    base: NonNull<u8>,
    size: usize,
    /// Free runs, offset -> length.
    free: BTreeMap<usize, usize>,
    /// Live allocations in this chunk.
    allocations: usize,
    /// Highest end offset ever handed out.
    high_water: usize,
}

// A chunk is plain bookkeeping about memory owned by the pool, and the pool
// serializes all access to it.
unsafe impl Send for Chunk {}

impl Chunk {
    fn addr(&self) -> usize {
        self.base.as_ptr() as usize
    }

    fn is_free(&self) -> bool {
        self.allocations == 0
    }
}

#[derive(Copy, Clone, Debug)]
struct Block {
    chunk: u64,
    offset: usize,
    size: usize,
}

struct PoolState<I> {
    next_chunk: u64,
    /// In creation order.
    chunks: BTreeMap<u64, Chunk>,
    /// Chunk base address -> chunk.
    bases: BTreeMap<usize, u64>,
    /// Best-fit index: (length, chunk, offset).
    runs: BTreeSet<(usize, u64, usize)>,
    /// Live block address -> block.
    blocks: BTreeMap<usize, Block>,
    introspection: I,
}

impl<I: Introspection> PoolState<I> {
    fn new() -> Self {
        PoolState {
            next_chunk: 0,
            chunks: BTreeMap::new(),
            bases: BTreeMap::new(),
            runs: BTreeSet::new(),
            blocks: BTreeMap::new(),
            introspection: I::default(),
        }
    }

    fn best_fit(&self, size: usize) -> Option<(usize, u64, usize)> {
        self.runs.range((size, 0, 0)..).next().copied()
    }

    fn add_chunk(&mut self, base: NonNull<u8>, size: usize) -> u64 {
        let seq = self.next_chunk;
        self.next_chunk += 1;

        let mut free = BTreeMap::new();
        free.insert(0, size);
        self.runs.insert((size, seq, 0));
        self.bases.insert(base.as_ptr() as usize, seq);
        self.chunks.insert(
            seq,
            Chunk {
                base,
                size,
                free,
                allocations: 0,
                high_water: 0,
            },
        );
        seq
    }

    // Split `size` bytes off the front of a free run, and return the address.
    fn take(&mut self, run: (usize, u64, usize), size: usize) -> Option<NonNull<u8>> {
        let (len, seq, offset) = run;
        let chunk = self.chunks.get_mut(&seq)?;
        self.runs.remove(&run);
        chunk.free.remove(&offset);
        if len > size {
            chunk.free.insert(offset + size, len - size);
            self.runs.insert((len - size, seq, offset + size));
        }
        chunk.allocations += 1;
        chunk.high_water = chunk.high_water.max(offset + size);

        let ptr = unsafe { NonNull::new_unchecked(chunk.base.as_ptr().add(offset)) };
        self.blocks.insert(
            ptr.as_ptr() as usize,
            Block {
                chunk: seq,
                offset,
                size,
            },
        );
        Some(ptr)
    }

    // Mark a block free and merge it with any free neighbours.
    fn give_back(&mut self, addr: usize) -> Option<Block> {
        let block = *self.blocks.get(&addr)?;
        let chunk = self.chunks.get_mut(&block.chunk)?;
        self.blocks.remove(&addr);
        chunk.allocations -= 1;

        let mut start = block.offset;
        let mut len = block.size;

        let before = chunk
            .free
            .range(..start)
            .next_back()
            .map(|(&offset, &size)| (offset, size));
        if let Some((prev_offset, prev_len)) = before {
            debug_assert!(prev_offset + prev_len <= start, "overlapping free runs");
            if prev_offset + prev_len == start {
                chunk.free.remove(&prev_offset);
                self.runs.remove(&(prev_len, block.chunk, prev_offset));
                start = prev_offset;
                len += prev_len;
            }
        }

        let after = block.offset + block.size;
        if let Some(next_len) = chunk.free.remove(&after) {
            self.runs.remove(&(next_len, block.chunk, after));
            len += next_len;
        }

        chunk.free.insert(start, len);
        self.runs.insert((len, block.chunk, start));
        Some(block)
    }

    // The live block containing [addr, addr + len).
    fn containing(&self, addr: usize, len: usize) -> Option<(usize, Block)> {
        let (&start, &block) = self.blocks.range(..=addr).next_back()?;
        if addr.checked_add(len)? <= start + block.size {
            Some((start, block))
        } else {
            None
        }
    }

    fn remove_chunk(&mut self, seq: u64) {
        if let Some(chunk) = self.chunks.remove(&seq) {
            self.bases.remove(&chunk.addr());
            for (&offset, &len) in &chunk.free {
                self.runs.remove(&(len, seq, offset));
            }
        }
    }
}

/// A free run, as reported by [`Pool::free_runs`](struct.Pool.html#method.free_runs).
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct FreeRun {
    /// Creation order of the chunk the run belongs to.
    pub chunk: u64,
    pub offset: usize,
    pub size: usize,
}

/// Validity counts every broken invariant found in a pool.
#[derive(Default, Debug)]
pub struct Validity {
    /// Free runs overlapping another free run. This indicates corruption.
    pub overlaps: usize,
    /// Free runs directly adjacent to each other, and not merged.
    pub adjacents: usize,
    /// Chunks whose free and live bytes don't add up to the chunk size.
    pub accounting: usize,
    /// Runs present in the chunks or the best-fit index, but not both.
    pub index: usize,
}

impl Validity {
    /// Returns a boolean - a simple check if all cases are 0
    pub fn is_valid(&self) -> bool {
        self.overlaps == 0 && self.adjacents == 0 && self.accounting == 0 && self.index == 0
    }
}

impl From<Validity> for bool {
    fn from(v: Validity) -> bool {
        v.is_valid()
    }
}

#[derive(Default, Debug, PartialEq, Eq)]
pub struct PoolStats {
    pub chunks: usize,
    pub chunk_bytes: usize,
    pub free_runs: usize,
    pub free_bytes: usize,
    pub live_blocks: usize,
    pub live_bytes: usize,
}

/// A pool over a backing allocator.
///
/// `I` decides at build time whether [`Usage`] counters are kept; with
/// [`Untracked`](../strategy/struct.Untracked.html) none exist.
pub struct Pool<I = Introspected> {
    name: String,
    id: usize,
    config: PoolConfig,
    backing: Arc<dyn AllocationStrategy>,
    state: Mutex<PoolState<I>>,
}

impl<I: Introspection> Pool<I> {
    pub fn new<S: Into<String>>(
        name: S,
        id: usize,
        backing: Arc<dyn AllocationStrategy>,
        config: PoolConfig,
    ) -> Self {
        Pool {
            name: name.into(),
            id,
            config,
            backing,
            state: Mutex::new(PoolState::new()),
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    pub fn backing(&self) -> &Arc<dyn AllocationStrategy> {
        &self.backing
    }

    pub fn chunk_count(&self) -> usize {
        self.state.lock().chunks.len()
    }

    /// All free runs, oldest chunk first, then by offset.
    pub fn free_runs(&self) -> Vec<FreeRun> {
        let state = self.state.lock();
        state
            .chunks
            .iter()
            .flat_map(|(&seq, chunk)| {
                chunk.free.iter().map(move |(&offset, &size)| FreeRun {
                    chunk: seq,
                    offset,
                    size,
                })
            })
            .collect()
    }

    /// Does `ptr` point anywhere inside one of this pool's chunks?
    pub fn owns(&self, ptr: NonNull<u8>) -> bool {
        let addr = ptr.as_ptr() as usize;
        let state = self.state.lock();
        match state.bases.range(..=addr).next_back() {
            Some((&base, seq)) => state
                .chunks
                .get(seq)
                .map_or(false, |chunk| addr < base + chunk.size),
            None => false,
        }
    }

    /// Highest end offset ever handed out from each chunk, oldest first.
    pub fn high_water_marks(&self) -> Vec<usize> {
        let state = self.state.lock();
        state.chunks.values().map(|c| c.high_water).collect()
    }

    /// Check the pool's invariants, and count what it holds.
    pub fn validate(&self) -> (Validity, PoolStats) {
        let state = self.state.lock();
        let mut validity = Validity::default();
        let mut stats = PoolStats::default();

        let mut live_per_chunk: HashMap<u64, (usize, usize)> = HashMap::new();
        for block in state.blocks.values() {
            let entry = live_per_chunk.entry(block.chunk).or_insert((0, 0));
            entry.0 += 1;
            entry.1 += block.size;
        }

        for (&seq, chunk) in &state.chunks {
            let mut previous_end: Option<usize> = None;
            let mut free_bytes = 0;
            for (&offset, &len) in &chunk.free {
                match previous_end {
                    Some(end) if offset < end => validity.overlaps += 1,
                    Some(end) if offset == end => validity.adjacents += 1,
                    _ => {}
                }
                if !state.runs.contains(&(len, seq, offset)) {
                    validity.index += 1;
                }
                previous_end = Some(offset + len);
                free_bytes += len;
                stats.free_runs += 1;
            }

            let (live_blocks, live_bytes) = live_per_chunk.get(&seq).copied().unwrap_or((0, 0));
            if free_bytes + live_bytes != chunk.size || live_blocks != chunk.allocations {
                validity.accounting += 1;
            }

            stats.chunks += 1;
            stats.chunk_bytes += chunk.size;
            stats.free_bytes += free_bytes;
        }

        if state.runs.len() != stats.free_runs {
            validity.index += 1;
        }
        stats.live_blocks = state.blocks.len();
        stats.live_bytes = live_per_chunk.values().map(|&(_, bytes)| bytes).sum();

        (validity, stats)
    }

    // Add a chunk able to hold `size` bytes, and return its one free run.
    fn grow(
        &self,
        state: &mut PoolState<I>,
        size: usize,
        requested: usize,
    ) -> Result<(usize, u64, usize)> {
        let first = state.next_chunk == 0;
        let chunk_size = self
            .config
            .chunk_size(size, first)
            .ok_or_else(|| Error::allocation_failure(self.name.as_str(), requested))?;

        // Nothing in the pool changes until the backing allocator succeeds.
        let base = self.backing.allocate(chunk_size).map_err(|e| {
            debug!("{}: growing by {} bytes failed: {}", self.name, chunk_size, e);
            Error::allocation_failure(self.name.as_str(), requested)
        })?;

        let seq = state.add_chunk(base, chunk_size);
        debug!(
            "{}: added chunk {} of {} bytes at {:?} from {}",
            self.name,
            seq,
            chunk_size,
            base,
            self.backing.name()
        );
        Ok((chunk_size, seq, 0))
    }
}

impl<I: Introspection> AllocationStrategy for Pool<I> {
    fn name(&self) -> &str {
        &self.name
    }

    fn id(&self) -> usize {
        self.id
    }

    fn traits(&self) -> MemoryResourceTraits {
        self.backing.traits()
    }

    fn allocate(&self, bytes: usize) -> Result<NonNull<u8>> {
        let size = aligned_size(bytes)
            .ok_or_else(|| Error::allocation_failure(self.name.as_str(), bytes))?;

        let mut state = self.state.lock();
        let run = match state.best_fit(size) {
            Some(run) => run,
            None => self.grow(&mut state, size, bytes)?,
        };

        let ptr = state
            .take(run, size)
            .ok_or_else(|| Error::allocation_failure(self.name.as_str(), bytes))?;
        state.introspection.record_allocate(size);
        trace!("{}: allocated {} bytes at {:?}", self.name, size, ptr);
        Ok(ptr)
    }

    fn reallocate(&self, ptr: NonNull<u8>, bytes: usize) -> Result<NonNull<u8>> {
        let addr = ptr.as_ptr() as usize;
        let old_size = match self.state.lock().blocks.get(&addr) {
            Some(block) => block.size,
            None => return Err(Error::invalid_pointer(self.name.as_str(), addr)),
        };
        if aligned_size(bytes) == Some(old_size) {
            return Ok(ptr);
        }

        let new_ptr = self.allocate(bytes)?;
        unsafe {
            core::ptr::copy_nonoverlapping(ptr.as_ptr(), new_ptr.as_ptr(), old_size.min(bytes));
        }
        self.deallocate(ptr)?;
        Ok(new_ptr)
    }

    fn deallocate(&self, ptr: NonNull<u8>) -> Result<()> {
        let addr = ptr.as_ptr() as usize;
        let mut state = self.state.lock();
        let block = state
            .give_back(addr)
            .ok_or_else(|| Error::invalid_pointer(self.name.as_str(), addr))?;
        state.introspection.record_deallocate(block.size);
        trace!("{}: freed {} bytes at {:?}", self.name, block.size, ptr);
        Ok(())
    }

    fn release(&self) -> Result<()> {
        let mut state = self.state.lock();
        let idle: Vec<(u64, NonNull<u8>)> = state
            .chunks
            .iter()
            .filter(|(_, chunk)| chunk.is_free())
            .map(|(&seq, chunk)| (seq, chunk.base))
            .collect();

        for (seq, base) in idle {
            // Stop at the first failure; every chunk not yet returned is
            // still fully registered.
            self.backing.deallocate(base)?;
            state.remove_chunk(seq);
            debug!("{}: released chunk {} at {:?}", self.name, seq, base);
        }
        Ok(())
    }

    fn memset(&self, ptr: NonNull<u8>, value: u8, bytes: usize) -> Result<()> {
        let addr = ptr.as_ptr() as usize;
        let state = self.state.lock();
        match state.containing(addr, bytes) {
            Some(_) => self.backing.memset(ptr, value, bytes),
            None => Err(Error::invalid_pointer(self.name.as_str(), addr)),
        }
    }

    fn size_of(&self, ptr: NonNull<u8>) -> Option<usize> {
        let state = self.state.lock();
        state
            .blocks
            .get(&(ptr.as_ptr() as usize))
            .map(|block| block.size)
    }

    fn usage(&self) -> Option<Usage> {
        self.state.lock().introspection.usage()
    }

    fn actual_size(&self) -> usize {
        self.state.lock().chunks.values().map(|c| c.size).sum()
    }
}

impl<I: Introspection> Strategy for Pool<I> {
    type Config = PoolConfig;

    fn build(name: &str, id: usize, backing: &Allocator, config: PoolConfig) -> Result<Self> {
        Ok(Pool::new(name, id, backing.strategy().clone(), config))
    }
}

impl<I> Drop for Pool<I> {
    fn drop(&mut self) {
        let state = self.state.lock();
        if !state.blocks.is_empty() {
            warn!(
                "{}: dropped with {} live blocks",
                self.name,
                state.blocks.len()
            );
        }
        for chunk in state.chunks.values() {
            if let Err(e) = self.backing.deallocate(chunk.base) {
                warn!("{}: could not return chunk {:?}: {}", self.name, chunk.base, e);
            }
        }
    }
}

impl<I> fmt::Display for Pool<I> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        write!(f, "Pool({}", self.name)?;
        for (seq, chunk) in &state.chunks {
            write!(f, ", Chunk({}, {:?}, {}: ", seq, chunk.base, chunk.size)?;
            let mut start = true;
            for (offset, len) in &chunk.free {
                if !start {
                    write!(f, " ")?;
                } else {
                    start = false;
                }
                write!(f, "[{}+{}]", offset, len)?;
            }
            write!(f, ")")?;
        }
        write!(f, ")")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::alloc::{HostAllocator, MappedAllocator};
    use crate::platform::ResourceKind;
    use crate::resource::MemoryResource;
    use crate::strategy::Untracked;

    use test_env_log::test;

    fn host() -> Arc<dyn AllocationStrategy> {
        Arc::new(MemoryResource::new(
            "HOST",
            0,
            MemoryResourceTraits::new(ResourceKind::Host, 0),
            HostAllocator,
        ))
    }

    fn small_config() -> PoolConfig {
        PoolConfig {
            initial_size: 1024,
            min_grow_size: 1024,
            granularity: 256,
        }
    }

    fn assert_valid<I: Introspection>(pool: &Pool<I>) -> PoolStats {
        let (validity, stats) = pool.validate();
        log::info!("{}", pool);
        assert!(validity.is_valid(), "{:?}", validity);
        stats
    }

    fn offset_of(pool: &Pool, ptr: NonNull<u8>) -> usize {
        let state = pool.state.lock();
        state.blocks[&(ptr.as_ptr() as usize)].offset
    }

    #[test]
    fn test_chunk_size() {
        let config = small_config();
        assert_eq!(config.chunk_size(16, true), Some(1024));
        assert_eq!(config.chunk_size(1024, false), Some(1024));
        assert_eq!(config.chunk_size(1025, false), Some(1280));
        assert_eq!(config.chunk_size(usize::MAX - 8, false), None);
    }

    #[test]
    fn test_split_and_coalesce() {
        let pool: Pool = Pool::new("pool", 1, host(), small_config());

        let a = pool.allocate(100).unwrap();
        let b = pool.allocate(100).unwrap();
        let c = pool.allocate(100).unwrap();
        assert_eq!(offset_of(&pool, a), 0);
        assert_eq!(offset_of(&pool, b), 112);
        assert_eq!(offset_of(&pool, c), 224);
        assert_eq!(pool.size_of(b), Some(112));

        let stats = assert_valid(&pool);
        assert_eq!(stats.live_bytes, 336);
        assert_eq!(stats.free_runs, 1);

        pool.deallocate(a).unwrap();
        pool.deallocate(c).unwrap();
        assert_valid(&pool);
        assert_eq!(
            pool.free_runs(),
            vec![
                FreeRun {
                    chunk: 0,
                    offset: 0,
                    size: 112
                },
                FreeRun {
                    chunk: 0,
                    offset: 224,
                    size: 800
                },
            ]
        );

        // Freeing the middle block merges everything back into one run.
        pool.deallocate(b).unwrap();
        let stats = assert_valid(&pool);
        assert_eq!(stats.free_runs, 1);
        assert_eq!(stats.free_bytes, 1024);
        assert_eq!(pool.high_water_marks(), vec![336]);
    }

    #[test]
    fn test_coalescing_matches_single_allocation() {
        let shape_after = |first_then_second: bool| {
            let pool: Pool = Pool::new("pool", 1, host(), small_config());
            let keep = pool.allocate(64).unwrap();
            let a = pool.allocate(48).unwrap();
            let b = pool.allocate(80).unwrap();
            let tail = pool.allocate(32).unwrap();
            if first_then_second {
                pool.deallocate(a).unwrap();
                pool.deallocate(b).unwrap();
            } else {
                pool.deallocate(b).unwrap();
                pool.deallocate(a).unwrap();
            }
            let runs = pool.free_runs();
            pool.deallocate(keep).unwrap();
            pool.deallocate(tail).unwrap();
            runs
        };

        let combined = {
            let pool: Pool = Pool::new("pool", 1, host(), small_config());
            let keep = pool.allocate(64).unwrap();
            let ab = pool.allocate(128).unwrap();
            let tail = pool.allocate(32).unwrap();
            pool.deallocate(ab).unwrap();
            let runs = pool.free_runs();
            pool.deallocate(keep).unwrap();
            pool.deallocate(tail).unwrap();
            runs
        };

        assert_eq!(shape_after(true), combined);
        assert_eq!(shape_after(false), combined);
    }

    #[test]
    fn test_best_fit_prefers_smallest_then_oldest() {
        let pool: Pool = Pool::new("pool", 1, host(), small_config());

        // Chunk 0: [a 64][x 960]; chunk 1: [b 64][y 960]
        let a = pool.allocate(64).unwrap();
        let x = pool.allocate(960).unwrap();
        let b = pool.allocate(64).unwrap();
        let y = pool.allocate(960).unwrap();
        assert_eq!(pool.chunk_count(), 2);

        // Two equal 64-byte holes, one in each chunk, plus a bigger one.
        pool.deallocate(b).unwrap();
        pool.deallocate(a).unwrap();
        pool.deallocate(y).unwrap();

        // y's run merged with b's into one 1024-byte run, so a's 64 bytes are
        // the smallest fit.
        let p = pool.allocate(48).unwrap();
        assert_eq!(p, a);

        pool.deallocate(p).unwrap();
        // The merged run in chunk 1 starts where `b` was.
        let q = pool.allocate(960).unwrap();
        assert_eq!(q, b);
        let r = pool.allocate(64).unwrap();
        // Equal 64-byte runs in chunk 0 and chunk 1: the oldest chunk wins.
        assert_eq!(r, a);

        for ptr in [x, q, r].iter() {
            pool.deallocate(*ptr).unwrap();
        }
        assert_valid(&pool);
    }

    #[test]
    fn test_growth_uses_initial_then_minimum() {
        let config = PoolConfig {
            initial_size: 4096,
            min_grow_size: 1024,
            granularity: 512,
        };
        let pool: Pool = Pool::new("pool", 1, host(), config);

        let a = pool.allocate(4000).unwrap();
        let b = pool.allocate(200).unwrap();
        let c = pool.allocate(1500).unwrap();

        let stats = assert_valid(&pool);
        assert_eq!(stats.chunks, 3);
        assert_eq!(stats.chunk_bytes, 4096 + 1024 + 1536);
        assert_eq!(pool.actual_size(), 4096 + 1024 + 1536);

        for ptr in [a, b, c].iter() {
            pool.deallocate(*ptr).unwrap();
        }
    }

    #[test]
    fn test_round_trip_keeps_shape() {
        let pool: Pool = Pool::new("pool", 1, host(), small_config());
        let keep = pool.allocate(200).unwrap();
        let before = pool.free_runs();

        for &size in [1usize, 16, 17, 300, 816].iter() {
            let ptr = pool.allocate(size).unwrap();
            pool.deallocate(ptr).unwrap();
            assert_eq!(pool.free_runs(), before);
        }
        pool.deallocate(keep).unwrap();
    }

    #[test]
    fn test_release_is_idempotent() {
        let pool: Pool = Pool::new("pool", 1, host(), small_config());
        let a = pool.allocate(1000).unwrap();
        let b = pool.allocate(1000).unwrap();
        assert_eq!(pool.chunk_count(), 2);

        pool.deallocate(b).unwrap();
        pool.release().unwrap();
        // The chunk holding `a` stays.
        assert_eq!(pool.chunk_count(), 1);
        assert_eq!(pool.backing().actual_size(), 1024);

        pool.deallocate(a).unwrap();
        pool.release().unwrap();
        pool.release().unwrap();
        assert_eq!(pool.chunk_count(), 0);
        assert_eq!(pool.backing().actual_size(), 0);
        assert_valid(&pool);
    }

    #[test]
    fn test_failed_growth_changes_nothing() {
        let page = sysconf::page::pagesize();
        let device: Arc<dyn AllocationStrategy> = Arc::new(MemoryResource::new(
            "DEVICE::0",
            0,
            MemoryResourceTraits::new(ResourceKind::Device, 0),
            MappedAllocator::device(2 * page),
        ));
        let config = PoolConfig {
            initial_size: page,
            min_grow_size: page,
            granularity: page,
        };
        let pool: Pool = Pool::new("device-pool", 1, device, config);

        let a = pool.allocate(page).unwrap();
        let before = pool.free_runs();
        match pool.allocate(4 * page) {
            Err(Error::AllocationFailure { allocator, size }) => {
                assert_eq!(allocator, "device-pool");
                assert_eq!(size, 4 * page);
            }
            other => panic!("expected AllocationFailure, got {:?}", other),
        }
        assert_eq!(pool.free_runs(), before);
        assert_eq!(pool.chunk_count(), 1);
        assert_valid(&pool);

        // The budget still has room for a chunk of the minimum size.
        let b = pool.allocate(16).unwrap();
        assert_eq!(pool.chunk_count(), 2);
        pool.deallocate(a).unwrap();
        pool.deallocate(b).unwrap();
    }

    #[test]
    fn test_foreign_pointer() {
        let pool: Pool = Pool::new("pool", 1, host(), small_config());
        let a = pool.allocate(64).unwrap();
        let inside = unsafe { NonNull::new_unchecked(a.as_ptr().add(16)) };
        match pool.deallocate(inside) {
            Err(Error::InvalidPointer { allocator, .. }) => assert_eq!(allocator, "pool"),
            other => panic!("expected InvalidPointer, got {:?}", other),
        }
        pool.deallocate(a).unwrap();
        assert!(pool.deallocate(a).is_err());

        // Freed, but still inside the pool's memory.
        assert!(pool.owns(inside));
        let mut local = 0u8;
        assert!(!pool.owns(NonNull::from(&mut local)));
    }

    #[test]
    fn test_memset_and_reallocate() {
        let pool: Pool = Pool::new("pool", 1, host(), small_config());
        let a = pool.allocate(32).unwrap();
        pool.memset(a, 0x5a, 32).unwrap();
        assert!(pool.memset(a, 0x5a, 33).is_err());

        let b = pool.reallocate(a, 128).unwrap();
        assert_ne!(a, b);
        let bytes = unsafe { core::slice::from_raw_parts(b.as_ptr(), 32) };
        assert!(bytes.iter().all(|&x| x == 0x5a));
        assert_eq!(pool.size_of(a), None);
        assert_eq!(pool.size_of(b), Some(128));

        let zeroed = pool.allocate_zeroed(64).unwrap();
        let bytes = unsafe { core::slice::from_raw_parts(zeroed.as_ptr(), 64) };
        assert!(bytes.iter().all(|&x| x == 0));

        pool.deallocate(b).unwrap();
        pool.deallocate(zeroed).unwrap();
        assert_valid(&pool);
    }

    #[test]
    fn test_introspection() {
        let tracked: Pool<Introspected> = Pool::new("tracked", 1, host(), small_config());
        let a = tracked.allocate(100).unwrap();
        let b = tracked.allocate(20).unwrap();
        tracked.deallocate(a).unwrap();
        let usage = tracked.usage().unwrap();
        assert_eq!(usage.current_size, 32);
        assert_eq!(usage.high_watermark, 144);
        assert_eq!(usage.allocation_count, 2);
        tracked.deallocate(b).unwrap();

        let untracked: Pool<Untracked> = Pool::new("untracked", 2, host(), small_config());
        let c = untracked.allocate(100).unwrap();
        assert_eq!(untracked.usage(), None);
        untracked.deallocate(c).unwrap();
        assert!(
            core::mem::size_of::<PoolState<Untracked>>()
                < core::mem::size_of::<PoolState<Introspected>>()
        );
    }

    #[test]
    fn test_drop_returns_chunks() {
        let backing = host();
        {
            let pool: Pool = Pool::new("pool", 1, backing.clone(), small_config());
            let _a = pool.allocate(2000).unwrap();
            assert_eq!(backing.actual_size(), 2048);
        }
        assert_eq!(backing.actual_size(), 0);
    }
}
