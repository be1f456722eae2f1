//! Times filling a pool with fixed-size blocks against doing the same with
//! `malloc`, with and without zeroing each block.
//!
//! Run with `RUST_LOG=debug` to see the pool grow and release.

use std::time::{Duration, Instant};

use memspace::{Introspected, Pool, PoolConfig, ResourceManager, Strategy, Untracked};

const KIB: usize = 1 << 10;
const MIB: usize = 1 << 20;

fn time_malloc(pool_size: usize, block_size: usize, zero: bool) -> Duration {
    let count = pool_size / block_size;
    let mut pointers = Vec::with_capacity(count);

    let start = Instant::now();
    for _ in 0..count {
        let ptr = unsafe { libc::malloc(block_size) };
        assert!(!ptr.is_null(), "malloc failed");
        if zero {
            unsafe { libc::memset(ptr, 0, block_size) };
        }
        pointers.push(ptr);
    }
    let elapsed = start.elapsed();

    for ptr in pointers {
        unsafe { libc::free(ptr) };
    }
    elapsed
}

fn time_pool<S: Strategy<Config = PoolConfig>>(
    rm: &ResourceManager,
    name: &str,
    pool_size: usize,
    block_size: usize,
    zero: bool,
) -> memspace::Result<Duration> {
    let host = rm.get_allocator("HOST")?;
    let config = PoolConfig {
        initial_size: pool_size,
        ..PoolConfig::default()
    };
    let pool = rm.make_allocator::<S>(name, &host, config)?;
    let count = pool_size / block_size;
    let mut pointers = Vec::with_capacity(count);

    let start = Instant::now();
    for _ in 0..count {
        let ptr = pool.allocate(block_size)?;
        if zero {
            rm.memset(ptr, 0, block_size)?;
        }
        pointers.push(ptr);
    }
    let elapsed = start.elapsed();

    for ptr in pointers {
        pool.deallocate(ptr)?;
    }
    pool.release()?;
    Ok(elapsed)
}

fn main() -> memspace::Result<()> {
    env_logger::init();

    let rm = ResourceManager::new();
    for &pool_size in [64 * MIB, 256 * MIB].iter() {
        for &block_size in [KIB, 64 * KIB].iter() {
            for &zero in [false, true].iter() {
                let label = format!("{}MiB/{}KiB/zero={}", pool_size / MIB, block_size / KIB, zero);
                let malloc = time_malloc(pool_size, block_size, zero);
                let tracked = time_pool::<Pool<Introspected>>(
                    &rm,
                    &format!("tracked-{}", label),
                    pool_size,
                    block_size,
                    zero,
                )?;
                let untracked = time_pool::<Pool<Untracked>>(
                    &rm,
                    &format!("untracked-{}", label),
                    pool_size,
                    block_size,
                    zero,
                )?;
                println!(
                    "{:<28} malloc {:>10.3?}  pool {:>10.3?}  pool (untracked) {:>10.3?}",
                    label, malloc, tracked, untracked
                );
            }
        }
    }
    Ok(())
}
