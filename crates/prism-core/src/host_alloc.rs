//! Recycling, page-aligned host allocator.
//!
//! Buffers are rounded up to a bucket size and returned to the owning
//! allocator when dropped, so a pipeline that keeps allocating frames of the
//! same geometry stops touching the system allocator after warm-up.

use std::alloc::{self, Layout};
use std::collections::HashMap;
use std::fmt;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::{info, warn};

use crate::error::{PrismError, Result};
use crate::types::MemoryType;

/// Alignment of every host block; matches the page size DMA importers expect.
pub const HOST_ALIGNMENT: usize = 4096;

const BUCKET_ALIGNMENT: usize = 2 * 1024 * 1024;
const MAX_PER_BUCKET: usize = 32;

// ─── Raw block ──────────────────────────────────────────────────────────────

/// One page-aligned allocation.  Freed on drop.
struct Block {
    ptr: NonNull<u8>,
    size: usize,
}

impl Block {
    fn allocate(size: usize) -> Result<Self> {
        let layout = Layout::from_size_align(size, HOST_ALIGNMENT).map_err(|err| {
            PrismError::InvalidArgument(format!("host allocation of {size} bytes: {err}"))
        })?;
        // SAFETY: `size` is a bucket size and therefore non-zero.
        let raw = unsafe { alloc::alloc_zeroed(layout) };
        let ptr = NonNull::new(raw).ok_or(PrismError::BackendFailure {
            backend: MemoryType::Cpu,
            call: "alloc",
            status: -12,
        })?;
        Ok(Self { ptr, size })
    }
}

impl Drop for Block {
    fn drop(&mut self) {
        // SAFETY: allocated in `Block::allocate` with this exact layout.
        unsafe {
            alloc::dealloc(
                self.ptr.as_ptr(),
                Layout::from_size_align_unchecked(self.size, HOST_ALIGNMENT),
            );
        }
    }
}

// SAFETY: a block is plain memory owned by exactly one `Block`.
unsafe impl Send for Block {}
unsafe impl Sync for Block {}

// ─── Pool statistics ────────────────────────────────────────────────────────

/// Lock-free allocator counters.
#[derive(Default)]
pub struct PoolStats {
    pub hits: AtomicU64,
    pub misses: AtomicU64,
    pub recycled: AtomicU64,
    pub overflows: AtomicU64,
}

impl PoolStats {
    /// Hit rate as a percentage (0.0–100.0).
    pub fn hit_rate(&self) -> f64 {
        let h = self.hits.load(Ordering::Relaxed) as f64;
        let m = self.misses.load(Ordering::Relaxed) as f64;
        let total = h + m;
        if total == 0.0 {
            0.0
        } else {
            (h / total) * 100.0
        }
    }
}

// ─── Allocation policy ──────────────────────────────────────────────────────

/// Tracks warm-up vs steady-state allocation mode.
#[derive(Default)]
pub struct AllocPolicy {
    steady: AtomicBool,
}

impl AllocPolicy {
    pub fn enter_steady_state(&self) {
        self.steady.store(true, Ordering::Release);
        info!("Host allocator entered steady state, pool misses are now warnings");
    }

    pub fn reset(&self) {
        self.steady.store(false, Ordering::Release);
    }

    #[inline]
    pub fn is_steady_state(&self) -> bool {
        self.steady.load(Ordering::Acquire)
    }
}

// ─── Bucketed pool ──────────────────────────────────────────────────────────

#[derive(Default)]
struct BucketedPool {
    buckets: HashMap<usize, Vec<Block>>,
}

impl BucketedPool {
    fn take(&mut self, bucket_size: usize) -> Option<Block> {
        let stack = self.buckets.get_mut(&bucket_size)?;
        let block = stack.pop()?;
        if stack.is_empty() {
            self.buckets.remove(&bucket_size);
        }
        Some(block)
    }

    fn put(&mut self, block: Block) -> Option<Block> {
        let stack = self.buckets.entry(block.size).or_default();
        if stack.len() >= MAX_PER_BUCKET {
            return Some(block);
        }
        stack.push(block);
        None
    }

    fn total_buffers(&self) -> usize {
        self.buckets.values().map(Vec::len).sum()
    }

    fn total_bytes(&self) -> usize {
        self.buckets
            .iter()
            .map(|(size, stack)| size * stack.len())
            .sum()
    }

    fn bucket_count(&self) -> usize {
        self.buckets.len()
    }
}

#[inline]
fn bucket_for(size: usize) -> usize {
    if size == 0 {
        return HOST_ALIGNMENT;
    }
    if size < BUCKET_ALIGNMENT {
        size.max(HOST_ALIGNMENT).next_power_of_two()
    } else {
        (size + BUCKET_ALIGNMENT - 1) & !(BUCKET_ALIGNMENT - 1)
    }
}

// ─── Allocator ──────────────────────────────────────────────────────────────

struct Shared {
    pool: Mutex<BucketedPool>,
    stats: PoolStats,
    policy: AllocPolicy,
    live_bytes: AtomicUsize,
}

impl Shared {
    fn recycle(&self, block: Block) {
        let size = block.size;
        if let Some(rejected) = self.pool.lock().put(block) {
            self.stats.overflows.fetch_add(1, Ordering::Relaxed);
            self.live_bytes.fetch_sub(size, Ordering::Relaxed);
            drop(rejected);
        } else {
            self.stats.recycled.fetch_add(1, Ordering::Relaxed);
        }
    }
}

/// Cloneable handle to a recycling host allocator.
#[derive(Clone)]
pub struct HostAllocator {
    shared: Arc<Shared>,
}

impl Default for HostAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl HostAllocator {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                pool: Mutex::new(BucketedPool::default()),
                stats: PoolStats::default(),
                policy: AllocPolicy::default(),
                live_bytes: AtomicUsize::new(0),
            }),
        }
    }

    /// Allocate at least `size` zero-initialized bytes (recycled buffers keep
    /// their previous contents).
    pub fn alloc(&self, size: usize) -> Result<HostBuffer> {
        let bucket_size = bucket_for(size);
        let shared = &self.shared;

        let pooled = shared.pool.lock().take(bucket_size);
        let block = match pooled {
            Some(block) => {
                shared.stats.hits.fetch_add(1, Ordering::Relaxed);
                block
            }
            None => {
                shared.stats.misses.fetch_add(1, Ordering::Relaxed);
                if shared.policy.is_steady_state() {
                    warn!(
                        requested = size,
                        bucket = bucket_size,
                        "Host pool miss in steady state"
                    );
                }
                let block = Block::allocate(bucket_size)?;
                shared.live_bytes.fetch_add(bucket_size, Ordering::Relaxed);
                block
            }
        };

        Ok(HostBuffer {
            block: Some(block),
            len: size,
            home: Arc::downgrade(shared),
        })
    }

    pub fn stats(&self) -> &PoolStats {
        &self.shared.stats
    }

    pub fn policy(&self) -> &AllocPolicy {
        &self.shared.policy
    }

    /// Bytes currently owned by the allocator, pooled or handed out.
    pub fn live_bytes(&self) -> usize {
        self.shared.live_bytes.load(Ordering::Relaxed)
    }

    pub fn pooled_buffers(&self) -> usize {
        self.shared.pool.lock().total_buffers()
    }

    /// Report pool statistics.
    pub fn report(&self) {
        let stats = &self.shared.stats;
        let pool = self.shared.pool.lock();
        info!(
            hits = stats.hits.load(Ordering::Relaxed),
            misses = stats.misses.load(Ordering::Relaxed),
            recycled = stats.recycled.load(Ordering::Relaxed),
            overflows = stats.overflows.load(Ordering::Relaxed),
            total_pooled = pool.total_buffers(),
            pooled_bytes_kb = pool.total_bytes() / 1024,
            buckets = pool.bucket_count(),
            live_bytes_kb = self.live_bytes() / 1024,
            "Host pool report"
        );
    }
}

impl fmt::Debug for HostAllocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostAllocator")
            .field("live_bytes", &self.live_bytes())
            .field("hit_rate", &self.shared.stats.hit_rate())
            .finish()
    }
}

// ─── Buffer ─────────────────────────────────────────────────────────────────

/// Host memory handed out by a [`HostAllocator`].  Returns to its allocator
/// on drop, or to the system if the allocator is gone.
pub struct HostBuffer {
    block: Option<Block>,
    len: usize,
    home: Weak<Shared>,
}

impl HostBuffer {
    /// Requested length in bytes.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Bucket size actually reserved.
    pub fn capacity(&self) -> usize {
        self.block.as_ref().map_or(0, |block| block.size)
    }

    pub fn as_ptr(&self) -> *mut u8 {
        self.block
            .as_ref()
            .map_or(std::ptr::null_mut(), |block| block.ptr.as_ptr())
    }

    pub fn as_slice(&self) -> &[u8] {
        match &self.block {
            // SAFETY: the block is at least `len` bytes and initialized.
            Some(block) => unsafe { std::slice::from_raw_parts(block.ptr.as_ptr(), self.len) },
            None => &[],
        }
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        match &mut self.block {
            // SAFETY: exclusive borrow of the owning buffer.
            Some(block) => unsafe { std::slice::from_raw_parts_mut(block.ptr.as_ptr(), self.len) },
            None => &mut [],
        }
    }
}

impl Drop for HostBuffer {
    fn drop(&mut self) {
        let Some(block) = self.block.take() else {
            return;
        };
        match self.home.upgrade() {
            Some(shared) => shared.recycle(block),
            None => drop(block),
        }
    }
}

impl fmt::Debug for HostBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostBuffer")
            .field("ptr", &self.as_ptr())
            .field("len", &self.len)
            .field("capacity", &self.capacity())
            .finish()
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bucket_sizing_small() {
        assert_eq!(bucket_for(1), 4096);
        assert_eq!(bucket_for(4096), 4096);
        assert_eq!(bucket_for(4097), 8192);
        assert_eq!(bucket_for(1_000_000), 1_048_576);
    }

    #[test]
    fn bucket_sizing_large() {
        let two_mb = 2 * 1024 * 1024;
        assert_eq!(bucket_for(two_mb), two_mb);
        assert_eq!(bucket_for(two_mb + 1), two_mb * 2);
        assert_eq!(bucket_for(5_000_000), 3 * two_mb);
    }

    #[test]
    fn bucket_sizing_zero() {
        assert!(bucket_for(0) > 0);
    }

    #[test]
    fn buffers_are_page_aligned_and_zeroed() {
        let allocator = HostAllocator::new();
        let buf = allocator.alloc(100).unwrap();
        assert_eq!(buf.as_ptr() as usize % HOST_ALIGNMENT, 0);
        assert_eq!(buf.len(), 100);
        assert_eq!(buf.capacity(), 4096);
        assert!(buf.as_slice().iter().all(|&b| b == 0));
    }

    #[test]
    fn dropped_buffers_are_reused() {
        let allocator = HostAllocator::new();
        let first = allocator.alloc(3000).unwrap();
        let addr = first.as_ptr();
        drop(first);
        assert_eq!(allocator.pooled_buffers(), 1);

        let second = allocator.alloc(4000).unwrap();
        assert_eq!(second.as_ptr(), addr);
        assert_eq!(allocator.stats().hits.load(Ordering::Relaxed), 1);
        assert_eq!(allocator.stats().misses.load(Ordering::Relaxed), 1);
        assert_eq!(allocator.stats().recycled.load(Ordering::Relaxed), 1);
        assert!((allocator.stats().hit_rate() - 50.0).abs() < f64::EPSILON);
    }

    #[test]
    fn overflowing_bucket_releases_memory() {
        let allocator = HostAllocator::new();
        let buffers: Vec<_> = (0..MAX_PER_BUCKET + 2)
            .map(|_| allocator.alloc(10).unwrap())
            .collect();
        assert_eq!(allocator.live_bytes(), (MAX_PER_BUCKET + 2) * 4096);
        drop(buffers);
        assert_eq!(allocator.pooled_buffers(), MAX_PER_BUCKET);
        assert_eq!(allocator.stats().overflows.load(Ordering::Relaxed), 2);
        assert_eq!(allocator.live_bytes(), MAX_PER_BUCKET * 4096);
    }

    #[test]
    fn buffer_outlives_allocator() {
        let allocator = HostAllocator::new();
        let mut buf = allocator.alloc(16).unwrap();
        drop(allocator);
        buf.as_mut_slice()[0] = 7;
        assert_eq!(buf.as_slice()[0], 7);
    }
}
