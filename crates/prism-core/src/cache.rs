//! Memoizing mapper for fixed pools of recurring source buffers.
//!
//! # Pool contract
//!
//! The cache keys destinations by the source's primary native handle and the
//! access mode they were mapped with, so a destination mapped for reading is
//! never handed out for writing.  It is only sound when a given handle always
//! denotes the same physical memory, i.e. the sources come from a fixed pool
//! (a decoder's surface pool) and never from one-off allocations.
//!
//! A cached destination is reissued for every later source with the same
//! handle.  On reissue its metadata, regions and parent link are cleared so
//! nothing from the previous logical frame leaks into the next one.  Callers
//! must release a destination before its source handle recurs; under
//! [`PoolPolicy::Strict`] reissuing a destination that is still referenced
//! outside the cache fails with [`PrismError::PoolContractViolation`].
//!
//! Destinations are not lifetime-extended by their sources: the parent link
//! is cleared on insertion as well.  Every backend mapper therefore makes its
//! destination own the memory it points into, so a cached destination stays
//! valid after its source and the source's pool are gone.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::config::PoolPolicy;
use crate::context::Context;
use crate::error::{PrismError, Result};
use crate::frame::Frame;
use crate::mapper::MemoryMapper;
use crate::tensor::Tensor;
use crate::types::{AccessMode, Handle};

type Slot<T> = Arc<Mutex<Option<Arc<T>>>>;
type Slots<T> = Mutex<HashMap<(Handle, AccessMode), Slot<T>>>;

/// Snapshot of cache counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
}

impl CacheStats {
    /// Hit rate as a percentage (0.0–100.0).
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64 * 100.0
        }
    }
}

pub struct MemoryMapperCache {
    mapper: Arc<dyn MemoryMapper>,
    policy: PoolPolicy,
    tensors: Slots<Tensor>,
    frames: Slots<Frame>,
    hits: AtomicU64,
    misses: AtomicU64,
    name: String,
}

impl MemoryMapperCache {
    pub fn new(mapper: Arc<dyn MemoryMapper>, policy: PoolPolicy) -> Self {
        let name = format!("cache({})", mapper.name());
        Self {
            mapper,
            policy,
            tensors: Mutex::new(HashMap::new()),
            frames: Mutex::new(HashMap::new()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            name,
        }
    }

    /// The wrapped mapper.
    pub fn inner(&self) -> &Arc<dyn MemoryMapper> {
        &self.mapper
    }

    #[inline]
    pub fn policy(&self) -> PoolPolicy {
        self.policy
    }

    /// Drop the cached destinations for `handle`, whatever mode they were
    /// mapped with.
    pub fn evict(&self, handle: Handle) -> bool {
        fn remove<T>(map: &Slots<T>, handle: Handle) -> bool {
            let mut map = map.lock();
            let before = map.len();
            map.retain(|(key, _), _| *key != handle);
            map.len() != before
        }
        let tensor = remove(&self.tensors, handle);
        let frame = remove(&self.frames, handle);
        tensor || frame
    }

    pub fn clear(&self) {
        self.tensors.lock().clear();
        self.frames.lock().clear();
    }

    /// Number of cached destinations (tensors and frames).
    pub fn len(&self) -> usize {
        fn filled<T>(map: &HashMap<(Handle, AccessMode), Slot<T>>) -> usize {
            map.values().filter(|slot| slot.lock().is_some()).count()
        }
        filled(&self.tensors.lock()) + filled(&self.frames.lock())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }

    /// Per-handle slot.  The map lock is only held for the lookup so
    /// distinct handles never wait on each other's mapping.
    fn slot<T>(map: &Slots<T>, handle: Handle, mode: AccessMode) -> Slot<T> {
        Arc::clone(map.lock().entry((handle, mode)).or_default())
    }

    fn check_reissue<T>(&self, cached: &Arc<T>, handle: Handle) -> Result<()> {
        let outstanding = Arc::strong_count(cached) - 1;
        if outstanding == 0 {
            return Ok(());
        }
        let memory_type = self.mapper.output_context().memory_type();
        match self.policy {
            PoolPolicy::Strict => Err(PrismError::PoolContractViolation {
                memory_type,
                handle,
                outstanding,
            }),
            PoolPolicy::Reissue => {
                warn!(
                    mapper = %self.name,
                    %memory_type,
                    handle,
                    outstanding,
                    "Reissuing cached destination that is still referenced"
                );
                Ok(())
            }
        }
    }
}

impl MemoryMapper for MemoryMapperCache {
    fn map_tensor(&self, src: &Arc<Tensor>, mode: AccessMode) -> Result<Arc<Tensor>> {
        let handle = src.handle("")?;
        let slot = Self::slot(&self.tensors, handle, mode);
        let mut slot = slot.lock();

        if let Some(cached) = slot.as_ref() {
            self.check_reissue(cached, handle)?;
            cached.clear_parent();
            self.hits.fetch_add(1, Ordering::Relaxed);
            debug!(mapper = %self.name, handle, ?mode, "Tensor cache hit");
            return Ok(Arc::clone(cached));
        }

        let dst = self.mapper.map_tensor(src, mode)?;
        dst.clear_parent();
        *slot = Some(Arc::clone(&dst));
        self.misses.fetch_add(1, Ordering::Relaxed);
        debug!(mapper = %self.name, handle, ?mode, "Tensor cache miss");
        Ok(dst)
    }

    fn map_frame(&self, src: &Arc<Frame>, mode: AccessMode) -> Result<Arc<Frame>> {
        let handle = src.tensor(0)?.handle("")?;
        let slot = Self::slot(&self.frames, handle, mode);
        let mut slot = slot.lock();

        if let Some(cached) = slot.as_ref() {
            self.check_reissue(cached, handle)?;
            cached.clear_metadata();
            cached.clear_regions();
            cached.clear_parent();
            self.hits.fetch_add(1, Ordering::Relaxed);
            debug!(mapper = %self.name, handle, ?mode, "Frame cache hit");
            return Ok(Arc::clone(cached));
        }

        let dst = self.mapper.map_frame(src, mode)?;
        dst.clear_parent();
        for tensor in dst.tensors() {
            tensor.clear_parent();
        }
        *slot = Some(Arc::clone(&dst));
        self.misses.fetch_add(1, Ordering::Relaxed);
        debug!(mapper = %self.name, handle, ?mode, "Frame cache miss");
        Ok(dst)
    }

    fn input_context(&self) -> &Arc<Context> {
        self.mapper.input_context()
    }

    fn output_context(&self) -> &Arc<Context> {
        self.mapper.output_context()
    }

    fn name(&self) -> &str {
        &self.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::PlainBackend;
    use crate::mapper::{MapperEndpoints, ensure_memory_type};
    use crate::tensor_info::TensorInfo;
    use crate::types::{DataType, MediaType, MemoryType, keys};
    use std::sync::atomic::AtomicUsize;

    struct Counting {
        endpoints: MapperEndpoints,
        calls: AtomicUsize,
    }

    impl MemoryMapper for Counting {
        fn map_tensor(&self, src: &Arc<Tensor>, _mode: AccessMode) -> Result<Arc<Tensor>> {
            ensure_memory_type(self.endpoints.input.memory_type(), src.memory_type())?;
            self.calls.fetch_add(1, Ordering::SeqCst);
            Tensor::builder(src.info().clone(), MemoryType::Dma)
                .handle(keys::DMA_FD, 1000 + src.handle("")?)
                .context(&self.endpoints.output)
                .parent(src)
                .build()
        }

        fn input_context(&self) -> &Arc<Context> {
            &self.endpoints.input
        }

        fn output_context(&self) -> &Arc<Context> {
            &self.endpoints.output
        }

        fn name(&self) -> &str {
            "counting"
        }
    }

    fn setup(policy: PoolPolicy) -> (Arc<Counting>, MemoryMapperCache) {
        let counting = Arc::new(Counting {
            endpoints: MapperEndpoints {
                input: Context::new(PlainBackend::new(MemoryType::Vaapi)),
                output: Context::new(PlainBackend::new(MemoryType::Dma)),
            },
            calls: AtomicUsize::new(0),
        });
        let cache = MemoryMapperCache::new(counting.clone(), policy);
        (counting, cache)
    }

    fn surface(id: Handle) -> Arc<Tensor> {
        Tensor::builder(TensorInfo::new([16, 16, 1], DataType::UInt8), MemoryType::Vaapi)
            .handle(keys::VA_SURFACE_ID, id)
            .build()
            .unwrap()
    }

    #[test]
    fn second_map_of_same_handle_is_a_hit() {
        let (counting, cache) = setup(PoolPolicy::Strict);
        let first = cache.map_tensor(&surface(7), AccessMode::Read).unwrap();
        assert!(first.parent().is_none(), "cached destinations are not lifetime-extended");
        let first_ptr = Arc::as_ptr(&first);
        drop(first);

        let second = cache.map_tensor(&surface(7), AccessMode::Read).unwrap();
        assert_eq!(Arc::as_ptr(&second), first_ptr);
        assert_eq!(counting.calls.load(Ordering::SeqCst), 1);
        assert_eq!(cache.stats(), CacheStats { hits: 1, misses: 1 });
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn distinct_handles_map_independently() {
        let (counting, cache) = setup(PoolPolicy::Strict);
        let a = cache.map_tensor(&surface(1), AccessMode::Read).unwrap();
        let b = cache.map_tensor(&surface(2), AccessMode::Read).unwrap();
        assert!(!Arc::ptr_eq(&a, &b));
        assert_eq!(counting.calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn strict_policy_refuses_reissue_of_live_destination() {
        let (_counting, cache) = setup(PoolPolicy::Strict);
        let held = cache.map_tensor(&surface(3), AccessMode::Read).unwrap();
        let err = cache
            .map_tensor(&surface(3), AccessMode::Read)
            .expect_err("destination still held");
        match err {
            PrismError::PoolContractViolation {
                memory_type,
                handle,
                outstanding,
            } => {
                assert_eq!(memory_type, MemoryType::Dma);
                assert_eq!(handle, 3);
                assert_eq!(outstanding, 1);
            }
            other => panic!("unexpected error variant: {other:?}"),
        }

        drop(held);
        assert!(cache.map_tensor(&surface(3), AccessMode::Read).is_ok());
    }

    #[test]
    fn reissue_policy_returns_live_destination() {
        let (_counting, cache) = setup(PoolPolicy::Reissue);
        let held = cache.map_tensor(&surface(4), AccessMode::Read).unwrap();
        let again = cache.map_tensor(&surface(4), AccessMode::Read).unwrap();
        assert!(Arc::ptr_eq(&held, &again));
    }

    #[test]
    fn frame_hit_clears_metadata_and_regions() {
        let (counting, cache) = setup(PoolPolicy::Strict);
        let src = Frame::new(MediaType::Image, 0, vec![surface(9)]).unwrap();

        let first = cache.map_frame(&src, AccessMode::Read).unwrap();
        assert!(first.parent().is_none());
        assert!(first.tensor(0).unwrap().parent().is_none());
        first.add_metadata("detection");
        let first_ptr = Arc::as_ptr(&first);
        drop(first);

        let second = cache.map_frame(&src, AccessMode::Read).unwrap();
        assert_eq!(Arc::as_ptr(&second), first_ptr);
        assert!(second.metadata().is_empty());
        assert_eq!(counting.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn access_modes_get_separate_destinations() {
        let (counting, cache) = setup(PoolPolicy::Strict);
        let read = cache.map_tensor(&surface(6), AccessMode::Read).unwrap();
        let write = cache.map_tensor(&surface(6), AccessMode::Write).unwrap();
        assert!(!Arc::ptr_eq(&read, &write));
        assert_eq!(counting.calls.load(Ordering::SeqCst), 2);
        assert_eq!(cache.len(), 2);

        drop((read, write));
        drop(cache.map_tensor(&surface(6), AccessMode::Write).unwrap());
        assert_eq!(counting.calls.load(Ordering::SeqCst), 2);
        assert!(cache.evict(6));
        assert!(cache.is_empty());
    }

    #[test]
    fn evict_forces_remap() {
        let (counting, cache) = setup(PoolPolicy::Strict);
        drop(cache.map_tensor(&surface(5), AccessMode::Read).unwrap());
        assert!(cache.evict(5));
        assert!(!cache.evict(5));
        drop(cache.map_tensor(&surface(5), AccessMode::Read).unwrap());
        assert_eq!(counting.calls.load(Ordering::SeqCst), 2);
        cache.clear();
        assert!(cache.is_empty());
    }

    #[test]
    fn failed_mapping_is_not_cached() {
        let (counting, cache) = setup(PoolPolicy::Strict);
        let mut backing = [0u8; 4];
        let info = TensorInfo::new([4], DataType::UInt8);
        // SAFETY: `backing` outlives `cpu` in this test.
        let cpu = unsafe { Tensor::builder(info, MemoryType::Cpu).host_ptr(backing.as_mut_ptr()) }
            .build()
            .unwrap();
        assert!(cache.map_tensor(&cpu, AccessMode::Read).is_err());
        assert!(cache.is_empty());
        assert_eq!(counting.calls.load(Ordering::SeqCst), 0);
    }
}
