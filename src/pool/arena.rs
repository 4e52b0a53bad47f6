// Pool arena
//
// An arena owns a family of chunk lists plus the subpage pool heads and
// serializes shared state behind one coarse lock. Multiple arenas per
// allocator reduce contention; threads bind to the least-used arena on
// first allocation and stay with it.
//
// Lock discipline (keep in sync with the assertions below):
// - The chunk-list mutex is THE arena lock. Critical sections contain at
//   most O(log2(chunk_size / page_size)) buddy-tree operations.
// - Each subpage pool head has its own lock. The fast path probes a head
//   with no other lock held and releases it before falling back.
// - Whenever both locks are needed (binding a fresh page as a subpage, or
//   freeing a subpage element under an arena-held free), the arena lock is
//   acquired FIRST and the head lock nested inside it. Never invert this.

use crate::config::AllocatorConfig;
use crate::error::{PoolError, Result};
use crate::pool::backing::{BackingMemory, MemoryKind};
use crate::pool::chunk::{subpage_handle, PoolChunk};
use crate::pool::chunk_list::ChunkLists;
use crate::pool::metrics::{ArenaMetrics, ArenaMetricsSnapshot};
use crate::pool::size_class::{SizeClass, SizeClasses};
use crate::pool::subpage::SubpagePools;
use parking_lot::Mutex;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tracing::debug;

use crate::pool::cache::PoolThreadCache;

/// One allocation as handed to the buffer layer: the owning chunk, the
/// opaque handle, and the byte placement within the chunk.
#[derive(Debug, Clone)]
pub(crate) struct AllocatedRegion {
    pub chunk: Arc<PoolChunk>,
    pub handle: u64,
    pub offset: usize,
    /// Requested capacity.
    pub length: usize,
    /// Length of the underlying run or element; equals the normalized
    /// capacity and is the key used when returning to a cache.
    pub max_length: usize,
    pub size_class: SizeClass,
}

#[derive(Debug)]
pub(crate) struct PoolArena {
    id: usize,
    size_classes: SizeClasses,
    page_size: usize,
    max_order: u32,
    backing: Arc<dyn BackingMemory>,
    /// THE arena lock.
    chunk_lists: Mutex<ChunkLists>,
    subpage_pools: SubpagePools,
    metrics: ArenaMetrics,
}

impl PoolArena {
    pub(crate) fn new(
        id: usize,
        backing: Arc<dyn BackingMemory>,
        config: &AllocatorConfig,
    ) -> Arc<Self> {
        let size_classes = SizeClasses::new(config.page_size, config.max_order);
        Arc::new(Self {
            id,
            size_classes,
            page_size: config.page_size,
            max_order: config.max_order,
            backing,
            chunk_lists: Mutex::new(ChunkLists::new()),
            subpage_pools: SubpagePools::new(size_classes.num_small_pools),
            metrics: ArenaMetrics::default(),
        })
    }

    pub(crate) fn id(&self) -> usize {
        self.id
    }

    pub(crate) fn kind(&self) -> MemoryKind {
        self.backing.kind()
    }

    pub(crate) fn size_classes(&self) -> SizeClasses {
        self.size_classes
    }

    pub(crate) fn metrics(&self) -> &ArenaMetrics {
        &self.metrics
    }

    /// Number of thread caches currently bound to this arena; used for
    /// least-used arena selection.
    pub(crate) fn thread_cache_count(&self) -> usize {
        self.metrics.thread_caches.load(Ordering::Relaxed)
    }

    pub(crate) fn bind_thread_cache(&self) {
        self.metrics.thread_caches.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn unbind_thread_cache(&self) {
        self.metrics.thread_caches.fetch_sub(1, Ordering::Relaxed);
    }

    /// Serves one allocation: classify, consult the thread cache, then the
    /// subpage pools or chunk lists, finally a fresh chunk.
    pub(crate) fn allocate(
        self: &Arc<Self>,
        cache: Option<&PoolThreadCache>,
        req_capacity: usize,
    ) -> Result<AllocatedRegion> {
        let sc = self.size_classes;
        // Zero-length requests share the smallest element class.
        let norm_capacity = sc.normalize(req_capacity.max(1));
        let class = sc.classify(norm_capacity);

        match class {
            SizeClass::Tiny | SizeClass::Small => {
                self.allocate_tiny_or_small(cache, req_capacity, norm_capacity, class)
            }
            SizeClass::Normal => self.allocate_normal(cache, req_capacity, norm_capacity),
            SizeClass::Huge => self.allocate_huge(req_capacity),
        }
    }

    fn allocate_tiny_or_small(
        self: &Arc<Self>,
        cache: Option<&PoolThreadCache>,
        req_capacity: usize,
        norm_capacity: usize,
        class: SizeClass,
    ) -> Result<AllocatedRegion> {
        if let Some(cache) = cache {
            if let Some((chunk, handle)) = cache.allocate(norm_capacity) {
                return Ok(self.region_for(chunk, handle, req_capacity, class));
            }
        }

        // Fast path: an existing subpage with availability, touched under
        // the head lock alone.
        {
            let head = self.subpage_pools.head_for(norm_capacity);
            let mut head_guard = head.lock();
            if let Some(subpage) = head_guard.first_available() {
                if let Some(bitmap_idx) = subpage.allocate() {
                    if subpage.num_avail() == 0 {
                        head_guard.remove(&subpage);
                    }
                    let handle = subpage_handle(subpage.node_id(), bitmap_idx);
                    if let Some(chunk) = subpage.chunk() {
                        return Ok(self.region_for(chunk, handle, req_capacity, class));
                    }
                    debug_assert!(false, "pooled subpage outlived its chunk");
                }
            }
            // Head lock drops here, before the arena lock is taken below.
        }

        self.allocate_from_lists(req_capacity, norm_capacity, class)
    }

    fn allocate_normal(
        self: &Arc<Self>,
        cache: Option<&PoolThreadCache>,
        req_capacity: usize,
        norm_capacity: usize,
    ) -> Result<AllocatedRegion> {
        if let Some(cache) = cache {
            if let Some((chunk, handle)) = cache.allocate(norm_capacity) {
                return Ok(self.region_for(chunk, handle, req_capacity, SizeClass::Normal));
            }
        }
        self.allocate_from_lists(req_capacity, norm_capacity, SizeClass::Normal)
    }

    /// Slow path under the arena lock: walk the chunk lists in the fixed
    /// probe order, then create a new chunk.
    fn allocate_from_lists(
        self: &Arc<Self>,
        req_capacity: usize,
        norm_capacity: usize,
        class: SizeClass,
    ) -> Result<AllocatedRegion> {
        let mut lists = self.chunk_lists.lock();

        if let Some((chunk, handle)) = lists.allocate(norm_capacity, &self.subpage_pools) {
            return Ok(self.region_for(chunk, handle, req_capacity, class));
        }

        let chunk = PoolChunk::new(
            Arc::clone(&self.backing),
            self.page_size,
            self.max_order,
        )?;
        self.metrics.record_reserved(chunk.chunk_size());
        debug!(
            arena = self.id,
            chunk_size = chunk.chunk_size(),
            "created new pool chunk"
        );

        let handle = chunk
            .allocate(norm_capacity, &self.subpage_pools)
            .ok_or_else(|| PoolError::OutOfMemory {
                reason: format!(
                    "fresh chunk cannot satisfy normalized capacity {}",
                    norm_capacity
                ),
            })?;
        lists.add_new_chunk(Arc::clone(&chunk));
        Ok(self.region_for(chunk, handle, req_capacity, class))
    }

    fn allocate_huge(self: &Arc<Self>, req_capacity: usize) -> Result<AllocatedRegion> {
        let chunk = PoolChunk::new_unpooled(Arc::clone(&self.backing), req_capacity)?;
        self.metrics.record_reserved(req_capacity);
        self.metrics.record_alloc(SizeClass::Huge, req_capacity);
        debug!(arena = self.id, size = req_capacity, "created unpooled chunk");
        Ok(AllocatedRegion {
            chunk,
            handle: 0,
            offset: 0,
            length: req_capacity,
            max_length: req_capacity,
            size_class: SizeClass::Huge,
        })
    }

    fn region_for(
        &self,
        chunk: Arc<PoolChunk>,
        handle: u64,
        req_capacity: usize,
        class: SizeClass,
    ) -> AllocatedRegion {
        let info = chunk.allocation_info(handle);
        self.metrics.record_alloc(class, info.max_length);
        AllocatedRegion {
            chunk,
            handle,
            offset: info.offset,
            length: req_capacity,
            max_length: info.max_length,
            size_class: class,
        }
    }

    /// Returns an allocation, preferring the caller's thread cache.
    pub(crate) fn free(
        &self,
        chunk: Arc<PoolChunk>,
        handle: u64,
        max_length: usize,
        cache: Option<&PoolThreadCache>,
    ) {
        if chunk.is_unpooled() {
            let size = chunk.chunk_size();
            self.metrics.record_free(SizeClass::Huge, size);
            self.metrics.record_released(size);
            debug!(arena = self.id, size, "destroying unpooled chunk");
            // Dropping the Arc releases the reservation.
            return;
        }

        let class = self.size_classes.classify(max_length);
        self.metrics.record_free(class, max_length);

        if let Some(cache) = cache {
            if cache.add(Arc::clone(&chunk), handle, max_length) {
                return;
            }
        }
        self.return_to_chunk(chunk, handle);
    }

    /// Returns memory straight to its chunk under the arena lock. Also the
    /// path used by cache trim and drain; metrics were recorded when the
    /// entry first left its buffer.
    pub(crate) fn return_to_chunk(&self, chunk: Arc<PoolChunk>, handle: u64) {
        let mut lists = self.chunk_lists.lock();
        let alive = lists.free(&chunk, handle, &self.subpage_pools);
        if !alive {
            self.metrics.record_released(chunk.chunk_size());
            // The list dropped its reference; the memory goes with the
            // last Arc.
        }
    }

    /// Moves an allocation to a region of `new_capacity` bytes, copying the
    /// overlapping prefix. The old region is freed when `free_old` is set.
    pub(crate) fn reallocate(
        self: &Arc<Self>,
        old: &AllocatedRegion,
        new_capacity: usize,
        cache: Option<&PoolThreadCache>,
        free_old: bool,
    ) -> Result<AllocatedRegion> {
        // Dequeues are restricted to the cache's owning thread; a
        // reallocation triggered elsewhere skips the cache on the
        // allocation side but may still enqueue the freed region.
        let alloc_cache = cache.filter(|c| c.is_owner());
        let new_region = self.allocate(alloc_cache, new_capacity)?;

        let bytes_to_copy = old.length.min(new_capacity);
        if bytes_to_copy > 0 {
            // SAFETY: both regions are live allocations of at least
            // `bytes_to_copy` bytes and cannot overlap: the new region was
            // just carved out while the old one is still allocated.
            unsafe {
                self.backing.copy(
                    old.chunk.base_ptr().add(old.offset),
                    new_region.chunk.base_ptr().add(new_region.offset),
                    bytes_to_copy,
                );
            }
        }

        if free_old {
            self.free(Arc::clone(&old.chunk), old.handle, old.max_length, cache);
        }
        Ok(new_region)
    }

    /// Best-effort metrics snapshot; chunk lists are read under the arena
    /// lock, subpage pools under their head locks.
    pub(crate) fn snapshot(&self) -> ArenaMetricsSnapshot {
        let chunk_lists = self.chunk_lists.lock().snapshot();
        let tiny_subpages = self
            .subpage_pools
            .tiny_heads()
            .iter()
            .flat_map(|head| {
                head.lock()
                    .iter()
                    .map(|s| s.snapshot())
                    .collect::<Vec<_>>()
            })
            .collect();
        let small_subpages = self
            .subpage_pools
            .small_heads()
            .iter()
            .flat_map(|head| {
                head.lock()
                    .iter()
                    .map(|s| s.snapshot())
                    .collect::<Vec<_>>()
            })
            .collect();

        ArenaMetricsSnapshot {
            counters: self.metrics.counters(),
            reserved_bytes: self.metrics.reserved_bytes(),
            thread_caches: self.thread_cache_count(),
            chunk_lists,
            tiny_subpages,
            small_subpages,
        }
    }

}
