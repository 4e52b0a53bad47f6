// Pooled allocator
//
// Public surface of the pool: buffer constructors over heap and direct
// arenas, composite construction, the capacity growth rule and the metrics
// surface. Each thread binds to the least-used arena of each kind on its
// first allocation and keeps that binding, together with a thread cache
// that drains itself when the thread ends.

use crate::buffer::composite::DEFAULT_MAX_COMPONENTS;
use crate::buffer::{CompositeByteBuf, PooledByteBuf, DEFAULT_MAX_CAPACITY};
use crate::config::AllocatorConfig;
use crate::error::{PoolError, Result};
use crate::leak::LeakDetector;
use crate::pool::arena::PoolArena;
use crate::pool::backing::{BackingMemory, DirectMemory, HeapMemory, MemoryKind};
use crate::pool::cache::PoolThreadCache;
use crate::pool::metrics::{AllocatorMetricsSnapshot, ThreadCacheStats};
use once_cell::sync::Lazy;
use std::cell::RefCell;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::debug;

/// Growth rule threshold: past this, capacities grow in 4 MiB steps
/// instead of doubling.
const GROWTH_THRESHOLD: usize = 4 * 1024 * 1024;

/// Default initial capacity of `buffer()`.
const DEFAULT_INITIAL_CAPACITY: usize = 256;

static NEXT_ALLOCATOR_ID: AtomicUsize = AtomicUsize::new(1);

/// Capacity growth rule used when a write overflows the current capacity:
/// double from 64 below 4 MiB, then advance in whole 4 MiB steps, always
/// clamped to `max_capacity`.
pub fn calculate_new_capacity(min_new_capacity: usize, max_capacity: usize) -> Result<usize> {
    if min_new_capacity > max_capacity {
        return Err(PoolError::InvalidArgument {
            reason: format!(
                "minimum new capacity {} exceeds the maximum capacity {}",
                min_new_capacity, max_capacity
            ),
        });
    }
    if min_new_capacity == GROWTH_THRESHOLD {
        return Ok(GROWTH_THRESHOLD);
    }

    if min_new_capacity > GROWTH_THRESHOLD {
        let base = min_new_capacity / GROWTH_THRESHOLD * GROWTH_THRESHOLD;
        let new_capacity = if base > max_capacity - GROWTH_THRESHOLD {
            max_capacity
        } else {
            base + GROWTH_THRESHOLD
        };
        return Ok(new_capacity);
    }

    // Not over the threshold: double from 64 until the minimum holds.
    let mut new_capacity = 64usize;
    while new_capacity < min_new_capacity {
        new_capacity <<= 1;
    }
    Ok(new_capacity.min(max_capacity))
}

fn kind_key(kind: MemoryKind) -> u8 {
    match kind {
        MemoryKind::Heap => 0,
        MemoryKind::Direct => 1,
    }
}

/// Per-thread cache bindings keyed by (allocator id, arena kind). Dropping
/// the map at thread exit drains every cache back to its arena.
struct ThreadBindings {
    caches: HashMap<(usize, u8), Arc<PoolThreadCache>>,
}

impl Drop for ThreadBindings {
    fn drop(&mut self) {
        for cache in self.caches.values() {
            cache.drain();
        }
    }
}

thread_local! {
    static BINDINGS: RefCell<ThreadBindings> = RefCell::new(ThreadBindings {
        caches: HashMap::new(),
    });
}

/// Pooled byte-buffer allocator with per-kind arena families.
#[derive(Debug)]
pub struct PooledByteBufAllocator {
    id: usize,
    config: AllocatorConfig,
    heap_arenas: Vec<Arc<PoolArena>>,
    direct_arenas: Vec<Arc<PoolArena>>,
    leak_detector: Arc<LeakDetector>,
}

impl PooledByteBufAllocator {
    pub fn new(config: AllocatorConfig) -> Result<Self> {
        config.validate()?;
        let id = NEXT_ALLOCATOR_ID.fetch_add(1, Ordering::Relaxed);

        let heap_backing: Arc<dyn BackingMemory> = Arc::new(HeapMemory);
        let heap_arenas = (0..config.heap_arena_count)
            .map(|arena_id| PoolArena::new(arena_id, Arc::clone(&heap_backing), &config))
            .collect();

        let direct_backing: Arc<dyn BackingMemory> = Arc::new(DirectMemory);
        let direct_arenas = (0..config.direct_arena_count)
            .map(|arena_id| PoolArena::new(arena_id, Arc::clone(&direct_backing), &config))
            .collect();

        let leak_detector = LeakDetector::new(config.leak_detection_level);
        debug!(
            allocator = id,
            heap_arenas = config.heap_arena_count,
            direct_arenas = config.direct_arena_count,
            chunk_size = config.chunk_size(),
            "created pooled allocator"
        );

        Ok(Self {
            id,
            config,
            heap_arenas,
            direct_arenas,
            leak_detector,
        })
    }

    pub fn with_defaults() -> Self {
        Self::new(AllocatorConfig::default()).expect("default configuration is valid")
    }

    /// Process-wide shared instance with default configuration.
    pub fn default_instance() -> &'static PooledByteBufAllocator {
        static DEFAULT: Lazy<PooledByteBufAllocator> =
            Lazy::new(PooledByteBufAllocator::with_defaults);
        &DEFAULT
    }

    pub fn config(&self) -> &AllocatorConfig {
        &self.config
    }

    pub fn leak_detector(&self) -> &Arc<LeakDetector> {
        &self.leak_detector
    }

    // ---- buffer constructors ----

    /// Allocates a pooled buffer with the default initial capacity,
    /// preferring direct arenas when they exist.
    pub fn buffer(&self) -> Result<PooledByteBuf> {
        self.buffer_bounded(DEFAULT_INITIAL_CAPACITY, DEFAULT_MAX_CAPACITY)
    }

    pub fn buffer_with_capacity(&self, initial_capacity: usize) -> Result<PooledByteBuf> {
        self.buffer_bounded(initial_capacity, DEFAULT_MAX_CAPACITY)
    }

    pub fn buffer_bounded(
        &self,
        initial_capacity: usize,
        max_capacity: usize,
    ) -> Result<PooledByteBuf> {
        if self.direct_arenas.is_empty() {
            self.heap_buffer_bounded(initial_capacity, max_capacity)
        } else {
            self.direct_buffer_bounded(initial_capacity, max_capacity)
        }
    }

    pub fn heap_buffer(&self) -> Result<PooledByteBuf> {
        self.heap_buffer_bounded(DEFAULT_INITIAL_CAPACITY, DEFAULT_MAX_CAPACITY)
    }

    pub fn heap_buffer_with_capacity(&self, initial_capacity: usize) -> Result<PooledByteBuf> {
        self.heap_buffer_bounded(initial_capacity, DEFAULT_MAX_CAPACITY)
    }

    pub fn heap_buffer_bounded(
        &self,
        initial_capacity: usize,
        max_capacity: usize,
    ) -> Result<PooledByteBuf> {
        self.pooled_buffer(MemoryKind::Heap, initial_capacity, max_capacity)
    }

    pub fn direct_buffer(&self) -> Result<PooledByteBuf> {
        self.direct_buffer_bounded(DEFAULT_INITIAL_CAPACITY, DEFAULT_MAX_CAPACITY)
    }

    pub fn direct_buffer_with_capacity(&self, initial_capacity: usize) -> Result<PooledByteBuf> {
        self.direct_buffer_bounded(initial_capacity, DEFAULT_MAX_CAPACITY)
    }

    pub fn direct_buffer_bounded(
        &self,
        initial_capacity: usize,
        max_capacity: usize,
    ) -> Result<PooledByteBuf> {
        self.pooled_buffer(MemoryKind::Direct, initial_capacity, max_capacity)
    }

    /// Constructs the composite collaborator with the default component
    /// bound.
    pub fn composite_buffer(&self) -> CompositeByteBuf {
        self.composite_buffer_with(DEFAULT_MAX_COMPONENTS)
    }

    pub fn composite_buffer_with(&self, max_components: usize) -> CompositeByteBuf {
        CompositeByteBuf::new(max_components, self.leak_detector.track(0))
    }

    fn pooled_buffer(
        &self,
        kind: MemoryKind,
        initial_capacity: usize,
        max_capacity: usize,
    ) -> Result<PooledByteBuf> {
        if initial_capacity > max_capacity {
            return Err(PoolError::InvalidArgument {
                reason: format!(
                    "initial capacity {} exceeds the maximum capacity {}",
                    initial_capacity, max_capacity
                ),
            });
        }

        let cache = self.bind_cache(kind).ok_or_else(|| PoolError::Unsupported {
            operation: format!("{:?} pooling is disabled (arena count is 0)", kind),
        })?;
        let arena = Arc::clone(cache.arena());
        let region = arena.allocate(Some(&*cache), initial_capacity)?;
        let leak = self.leak_detector.track(initial_capacity);
        Ok(PooledByteBuf::new_root(
            arena,
            region,
            Some(cache),
            max_capacity,
            leak,
        ))
    }

    /// Sticky per-thread binding: the first allocation of each kind picks
    /// the arena with the fewest bound caches and stays there.
    fn bind_cache(&self, kind: MemoryKind) -> Option<Arc<PoolThreadCache>> {
        let arenas = match kind {
            MemoryKind::Heap => &self.heap_arenas,
            MemoryKind::Direct => &self.direct_arenas,
        };
        if arenas.is_empty() {
            return None;
        }

        BINDINGS.with(|bindings| {
            let mut bindings = bindings.borrow_mut();
            let key = (self.id, kind_key(kind));
            if let Some(cache) = bindings.caches.get(&key) {
                return Some(Arc::clone(cache));
            }

            let arena = arenas
                .iter()
                .min_by_key(|arena| arena.thread_cache_count())
                .map(Arc::clone)?;
            let cache = PoolThreadCache::new(arena, &self.config);
            bindings.caches.insert(key, Arc::clone(&cache));
            Some(cache)
        })
    }

    // ---- maintenance and observation ----

    /// Trims the calling thread's caches for this allocator. Returns
    /// whether any cache was bound.
    pub fn trim_current_thread_cache(&self) -> bool {
        BINDINGS.with(|bindings| {
            let bindings = bindings.borrow();
            let mut trimmed = false;
            for kind in [MemoryKind::Heap, MemoryKind::Direct] {
                if let Some(cache) = bindings.caches.get(&(self.id, kind_key(kind))) {
                    cache.trim();
                    trimmed = true;
                }
            }
            trimmed
        })
    }

    /// Hit/miss/occupancy stats of the calling thread's caches for this
    /// allocator, heap first.
    pub fn thread_cache_stats(&self) -> Vec<ThreadCacheStats> {
        BINDINGS.with(|bindings| {
            let bindings = bindings.borrow();
            [MemoryKind::Heap, MemoryKind::Direct]
                .iter()
                .filter_map(|kind| bindings.caches.get(&(self.id, kind_key(*kind))))
                .map(|cache| cache.stats())
                .collect()
        })
    }

    pub fn used_heap_memory(&self) -> usize {
        self.heap_arenas
            .iter()
            .map(|arena| arena.metrics().reserved_bytes())
            .sum()
    }

    pub fn used_direct_memory(&self) -> usize {
        self.direct_arenas
            .iter()
            .map(|arena| arena.metrics().reserved_bytes())
            .sum()
    }

    /// Best-effort snapshot across every arena of both kinds.
    pub fn metrics(&self) -> AllocatorMetricsSnapshot {
        AllocatorMetricsSnapshot {
            heap_arenas: self.heap_arenas.iter().map(|a| a.snapshot()).collect(),
            direct_arenas: self.direct_arenas.iter().map(|a| a.snapshot()).collect(),
            used_heap_memory: self.used_heap_memory(),
            used_direct_memory: self.used_direct_memory(),
        }
    }
}

impl Drop for PooledByteBufAllocator {
    fn drop(&mut self) {
        let leaked = self.leak_detector.report_outstanding();
        if leaked > 0 {
            debug!(allocator = self.id, leaked, "allocator shut down with open trackers");
        }
    }
}
