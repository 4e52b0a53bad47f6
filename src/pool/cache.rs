// Thread cache
//
// Per-thread front-end of size-class-indexed bounded queues holding
// recently freed (chunk, handle) pairs. The owning thread is the only
// consumer; any thread releasing a buffer allocated through this cache may
// produce into it. The hot path takes no lock.
//
// Drain protocol: `closed` is the sentinel. Once it is set, producers
// bypass the cache and return memory straight to the arena. A producer
// that raced its enqueue past the sentinel flushes the queues itself, so
// no entry is stranded between the start of a drain and the moment every
// producer observes the flag.

use crate::config::AllocatorConfig;
use crate::pool::arena::PoolArena;
use crate::pool::chunk::PoolChunk;
use crate::pool::metrics::ThreadCacheStats;
use crate::pool::size_class::{SizeClass, SizeClasses, NUM_TINY_POOLS};
use crossbeam::queue::ArrayQueue;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::ThreadId;
use tracing::debug;

#[derive(Debug)]
struct CacheEntry {
    chunk: Arc<PoolChunk>,
    handle: u64,
}

/// One bounded queue of cached regions of a single normalized capacity.
#[derive(Debug)]
struct MemoryRegionCache {
    queue: ArrayQueue<CacheEntry>,
    capacity: usize,
    /// Pops since the last trim sweep; written by the owner thread only.
    recent_allocations: AtomicU32,
}

impl MemoryRegionCache {
    fn new(configured_size: usize) -> Self {
        let capacity = configured_size.next_power_of_two();
        Self {
            queue: ArrayQueue::new(capacity),
            capacity,
            recent_allocations: AtomicU32::new(0),
        }
    }

    fn allocate(&self) -> Option<CacheEntry> {
        let entry = self.queue.pop()?;
        self.recent_allocations.fetch_add(1, Ordering::Relaxed);
        Some(entry)
    }

    fn add(&self, entry: CacheEntry) -> bool {
        self.queue.push(entry).is_ok()
    }

    /// Frees `capacity - recent_allocations` entries: queues that were not
    /// kept busy since the last sweep give their memory back.
    fn trim(&self, arena: &PoolArena) {
        let recent = self.recent_allocations.swap(0, Ordering::Relaxed) as usize;
        let mut to_free = self.capacity.saturating_sub(recent);
        while to_free > 0 {
            match self.queue.pop() {
                Some(entry) => {
                    arena.return_to_chunk(entry.chunk, entry.handle);
                    to_free -= 1;
                }
                None => break,
            }
        }
    }

    fn flush(&self, arena: &PoolArena) {
        while let Some(entry) = self.queue.pop() {
            arena.return_to_chunk(entry.chunk, entry.handle);
        }
    }
}

/// Lock-free per-thread allocation cache bound to one arena.
#[derive(Debug)]
pub(crate) struct PoolThreadCache {
    arena: Arc<PoolArena>,
    size_classes: SizeClasses,
    owner: ThreadId,
    /// Drain sentinel; see the module header.
    closed: AtomicBool,
    /// Allocation attempts since the last trim sweep.
    allocations: AtomicU32,
    trim_interval: u32,
    hits: AtomicU64,
    misses: AtomicU64,
    tiny: Vec<MemoryRegionCache>,
    small: Vec<MemoryRegionCache>,
    normal: Vec<MemoryRegionCache>,
}

impl PoolThreadCache {
    pub(crate) fn new(arena: Arc<PoolArena>, config: &AllocatorConfig) -> Arc<Self> {
        let size_classes = arena.size_classes();

        let tiny = if config.tiny_cache_size > 0 {
            (0..NUM_TINY_POOLS)
                .map(|_| MemoryRegionCache::new(config.tiny_cache_size))
                .collect()
        } else {
            Vec::new()
        };
        let small = if config.small_cache_size > 0 {
            (0..size_classes.num_small_pools)
                .map(|_| MemoryRegionCache::new(config.small_cache_size))
                .collect()
        } else {
            Vec::new()
        };

        let max_cached = config
            .max_cached_buffer_capacity
            .min(size_classes.chunk_size);
        let normal = if config.normal_cache_size > 0 && max_cached >= size_classes.page_size {
            let count = size_classes.normal_idx(max_cached.next_power_of_two().min(
                size_classes.chunk_size,
            )) + 1;
            (0..count)
                .map(|_| MemoryRegionCache::new(config.normal_cache_size))
                .collect()
        } else {
            Vec::new()
        };

        arena.bind_thread_cache();
        Arc::new(Self {
            arena,
            size_classes,
            owner: std::thread::current().id(),
            closed: AtomicBool::new(false),
            allocations: AtomicU32::new(0),
            trim_interval: config.cache_trim_interval,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            tiny,
            small,
            normal,
        })
    }

    pub(crate) fn arena(&self) -> &Arc<PoolArena> {
        &self.arena
    }

    /// Whether the calling thread owns this cache. Dequeues and the
    /// allocation side of `reallocate` are restricted to the owner.
    pub(crate) fn is_owner(&self) -> bool {
        std::thread::current().id() == self.owner
    }

    fn region_cache_for(&self, norm_capacity: usize) -> Option<&MemoryRegionCache> {
        match self.size_classes.classify(norm_capacity) {
            SizeClass::Tiny => self.tiny.get(SizeClasses::tiny_idx(norm_capacity)),
            SizeClass::Small => self.small.get(SizeClasses::small_idx(norm_capacity)),
            SizeClass::Normal => self.normal.get(self.size_classes.normal_idx(norm_capacity)),
            SizeClass::Huge => None,
        }
    }

    /// Attempts to serve a normalized capacity from the cache. Only the
    /// owning thread may call this.
    pub(crate) fn allocate(&self, norm_capacity: usize) -> Option<(Arc<PoolChunk>, u64)> {
        debug_assert_eq!(
            std::thread::current().id(),
            self.owner,
            "thread cache dequeued from a non-owner thread"
        );
        if self.closed.load(Ordering::Acquire) {
            return None;
        }

        let entry = self.region_cache_for(norm_capacity).and_then(|rc| rc.allocate());
        if entry.is_some() {
            self.hits.fetch_add(1, Ordering::Relaxed);
        } else {
            self.misses.fetch_add(1, Ordering::Relaxed);
        }

        let attempts = self.allocations.fetch_add(1, Ordering::Relaxed) + 1;
        if attempts >= self.trim_interval {
            self.allocations.store(0, Ordering::Relaxed);
            self.trim();
        }

        entry.map(|e| (e.chunk, e.handle))
    }

    /// Offers a freed region to the cache. Any thread may call this.
    ///
    /// Returns `false` when the region must go back to its chunk instead:
    /// the queue is full, the capacity is not cacheable, or the cache is
    /// draining.
    pub(crate) fn add(&self, chunk: Arc<PoolChunk>, handle: u64, norm_capacity: usize) -> bool {
        if self.closed.load(Ordering::Acquire) {
            return false;
        }
        let Some(rc) = self.region_cache_for(norm_capacity) else {
            return false;
        };
        if !rc.add(CacheEntry { chunk, handle }) {
            return false;
        }
        if self.closed.load(Ordering::Acquire) {
            // A drain began while this entry was in flight; flush so it is
            // not stranded in a queue nobody will consume.
            self.flush();
        }
        true
    }

    /// Trims every queue down to its recent demand.
    pub(crate) fn trim(&self) {
        debug!(arena = self.arena.id(), "trimming thread cache");
        for rc in self.tiny.iter().chain(&self.small).chain(&self.normal) {
            rc.trim(&self.arena);
        }
    }

    /// Drains the cache: sets the producer sentinel, returns every queued
    /// entry to its chunk and unbinds from the arena. Runs once; later
    /// calls are no-ops.
    pub(crate) fn drain(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.flush();
        self.arena.unbind_thread_cache();
        debug!(arena = self.arena.id(), "drained thread cache");
    }

    fn flush(&self) {
        for rc in self.tiny.iter().chain(&self.small).chain(&self.normal) {
            rc.flush(&self.arena);
        }
    }

    pub(crate) fn hit_count(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub(crate) fn miss_count(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    pub(crate) fn stats(&self) -> ThreadCacheStats {
        ThreadCacheStats {
            hits: self.hit_count(),
            misses: self.miss_count(),
            cached_entries: self.cached_entries(),
        }
    }

    fn cached_entries(&self) -> usize {
        self.tiny
            .iter()
            .chain(&self.small)
            .chain(&self.normal)
            .map(|rc| rc.queue.len())
            .sum()
    }
}

impl Drop for PoolThreadCache {
    fn drop(&mut self) {
        self.drain();
    }
}
