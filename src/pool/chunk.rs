// Pool chunk
//
// A chunk is one contiguous reservation (16 MiB by default) managed as a
// binary buddy allocator over pages, with subpage descriptors for requests
// below the page size. The buddy tree is stored as two height arrays of
// length 2 * 2^max_order: `memory_map` holds the current allocatable height
// per node, `depth_map` the original height used to reset nodes on free.
//
// Node invariants:
// - value == original height: the node and its whole subtree are free
// - value == max_order + 1:   the node is fully consumed
// - otherwise:                value is the min of the two children
//
// Handles pack the buddy node index into the low 32 bits. Subpage handles
// additionally carry `0x4000_0000 | bitmap_idx` in the high 32 bits, so a
// non-zero high half marks a subpage allocation.

use crate::error::Result;
use crate::pool::backing::BackingMemory;
use crate::pool::size_class::log2;
use crate::pool::subpage::{PoolSubpage, SubpagePools};
use crate::pool::metrics::ChunkSnapshot;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

/// Marker bit distinguishing subpage handles from whole-run handles.
const SUBPAGE_FLAG: u32 = 0x4000_0000;

/// Sentinel for a chunk not currently linked into any chunk list.
pub(crate) const NO_LIST: usize = usize::MAX;

pub(crate) fn is_subpage_handle(handle: u64) -> bool {
    (handle >> 32) != 0
}

pub(crate) fn handle_node(handle: u64) -> u32 {
    handle as u32
}

pub(crate) fn handle_bitmap_idx(handle: u64) -> u32 {
    ((handle >> 32) as u32) & !SUBPAGE_FLAG
}

pub(crate) fn subpage_handle(node_id: u32, bitmap_idx: u32) -> u64 {
    ((u64::from(SUBPAGE_FLAG | bitmap_idx)) << 32) | u64::from(node_id)
}

/// Placement of one allocation within its chunk.
#[derive(Debug, Clone, Copy)]
pub(crate) struct RunInfo {
    /// Byte offset from the chunk base.
    pub offset: usize,
    /// Length of the underlying run or subpage element; capacity can grow
    /// to this without reallocation.
    pub max_length: usize,
}

/// Owned raw reservation. Released through its backing provider on drop.
#[derive(Debug)]
struct ChunkMemory {
    ptr: NonNull<u8>,
    len: usize,
    source: Arc<dyn BackingMemory>,
}

// SAFETY: the region behind `ptr` is exclusively owned by this chunk and
// handed out in disjoint ranges; all mutation goes through raw pointers
// with range checks at the buffer surface, never through shared references.
unsafe impl Send for ChunkMemory {}
unsafe impl Sync for ChunkMemory {}

impl Drop for ChunkMemory {
    fn drop(&mut self) {
        // SAFETY: ptr/len came from this source's reserve and nothing can
        // reference the region once the owning chunk is gone.
        unsafe { self.source.release(self.ptr, self.len) };
    }
}

#[derive(Debug)]
struct ChunkInner {
    /// Current allocatable height per node.
    memory_map: Vec<u8>,
    /// Original height per node, for restore on free.
    depth_map: Vec<u8>,
    /// Subpage descriptors keyed by their leaf node.
    subpages: HashMap<u32, Arc<PoolSubpage>>,
}

/// One buddy-managed reservation, or a dedicated unpooled reservation for
/// Huge allocations.
#[derive(Debug)]
pub(crate) struct PoolChunk {
    memory: ChunkMemory,
    page_size: usize,
    page_shifts: u32,
    max_order: u32,
    chunk_size: usize,
    log2_chunk_size: u32,
    /// Mask with all bits at or above the page size set; a normalized
    /// capacity & mask != 0 means a whole-page run.
    subpage_overflow_mask: usize,
    unusable: u8,
    unpooled: bool,
    free_bytes: AtomicUsize,
    /// Index of the chunk list currently holding this chunk. Written only
    /// under the arena lock.
    list_index: AtomicUsize,
    inner: Mutex<ChunkInner>,
}

impl PoolChunk {
    /// Creates a pooled chunk of `page_size << max_order` bytes.
    pub(crate) fn new(
        source: Arc<dyn BackingMemory>,
        page_size: usize,
        max_order: u32,
    ) -> Result<Arc<Self>> {
        let chunk_size = page_size << max_order;
        let ptr = source.reserve(chunk_size)?;

        let nodes = 1usize << (max_order + 1);
        let mut memory_map = vec![0u8; nodes];
        let mut depth_map = vec![0u8; nodes];
        for id in 1..nodes {
            let depth = log2(id) as u8;
            memory_map[id] = depth;
            depth_map[id] = depth;
        }

        Ok(Arc::new(Self {
            memory: ChunkMemory {
                ptr,
                len: chunk_size,
                source,
            },
            page_size,
            page_shifts: page_size.trailing_zeros(),
            max_order,
            chunk_size,
            log2_chunk_size: log2(chunk_size),
            subpage_overflow_mask: !(page_size - 1),
            unusable: (max_order + 1) as u8,
            unpooled: false,
            free_bytes: AtomicUsize::new(chunk_size),
            list_index: AtomicUsize::new(NO_LIST),
            inner: Mutex::new(ChunkInner {
                memory_map,
                depth_map,
                subpages: HashMap::new(),
            }),
        }))
    }

    /// Creates an unpooled chunk of exactly `size` bytes for a Huge
    /// allocation. No buddy tree is built; the whole reservation belongs to
    /// its single buffer.
    pub(crate) fn new_unpooled(source: Arc<dyn BackingMemory>, size: usize) -> Result<Arc<Self>> {
        let ptr = source.reserve(size)?;
        Ok(Arc::new(Self {
            memory: ChunkMemory {
                ptr,
                len: size,
                source,
            },
            page_size: 0,
            page_shifts: 0,
            max_order: 0,
            chunk_size: size,
            log2_chunk_size: 0,
            subpage_overflow_mask: 0,
            unusable: 0,
            unpooled: true,
            free_bytes: AtomicUsize::new(0),
            list_index: AtomicUsize::new(NO_LIST),
            inner: Mutex::new(ChunkInner {
                memory_map: Vec::new(),
                depth_map: Vec::new(),
                subpages: HashMap::new(),
            }),
        }))
    }

    pub(crate) fn base_ptr(&self) -> *mut u8 {
        self.memory.ptr.as_ptr()
    }

    pub(crate) fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    pub(crate) fn is_unpooled(&self) -> bool {
        self.unpooled
    }

    pub(crate) fn free_bytes(&self) -> usize {
        self.free_bytes.load(Ordering::Acquire)
    }

    pub(crate) fn list_index(&self) -> usize {
        self.list_index.load(Ordering::Relaxed)
    }

    pub(crate) fn set_list_index(&self, index: usize) {
        self.list_index.store(index, Ordering::Relaxed);
    }

    /// Percentage of the chunk currently consumed, 0..=100.
    pub(crate) fn usage(&self) -> usize {
        let free = self.free_bytes();
        if free == 0 {
            return 100;
        }
        let free_percentage = free * 100 / self.chunk_size;
        if free_percentage == 0 {
            // Less than 1% free still counts as not-quite-full.
            return 99;
        }
        100 - free_percentage
    }

    /// Allocates a normalized capacity, dispatching to a page run or a
    /// fresh subpage. Caller holds the arena lock.
    pub(crate) fn allocate(
        self: &Arc<Self>,
        norm_capacity: usize,
        pools: &SubpagePools,
    ) -> Option<u64> {
        debug_assert!(!self.unpooled);
        if norm_capacity & self.subpage_overflow_mask != 0 {
            self.allocate_run(norm_capacity)
        } else {
            self.allocate_subpage(norm_capacity, pools)
        }
    }

    /// Allocates a run of `norm_capacity / page_size` pages.
    pub(crate) fn allocate_run(&self, norm_capacity: usize) -> Option<u64> {
        debug_assert!(norm_capacity >= self.page_size);
        let d = self.max_order - (log2(norm_capacity) - self.page_shifts);
        let mut inner = self.inner.lock();
        let node = self.allocate_node(&mut inner, d)?;
        let run = self.run_length_at(&inner, node);
        self.free_bytes.fetch_sub(run, Ordering::AcqRel);
        Some(u64::from(node))
    }

    /// Allocates one element from a fresh subpage backed by a new page.
    ///
    /// Caller holds the arena lock; the pool-head lock is taken inside,
    /// nested under the arena lock per the arena's ordering rule.
    fn allocate_subpage(
        self: &Arc<Self>,
        norm_capacity: usize,
        pools: &SubpagePools,
    ) -> Option<u64> {
        let head = pools.head_for(norm_capacity);
        let mut head_guard = head.lock();

        let node = {
            let mut inner = self.inner.lock();
            let node = self.allocate_node(&mut inner, self.max_order)?;
            self.free_bytes.fetch_sub(self.page_size, Ordering::AcqRel);
            node
        };

        let run_offset = self.run_offset_of(node);
        let subpage = Arc::new(PoolSubpage::new(
            Arc::downgrade(self),
            node,
            run_offset,
            self.page_size,
            norm_capacity,
        ));
        self.inner.lock().subpages.insert(node, Arc::clone(&subpage));

        let bitmap_idx = subpage
            .allocate()
            .unwrap_or_else(|| unreachable!("fresh subpage must have a free element"));
        // A page always yields at least two elements, so the subpage still
        // has availability and belongs in its pool.
        head_guard.push_front(subpage);
        Some(subpage_handle(node, bitmap_idx))
    }

    /// Returns an allocation to the chunk. Caller holds the arena lock.
    ///
    /// Subpage handles free one element first; the page run itself is only
    /// reclaimed when the pool releases the subpage.
    pub(crate) fn free(&self, handle: u64, pools: &SubpagePools) {
        debug_assert!(!self.unpooled);
        let node = handle_node(handle);

        if is_subpage_handle(handle) {
            let subpage = {
                let inner = self.inner.lock();
                inner.subpages.get(&node).cloned()
            };
            let Some(subpage) = subpage else {
                debug_assert!(false, "subpage handle {:#x} without descriptor", handle);
                return;
            };

            let head = pools.head_for(subpage.elem_size());
            let mut head_guard = head.lock();
            use crate::pool::subpage::SubpageFreeOutcome;
            match subpage.free(handle_bitmap_idx(handle)) {
                SubpageFreeOutcome::Retained => return,
                SubpageFreeOutcome::Reinsert => {
                    head_guard.push_front(Arc::clone(&subpage));
                    return;
                }
                SubpageFreeOutcome::FullyFree => {
                    // An entirely free subpage is unlinked and its page
                    // returned to the buddy tree.
                    subpage.mark_destroyed();
                    head_guard.remove(&subpage);
                    drop(head_guard);
                    self.inner.lock().subpages.remove(&node);
                }
            }
        }

        let run = {
            let mut inner = self.inner.lock();
            let run = self.run_length_at(&inner, node);
            inner.memory_map[node as usize] = inner.depth_map[node as usize];
            self.update_parents_free(&mut inner, node);
            run
        };
        self.free_bytes.fetch_add(run, Ordering::AcqRel);
    }

    /// Resolves a handle to its byte placement.
    pub(crate) fn allocation_info(&self, handle: u64) -> RunInfo {
        if self.unpooled {
            return RunInfo {
                offset: 0,
                max_length: self.chunk_size,
            };
        }

        let node = handle_node(handle);
        if is_subpage_handle(handle) {
            let inner = self.inner.lock();
            let subpage = inner
                .subpages
                .get(&node)
                .unwrap_or_else(|| unreachable!("live subpage handle must have a descriptor"));
            let elem_size = subpage.elem_size();
            RunInfo {
                offset: subpage.run_offset() + handle_bitmap_idx(handle) as usize * elem_size,
                max_length: elem_size,
            }
        } else {
            let inner = self.inner.lock();
            RunInfo {
                offset: self.run_offset_of(node),
                max_length: self.run_length_at(&inner, node),
            }
        }
    }

    pub(crate) fn snapshot(&self) -> ChunkSnapshot {
        ChunkSnapshot {
            chunk_size: self.chunk_size,
            free_bytes: self.free_bytes(),
            usage_percent: self.usage(),
            unpooled: self.unpooled,
        }
    }

    /// Deterministic buddy descent: prefer the left subtree whenever it can
    /// still satisfy depth `d`, otherwise go right. Marks the node consumed
    /// and refreshes every ancestor to the min of its children.
    fn allocate_node(&self, inner: &mut ChunkInner, d: u32) -> Option<u32> {
        let mut id: u32 = 1;
        // Bit `d` and above; ids at depth >= d have one of these bits set.
        let initial = u32::MAX << d;

        let mut val = inner.memory_map[id as usize];
        if val > d as u8 {
            return None;
        }
        while u32::from(val) < d || (id & initial) == 0 {
            id <<= 1;
            val = inner.memory_map[id as usize];
            if val > d as u8 {
                id ^= 1;
                val = inner.memory_map[id as usize];
            }
        }
        debug_assert_eq!(u32::from(inner.memory_map[id as usize]), d);

        inner.memory_map[id as usize] = self.unusable;
        self.update_parents_alloc(inner, id);
        Some(id)
    }

    fn update_parents_alloc(&self, inner: &mut ChunkInner, mut id: u32) {
        while id > 1 {
            let parent = id >> 1;
            let left = inner.memory_map[(parent << 1) as usize];
            let right = inner.memory_map[((parent << 1) | 1) as usize];
            inner.memory_map[parent as usize] = left.min(right);
            id = parent;
        }
    }

    /// Restores ancestors after a free, coalescing buddies: when both
    /// children sit at their original heights the parent returns to its
    /// original height as well.
    fn update_parents_free(&self, inner: &mut ChunkInner, mut id: u32) {
        while id > 1 {
            let parent = id >> 1;
            let left_idx = (parent << 1) as usize;
            let right_idx = left_idx | 1;
            let left = inner.memory_map[left_idx];
            let right = inner.memory_map[right_idx];
            if left == inner.depth_map[left_idx] && right == inner.depth_map[right_idx] {
                inner.memory_map[parent as usize] = inner.depth_map[parent as usize];
            } else {
                inner.memory_map[parent as usize] = left.min(right);
            }
            id = parent;
        }
    }

    fn depth_of(&self, inner: &ChunkInner, id: u32) -> u32 {
        u32::from(inner.depth_map[id as usize])
    }

    fn run_length_at(&self, inner: &ChunkInner, id: u32) -> usize {
        1usize << (self.log2_chunk_size - self.depth_of(inner, id))
    }

    /// Byte offset of a node's run: `(id ^ 2^depth) * (chunk_size >> depth)`.
    fn run_offset_of(&self, id: u32) -> usize {
        let depth = log2(id as usize);
        let shift = id ^ (1u32 << depth);
        shift as usize * (self.chunk_size >> depth)
    }

    #[cfg(test)]
    pub(crate) fn buddy_tree_is_pristine(&self) -> bool {
        let inner = self.inner.lock();
        inner.memory_map == inner.depth_map
    }
}

/// Back-reference type used by subpages.
pub(crate) type ChunkRef = Weak<PoolChunk>;
