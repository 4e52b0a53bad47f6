// Subpage allocator
//
// A subpage is a single page carved into equal-sized elements and tracked
// by an availability bitmap. Tiny subpages use 16-byte element steps
// (16..496), Small subpages use powers of two from 512 up to half the page
// size. Bitmap convention: a set bit marks a FREE element, so allocation is
// a first-set-bit scan and `num_avail` always equals the bitmap popcount.

use crate::pool::chunk::{ChunkRef, PoolChunk};
use crate::pool::metrics::SubpageSnapshot;
use crate::pool::size_class::{SizeClasses, NUM_TINY_POOLS, SMALL_THRESHOLD};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;

/// Result of freeing one element of a subpage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SubpageFreeOutcome {
    /// The subpage still holds live elements (or was already pooled).
    Retained,
    /// The subpage was full and now has one free element; it must be put
    /// back at the head of its pool.
    Reinsert,
    /// Every element is free; the pool decides whether to keep the subpage
    /// or release its page back to the buddy tree.
    FullyFree,
}

#[derive(Debug)]
struct SubpageInner {
    /// Availability words; bit set = element free.
    bitmap: Vec<u64>,
    num_avail: usize,
    /// Cleared when the pool decides to release the page. A destroyed
    /// subpage rejects further allocation even if it is still reachable.
    do_not_destroy: bool,
}

/// One page of a chunk partitioned into `page_size / elem_size` elements.
#[derive(Debug)]
pub(crate) struct PoolSubpage {
    /// Owning chunk; weak to keep the arena the sole long-lived owner.
    chunk: ChunkRef,
    /// Buddy-tree leaf node holding the page.
    node_id: u32,
    /// Byte offset of the page within the owning chunk.
    run_offset: usize,
    elem_size: usize,
    max_num_elems: usize,
    inner: Mutex<SubpageInner>,
}

impl PoolSubpage {
    pub(crate) fn new(
        chunk: ChunkRef,
        node_id: u32,
        run_offset: usize,
        page_size: usize,
        elem_size: usize,
    ) -> Self {
        debug_assert!(elem_size >= 16 && elem_size < page_size);
        let max_num_elems = page_size / elem_size;
        let words = max_num_elems.div_ceil(64);
        let mut bitmap = vec![0u64; words];
        for idx in 0..max_num_elems {
            bitmap[idx / 64] |= 1u64 << (idx % 64);
        }
        Self {
            chunk,
            node_id,
            run_offset,
            elem_size,
            max_num_elems,
            inner: Mutex::new(SubpageInner {
                bitmap,
                num_avail: max_num_elems,
                do_not_destroy: true,
            }),
        }
    }

    /// Owning chunk, if it is still alive. A subpage holding any live
    /// element always resolves: the chunk cannot empty out while one of
    /// its pages is allocated.
    pub(crate) fn chunk(&self) -> Option<Arc<PoolChunk>> {
        self.chunk.upgrade()
    }

    pub(crate) fn node_id(&self) -> u32 {
        self.node_id
    }

    pub(crate) fn run_offset(&self) -> usize {
        self.run_offset
    }

    pub(crate) fn elem_size(&self) -> usize {
        self.elem_size
    }

    pub(crate) fn max_num_elems(&self) -> usize {
        self.max_num_elems
    }

    pub(crate) fn num_avail(&self) -> usize {
        self.inner.lock().num_avail
    }

    /// Claims the lowest free element, returning its bitmap index.
    ///
    /// Returns `None` when the subpage is exhausted or already marked for
    /// destruction.
    pub(crate) fn allocate(&self) -> Option<u32> {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        if inner.num_avail == 0 || !inner.do_not_destroy {
            return None;
        }

        for (word_idx, word) in inner.bitmap.iter_mut().enumerate() {
            if *word != 0 {
                let bit = word.trailing_zeros();
                *word &= !(1u64 << bit);
                inner.num_avail -= 1;
                return Some((word_idx as u32) * 64 + bit);
            }
        }

        // num_avail said an element was free but the bitmap disagrees.
        debug_assert!(false, "subpage bitmap out of sync with num_avail");
        None
    }

    /// Returns one element, reporting the transition the pool must act on.
    pub(crate) fn free(&self, bitmap_idx: u32) -> SubpageFreeOutcome {
        let mut inner = self.inner.lock();
        let word = (bitmap_idx / 64) as usize;
        let bit = bitmap_idx % 64;
        debug_assert_eq!(
            inner.bitmap[word] & (1u64 << bit),
            0,
            "double free of subpage element {}",
            bitmap_idx
        );
        inner.bitmap[word] |= 1u64 << bit;
        inner.num_avail += 1;

        if inner.num_avail == 1 {
            SubpageFreeOutcome::Reinsert
        } else if inner.num_avail == self.max_num_elems {
            SubpageFreeOutcome::FullyFree
        } else {
            SubpageFreeOutcome::Retained
        }
    }

    /// Marks the subpage destroyed ahead of releasing its page run.
    pub(crate) fn mark_destroyed(&self) {
        self.inner.lock().do_not_destroy = false;
    }

    #[cfg(test)]
    pub(crate) fn bitmap_popcount(&self) -> usize {
        self.inner
            .lock()
            .bitmap
            .iter()
            .map(|w| w.count_ones() as usize)
            .sum()
    }

    pub(crate) fn snapshot(&self) -> SubpageSnapshot {
        let inner = self.inner.lock();
        SubpageSnapshot {
            elem_size: self.elem_size(),
            max_num_elems: self.max_num_elems(),
            num_avail: inner.num_avail,
        }
    }
}

/// One pool of subpages sharing an element size, anchored in the arena.
#[derive(Debug, Default)]
pub(crate) struct SubpageList {
    subpages: VecDeque<Arc<PoolSubpage>>,
}

impl SubpageList {
    /// First subpage with a free element, if any.
    pub(crate) fn first_available(&self) -> Option<Arc<PoolSubpage>> {
        self.subpages.front().cloned()
    }

    pub(crate) fn push_front(&mut self, subpage: Arc<PoolSubpage>) {
        self.subpages.push_front(subpage);
    }

    /// Removes a specific subpage by identity.
    pub(crate) fn remove(&mut self, subpage: &Arc<PoolSubpage>) {
        self.subpages.retain(|s| !Arc::ptr_eq(s, subpage));
    }

    pub(crate) fn len(&self) -> usize {
        self.subpages.len()
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = &Arc<PoolSubpage>> {
        self.subpages.iter()
    }
}

/// All subpage pool heads of one arena: one per Tiny size, one per Small
/// size. Each head carries its own lock; see the arena for the ordering
/// rules against the arena lock.
#[derive(Debug)]
pub(crate) struct SubpagePools {
    tiny: Vec<Mutex<SubpageList>>,
    small: Vec<Mutex<SubpageList>>,
}

impl SubpagePools {
    pub(crate) fn new(num_small_pools: usize) -> Self {
        Self {
            tiny: (0..NUM_TINY_POOLS).map(|_| Mutex::new(SubpageList::default())).collect(),
            small: (0..num_small_pools)
                .map(|_| Mutex::new(SubpageList::default()))
                .collect(),
        }
    }

    /// Pool head for a normalized subpage capacity.
    pub(crate) fn head_for(&self, elem_size: usize) -> &Mutex<SubpageList> {
        if elem_size < SMALL_THRESHOLD {
            &self.tiny[SizeClasses::tiny_idx(elem_size)]
        } else {
            &self.small[SizeClasses::small_idx(elem_size)]
        }
    }

    pub(crate) fn tiny_heads(&self) -> &[Mutex<SubpageList>] {
        &self.tiny
    }

    pub(crate) fn small_heads(&self) -> &[Mutex<SubpageList>] {
        &self.small
    }
}
