// Chunk lists
//
// Chunks are grouped into six lists by fill percentage and migrate between
// neighbouring lists as usage rises and falls. The terminal list on the way
// down is q000: a chunk falling below its minimum usage is destroyed rather
// than retained. All list state is guarded by the arena lock.
//
// The allocation probe order q050, q025, q000, qInit, q075 is deliberately
// non-monotonic: it skews toward mid-occupancy chunks for locality without
// bloating a nearly-empty chunk, and never probes q100. This ordering is a
// contract, not an accident.

use crate::pool::chunk::{PoolChunk, NO_LIST};
use crate::pool::metrics::ChunkListSnapshot;
use crate::pool::subpage::SubpagePools;
use std::collections::VecDeque;
use std::sync::Arc;
use tracing::debug;

pub(crate) const QINIT: usize = 0;
pub(crate) const Q000: usize = 1;
pub(crate) const Q025: usize = 2;
pub(crate) const Q050: usize = 3;
pub(crate) const Q075: usize = 4;
pub(crate) const Q100: usize = 5;

/// Probe order used by the arena before creating a new chunk.
pub(crate) const ALLOCATION_ORDER: [usize; 5] = [Q050, Q025, Q000, QINIT, Q075];

/// (min_usage, max_usage, prev, next) per list.
const LIST_BOUNDS: [(usize, usize, Option<usize>, Option<usize>); 6] = [
    // qInit never releases chunks downward: its minimum of 0 can't be
    // undercut, so freshly created chunks stay put until usage grows.
    (0, 25, None, Some(Q000)),
    (1, 50, None, Some(Q025)),
    (25, 75, Some(Q000), Some(Q050)),
    (50, 100, Some(Q025), Some(Q075)),
    (75, 100, Some(Q050), Some(Q100)),
    (100, 101, Some(Q075), None),
];

#[derive(Debug)]
pub(crate) struct PoolChunkList {
    min_usage: usize,
    max_usage: usize,
    prev: Option<usize>,
    next: Option<usize>,
    chunks: VecDeque<Arc<PoolChunk>>,
}

impl PoolChunkList {
    pub(crate) fn len(&self) -> usize {
        self.chunks.len()
    }
}

/// The six usage-banded lists of one arena.
#[derive(Debug)]
pub(crate) struct ChunkLists {
    lists: [PoolChunkList; 6],
}

impl ChunkLists {
    pub(crate) fn new() -> Self {
        let lists = LIST_BOUNDS.map(|(min_usage, max_usage, prev, next)| PoolChunkList {
            min_usage,
            max_usage,
            prev,
            next,
            chunks: VecDeque::new(),
        });
        Self { lists }
    }

    /// Attempts an allocation from the existing chunks, probing lists in
    /// the fixed order above and each list head-first.
    pub(crate) fn allocate(
        &mut self,
        norm_capacity: usize,
        pools: &SubpagePools,
    ) -> Option<(Arc<PoolChunk>, u64)> {
        for &list_idx in &ALLOCATION_ORDER {
            for pos in 0..self.lists[list_idx].chunks.len() {
                let chunk = Arc::clone(&self.lists[list_idx].chunks[pos]);
                if let Some(handle) = chunk.allocate(norm_capacity, pools) {
                    if chunk.usage() >= self.lists[list_idx].max_usage {
                        self.detach(list_idx, &chunk);
                        let next = self.lists[list_idx]
                            .next
                            .unwrap_or_else(|| unreachable!("every list below q100 has a successor"));
                        self.attach(next, chunk.clone());
                    }
                    return Some((chunk, handle));
                }
            }
        }
        None
    }

    /// Registers a freshly created chunk, which enters at qInit and bubbles
    /// up if its first allocation already pushed usage past a boundary.
    pub(crate) fn add_new_chunk(&mut self, chunk: Arc<PoolChunk>) {
        self.attach(QINIT, chunk);
    }

    /// Frees one allocation and migrates the chunk downward as needed.
    ///
    /// Returns `false` when the chunk descended past the terminal list and
    /// was removed for destruction.
    pub(crate) fn free(&mut self, chunk: &Arc<PoolChunk>, handle: u64, pools: &SubpagePools) -> bool {
        let list_idx = chunk.list_index();
        debug_assert_ne!(list_idx, NO_LIST, "freeing into an unlisted chunk");
        chunk.free(handle, pools);

        if chunk.usage() < self.lists[list_idx].min_usage {
            self.detach(list_idx, chunk);
            return self.move_down(list_idx, chunk);
        }
        true
    }

    fn move_down(&mut self, from: usize, chunk: &Arc<PoolChunk>) -> bool {
        let mut idx = from;
        loop {
            match self.lists[idx].prev {
                Some(prev) => {
                    if chunk.usage() >= self.lists[prev].min_usage {
                        self.attach(prev, Arc::clone(chunk));
                        return true;
                    }
                    idx = prev;
                }
                None => {
                    debug_assert_eq!(chunk.usage(), 0);
                    chunk.set_list_index(NO_LIST);
                    debug!(
                        chunk_size = chunk.chunk_size(),
                        "destroying empty chunk below the terminal list"
                    );
                    return false;
                }
            }
        }
    }

    /// Inserts a chunk, climbing to higher lists while its usage exceeds
    /// the candidate list's ceiling.
    fn attach(&mut self, mut idx: usize, chunk: Arc<PoolChunk>) {
        while chunk.usage() >= self.lists[idx].max_usage {
            match self.lists[idx].next {
                Some(next) => idx = next,
                None => break,
            }
        }
        chunk.set_list_index(idx);
        self.lists[idx].chunks.push_front(chunk);
    }

    fn detach(&mut self, idx: usize, chunk: &Arc<PoolChunk>) {
        self.lists[idx].chunks.retain(|c| !Arc::ptr_eq(c, chunk));
    }

    pub(crate) fn chunk_count(&self) -> usize {
        self.lists.iter().map(|l| l.chunks.len()).sum()
    }

    pub(crate) fn list(&self, idx: usize) -> &PoolChunkList {
        &self.lists[idx]
    }

    pub(crate) fn snapshot(&self) -> Vec<ChunkListSnapshot> {
        self.lists
            .iter()
            .map(|list| ChunkListSnapshot {
                min_usage: list.min_usage,
                max_usage: list.max_usage,
                chunks: list.chunks.iter().map(|c| c.snapshot()).collect(),
            })
            .collect()
    }
}
