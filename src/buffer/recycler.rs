// Buffer shell recycler
//
// Deallocated buffers push their shared shell into a per-thread pool; the
// next allocation on that thread reuses the shell instead of heap-allocating
// a fresh one. A shell is only reusable once every derived view has dropped
// its reference, which is exactly when the caller holds the sole `Arc`.

use super::{BufShared, BufState};
use crate::leak::LeakTracker;
use crate::pool::arena::PoolArena;
use std::cell::RefCell;
use std::sync::Arc;

/// Bound on pooled shells per thread.
const MAX_POOLED_SHELLS: usize = 64;

thread_local! {
    static SHELL_POOL: RefCell<Vec<Arc<BufShared>>> = const { RefCell::new(Vec::new()) };
}

/// Hands out a shell for a fresh allocation, reusing a pooled one when its
/// previous users are all gone.
pub(crate) fn acquire(
    arena: Arc<PoolArena>,
    state: BufState,
    leak: Option<LeakTracker>,
) -> Arc<BufShared> {
    let candidate = SHELL_POOL.with(|pool| {
        let mut pool = pool.borrow_mut();
        while let Some(shell) = pool.pop() {
            if Arc::strong_count(&shell) == 1 {
                return Some(shell);
            }
            // A view from the shell's previous life is still around; let
            // the shell go instead of waiting for it.
        }
        None
    });

    match candidate {
        Some(mut shell) => match Arc::get_mut(&mut shell) {
            Some(inner) => {
                inner.reinit(arena, state, leak);
                shell
            }
            None => unreachable!("no weak references to buffer shells exist"),
        },
        None => Arc::new(BufShared::new(arena, state, leak)),
    }
}

/// Offers a deallocated shell back to the calling thread's pool.
pub(crate) fn recycle(shell: Arc<BufShared>) {
    SHELL_POOL.with(|pool| {
        let mut pool = pool.borrow_mut();
        if pool.len() < MAX_POOLED_SHELLS {
            pool.push(shell);
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AllocatorConfig;
    use crate::pool::backing::HeapMemory;

    fn region_state(arena: &Arc<PoolArena>) -> BufState {
        let region = arena.allocate(None, 64).unwrap();
        BufState {
            chunk: region.chunk,
            handle: region.handle,
            offset: region.offset,
            length: region.length,
            max_length: region.max_length,
            cache: None,
        }
    }

    fn arena() -> Arc<PoolArena> {
        let config = AllocatorConfig {
            heap_arena_count: 1,
            direct_arena_count: 0,
            ..Default::default()
        };
        PoolArena::new(0, Arc::new(HeapMemory), &config)
    }

    #[test]
    fn unique_shell_is_reused() {
        let arena = arena();
        let shell = acquire(Arc::clone(&arena), region_state(&arena), None);
        let ptr = Arc::as_ptr(&shell);
        recycle(Arc::clone(&shell));
        drop(shell);

        let reused = acquire(Arc::clone(&arena), region_state(&arena), None);
        assert_eq!(Arc::as_ptr(&reused), ptr);
    }

    #[test]
    fn referenced_shell_is_not_reused() {
        let arena = arena();
        let shell = acquire(Arc::clone(&arena), region_state(&arena), None);
        let ptr = Arc::as_ptr(&shell);
        recycle(Arc::clone(&shell));
        // `shell` is still alive here, standing in for a live view.
        let fresh = acquire(Arc::clone(&arena), region_state(&arena), None);
        assert_ne!(Arc::as_ptr(&fresh), ptr);
        drop(shell);
    }
}
