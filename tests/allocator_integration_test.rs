// End-to-end tests for the pooled allocator: allocation flavors, chunk
// lifecycle, thread caches, derived views and leak reporting, exercised
// through the public surface only.

use bytepool::pool::size_class::SizeClasses;
use bytepool::{
    AllocatorConfig, LeakDetectionLevel, MemoryKind, PoolError, PooledByteBufAllocator,
};
use std::sync::Arc;

fn allocator_with(config: AllocatorConfig) -> PooledByteBufAllocator {
    PooledByteBufAllocator::new(config).expect("valid test configuration")
}

fn quiet_config() -> AllocatorConfig {
    AllocatorConfig {
        heap_arena_count: 1,
        direct_arena_count: 1,
        leak_detection_level: LeakDetectionLevel::Disabled,
        ..Default::default()
    }
}

#[test]
fn tiny_allocations_resolve_against_shared_subpages() {
    // Cache disabled so frees land in the subpages immediately.
    let allocator = allocator_with(AllocatorConfig {
        tiny_cache_size: 0,
        ..quiet_config()
    });

    let a = allocator.heap_buffer_with_capacity(16).unwrap();
    let b = allocator.heap_buffer_with_capacity(16).unwrap();
    let c = allocator.heap_buffer_with_capacity(32).unwrap();

    let metrics = allocator.metrics();
    let arena = &metrics.heap_arenas[0];
    assert_eq!(arena.counters.allocations_tiny, 3);
    // One subpage of 16-byte elements, one of 32-byte elements.
    assert_eq!(arena.tiny_subpages.len(), 2);
    let elem_sizes: Vec<usize> = arena.tiny_subpages.iter().map(|s| s.elem_size).collect();
    assert!(elem_sizes.contains(&16));
    assert!(elem_sizes.contains(&32));

    assert!(a.release().unwrap());
    assert!(b.release().unwrap());
    assert!(c.release().unwrap());

    // Freeing emptied both subpages, so their pages rejoined the buddy
    // tree and the chunk reads fully free.
    let metrics = allocator.metrics();
    let arena = &metrics.heap_arenas[0];
    assert_eq!(arena.counters.active_allocations(), 0);
    assert_eq!(arena.counters.active_bytes, 0);
    let chunk = arena
        .chunk_lists
        .iter()
        .flat_map(|l| l.chunks.iter())
        .next()
        .expect("the chunk survives in qInit");
    assert_eq!(chunk.free_bytes, chunk.chunk_size);
}

#[test]
fn single_page_run_lands_in_qinit_and_frees_cleanly() {
    let allocator = allocator_with(AllocatorConfig {
        normal_cache_size: 0,
        ..quiet_config()
    });
    let buf = allocator.heap_buffer_with_capacity(8192).unwrap();

    let metrics = allocator.metrics();
    let arena = &metrics.heap_arenas[0];
    assert_eq!(arena.counters.allocations_normal, 1);
    // qInit is the first list; the fresh chunk sits there at ~0.05% usage.
    assert_eq!(arena.chunk_lists[0].chunks.len(), 1);
    assert_eq!(arena.chunk_lists[0].chunks[0].usage_percent, 1);

    assert!(buf.release().unwrap());
    let metrics = allocator.metrics();
    let chunk = &metrics.heap_arenas[0].chunk_lists[0].chunks[0];
    assert_eq!(chunk.free_bytes, chunk.chunk_size);
}

#[test]
fn chunk_that_descends_past_q000_is_destroyed() {
    // Disable the normal cache so frees hit the chunk directly.
    let allocator = allocator_with(AllocatorConfig {
        normal_cache_size: 0,
        ..quiet_config()
    });
    let chunk_size = allocator.config().chunk_size();

    // 600 single-page runs push usage near 30%, migrating the chunk out
    // of qInit into q000's band.
    let buffers: Vec<_> = (0..600)
        .map(|_| allocator.heap_buffer_with_capacity(8192).unwrap())
        .collect();
    assert_eq!(allocator.used_heap_memory(), chunk_size);

    for buf in buffers {
        assert!(buf.release().unwrap());
    }

    // The last free dropped usage to zero while the chunk sat in q000:
    // the chunk is gone and its reservation released.
    assert_eq!(allocator.used_heap_memory(), 0);
    let metrics = allocator.metrics();
    let remaining: usize = metrics.heap_arenas[0]
        .chunk_lists
        .iter()
        .map(|l| l.chunks.len())
        .sum();
    assert_eq!(remaining, 0);
}

#[test]
fn huge_allocation_counts_exact_bytes() {
    let allocator = allocator_with(quiet_config());
    let chunk_size = allocator.config().chunk_size();
    let size = chunk_size + 1;

    let buf = allocator.heap_buffer_with_capacity(size).unwrap();
    let metrics = allocator.metrics();
    let counters = &metrics.heap_arenas[0].counters;
    assert_eq!(counters.allocations_huge, 1);
    assert_eq!(counters.active_bytes_huge, 16_777_217);

    assert!(buf.release().unwrap());
    let metrics = allocator.metrics();
    let counters = &metrics.heap_arenas[0].counters;
    assert_eq!(counters.deallocations_huge, 1);
    assert_eq!(counters.active_bytes_huge, 0);
    assert_eq!(counters.active_huge_allocations(), 0);
}

#[test]
fn slices_share_memory_and_keep_the_buffer_alive() {
    let allocator = allocator_with(quiet_config());
    let buf = allocator.heap_buffer_with_capacity(1024).unwrap();

    let slice = buf.slice(0, 512).unwrap();
    let retained = buf.retained_slice(0, 256).unwrap();

    buf.set_u8(100, 0xAB).unwrap();
    assert_eq!(slice.get_u8(100).unwrap(), 0xAB);
    assert_eq!(retained.get_u8(100).unwrap(), 0xAB);

    // The parent's release does not deallocate while the retained slice
    // holds its transferred reference.
    assert!(!buf.release().unwrap());
    assert!(retained.release().unwrap());

    let metrics = allocator.metrics();
    assert_eq!(metrics.heap_arenas[0].counters.active_allocations(), 0);
}

#[test]
fn tiny_cache_overflow_spills_to_the_chunk() {
    let allocator = allocator_with(AllocatorConfig {
        tiny_cache_size: 2,
        ..quiet_config()
    });

    let buffers: Vec<_> = (0..3)
        .map(|_| allocator.heap_buffer_with_capacity(16).unwrap())
        .collect();
    for (i, buf) in buffers.iter().enumerate() {
        buf.set_u8(0, 0xC0 + i as u8).unwrap();
    }
    for buf in buffers {
        assert!(buf.release().unwrap());
    }

    // The first two releases were cached; the next allocation reuses the
    // oldest cached element without zeroing, so its marker survives.
    let reused = allocator.heap_buffer_with_capacity(16).unwrap();
    assert_eq!(reused.get_u8(0).unwrap(), 0xC0);
    assert!(reused.release().unwrap());
}

#[test]
fn thread_death_drains_the_cache_without_losing_entries() {
    let allocator = Arc::new(allocator_with(quiet_config()));

    let worker = {
        let allocator = Arc::clone(&allocator);
        std::thread::spawn(move || {
            let bufs: Vec<_> = (0..64)
                .map(|_| allocator.heap_buffer_with_capacity(16).unwrap())
                .collect();
            for buf in bufs {
                assert!(buf.release().unwrap());
            }
            // Entries now sit in this thread's cache; they must all come
            // back when the thread ends.
        })
    };
    worker.join().unwrap();

    let metrics = allocator.metrics();
    let arena = &metrics.heap_arenas[0];
    assert_eq!(arena.counters.active_allocations(), 0);
    assert_eq!(arena.thread_caches, 0);
    for list in &arena.chunk_lists {
        for chunk in &list.chunks {
            assert_eq!(chunk.free_bytes, chunk.chunk_size);
        }
    }
}

#[test]
fn buffers_release_safely_from_another_thread() {
    let allocator = Arc::new(allocator_with(quiet_config()));
    let buf = allocator.heap_buffer_with_capacity(512).unwrap();
    buf.set_u8(0, 0x11).unwrap();

    let handle = std::thread::spawn(move || {
        assert_eq!(buf.get_u8(0).unwrap(), 0x11);
        assert!(buf.release().unwrap());
    });
    handle.join().unwrap();

    let metrics = allocator.metrics();
    assert_eq!(metrics.heap_arenas[0].counters.active_allocations(), 0);
}

#[test]
fn concurrent_churn_stays_balanced() {
    let allocator = Arc::new(allocator_with(AllocatorConfig {
        heap_arena_count: 2,
        direct_arena_count: 0,
        leak_detection_level: LeakDetectionLevel::Disabled,
        ..Default::default()
    }));

    let threads: Vec<_> = (0..4)
        .map(|t| {
            let allocator = Arc::clone(&allocator);
            std::thread::spawn(move || {
                for i in 0..200 {
                    let size = match (t + i) % 4 {
                        0 => 16,
                        1 => 600,
                        2 => 8192,
                        _ => 40_000,
                    };
                    let mut buf = allocator.heap_buffer_with_capacity(size).unwrap();
                    buf.write_bytes(&[t as u8; 8]).unwrap();
                    let mut out = [0u8; 8];
                    buf.read_bytes(&mut out).unwrap();
                    assert_eq!(out, [t as u8; 8]);
                    assert!(buf.release().unwrap());
                }
            })
        })
        .collect();
    for thread in threads {
        thread.join().unwrap();
    }

    let metrics = allocator.metrics();
    let active: u64 = metrics
        .heap_arenas
        .iter()
        .map(|a| a.counters.active_allocations())
        .sum();
    assert_eq!(active, 0);
    let active_bytes: usize = metrics
        .heap_arenas
        .iter()
        .map(|a| a.counters.active_bytes)
        .sum();
    assert_eq!(active_bytes, 0);
}

#[test]
fn direct_buffers_come_from_direct_arenas() {
    let allocator = allocator_with(quiet_config());
    let buf = allocator.direct_buffer_with_capacity(1024).unwrap();
    assert_eq!(buf.memory_kind(), MemoryKind::Direct);
    assert!(allocator.used_direct_memory() > 0);
    assert!(buf.release().unwrap());
}

#[test]
fn composite_concatenates_pooled_buffers() {
    let allocator = allocator_with(quiet_config());
    let mut composite = allocator.composite_buffer();

    let mut first = allocator.heap_buffer_with_capacity(64).unwrap();
    first.write_bytes(b"alpha-").unwrap();
    let mut second = allocator.heap_buffer_with_capacity(64).unwrap();
    second.write_bytes(b"omega").unwrap();

    composite.add_component(first).unwrap();
    composite.add_component(second).unwrap();
    assert_eq!(composite.capacity(), 11);

    let mut out = vec![0u8; 11];
    composite.get_bytes(0, &mut out).unwrap();
    assert_eq!(&out, b"alpha-omega");

    assert!(composite.release().unwrap());
    let metrics = allocator.metrics();
    assert_eq!(metrics.heap_arenas[0].counters.active_allocations(), 0);
}

#[test]
fn unreleased_buffer_is_reported_as_a_leak() {
    let allocator = allocator_with(AllocatorConfig {
        leak_detection_level: LeakDetectionLevel::Paranoid,
        ..quiet_config()
    });

    let buf = allocator.heap_buffer_with_capacity(64).unwrap();
    assert_eq!(allocator.leak_detector().active_tracked(), 1);
    drop(buf);
    assert_eq!(allocator.leak_detector().leaks_reported(), 1);

    let clean = allocator.heap_buffer_with_capacity(64).unwrap();
    assert!(clean.release().unwrap());
    drop(clean);
    assert_eq!(allocator.leak_detector().leaks_reported(), 1);
}

#[test]
fn size_normalization_is_deterministic_and_monotonic() {
    let classes = SizeClasses::new(8192, 11);
    let mut previous = 0;
    for req in 1..=20_000 {
        let norm = classes.normalize(req);
        assert!(norm >= req);
        assert!(norm >= previous);
        assert_eq!(classes.normalize(norm), norm);
        previous = norm;
    }
}

#[test]
fn invalid_configurations_are_rejected_up_front() {
    let bad_page = AllocatorConfig {
        page_size: 5000,
        ..Default::default()
    };
    assert!(matches!(
        PooledByteBufAllocator::new(bad_page),
        Err(PoolError::InvalidConfiguration { .. })
    ));

    let bad_order = AllocatorConfig {
        max_order: 20,
        ..Default::default()
    };
    assert!(PooledByteBufAllocator::new(bad_order).is_err());
}

#[test]
fn thread_cache_stats_track_hits_and_occupancy() {
    let allocator = allocator_with(quiet_config());
    let buf = allocator.heap_buffer_with_capacity(16).unwrap();
    assert!(buf.release().unwrap());

    let stats = allocator.thread_cache_stats();
    assert_eq!(stats.len(), 1);
    assert_eq!(stats[0].cached_entries, 1);

    let again = allocator.heap_buffer_with_capacity(16).unwrap();
    let stats = allocator.thread_cache_stats();
    assert_eq!(stats[0].hits, 1);
    assert_eq!(stats[0].cached_entries, 0);
    assert!(stats[0].hit_ratio() > 0.0);
    assert!(again.release().unwrap());
}

#[test]
fn metrics_render_human_readable_totals() {
    let allocator = allocator_with(quiet_config());
    let buf = allocator.heap_buffer_with_capacity(8192).unwrap();

    let rendered = allocator.metrics().to_string();
    assert!(rendered.contains("1 heap arena(s) using 16.00 MB"));
    assert!(rendered.contains("heap 0:"));
    assert!(buf.release().unwrap());
}

#[test]
fn adjust_capacity_moves_buffers_across_chunks() {
    let allocator = allocator_with(quiet_config());
    let chunk_size = allocator.config().chunk_size();

    let mut buf = allocator.heap_buffer_with_capacity(1024).unwrap();
    buf.write_bytes(b"survives the move").unwrap();

    // Grow past the chunk size: the buffer moves to an unpooled chunk.
    buf.adjust_capacity(chunk_size + 1).unwrap();
    assert_eq!(buf.capacity(), chunk_size + 1);
    let mut out = vec![0u8; 17];
    buf.read_bytes(&mut out).unwrap();
    assert_eq!(&out, b"survives the move");

    assert!(buf.release().unwrap());
    let metrics = allocator.metrics();
    let counters = &metrics.heap_arenas[0].counters;
    assert_eq!(counters.active_allocations(), 0);
    assert_eq!(counters.active_bytes_huge, 0);
}
