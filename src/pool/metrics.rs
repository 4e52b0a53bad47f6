// Arena metrics
//
// Lock-free counters updated on the allocation paths and snapshotted on
// demand. Snapshots are plain serializable values; readers get a
// best-effort view with no synchronization against in-flight operations.

use crate::error::{PoolError, Result};
use crate::pool::size_class::SizeClass;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

/// Helper to format memory size
pub fn format_memory_size(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;
    const TB: u64 = GB * 1024;

    if bytes >= TB {
        format!("{:.2} TB", bytes as f64 / TB as f64)
    } else if bytes >= GB {
        format!("{:.2} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}

/// Helper to parse memory size strings such as "32KB" or "1.5GB"
pub fn parse_memory_size(s: &str) -> Result<u64> {
    let s = s.trim().to_uppercase();
    let (num_str, multiplier) = if s.ends_with("TB") {
        (&s[..s.len() - 2], 1024u64 * 1024 * 1024 * 1024)
    } else if s.ends_with("GB") {
        (&s[..s.len() - 2], 1024u64 * 1024 * 1024)
    } else if s.ends_with("MB") {
        (&s[..s.len() - 2], 1024u64 * 1024)
    } else if s.ends_with("KB") {
        (&s[..s.len() - 2], 1024u64)
    } else if s.ends_with('B') {
        (&s[..s.len() - 1], 1)
    } else {
        (s.as_str(), 1)
    };

    let num: f64 = num_str.trim().parse().map_err(|e| PoolError::InvalidArgument {
        reason: format!("invalid memory size: {}", e),
    })?;

    Ok((num * multiplier as f64) as u64)
}

/// Live counters of one arena.
#[derive(Debug, Default)]
pub(crate) struct ArenaMetrics {
    allocations_tiny: AtomicU64,
    allocations_small: AtomicU64,
    allocations_normal: AtomicU64,
    allocations_huge: AtomicU64,
    deallocations_tiny: AtomicU64,
    deallocations_small: AtomicU64,
    deallocations_normal: AtomicU64,
    deallocations_huge: AtomicU64,
    /// Bytes currently handed out from pooled chunks.
    active_bytes: AtomicUsize,
    /// Bytes currently handed out through unpooled Huge chunks.
    active_bytes_huge: AtomicUsize,
    /// Bytes reserved from the backing source (chunks plus Huge regions).
    reserved_bytes: AtomicUsize,
    /// Thread caches currently bound to this arena.
    pub(crate) thread_caches: AtomicUsize,
}

impl ArenaMetrics {
    pub(crate) fn record_alloc(&self, class: SizeClass, bytes: usize) {
        match class {
            SizeClass::Tiny => self.allocations_tiny.fetch_add(1, Ordering::Relaxed),
            SizeClass::Small => self.allocations_small.fetch_add(1, Ordering::Relaxed),
            SizeClass::Normal => self.allocations_normal.fetch_add(1, Ordering::Relaxed),
            SizeClass::Huge => self.allocations_huge.fetch_add(1, Ordering::Relaxed),
        };
        if class == SizeClass::Huge {
            self.active_bytes_huge.fetch_add(bytes, Ordering::Relaxed);
        } else {
            self.active_bytes.fetch_add(bytes, Ordering::Relaxed);
        }
    }

    pub(crate) fn record_free(&self, class: SizeClass, bytes: usize) {
        match class {
            SizeClass::Tiny => self.deallocations_tiny.fetch_add(1, Ordering::Relaxed),
            SizeClass::Small => self.deallocations_small.fetch_add(1, Ordering::Relaxed),
            SizeClass::Normal => self.deallocations_normal.fetch_add(1, Ordering::Relaxed),
            SizeClass::Huge => self.deallocations_huge.fetch_add(1, Ordering::Relaxed),
        };
        if class == SizeClass::Huge {
            self.active_bytes_huge.fetch_sub(bytes, Ordering::Relaxed);
        } else {
            self.active_bytes.fetch_sub(bytes, Ordering::Relaxed);
        }
    }

    pub(crate) fn record_reserved(&self, bytes: usize) {
        self.reserved_bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    pub(crate) fn record_released(&self, bytes: usize) {
        self.reserved_bytes.fetch_sub(bytes, Ordering::Relaxed);
    }

    pub(crate) fn reserved_bytes(&self) -> usize {
        self.reserved_bytes.load(Ordering::Relaxed)
    }

    pub(crate) fn counters(&self) -> ArenaCounters {
        ArenaCounters {
            allocations_tiny: self.allocations_tiny.load(Ordering::Relaxed),
            allocations_small: self.allocations_small.load(Ordering::Relaxed),
            allocations_normal: self.allocations_normal.load(Ordering::Relaxed),
            allocations_huge: self.allocations_huge.load(Ordering::Relaxed),
            deallocations_tiny: self.deallocations_tiny.load(Ordering::Relaxed),
            deallocations_small: self.deallocations_small.load(Ordering::Relaxed),
            deallocations_normal: self.deallocations_normal.load(Ordering::Relaxed),
            deallocations_huge: self.deallocations_huge.load(Ordering::Relaxed),
            active_bytes: self.active_bytes.load(Ordering::Relaxed),
            active_bytes_huge: self.active_bytes_huge.load(Ordering::Relaxed),
        }
    }
}

/// Raw counter block shared by the arena snapshot.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ArenaCounters {
    pub allocations_tiny: u64,
    pub allocations_small: u64,
    pub allocations_normal: u64,
    pub allocations_huge: u64,
    pub deallocations_tiny: u64,
    pub deallocations_small: u64,
    pub deallocations_normal: u64,
    pub deallocations_huge: u64,
    pub active_bytes: usize,
    pub active_bytes_huge: usize,
}

impl ArenaCounters {
    /// Allocations minus deallocations across the pooled size classes.
    pub fn active_allocations(&self) -> u64 {
        (self.allocations_tiny + self.allocations_small + self.allocations_normal
            + self.allocations_huge)
            .saturating_sub(
                self.deallocations_tiny
                    + self.deallocations_small
                    + self.deallocations_normal
                    + self.deallocations_huge,
            )
    }

    pub fn active_huge_allocations(&self) -> u64 {
        self.allocations_huge.saturating_sub(self.deallocations_huge)
    }
}

impl fmt::Display for ArenaCounters {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "active: {} ({} pooled, {} huge), allocations t/s/n/h: {}/{}/{}/{}",
            self.active_allocations(),
            format_memory_size(self.active_bytes as u64),
            format_memory_size(self.active_bytes_huge as u64),
            self.allocations_tiny,
            self.allocations_small,
            self.allocations_normal,
            self.allocations_huge,
        )
    }
}

/// Point-in-time view of one chunk.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkSnapshot {
    pub chunk_size: usize,
    pub free_bytes: usize,
    pub usage_percent: usize,
    pub unpooled: bool,
}

/// Point-in-time view of one chunk list.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkListSnapshot {
    pub min_usage: usize,
    pub max_usage: usize,
    pub chunks: Vec<ChunkSnapshot>,
}

/// Point-in-time view of one subpage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubpageSnapshot {
    pub elem_size: usize,
    pub max_num_elems: usize,
    pub num_avail: usize,
}

/// Full snapshot of one arena.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArenaMetricsSnapshot {
    pub counters: ArenaCounters,
    pub reserved_bytes: usize,
    pub thread_caches: usize,
    pub chunk_lists: Vec<ChunkListSnapshot>,
    pub tiny_subpages: Vec<SubpageSnapshot>,
    pub small_subpages: Vec<SubpageSnapshot>,
}

/// Snapshot of a whole allocator: every arena of both kinds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AllocatorMetricsSnapshot {
    pub heap_arenas: Vec<ArenaMetricsSnapshot>,
    pub direct_arenas: Vec<ArenaMetricsSnapshot>,
    pub used_heap_memory: usize,
    pub used_direct_memory: usize,
}

impl fmt::Display for AllocatorMetricsSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "{} heap arena(s) using {}, {} direct arena(s) using {}",
            self.heap_arenas.len(),
            format_memory_size(self.used_heap_memory as u64),
            self.direct_arenas.len(),
            format_memory_size(self.used_direct_memory as u64),
        )?;
        for (idx, arena) in self.heap_arenas.iter().enumerate() {
            writeln!(f, "  heap {}: {}", idx, arena.counters)?;
        }
        for (idx, arena) in self.direct_arenas.iter().enumerate() {
            writeln!(f, "  direct {}: {}", idx, arena.counters)?;
        }
        Ok(())
    }
}

/// Point-in-time view of one thread cache.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ThreadCacheStats {
    pub hits: u64,
    pub misses: u64,
    pub cached_entries: usize,
}

impl ThreadCacheStats {
    pub fn hit_ratio(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}
