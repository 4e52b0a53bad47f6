// Allocator configuration
//
// All tunables recognized by the pooled allocator live in one explicit
// configuration object. There are no process-wide globals: every allocator
// instance is constructed from an `AllocatorConfig` and validates it up
// front, so a bad page size or buddy depth fails at construction rather than
// deep inside an allocation path.

use crate::error::{PoolError, Result};
use serde::{Deserialize, Serialize};

/// Upper bound on the buddy-tree depth. `page_size << max_order` must stay
/// at or below 1 GiB.
pub const MAX_ORDER_LIMIT: u32 = 14;

/// Smallest supported page size.
pub const MIN_PAGE_SIZE: usize = 4096;

/// Largest chunk a configuration may produce.
pub const MAX_CHUNK_SIZE: usize = 1 << 30; // 1GB

/// Leak detection level for pooled buffers.
///
/// `Simple` samples roughly 1 in 128 allocations; `Paranoid` tracks every
/// allocation and records a backtrace for every non-reference-counting
/// operation, which is expensive and meant for debugging only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LeakDetectionLevel {
    Disabled,
    Simple,
    Advanced,
    Paranoid,
}

impl LeakDetectionLevel {
    /// Whether this level records per-operation backtraces.
    pub fn records_accesses(self) -> bool {
        matches!(self, LeakDetectionLevel::Advanced | LeakDetectionLevel::Paranoid)
    }

    /// Whether every allocation is tracked (as opposed to sampled).
    pub fn tracks_all(self) -> bool {
        matches!(self, LeakDetectionLevel::Advanced | LeakDetectionLevel::Paranoid)
    }
}

/// Configuration for a `PooledByteBufAllocator`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AllocatorConfig {
    /// Number of heap arenas. Zero disables heap pooling entirely.
    pub heap_arena_count: usize,
    /// Number of direct arenas.
    pub direct_arena_count: usize,
    /// Page granularity. Must be a power of two >= 4096.
    pub page_size: usize,
    /// Buddy-tree depth. Chunk size is `page_size << max_order`.
    pub max_order: u32,
    /// Per-thread queue depth for Tiny allocations.
    pub tiny_cache_size: usize,
    /// Per-thread queue depth for Small allocations.
    pub small_cache_size: usize,
    /// Per-thread queue depth for Normal allocations.
    pub normal_cache_size: usize,
    /// Upper bound on normalized capacities kept in any thread cache.
    pub max_cached_buffer_capacity: usize,
    /// Allocations between automatic cache trim sweeps.
    pub cache_trim_interval: u32,
    /// Leak detection level for buffers served by this allocator.
    pub leak_detection_level: LeakDetectionLevel,
}

impl Default for AllocatorConfig {
    fn default() -> Self {
        let default_arenas = 2 * num_cpus::get();
        Self {
            heap_arena_count: default_arenas,
            direct_arena_count: default_arenas,
            page_size: 8192,
            max_order: 11, // 8192 << 11 = 16MB chunks
            tiny_cache_size: 512,
            small_cache_size: 256,
            normal_cache_size: 64,
            max_cached_buffer_capacity: 32 * 1024, // 32KB
            cache_trim_interval: 8192,
            leak_detection_level: LeakDetectionLevel::Simple,
        }
    }
}

impl AllocatorConfig {
    /// Chunk size implied by `page_size` and `max_order`.
    pub fn chunk_size(&self) -> usize {
        self.page_size << self.max_order
    }

    /// log2 of the page size. Valid only after `validate()`.
    pub fn page_shifts(&self) -> u32 {
        self.page_size.trailing_zeros()
    }

    /// Validates the configuration, returning the first violation found.
    pub fn validate(&self) -> Result<()> {
        if !self.page_size.is_power_of_two() || self.page_size < MIN_PAGE_SIZE {
            return Err(PoolError::InvalidConfiguration {
                field: "page_size".to_string(),
                reason: format!(
                    "expected a power of two >= {}, got {}",
                    MIN_PAGE_SIZE, self.page_size
                ),
            });
        }

        if self.max_order > MAX_ORDER_LIMIT {
            return Err(PoolError::InvalidConfiguration {
                field: "max_order".to_string(),
                reason: format!("expected 0..={}, got {}", MAX_ORDER_LIMIT, self.max_order),
            });
        }

        let chunk_size = self
            .page_size
            .checked_shl(self.max_order)
            .unwrap_or(usize::MAX);
        if chunk_size > MAX_CHUNK_SIZE {
            return Err(PoolError::InvalidConfiguration {
                field: "max_order".to_string(),
                reason: format!(
                    "page_size << max_order = {} exceeds {} bytes",
                    chunk_size, MAX_CHUNK_SIZE
                ),
            });
        }

        if self.max_cached_buffer_capacity > chunk_size {
            return Err(PoolError::InvalidConfiguration {
                field: "max_cached_buffer_capacity".to_string(),
                reason: format!(
                    "{} exceeds the chunk size {}",
                    self.max_cached_buffer_capacity, chunk_size
                ),
            });
        }

        if self.cache_trim_interval == 0 {
            return Err(PoolError::InvalidConfiguration {
                field: "cache_trim_interval".to_string(),
                reason: "must be at least 1".to_string(),
            });
        }

        Ok(())
    }
}
