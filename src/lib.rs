// BytePool - pooled byte-buffer allocator
// Core library module
//
// Serves mutable, reference-counted byte buffers of arbitrary size from
// pre-reserved memory regions. The pool follows the jemalloc layout:
// per-allocator arena families, 16 MiB buddy-managed chunks, subpage slabs
// for sub-page sizes and lock-free per-thread front-end caches.

pub mod allocator;
pub mod buffer;
pub mod config;
pub mod error;
pub mod leak;
pub mod pool;

pub use allocator::{calculate_new_capacity, PooledByteBufAllocator};
pub use buffer::{CompositeByteBuf, PooledByteBuf, DEFAULT_MAX_CAPACITY};
pub use config::{AllocatorConfig, LeakDetectionLevel};
pub use error::{PoolError, Result};
pub use leak::LeakDetector;
pub use pool::{
    format_memory_size, parse_memory_size, AllocatorMetricsSnapshot, ArenaCounters,
    ArenaMetricsSnapshot, ChunkListSnapshot, ChunkSnapshot, MemoryKind, SizeClass,
    SubpageSnapshot, ThreadCacheStats,
};
