// Pooled allocation engine
//
// The jemalloc-inspired pool: size classification, buddy-managed chunks
// with subpage slabs, usage-banded chunk lists, arenas with coarse locking
// and lock-free thread caches. The buffer layer on top of this module is
// the only consumer of arenas and regions.

pub mod backing;
pub mod metrics;
pub mod size_class;

pub(crate) mod arena;
pub(crate) mod cache;
pub(crate) mod chunk;
pub(crate) mod chunk_list;
pub(crate) mod subpage;

pub use backing::MemoryKind;
pub use metrics::{
    format_memory_size, parse_memory_size, AllocatorMetricsSnapshot, ArenaCounters,
    ArenaMetricsSnapshot, ChunkListSnapshot, ChunkSnapshot, SubpageSnapshot, ThreadCacheStats,
};
pub use size_class::SizeClass;
